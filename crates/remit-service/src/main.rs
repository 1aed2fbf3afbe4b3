use clap::{Parser, ValueEnum};
use remit_core::{EngineConfig, MtlsMaterial, StatementConfig, StorageConfig};
use remit_rails::{CircuitBreakerConfig, DispatcherConfig, HttpRailConfig, RetryPolicy};
use remit_service::{
    build_router, KmsBackendConfig, RailMode, RailStackConfig, ServiceConfig, ServiceState,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RailModeArg {
    Mock,
    Real,
    Shadow,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KmsBackendArg {
    Local,
    Remote,
    Cloud,
}

#[derive(Debug, Parser)]
#[command(name = "remitd", version, about = "Tax-remittance release service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,

    /// Persistence backend. `auto` picks postgres when a database url is set.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "REMIT_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for the ledger/reconciliation mirror.
    #[arg(long, env = "REMIT_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "REMIT_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,

    /// Rail provider stack.
    #[arg(long, value_enum, default_value_t = RailModeArg::Mock, env = "REMIT_RAIL_MODE")]
    rail_mode: RailModeArg,
    /// Base url of the bank rail gateway (real/shadow modes).
    #[arg(long, env = "REMIT_RAIL_URL")]
    rail_url: Option<String>,
    /// Client identity PEM (certificate + key) for rail mTLS.
    #[arg(long, env = "REMIT_RAIL_IDENTITY_PEM")]
    rail_identity_pem: Option<String>,
    /// CA bundle PEM for rail mTLS.
    #[arg(long, env = "REMIT_RAIL_CA_PEM")]
    rail_ca_pem: Option<String>,
    /// Dry-run: never touch the network, derive synthetic receipts.
    #[arg(long, default_value_t = false, env = "REMIT_DRY_RUN")]
    dry_run: bool,
    /// Consecutive rail failures before the circuit opens.
    #[arg(long, default_value_t = 5)]
    breaker_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    #[arg(long, default_value_t = 30)]
    breaker_cooldown_secs: u64,
    /// Retry attempts per rail dispatch.
    #[arg(long, default_value_t = 3)]
    rail_retry_attempts: u32,
    /// Per-attempt rail call timeout in seconds.
    #[arg(long, default_value_t = 10)]
    rail_timeout_secs: u64,

    /// KMS backend for release-token signing.
    #[arg(long, value_enum, default_value_t = KmsBackendArg::Local, env = "REMIT_KMS_BACKEND")]
    kms_backend: KmsBackendArg,
    /// Signing key identifier.
    #[arg(long, default_value = "remit-rpt-key", env = "REMIT_KMS_KEY_ID")]
    kms_key_id: String,
    /// Hex-encoded Ed25519 seed for the local backend.
    #[arg(long, env = "REMIT_KMS_SEED_HEX")]
    kms_seed_hex: Option<String>,
    /// Base url of the remote KMS service.
    #[arg(long, env = "REMIT_KMS_URL")]
    kms_url: Option<String>,
    /// Client identity PEM for remote KMS mTLS.
    #[arg(long, env = "REMIT_KMS_IDENTITY_PEM")]
    kms_identity_pem: Option<String>,
    /// CA bundle PEM for remote KMS mTLS.
    #[arg(long, env = "REMIT_KMS_CA_PEM")]
    kms_ca_pem: Option<String>,
    /// Cloud KMS endpoint (cloud backend).
    #[arg(long, env = "REMIT_CLOUD_KMS_ENDPOINT")]
    cloud_kms_endpoint: Option<String>,
    /// Cloud KMS key resource name (cloud backend).
    #[arg(long, env = "REMIT_CLOUD_KMS_KEY")]
    cloud_kms_key: Option<String>,
    /// Cloud KMS API token (cloud backend).
    #[arg(long, env = "REMIT_CLOUD_KMS_TOKEN")]
    cloud_kms_token: Option<String>,
    /// KMS call timeout in seconds.
    #[arg(long, default_value_t = 5)]
    kms_timeout_secs: u64,

    /// Release-token lifetime in minutes.
    #[arg(long, default_value_t = 15)]
    rpt_ttl_minutes: i64,
    /// Allow-listed release destinations; omit to allow any (dev only).
    #[arg(long = "allow-destination")]
    allow_destinations: Vec<String>,
    /// Statement posting cutoff hour (0-23).
    #[arg(long, default_value_t = 17)]
    statement_cutoff_hour: u32,
    /// Disable weekend posting adjustment.
    #[arg(long, default_value_t = false)]
    no_weekend_adjust: bool,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };
    Ok(storage)
}

fn resolve_kms(cli: &Cli) -> anyhow::Result<KmsBackendConfig> {
    let timeout = Duration::from_secs(cli.kms_timeout_secs);
    match cli.kms_backend {
        KmsBackendArg::Local => Ok(KmsBackendConfig::Local {
            key_id: cli.kms_key_id.clone(),
            seed_hex: cli.kms_seed_hex.clone(),
        }),
        KmsBackendArg::Remote => {
            let base_url = cli
                .kms_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("kms-backend=remote requires --kms-url"))?;
            let mtls = cli.kms_identity_pem.clone().map(|identity| MtlsMaterial {
                identity_pem_path: identity,
                ca_pem_path: cli.kms_ca_pem.clone(),
            });
            Ok(KmsBackendConfig::Remote {
                key_id: cli.kms_key_id.clone(),
                base_url,
                mtls,
                timeout,
            })
        }
        KmsBackendArg::Cloud => {
            let endpoint = cli.cloud_kms_endpoint.clone().ok_or_else(|| {
                anyhow::anyhow!("kms-backend=cloud requires --cloud-kms-endpoint")
            })?;
            let key_resource = cli
                .cloud_kms_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("kms-backend=cloud requires --cloud-kms-key"))?;
            let api_token = cli
                .cloud_kms_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("kms-backend=cloud requires --cloud-kms-token"))?;
            Ok(KmsBackendConfig::Cloud {
                key_resource,
                endpoint,
                api_token,
                timeout,
            })
        }
    }
}

fn resolve_rails(cli: &Cli) -> anyhow::Result<RailStackConfig> {
    let mode = match cli.rail_mode {
        RailModeArg::Mock => RailMode::Mock,
        RailModeArg::Real => RailMode::Real,
        RailModeArg::Shadow => RailMode::Shadow,
    };
    let http = match (&mode, &cli.rail_url) {
        (RailMode::Mock, _) => None,
        (_, Some(base_url)) => Some(HttpRailConfig {
            base_url: base_url.clone(),
            timeout: Duration::from_secs(cli.rail_timeout_secs),
            mtls: cli.rail_identity_pem.clone().map(|identity| MtlsMaterial {
                identity_pem_path: identity,
                ca_pem_path: cli.rail_ca_pem.clone(),
            }),
        }),
        (_, None) => anyhow::bail!("rail mode '{:?}' requires --rail-url", cli.rail_mode),
    };

    Ok(RailStackConfig {
        mode,
        http,
        breaker: CircuitBreakerConfig {
            failure_threshold: cli.breaker_threshold,
            cooldown: Duration::from_secs(cli.breaker_cooldown_secs),
        },
        dispatcher: DispatcherConfig {
            retry: RetryPolicy {
                max_attempts: cli.rail_retry_attempts,
                ..Default::default()
            },
            call_timeout: Duration::from_secs(cli.rail_timeout_secs),
            dry_run: cli.dry_run,
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "remit_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    let engine = EngineConfig {
        storage: resolve_storage(&cli)?,
        statement: StatementConfig {
            cutoff_hour: cli.statement_cutoff_hour.min(23),
            weekend_adjust: !cli.no_weekend_adjust,
        },
        rpt_ttl: chrono::Duration::minutes(cli.rpt_ttl_minutes),
        allowed_destinations: if cli.allow_destinations.is_empty() {
            None
        } else {
            Some(cli.allow_destinations.clone())
        },
    };
    let config = ServiceConfig {
        engine,
        kms: resolve_kms(&cli)?,
        rails: resolve_rails(&cli)?,
    };

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("remitd listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
