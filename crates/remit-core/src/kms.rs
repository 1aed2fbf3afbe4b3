//! Pluggable Ed25519 sign/verify backends.
//!
//! The backend set is closed and selected once at process startup:
//! local key material, a remote verification service over mutual TLS, or
//! a cloud-managed asymmetric key. `verify` is side-effect-free and safe
//! to call concurrently; components that only verify receive a
//! [`KmsVerifier`] handle so they can never reach `sign`.

use crate::error::RemitError;
use crate::tls::MtlsMaterial;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SIGNING_ALGORITHM: &str = "Ed25519";

/// Uniform signing/verification contract across backends.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    fn key_id(&self) -> &str;

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, RemitError>;

    /// Returns `Ok(false)` for a well-formed "does not verify" answer
    /// (bad signature, unknown key); `Err` only for backend failures.
    async fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, RemitError>;
}

/// Verification-only handle. Handing this out instead of the provider
/// keeps the verification path privilege-minimal.
#[derive(Clone)]
pub struct KmsVerifier {
    inner: Arc<dyn KmsProvider>,
}

impl KmsVerifier {
    pub fn new(inner: Arc<dyn KmsProvider>) -> Self {
        Self { inner }
    }

    pub fn key_id(&self) -> &str {
        self.inner.key_id()
    }

    pub async fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, RemitError> {
        self.inner.verify(message, signature).await
    }
}

/// Local backend: secret key material loaded from configuration and used
/// directly for detached Ed25519 signatures.
pub struct LocalKms {
    key_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl LocalKms {
    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            key_id: key_id.into(),
            signing_key,
            verifying_key,
        }
    }

    /// Seed supplied as hex, the form it takes in configuration.
    pub fn from_hex_seed(key_id: impl Into<String>, hex_seed: &str) -> Result<Self, RemitError> {
        let bytes = hex::decode(hex_seed.trim())
            .map_err(|e| RemitError::Kms(format!("invalid signing key seed hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RemitError::Kms("signing key seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(key_id, &seed))
    }

    /// Throwaway keypair for tests and dry-run environments.
    pub fn generate(key_id: impl Into<String>) -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(key_id, &seed)
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

#[async_trait]
impl KmsProvider for LocalKms {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, RemitError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }

    async fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, RemitError> {
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return Ok(false);
        };
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(self.verifying_key.verify(message, &signature).is_ok())
    }
}

#[derive(Debug, Serialize)]
struct RemoteSignRequest<'a> {
    #[serde(rename = "keyId")]
    key_id: &'a str,
    message: String,
    algorithm: &'static str,
}

#[derive(Debug, Serialize)]
struct RemoteVerifyRequest<'a> {
    #[serde(rename = "keyId")]
    key_id: &'a str,
    message: String,
    signature: String,
    algorithm: &'static str,
}

#[derive(Debug, Deserialize)]
struct RemoteSignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct RemoteVerifyResponse {
    valid: bool,
}

/// Remote backend: delegates to an HTTP signing/verification service over
/// mutual TLS. A 404 from the verify endpoint means "key or record not
/// found" and verifies false; any other non-2xx is a hard failure.
pub struct RemoteKms {
    key_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteKms {
    pub fn new(
        key_id: impl Into<String>,
        base_url: impl Into<String>,
        mtls: Option<&MtlsMaterial>,
        timeout: Duration,
    ) -> Result<Self, RemitError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(material) = mtls {
            builder = material.apply(builder)?;
        }
        let client = builder
            .build()
            .map_err(|e| RemitError::Kms(format!("failed to build KMS http client: {e}")))?;
        Ok(Self {
            key_id: key_id.into(),
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl KmsProvider for RemoteKms {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, RemitError> {
        let body = RemoteSignRequest {
            key_id: &self.key_id,
            message: BASE64.encode(message),
            algorithm: SIGNING_ALGORITHM,
        };
        let response = self
            .client
            .post(format!("{}/v1/sign", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(classify_kms_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemitError::Kms(format!(
                "remote sign failed with status {status}"
            )));
        }
        let parsed: RemoteSignResponse = response
            .json()
            .await
            .map_err(|e| RemitError::Kms(format!("remote sign response malformed: {e}")))?;
        BASE64
            .decode(parsed.signature.as_bytes())
            .map_err(|e| RemitError::Kms(format!("remote signature not base64: {e}")))
    }

    async fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, RemitError> {
        let body = RemoteVerifyRequest {
            key_id: &self.key_id,
            message: BASE64.encode(message),
            signature: BASE64.encode(signature),
            algorithm: SIGNING_ALGORITHM,
        };
        let response = self
            .client
            .post(format!("{}/v1/verify", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(classify_kms_transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let parsed: RemoteVerifyResponse = response.json().await.map_err(|e| {
                    RemitError::Kms(format!("remote verify response malformed: {e}"))
                })?;
                Ok(parsed.valid)
            }
            status => Err(RemitError::Kms(format!(
                "remote verify failed with status {status}"
            ))),
        }
    }
}

/// Cloud backend: delegates to a managed asymmetric-signing key using the
/// provider's native `:sign` / `:verify` call shape.
pub struct CloudKms {
    key_resource: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CloudSignRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CloudSignResponse {
    signature: String,
}

#[derive(Debug, Serialize)]
struct CloudVerifyRequest {
    message: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct CloudVerifyResponse {
    valid: bool,
}

impl CloudKms {
    pub fn new(
        key_resource: impl Into<String>,
        endpoint: impl Into<String>,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, RemitError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_token}"))
            .map_err(|e| RemitError::Kms(format!("invalid cloud KMS token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RemitError::Kms(format!("failed to build cloud KMS client: {e}")))?;
        Ok(Self {
            key_resource: key_resource.into(),
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl KmsProvider for CloudKms {
    fn key_id(&self) -> &str {
        &self.key_resource
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, RemitError> {
        let url = format!("{}/v1/{}:sign", self.endpoint, self.key_resource);
        let response = self
            .client
            .post(url)
            .json(&CloudSignRequest {
                message: BASE64.encode(message),
            })
            .send()
            .await
            .map_err(classify_kms_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemitError::Kms(format!(
                "cloud sign failed with status {status}"
            )));
        }
        let parsed: CloudSignResponse = response
            .json()
            .await
            .map_err(|e| RemitError::Kms(format!("cloud sign response malformed: {e}")))?;
        BASE64
            .decode(parsed.signature.as_bytes())
            .map_err(|e| RemitError::Kms(format!("cloud signature not base64: {e}")))
    }

    async fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, RemitError> {
        let url = format!("{}/v1/{}:verify", self.endpoint, self.key_resource);
        let response = self
            .client
            .post(url)
            .json(&CloudVerifyRequest {
                message: BASE64.encode(message),
                signature: BASE64.encode(signature),
            })
            .send()
            .await
            .map_err(classify_kms_transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let parsed: CloudVerifyResponse = response
                    .json()
                    .await
                    .map_err(|e| RemitError::Kms(format!("cloud verify response malformed: {e}")))?;
                Ok(parsed.valid)
            }
            status => Err(RemitError::Kms(format!(
                "cloud verify failed with status {status}"
            ))),
        }
    }
}

/// Outbound KMS calls carry bounded timeouts; a timeout is a retryable
/// transient failure, never success.
fn classify_kms_transport(err: reqwest::Error) -> RemitError {
    if err.is_timeout() || err.is_connect() {
        RemitError::transient(format!("kms transport: {err}"))
    } else {
        RemitError::Kms(err.to_string())
    }
}
