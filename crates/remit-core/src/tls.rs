//! Mutual-TLS client material shared by the remote KMS backend and the
//! real rail client. Certificates load eagerly at construction so a
//! misconfigured deployment fails at startup, not at first call.

use crate::error::RemitError;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct MtlsMaterial {
    /// Client certificate + private key, concatenated PEM.
    pub identity_pem_path: String,
    pub ca_pem_path: Option<String>,
}

impl MtlsMaterial {
    pub fn apply(
        &self,
        builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, RemitError> {
        let identity_pem = std::fs::read(Path::new(&self.identity_pem_path))
            .map_err(|e| RemitError::Config(format!("failed to read client identity PEM: {e}")))?;
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| RemitError::Config(format!("invalid client identity PEM: {e}")))?;
        let mut builder = builder.identity(identity);

        if let Some(ca_path) = &self.ca_pem_path {
            let ca_pem = std::fs::read(Path::new(ca_path))
                .map_err(|e| RemitError::Config(format!("failed to read CA PEM: {e}")))?;
            let ca = reqwest::Certificate::from_pem(&ca_pem)
                .map_err(|e| RemitError::Config(format!("invalid CA PEM: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_fails_at_load() {
        let material = MtlsMaterial {
            identity_pem_path: "/nonexistent/client.pem".to_string(),
            ca_pem_path: None,
        };
        let err = material.apply(reqwest::Client::builder()).err().unwrap();
        assert!(matches!(err, RemitError::Config(_)));
    }

    #[test]
    fn garbage_identity_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("remit-test-bad-identity.pem");
        std::fs::write(&path, b"not a pem").unwrap();
        let material = MtlsMaterial {
            identity_pem_path: path.to_string_lossy().into_owned(),
            ca_pem_path: None,
        };
        let err = material.apply(reqwest::Client::builder()).err().unwrap();
        assert!(matches!(err, RemitError::Config(_)));
        let _ = std::fs::remove_file(path);
    }
}
