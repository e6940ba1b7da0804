/*
 * Cvassist - personal CV assistant backend
 * Copyright (C) 2025–2026 Pedro Monteiro <pedro@cvassist.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Secrets resolution for the Cvassist backend.
//!
//! Config files carry secret *key names*; the values live in the process
//! environment or in a docker-style secrets directory (one file per key).
//! Nothing in this crate ever logs a secret value.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;

/// Errors from secrets operations.
#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret unreadable: {0}")]
    Unreadable(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Trait for secrets providers.
#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<String, SecretsError>;

    /// Like [`get`](Self::get), but maps an absent key to `None` so callers
    /// can treat it as a call-time misconfiguration instead of a failure.
    async fn get_optional(&self, key: &str) -> Result<Option<String>, SecretsError> {
        match self.get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(SecretsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Environment-variable provider. Empty values count as absent so that
/// `FOO=` in a unit file does not masquerade as a configured secret.
#[derive(Debug)]
pub struct EnvProvider;

#[async_trait::async_trait]
impl SecretsProvider for EnvProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        match std::env::var(key) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                Err(SecretsError::NotFound(key.to_string()))
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(SecretsError::Unreadable(key.to_string()))
            }
        }
    }
}

/// Docker-secrets-style provider: one file per key under a directory,
/// value is the trimmed file content.
#[derive(Debug)]
pub struct DirProvider {
    dir: PathBuf,
}

impl DirProvider {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait::async_trait]
impl SecretsProvider for DirProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        // Key names come from our own config, but never let one escape the dir.
        if key.contains('/') || key.contains("..") {
            return Err(SecretsError::Unreadable(key.to_string()));
        }

        let path = self.dir.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let value = raw.trim().to_string();
                if value.is_empty() {
                    Err(SecretsError::NotFound(key.to_string()))
                } else {
                    Ok(value)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretsError::NotFound(key.to_string()))
            }
            Err(e) => Err(SecretsError::Unreadable(format!("{key}: {e}"))),
        }
    }
}

/// Create a secrets provider based on the provider name.
///
/// # Errors
///
/// Returns `SecretsError::Unavailable` if the provider name is unknown or
/// required parameters are missing.
pub fn create_provider(
    provider: &str,
    secrets_dir: Option<&str>,
) -> Result<Box<dyn SecretsProvider>, SecretsError> {
    match provider {
        "env" => Ok(Box::new(EnvProvider)),
        "dir" => {
            let dir = secrets_dir.ok_or_else(|| {
                SecretsError::Unavailable("secrets_dir not configured".to_string())
            })?;
            Ok(Box::new(DirProvider::new(PathBuf::from(dir))))
        }
        other => Err(SecretsError::Unavailable(format!(
            "unknown provider: {other}"
        ))),
    }
}
