#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # cert-provider
//!
//! The certificate material handed to backends at registration time comes
//! through the [`CertificateProvider`] trait. The relay ships one
//! implementation, [`SelfSignedProvider`], which mints a wildcard pair for
//! the whole funnel domain and is the fallback for local development
//! (`--funnel-domain localhost`). An ACME-backed provider plugs into the
//! same trait without touching the callers.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Certificate provisioning failures.
#[derive(Debug, Error)]
pub enum CertError {
    /// the provider could not produce a pair for this name
    #[error("certificate generation failed: {0}")]
    Generation(String),
    /// provisioning was cancelled before it finished
    #[error("certificate provisioning cancelled")]
    Cancelled,
}

/// A PEM-encoded certificate chain and private key.
#[derive(Debug, Clone)]
pub struct CertPair {
    /// certificate chain, PEM
    pub cert_pem: String,
    /// private key, PEM
    pub key_pem: String,
}

/// Source of per-lease certificate material.
///
/// `get_cert_pem` may block up to 60 s (an ACME issuance) and must be
/// idempotent per name; callers thread a cancellation token through so a
/// dying registration doesn't leave an issuance running unobserved.
#[async_trait]
pub trait CertificateProvider: Send + Sync + 'static {
    /// produce (or fetch cached) PEMs covering `name`
    async fn get_cert_pem(&self, name: &str, cancel: &CancellationToken)
        -> Result<CertPair, CertError>;
}

/// Self-signed wildcard certificates, one pair per funnel domain.
///
/// Every lease under the domain shares the cached `*.<domain>` pair, so the
/// subject CN for `--funnel-domain localhost` is `*.localhost`.
pub struct SelfSignedProvider {
    domain: String,
    cached: Mutex<Option<CertPair>>,
}

impl fmt::Debug for SelfSignedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedProvider")
            .field("domain", &self.domain)
            .finish()
    }
}

impl SelfSignedProvider {
    /// provider for `*.<domain>`
    pub fn new(domain: impl Into<String>) -> Self {
        SelfSignedProvider {
            domain: domain.into(),
            cached: Mutex::new(None),
        }
    }

    fn generate(&self) -> Result<CertPair, CertError> {
        let wildcard = format!("*.{}", self.domain);
        let mut params =
            CertificateParams::new(vec![wildcard.clone(), self.domain.clone()])
                .map_err(|err| CertError::Generation(err.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, wildcard.clone());
        params.distinguished_name = dn;
        let key_pair =
            KeyPair::generate().map_err(|err| CertError::Generation(err.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|err| CertError::Generation(err.to_string()))?;
        debug!(cn = %wildcard, "generated self-signed certificate");
        Ok(CertPair {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateProvider for SelfSignedProvider {
    async fn get_cert_pem(
        &self,
        _name: &str,
        cancel: &CancellationToken,
    ) -> Result<CertPair, CertError> {
        if cancel.is_cancelled() {
            return Err(CertError::Cancelled);
        }
        if let Some(pair) = self.cached.lock().clone() {
            return Ok(pair);
        }
        let pair = self.generate()?;
        *self.cached.lock() = Some(pair.clone());
        Ok(pair)
    }
}

/// In-memory provider for tests that need deterministic failures.
#[derive(Debug, Default)]
pub struct StaticProvider {
    pairs: Mutex<HashMap<String, CertPair>>,
    /// when set, every request fails with this message
    pub fail_with: Mutex<Option<String>>,
}

impl StaticProvider {
    /// preload a pair for `name`
    pub fn insert(&self, name: impl Into<String>, pair: CertPair) {
        self.pairs.lock().insert(name.into(), pair);
    }
}

#[async_trait]
impl CertificateProvider for StaticProvider {
    async fn get_cert_pem(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<CertPair, CertError> {
        if let Some(msg) = self.fail_with.lock().clone() {
            return Err(CertError::Generation(msg));
        }
        self.pairs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CertError::Generation(format!("no pair for {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn self_signed_localhost_wildcard() {
        let provider = SelfSignedProvider::new("localhost");
        let cancel = CancellationToken::new();
        let pair = provider.get_cert_pem("demo", &cancel).await.unwrap();
        assert!(pair.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pair.key_pem.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn pair_is_cached_per_domain() {
        let provider = SelfSignedProvider::new("portal.example.com");
        let cancel = CancellationToken::new();
        let a = provider.get_cert_pem("a", &cancel).await.unwrap();
        let b = provider.get_cert_pem("b", &cancel).await.unwrap();
        assert_eq!(a.cert_pem, b.cert_pem);
        assert_eq!(a.key_pem, b.key_pem);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let provider = SelfSignedProvider::new("localhost");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            provider.get_cert_pem("demo", &cancel).await,
            Err(CertError::Cancelled)
        ));
    }
}
