//! External certificate signers
//!
//! A pool of cfssl-compatible signing endpoints, all issuing under the same
//! signing root. Requests fail over across URLs with exponential backoff
//! and jitter; a transiently flaking signer is never surfaced as a
//! permanent issuance failure: the caller leaves the node queued and the
//! next attempt retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::NodeRole;

/// Total attempts made per signing request across the URL pool.
const SIGN_MAX_ATTEMPTS: usize = 5;

/// Initial backoff between attempts; doubled each retry.
const SIGN_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound on the backoff between attempts.
const SIGN_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Per-request timeout against a single signer URL.
const SIGN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// External signing errors. All of these are transient from the issuance
/// loop's point of view.
#[derive(Debug, Error)]
pub enum ExternalCaError {
    /// The pool has no URLs for the active signing root.
    #[error("no external CA URLs")]
    NoExternalCaUrls,

    /// Every attempt against the pool failed.
    #[error("external signing failed after {attempts} attempts: {last_error}")]
    SigningFailed { attempts: usize, last_error: String },
}

/// A CSR prepared for external signing: the raw CSR plus the node
/// identity template the signer must issue it under (CN = node ID,
/// OU = role, O = cluster organization). The signer owns subject,
/// usage and validity; only the public key comes from the CSR.
#[derive(Clone, Debug)]
pub struct PreparedCsr {
    /// PEM-encoded CSR as submitted by the node.
    pub csr_pem: String,
    /// Node ID issued as the certificate common name.
    pub node_id: String,
    /// Role issued as the certificate organizational unit.
    pub role: NodeRole,
    /// Cluster organization.
    pub organization: String,
}

/// cfssl sign request body.
#[derive(Debug, Serialize)]
struct SignRequestBody<'a> {
    certificate_request: &'a str,
    subject: SubjectBody<'a>,
}

/// cfssl subject override accompanying the sign request.
#[derive(Debug, Serialize)]
struct SubjectBody<'a> {
    #[serde(rename = "CN")]
    common_name: &'a str,
    names: Vec<SubjectName<'a>>,
}

#[derive(Debug, Serialize)]
struct SubjectName<'a> {
    #[serde(rename = "O")]
    organization: &'a str,
    #[serde(rename = "OU")]
    organizational_unit: &'a str,
}

/// cfssl response envelope.
#[derive(Debug, Deserialize)]
struct SignResponse {
    success: bool,
    #[serde(default)]
    result: Option<SignResult>,
    #[serde(default)]
    errors: Vec<SignResponseError>,
}

#[derive(Debug, Deserialize)]
struct SignResult {
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct SignResponseError {
    #[serde(default)]
    message: String,
}

/// A pool of external signer URLs, already filtered to those issuing under
/// the active signing root.
#[derive(Clone, Debug)]
pub struct ExternalCa {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl ExternalCa {
    /// Build a pool over the given URLs.
    pub fn new(urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SIGN_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        ExternalCa { urls, client }
    }

    /// A pool with no signers; every sign attempt fails with
    /// [`ExternalCaError::NoExternalCaUrls`].
    pub fn empty() -> Self {
        ExternalCa::new(Vec::new())
    }

    /// Whether any signer URL is configured.
    pub fn is_configured(&self) -> bool {
        !self.urls.is_empty()
    }

    /// The configured signer URLs.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Submit a prepared CSR for signing, failing over across the URL pool
    /// with exponential backoff.
    pub async fn sign(&self, prepared: &PreparedCsr) -> Result<String, ExternalCaError> {
        if self.urls.is_empty() {
            return Err(ExternalCaError::NoExternalCaUrls);
        }

        let mut delay = SIGN_INITIAL_BACKOFF;
        let mut last_error = String::new();

        for attempt in 0..SIGN_MAX_ATTEMPTS {
            let url = &self.urls[attempt % self.urls.len()];

            match self.sign_once(url, prepared).await {
                Ok(cert) => {
                    debug!(url = %url, attempt = attempt + 1, "external CA signed certificate");
                    return Ok(cert);
                }
                Err(e) => {
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        error = %e,
                        "external CA signing attempt failed"
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < SIGN_MAX_ATTEMPTS {
                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                tokio::time::sleep(Duration::from_secs_f64(delay.as_secs_f64() * jitter)).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * 2.0).min(SIGN_MAX_BACKOFF.as_secs_f64()),
                );
            }
        }

        Err(ExternalCaError::SigningFailed {
            attempts: SIGN_MAX_ATTEMPTS,
            last_error,
        })
    }

    async fn sign_once(&self, url: &str, prepared: &PreparedCsr) -> Result<String, String> {
        let response = self
            .client
            .post(url)
            .json(&SignRequestBody {
                certificate_request: &prepared.csr_pem,
                subject: SubjectBody {
                    common_name: &prepared.node_id,
                    names: vec![SubjectName {
                        organization: &prepared.organization,
                        organizational_unit: prepared.role.organizational_unit(),
                    }],
                },
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("signer returned HTTP {}", response.status()));
        }

        let body: SignResponse = response.json().await.map_err(|e| e.to_string())?;
        if !body.success {
            let reason = body
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unspecified signer error".to_string());
            return Err(reason);
        }

        body.result
            .map(|r| r.certificate)
            .ok_or_else(|| "signer response carried no certificate".to_string())
    }
}
