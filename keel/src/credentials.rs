//! Per-run storage credentials.
//!
//! Every run gets its own short-lived credential whose access is limited to
//! the run's namespace prefix. Nothing here caches: each call to
//! [`CredentialBroker::get_credentials`] goes to the identity provider.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::channel::SecureChannel;
use crate::config::CredentialBrokerConfig;
use crate::error::CredentialError;
use crate::run::Namespace;
use crate::telemetry::credential_span;

/// Time-limited storage credential scoped to one namespace.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub namespace: Namespace,
    /// Object prefix the credential may touch, always `<namespace>/*`.
    pub allowed_prefix: String,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_scoped_to(&self, namespace: &Namespace) -> bool {
        self.allowed_prefix == namespace.allowed_prefix()
    }

    /// Check that this credential may be handed to a run in `namespace`.
    pub fn validate_for(&self, namespace: &Namespace) -> Result<(), CredentialError> {
        if !self.is_scoped_to(namespace) {
            return Err(CredentialError::ScopeMismatch {
                expected: namespace.allowed_prefix(),
                actual: self.allowed_prefix.clone(),
            });
        }
        if self.is_expired() {
            return Err(CredentialError::Expired {
                namespace: namespace.to_string(),
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("namespace", &self.namespace)
            .field("allowed_prefix", &self.allowed_prefix)
            .finish()
    }
}

/// Source of namespace-scoped credentials.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn get_credentials(
        &self,
        principal: &str,
        namespace: &Namespace,
    ) -> Result<Credential, CredentialError>;
}

/// Inline session policy granting object access below `<resource>/<namespace>/`
/// and listing restricted to the same prefix.
pub fn scoped_policy(resource: &str, namespace: &Namespace) -> Value {
    let resource = resource.trim_end_matches('/');
    let prefix = namespace.allowed_prefix();
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
                "Resource": [format!("{resource}/{prefix}")],
            },
            {
                "Effect": "Allow",
                "Action": ["s3:ListBucket"],
                "Resource": [resource],
                "Condition": { "StringLike": { "s3:prefix": [prefix] } },
            },
        ],
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VendRequest<'a> {
    pub principal: &'a str,
    pub namespace: &'a str,
    pub policy: Value,
    pub duration_seconds: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VendResponse {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub allowed_prefix: String,
}

/// Broker that asks an identity provider to vend scoped session credentials
/// at `POST <endpoint>/v1/credentials`.
#[derive(Clone, Debug)]
pub struct HttpCredentialBroker {
    channel: SecureChannel,
    config: CredentialBrokerConfig,
}

impl HttpCredentialBroker {
    pub const PATH: &'static str = "v1/credentials";

    pub fn new(channel: SecureChannel, config: CredentialBrokerConfig) -> Self {
        Self { channel, config }
    }

    pub fn config(&self) -> &CredentialBrokerConfig {
        &self.config
    }

    async fn vend(
        &self,
        principal: &str,
        namespace: &Namespace,
    ) -> Result<Credential, CredentialError> {
        let request = VendRequest {
            principal,
            namespace: namespace.as_str(),
            policy: scoped_policy(&self.config.resource, namespace),
            duration_seconds: self.config.session_duration_secs,
        };

        let response = self
            .channel
            .post_json(Self::PATH, &request)?
            .send()
            .await
            .map_err(CredentialError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let vended: VendResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Decode(e.to_string()))?;

        let credential = Credential {
            access_key: vended.access_key,
            secret_key: vended.secret_key,
            session_token: vended.session_token,
            expires_at: vended.expires_at,
            namespace: namespace.clone(),
            allowed_prefix: vended.allowed_prefix,
        };
        credential.validate_for(namespace)?;

        tracing::debug!(expires_at = %credential.expires_at, "credential issued");
        Ok(credential)
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn get_credentials(
        &self,
        principal: &str,
        namespace: &Namespace,
    ) -> Result<Credential, CredentialError> {
        self.vend(principal, namespace)
            .instrument(credential_span(principal, namespace))
            .await
    }
}
