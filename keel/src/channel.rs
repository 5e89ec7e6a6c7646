//! Outbound channels to executor and credential services.
//!
//! A [`SecureChannel`] wraps a pooled HTTP client that multiplexes requests
//! over HTTP/2. Cleartext (h2c prior knowledge) is used for trusted
//! intra-cluster traffic; configuring a CA bundle switches to TLS pinned to
//! that bundle, and a client certificate and key add mutual TLS.

use std::fmt::{self, Display};
use std::path::Path;

use reqwest::{Certificate, Client, Identity, Url};
use serde::Serialize;

use crate::config::ChannelConfig;
use crate::error::ConfigurationError;

/// How a channel protects its traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Cleartext,
    Tls,
    MutualTls,
}

impl Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Cleartext => "cleartext",
            Transport::Tls => "tls",
            Transport::MutualTls => "mtls",
        })
    }
}

/// A reusable client bound to one peer endpoint. Cheap to clone; clones share
/// the connection pool.
#[derive(Clone, Debug)]
pub struct SecureChannel {
    client: Client,
    endpoint: Url,
    transport: Transport,
}

impl SecureChannel {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Resolve `path` against the endpoint, keeping any base path prefix.
    pub fn url(&self, path: &str) -> Result<Url, ConfigurationError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| ConfigurationError::InvalidEndpoint {
                endpoint: format!("{}{}", self.endpoint, path),
                reason: e.to_string(),
            })
    }

    /// Start a JSON POST to `path` on the peer.
    pub fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::RequestBuilder, ConfigurationError> {
        Ok(self.client.post(self.url(path)?).json(body))
    }
}

/// Builds [`SecureChannel`]s from [`ChannelConfig`].
///
/// Every failure here is a configuration problem and is returned as-is;
/// callers must not fall back to a weaker transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecureChannelFactory;

impl SecureChannelFactory {
    pub fn build(config: &ChannelConfig) -> Result<SecureChannel, ConfigurationError> {
        let endpoint = parse_endpoint(&config.endpoint)?;

        let builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout());

        let (builder, transport) = match &config.ca_cert_path {
            None => {
                if config.client_cert_path.is_some() || config.client_key_path.is_some() {
                    tracing::warn!(
                        endpoint = %endpoint,
                        "client certificate configured without CA_CERT_PATH, ignoring it for cleartext transport"
                    );
                }
                if endpoint.scheme() != "http" {
                    return Err(ConfigurationError::SchemeMismatch {
                        endpoint: config.endpoint.clone(),
                        transport: "cleartext",
                    });
                }
                (builder.http2_prior_knowledge(), Transport::Cleartext)
            }
            Some(ca_path) => {
                if endpoint.scheme() != "https" {
                    return Err(ConfigurationError::SchemeMismatch {
                        endpoint: config.endpoint.clone(),
                        transport: "tls",
                    });
                }

                let mut builder = builder
                    .use_rustls_tls()
                    .tls_built_in_root_certs(false)
                    .min_tls_version(reqwest::tls::Version::TLS_1_2)
                    .https_only(true);
                for cert in load_ca_bundle(ca_path)? {
                    builder = builder.add_root_certificate(cert);
                }

                match (&config.client_cert_path, &config.client_key_path) {
                    (Some(cert), Some(key)) => {
                        let identity = load_identity(cert, key)?;
                        (builder.identity(identity), Transport::MutualTls)
                    }
                    (Some(_), None) => {
                        return Err(ConfigurationError::IncompleteIdentity {
                            present: "CLIENT_CERT_PATH",
                        });
                    }
                    (None, Some(_)) => {
                        return Err(ConfigurationError::IncompleteIdentity {
                            present: "CLIENT_KEY_PATH",
                        });
                    }
                    (None, None) => (builder, Transport::Tls),
                }
            }
        };

        let client = builder.build().map_err(ConfigurationError::Client)?;
        tracing::debug!(endpoint = %endpoint, transport = %transport, "built channel");

        Ok(SecureChannel {
            client,
            endpoint,
            transport,
        })
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigurationError> {
    let mut endpoint = Url::parse(raw).map_err(|e| ConfigurationError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: e.to_string(),
    })?;
    if endpoint.cannot_be_a_base() || endpoint.host_str().is_none() {
        return Err(ConfigurationError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: "endpoint must include a host".to_string(),
        });
    }
    // Url::join replaces the last segment unless the base ends with '/'.
    if !endpoint.path().ends_with('/') {
        let path = format!("{}/", endpoint.path());
        endpoint.set_path(&path);
    }
    Ok(endpoint)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigurationError> {
    std::fs::read(path).map_err(|source| ConfigurationError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

fn load_ca_bundle(path: &Path) -> Result<Vec<Certificate>, ConfigurationError> {
    let pem = read_file(path)?;
    let certs =
        Certificate::from_pem_bundle(&pem).map_err(|e| ConfigurationError::InvalidCaBundle {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigurationError::InvalidCaBundle {
            path: path.to_path_buf(),
            reason: "no PEM certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<Identity, ConfigurationError> {
    let mut pem = read_file(key_path)?;
    pem.push(b'\n');
    pem.extend(read_file(cert_path)?);
    Identity::from_pem(&pem).map_err(|e| ConfigurationError::InvalidIdentity {
        reason: e.to_string(),
    })
}
