//! Thin client for the Cloud SQL admin API.
//!
//! Attaches a bearer token from the configured [`TokenSource`] to every
//! outbound request. The token source is consulted per request rather than
//! cached here — the source owns expiry and refresh.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::InstanceKey;
use crate::error::{Error, Result};
use crate::retry::cancellable;
use crate::token::TokenSource;

/// Connection details for one instance, from `instances.get`.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    /// Public address the instance serves mTLS on.
    pub ip_address: IpAddr,
    /// CA that signs the instance's server certificate.
    pub server_ca: Vec<CertificateDer<'static>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateEphemeralCertResponse {
    ephemeral_cert: SslCert,
}

#[derive(Deserialize)]
struct SslCert {
    cert: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseInstance {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    server_ca_cert: Option<SslCert>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Clone)]
pub struct SqlAdminClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base: Url,
}

impl SqlAdminClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>, base: Url) -> Self {
        Self { http, tokens, base }
    }

    /// Asks the control plane to sign `public_key_pem` (PEM-encoded SPKI)
    /// into a short-lived client certificate. Returns the certificate PEM.
    pub async fn generate_ephemeral_cert(
        &self,
        key: &InstanceKey,
        public_key_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.instance_url(&key.project, &format!("{}:generateEphemeralCert", key.admin_path()))?;
        let token = self.tokens.token(cancel).await?;

        debug!(key = %key, "requesting ephemeral certificate");
        let request = self
            .http
            .post(url)
            .bearer_auth(token.expose())
            .json(&serde_json::json!({ "public_key": public_key_pem }))
            .send();
        let response = cancellable(cancel, async { Ok(request.await?) }).await?;

        let response = check("sqladmin generateEphemeralCert", response).await?;
        let body: GenerateEphemeralCertResponse = response.json().await?;
        Ok(body.ephemeral_cert.cert)
    }

    /// Fetches the instance's public address and server CA.
    pub async fn instance_metadata(
        &self,
        key: &InstanceKey,
        cancel: &CancellationToken,
    ) -> Result<InstanceMetadata> {
        let url = self.instance_url(&key.project, &key.name)?;
        let token = self.tokens.token(cancel).await?;

        debug!(key = %key, "resolving instance metadata");
        let request = self.http.get(url).bearer_auth(token.expose()).send();
        let response = cancellable(cancel, async { Ok(request.await?) }).await?;

        let response = check("sqladmin instances.get", response).await?;
        let body: DatabaseInstance = response.json().await?;

        let ip_address = body
            .ip_addresses
            .iter()
            .find(|m| m.kind == "PRIMARY")
            .or_else(|| body.ip_addresses.first())
            .ok_or_else(|| {
                Error::Certificate(format!("instance {key} has no ip address assigned"))
            })?
            .ip_address
            .parse()
            .map_err(|e| Error::Certificate(format!("instance {key} ip address: {e}")))?;

        let ca_pem = body
            .server_ca_cert
            .ok_or_else(|| Error::Certificate(format!("instance {key} has no server CA")))?
            .cert;
        let server_ca = parse_cert_pem(&ca_pem)?;

        Ok(InstanceMetadata {
            ip_address,
            server_ca,
        })
    }

    fn instance_url(&self, project: &str, instance: &str) -> Result<Url> {
        self.base
            .join(&format!(
                "sql/v1beta4/projects/{project}/instances/{instance}"
            ))
            .map_err(|e| Error::Certificate(format!("bad admin api url: {e}")))
    }
}

/// Parses one or more PEM certificates into DER.
pub(crate) fn parse_cert_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Certificate(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Certificate("no certificate in PEM".into()));
    }
    Ok(certs)
}

/// Maps a non-2xx response to an API error, extracting the message from
/// Google's error envelope when the body carries one.
async fn check(endpoint: &'static str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorEnvelope>(&text)
        .map(|envelope| envelope.error.message)
        .unwrap_or(text);
    Err(Error::Api {
        endpoint,
        status: status.as_u16(),
        message,
    })
}
