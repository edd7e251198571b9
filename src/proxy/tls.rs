use std::net::SocketAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::certs::ClientIdentity;
use crate::error::{Error, Result};

/// Get the crypto provider (ring)
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create a TLS client config for one connection to the instance: the
/// ephemeral identity as client auth, trust pinned to the instance's
/// server CA.
pub(crate) fn client_config(
    identity: &ClientIdentity,
    server_ca: &[CertificateDer<'static>],
    expected_cn: &str,
) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in server_ca {
        roots.add(cert.clone())?;
    }

    let verifier = InstanceServerVerifier::new(Arc::new(roots), expected_cn.to_string())?;

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![identity.cert()], identity.key())?;

    Ok(config)
}

/// Dial the instance and complete the mTLS handshake.
///
/// The instance is addressed by IP; its certificate names the instance by
/// common name rather than by a SAN for that IP, so name validation is
/// handled by [`InstanceServerVerifier`].
pub(crate) async fn connect_instance(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(config);
    let server_name = ServerName::IpAddress(addr.ip().into());

    let stream = connector.connect(server_name, tcp).await?;
    debug!(addr = %addr, "mtls session established");
    Ok(stream)
}

/// Verifier that pins the instance's server CA and accepts its canonical
/// common name.
///
/// Chain validation is delegated to webpki over a root store holding only
/// the CA from `instances.get`. The server certificate carries the
/// instance's `project:name` as its subject CN and no SAN for the dialed
/// address, so webpki's name check is expected to fail; that specific
/// failure is accepted iff the CN matches the instance we intended to reach.
#[derive(Debug)]
pub(crate) struct InstanceServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected_cn: String,
}

impl InstanceServerVerifier {
    pub(crate) fn new(roots: Arc<RootCertStore>, expected_cn: String) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, crypto_provider())
            .build()
            .map_err(|e| Error::Certificate(format!("server ca verifier: {e}")))?;
        Ok(Self { inner, expected_cn })
    }

    fn common_name_matches(&self, end_entity: &CertificateDer<'_>) -> bool {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(end_entity.as_ref()) else {
            return false;
        };
        let matches = cert
            .subject()
            .iter_common_name()
            .filter_map(|attr| attr.as_str().ok())
            .any(|cn| cn == self.expected_cn);
        matches
    }
}

impl ServerCertVerifier for InstanceServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) if self.common_name_matches(end_entity) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
