//! Shared test infrastructure: a mock control plane (admin API, OAuth, STS,
//! IAM credentials) and a mock database server speaking mTLS.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePublicKey, LineEnding};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use url::Url;

use cloudsql_broker::BrokerConfig;

// Install the rustls ring crypto provider once for all tests.
static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Log capture for failing tests; run with RUST_LOG=debug to see broker
/// internals.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Certificate authority
// ============================================================================

/// Stand-in for the Cloud SQL control plane's CA: signs the mock instance's
/// server certificate and the ephemeral client certificates.
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
    pub ca_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().expect("generate ca keypair");

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "Test Cloud SQL Server CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params.self_signed(&key).expect("self-signed ca");
        let ca_pem = cert.pem();

        Self { cert, key, ca_pem }
    }

    /// Server certificate for the mock instance. Like the real control
    /// plane's, it names the instance by CN and carries no SAN for the
    /// loopback address we dial.
    pub fn server_identity(&self, cn: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().expect("generate server keypair");

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign server cert");

        (
            CertificateDer::from(cert.der().to_vec()),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }

    /// Signs an ephemeral client certificate for the submitted SPKI, the way
    /// `generateEphemeralCert` binds the caller's public key.
    pub fn issue_ephemeral(&self, public_key_pem: &str, validity: Duration) -> String {
        let public_key =
            rsa::RsaPublicKey::from_public_key_pem(public_key_pem).expect("parse submitted spki");
        let pkcs1 = public_key.to_pkcs1_der().expect("encode pkcs1");

        let subject = KeyPair::from_remote(Box::new(RsaSpkiOnly {
            der: pkcs1.as_bytes().to_vec(),
        }))
        .expect("wrap submitted public key");

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "ephemeral-client");
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_after = time::OffsetDateTime::now_utc() + validity;

        let cert = params
            .signed_by(&subject, &self.cert, &self.key)
            .expect("sign ephemeral cert");
        cert.pem()
    }
}

/// A public key without signing capability — certificate issuance only needs
/// the SPKI; the issuer's key does the signing.
struct RsaSpkiOnly {
    der: Vec<u8>,
}

impl rcgen::RemoteKeyPair for RsaSpkiOnly {
    fn public_key(&self) -> &[u8] {
        &self.der
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_RSA_SHA256
    }
}

// ============================================================================
// Mock control plane
// ============================================================================

pub struct ControlPlane {
    pub ca: TestCa,
    pub cert_calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    pub oauth_calls: AtomicUsize,
    pub sts_calls: AtomicUsize,
    pub impersonation_calls: AtomicUsize,
    /// Scripted HTTP statuses popped per generateEphemeralCert call.
    pub cert_statuses: Mutex<VecDeque<u16>>,
    /// Scripted HTTP statuses popped per instances.get call.
    pub metadata_statuses: Mutex<VecDeque<u16>>,
    /// Scripted validity per issued certificate; 1 hour when exhausted.
    pub cert_validities: Mutex<VecDeque<Duration>>,
}

impl ControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ca: TestCa::new(),
            cert_calls: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            oauth_calls: AtomicUsize::new(0),
            sts_calls: AtomicUsize::new(0),
            impersonation_calls: AtomicUsize::new(0),
            cert_statuses: Mutex::new(VecDeque::new()),
            metadata_statuses: Mutex::new(VecDeque::new()),
            cert_validities: Mutex::new(VecDeque::new()),
        })
    }

    pub fn script_cert_status(&self, status: u16) {
        self.cert_statuses.lock().unwrap().push_back(status);
    }

    pub fn script_metadata_status(&self, status: u16) {
        self.metadata_statuses.lock().unwrap().push_back(status);
    }

    pub fn script_cert_validity(&self, validity: Duration) {
        self.cert_validities.lock().unwrap().push_back(validity);
    }
}

fn error_envelope(status: u16) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        code,
        Json(json!({ "error": { "code": status, "message": "scripted failure" } })),
    )
        .into_response()
}

async fn oauth_token(State(state): State<Arc<ControlPlane>>) -> Response {
    state.oauth_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "access_token": "sa-access-token",
        "expires_in": 3600,
        "token_type": "Bearer"
    }))
    .into_response()
}

async fn sts_token(State(state): State<Arc<ControlPlane>>) -> Response {
    state.sts_calls.fetch_add(1, Ordering::SeqCst);
    // hold the exchange open briefly so concurrent refreshers overlap
    tokio::time::sleep(Duration::from_millis(50)).await;
    Json(json!({
        "access_token": "federated-token",
        "expires_in": 3600,
        "token_type": "Bearer"
    }))
    .into_response()
}

async fn impersonate(
    State(state): State<Arc<ControlPlane>>,
    Path(action): Path<String>,
) -> Response {
    if !action.ends_with(":generateAccessToken") {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.impersonation_calls.fetch_add(1, Ordering::SeqCst);
    let expire_time = chrono::Utc::now() + chrono::TimeDelta::hours(1);
    Json(json!({
        "accessToken": "impersonated-token",
        "expireTime": expire_time.to_rfc3339()
    }))
    .into_response()
}

async fn instance_get(
    State(state): State<Arc<ControlPlane>>,
    Path((_project, _name)): Path<(String, String)>,
) -> Response {
    state.metadata_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(status) = state.metadata_statuses.lock().unwrap().pop_front() {
        if status != 200 {
            return error_envelope(status);
        }
    }
    Json(json!({
        "kind": "sql#instance",
        "ipAddresses": [
            { "type": "PRIMARY", "ipAddress": "127.0.0.1" }
        ],
        "serverCaCert": { "cert": state.ca.ca_pem }
    }))
    .into_response()
}

async fn instance_post(
    State(state): State<Arc<ControlPlane>>,
    Path((_project, action)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !action.ends_with(":generateEphemeralCert") {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.cert_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(status) = state.cert_statuses.lock().unwrap().pop_front() {
        if status != 200 {
            return error_envelope(status);
        }
    }

    let Some(public_key) = body.get("public_key").and_then(|v| v.as_str()) else {
        return error_envelope(400);
    };
    let validity = state
        .cert_validities
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Duration::from_secs(3600));

    let cert_pem = state.ca.issue_ephemeral(public_key, validity);
    Json(json!({ "ephemeralCert": { "cert": cert_pem } })).into_response()
}

/// Spawns the mock control plane; serves the admin API, the OAuth token
/// endpoint, STS, and IAM credentials from one listener.
pub async fn spawn_control_plane(state: Arc<ControlPlane>) -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route("/token", post(oauth_token))
        .route("/v1/token", post(sts_token))
        .route("/v1/projects/-/serviceAccounts/{action}", post(impersonate))
        .route(
            "/sql/v1beta4/projects/{project}/instances/{action}",
            get(instance_get).post(instance_post),
        )
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve control plane");
    });
    (addr, handle)
}

// ============================================================================
// Mock database server
// ============================================================================

/// Accepts any client certificate but requires one, so the handshake still
/// exercises the broker's client-auth path.
#[derive(Debug)]
struct AnyClientCert;

impl ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

/// Spawns an mTLS echo server standing in for the instance's port 3307.
/// Returns its address; point `BrokerConfig::remote_port` at it.
pub async fn spawn_mock_instance(ca: &TestCa, server_cn: &str) -> (SocketAddr, JoinHandle<()>) {
    init_crypto_provider();

    let (cert, key) = ca.server_identity(server_cn);
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_client_cert_verifier(Arc::new(AnyClientCert))
        .with_single_cert(vec![cert], key)
        .expect("server config");
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                continue;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, handle)
}

// ============================================================================
// Credentials and config
// ============================================================================

// RSA keygen is the slow part of every test; share one test key.
static TEST_RSA_PEM: OnceLock<String> = OnceLock::new();

fn test_rsa_pem() -> &'static str {
    TEST_RSA_PEM.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        key.to_pkcs1_pem(LineEnding::LF).expect("encode pkcs1").to_string()
    })
}

/// Writes a service account key file whose token_uri points at the mock
/// control plane.
pub fn write_sa_key(control_plane: SocketAddr) -> NamedTempFile {
    let sa_json = json!({
        "type": "service_account",
        "project_id": "test-project",
        "private_key_id": "test-key-id",
        "private_key": test_rsa_pem(),
        "client_email": "broker-test@test-project.iam.gserviceaccount.com",
        "client_id": "123456789",
        "auth_uri": "https://accounts.google.com/o/oauth2/auth",
        "token_uri": format!("http://{control_plane}/token"),
        "auth_provider_x509_cert_url": "https://www.googleapis.com/oauth2/v1/certs",
        "client_x509_cert_url": "https://www.googleapis.com/robot/v1/metadata/x509/broker-test"
    });

    let file = NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), serde_json::to_string_pretty(&sa_json).expect("serialize"))
        .expect("write key file");
    file
}

/// Broker config pointed entirely at the mocks.
pub fn test_config(control_plane: SocketAddr, instance_port: u16) -> BrokerConfig {
    BrokerConfig {
        admin_api_base: Url::parse(&format!("http://{control_plane}")).expect("url"),
        sts_token_url: Url::parse(&format!("http://{control_plane}/v1/token")).expect("url"),
        iam_credentials_base: Url::parse(&format!("http://{control_plane}")).expect("url"),
        remote_port: instance_port,
        ..BrokerConfig::default()
    }
}
