use std::convert::TryFrom;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tempfile::{tempdir, TempDir};

use tlsgate::{ClientCertMode, ServerState};

pub const HTTP_10_REQUEST: &str = "GET / HTTP/1.0\r\nHost: localhost\r\n\r\n";

/// Which scheme the fake backend believes it is serving, mirrored into its
/// Content-Security-Policy header.
#[derive(Debug, Clone, Copy)]
pub enum Scheme {
    Http,
    Https,
}

/// Stand-in for the backend worker: accepts connections on a Unix socket and
/// answers minimal HTTP. `/` is served, everything else is a 404.
pub fn spawn_backend(path: &Path, scheme: Scheme) {
    let listener = UnixListener::bind(path).expect("failed to bind backend socket");
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    thread::spawn(move || backend_serve(stream, scheme));
                }
                Err(_) => break,
            }
        }
    });
}

fn backend_serve(mut stream: UnixStream, scheme: Scheme) {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();
    let mut request = Vec::new();
    let mut buf = [0; 4096];
    while !head_complete(&request) {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(received) => request.extend(&buf[..received]),
            // a client that never sends a full head gets hung up on
            Err(_) => return,
        }
    }
    let request = String::from_utf8_lossy(&request);
    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

    let connect_src = match scheme {
        Scheme::Http => "http://localhost ws://localhost",
        Scheme::Https => "https://localhost wss://localhost",
    };
    let response = if path == "/" {
        let body = "<html><body>This is the backend speaking.</body></html>\n";
        format!(
            "HTTP/1.1 200 OK\r\n\
            Content-Type: text/html\r\n\
            Content-Security-Policy: connect-src 'self' {};\r\n\
            Content-Length: {}\r\n\
            \r\n\
            {}",
            connect_src,
            body.len(),
            body,
        )
    } else {
        let body = "<html><body>The backend has no such page.</body></html>\n";
        format!(
            "HTTP/1.1 404 Not Found\r\n\
            Content-Type: text/html\r\n\
            Content-Length: {}\r\n\
            \r\n\
            {}",
            body.len(),
            body,
        )
    };
    let _ = stream.write_all(response.as_bytes());
}

fn head_complete(request: &[u8]) -> bool {
    request.windows(4).any(|window| window == b"\r\n\r\n")
        || request.windows(2).any(|window| window == b"\n\n")
}

/// Server certificate material on disk, in one of the supported layouts.
pub struct CertFixture {
    pub cert: PathBuf,
    pub key: Option<PathBuf>,
    pub chain_len: usize,
}

fn write_pem(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).expect("failed to create PEM file");
    file.write_all(contents.as_bytes())
        .expect("failed to write PEM file");
    path
}

fn generate_cert(
    names: &[&str],
    not_before: (i32, u8, u8),
    not_after: (i32, u8, u8),
) -> rcgen::Certificate {
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let mut params = rcgen::CertificateParams::new(names);
    params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
    params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
    rcgen::Certificate::from_params(params).expect("failed to generate certificate")
}

fn server_cert() -> rcgen::Certificate {
    generate_cert(&["localhost"], (2020, 1, 1), (2099, 1, 1))
}

/// Separate certificate and key files.
pub fn separate_cert_key(dir: &Path) -> CertFixture {
    let cert = server_cert();
    CertFixture {
        cert: write_pem(dir, "server.crt", &cert.serialize_pem().unwrap()),
        key: Some(write_pem(
            dir,
            "server.key",
            &cert.serialize_private_key_pem(),
        )),
        chain_len: 1,
    }
}

/// One file holding both the key and the certificate.
pub fn combined_cert_key(dir: &Path) -> CertFixture {
    let cert = server_cert();
    let combined = format!(
        "{}{}",
        cert.serialize_private_key_pem(),
        cert.serialize_pem().unwrap()
    );
    CertFixture {
        cert: write_pem(dir, "server-combined.pem", &combined),
        key: None,
        chain_len: 1,
    }
}

/// One file holding the key and a two-certificate chain.
pub fn cert_chain(dir: &Path) -> CertFixture {
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(2099, 1, 1);
    let ca = rcgen::Certificate::from_params(ca_params).expect("failed to generate CA");
    let leaf = server_cert();
    let combined = format!(
        "{}{}{}",
        leaf.serialize_private_key_pem(),
        leaf.serialize_pem_with_signer(&ca).unwrap(),
        ca.serialize_pem().unwrap()
    );
    CertFixture {
        cert: write_pem(dir, "server-chain.pem", &combined),
        key: None,
        chain_len: 2,
    }
}

/// A client certificate that is currently valid.
pub fn client_cert(dir: &Path) -> (PathBuf, PathBuf) {
    let cert = generate_cert(&["client"], (2020, 1, 1), (2099, 1, 1));
    (
        write_pem(dir, "client.crt", &cert.serialize_pem().unwrap()),
        write_pem(dir, "client.key", &cert.serialize_private_key_pem()),
    )
}

/// A client certificate whose validity window is long gone.
pub fn expired_client_cert(dir: &Path) -> (PathBuf, PathBuf) {
    let cert = generate_cert(&["client"], (2000, 1, 1), (2001, 1, 1));
    (
        write_pem(dir, "client-expired.crt", &cert.serialize_pem().unwrap()),
        write_pem(dir, "client-expired.key", &cert.serialize_private_key_pem()),
    )
}

/// A running server plus the activation directory and fake backends behind
/// it. Drives the loop from the test thread while clients run in helpers.
pub struct TestServer {
    pub dir: TempDir,
    pub server: ServerState,
}

impl TestServer {
    pub fn start(
        fixture: Option<fn(&Path) -> CertFixture>,
        client_cert_mode: ClientCertMode,
    ) -> Self {
        let dir = tempdir().expect("failed to create activation directory");
        let fixture = fixture.map(|fixture| fixture(dir.path()));

        spawn_backend(&dir.path().join("http.sock"), Scheme::Http);
        spawn_backend(&dir.path().join("https.sock"), Scheme::Https);
        // published by the helper for layout completeness; the core only
        // checks that it exists
        UnixListener::bind(dir.path().join("http-redirect.sock"))
            .expect("failed to bind redirect socket");
        File::create(dir.path().join("ready")).expect("failed to create ready marker");

        let server = ServerState::init(
            dir.path(),
            0,
            fixture.as_ref().map(|fixture| fixture.cert.as_path()),
            fixture.as_ref().and_then(|fixture| fixture.key.as_deref()),
            client_cert_mode,
        )
        .expect("failed to initialize server");

        Self { dir, server }
    }

    pub fn start_plain() -> Self {
        Self::start(None, ClientCertMode::None)
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Step the loop until the given client thread has finished.
    pub fn drive_until_finished<T>(&mut self, handle: &thread::JoinHandle<T>) {
        for _ in 0..600 {
            if handle.is_finished() {
                return;
            }
            self.server.poll_event(Duration::from_millis(50));
        }
        panic!("client did not finish");
    }

    /// Step the loop until every connection has been torn down.
    pub fn drain(&mut self) {
        for _ in 0..100 {
            if self.server.num_connections() == 0 {
                return;
            }
            self.server.poll_event(Duration::from_millis(50));
        }
        panic!(
            "connections did not drain: {}",
            self.server.num_connections()
        );
    }

    /// Issue a plain HTTP request and return the raw response.
    pub fn request(&mut self, request: &str) -> String {
        let port = self.port();
        let request = request.to_string();
        let handle = thread::spawn(move || plain_request_blocking(port, &request));
        self.drive_until_finished(&handle);
        handle.join().expect("client thread panicked")
    }

    /// Issue an HTTPS request, optionally with a client certificate.
    /// Returns the number of server certificates observed and the response,
    /// or the TLS-layer error.
    pub fn https_request(
        &mut self,
        client_cert: Option<(PathBuf, PathBuf)>,
        request: &str,
    ) -> Result<TlsOutcome, String> {
        let port = self.port();
        let request = request.to_string();
        let handle = thread::spawn(move || tls_request_blocking(port, client_cert, &request));
        self.drive_until_finished(&handle);
        handle.join().expect("client thread panicked")
    }
}

pub fn plain_request_blocking(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("localhost", port)).expect("failed to connect");
    // set timeouts to prevent tests from hanging
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("failed to read response");
    response
}

pub struct TlsOutcome {
    pub server_certs: usize,
    pub response: String,
}

pub fn tls_request_blocking(
    port: u16,
    client_cert: Option<(PathBuf, PathBuf)>,
    request: &str,
) -> Result<TlsOutcome, String> {
    let config = client_config(client_cert)?;
    let server_name = ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| e.to_string())?;
    let sock = TcpStream::connect(("localhost", port)).map_err(|e| e.to_string())?;
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.set_write_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut conn = conn;
    let mut sock = sock;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock).map_err(|e| e.to_string())?;
    }
    let server_certs = conn.peer_certificates().map(|certs| certs.len()).unwrap_or(0);

    let mut stream = rustls::StreamOwned::new(conn, sock);
    stream
        .write_all(request.as_bytes())
        .map_err(|e| e.to_string())?;
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .map_err(|e| e.to_string())?;

    Ok(TlsOutcome {
        server_certs,
        response: String::from_utf8_lossy(&response).into_owned(),
    })
}

fn client_config(client_cert: Option<(PathBuf, PathBuf)>) -> Result<rustls::ClientConfig, String> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    match client_cert {
        None => Ok(builder.with_no_client_auth()),
        Some((cert_path, key_path)) => {
            let cert_pem = std::fs::read(cert_path).map_err(|e| e.to_string())?;
            let certs = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            let key_pem = std::fs::read(key_path).map_err(|e| e.to_string())?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "no private key".to_string())?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| e.to_string())
        }
    }
}

/// The tests talk to a server presenting freshly minted self-signed
/// certificates; trust is not what is under test here.
#[derive(Debug)]
struct AcceptAnyServerCert {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            supported_algs: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}
