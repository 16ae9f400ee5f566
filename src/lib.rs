//! Socket-activated TLS terminating front-end.
//!
//! Accepts browser connections on a single TCP port, classifies each one as
//! plain HTTP or TLS by peeking at the first byte, terminates TLS, answers
//! redirects locally and relays everything else to per-role backend workers
//! reached over Unix sockets published in an activation directory. All
//! connections are multiplexed from one select()-based loop; nothing blocks
//! except the bounded startup wait for the activation readiness marker.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{self, MsgFlags};
use nix::sys::time::TimeVal;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, info, warn};

// Well-known names inside the activation directory.
const READY_MARKER: &str = "ready";
const HTTP_SOCKET: &str = "http.sock";
const HTTPS_SOCKET: &str = "https.sock";
const HTTP_REDIRECT_SOCKET: &str = "http-redirect.sock";

// Bounded startup wait for the activation helper.
const READY_POLL_ATTEMPTS: u32 = 200;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

// To prevent a malformed request from eating up too much memory, answer 400
// once the request head exceeds this many bytes:
const MAX_REQUEST_HEAD: usize = 4000;

// Per-direction relay high-water mark; a side with this much pending output
// stops reading until the buffer drains.
const RELAY_BUFFER_LIMIT: usize = 1 << 16;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal, startup-only: certificate or key material could not be used.
    #[error("credential error: {0}")]
    Credential(String),
    /// Fatal, startup-only: the activation directory was not usable.
    #[error("activation error: {0}")]
    Activation(String),
    /// Per-connection: the TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] rustls::Error),
    /// Per-connection: the request head could not be routed.
    #[error("unroutable request: {0}")]
    Routing(&'static str),
    /// Per-connection: the backend channel is missing or refused.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] io::Error),
}

/// Policy for soliciting a certificate from the peer during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCertMode {
    /// Never ask the peer for a certificate.
    None,
    /// Ask for a certificate, but accept a peer that presents none.
    Request,
}

/// Server certificate, key and client-certificate policy, loaded once at
/// startup and shared read-only by every handshake.
pub struct TlsCredentials {
    config: Arc<rustls::ServerConfig>,
    chain_len: usize,
    client_cert_mode: ClientCertMode,
}

impl TlsCredentials {
    /// Load PEM credentials from disk.
    ///
    /// With `key_path` given, `cert_path` holds one or more certificates
    /// (leaf first) and `key_path` the private key. Without it, `cert_path`
    /// is a combined file holding both the key and the certificate(s).
    pub fn load(
        cert_path: &Path,
        key_path: Option<&Path>,
        client_cert_mode: ClientCertMode,
    ) -> Result<Self, Error> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            Error::Credential(format!("failed to read {}: {}", cert_path.display(), e))
        })?;
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::Credential(format!(
                    "malformed certificate in {}: {}",
                    cert_path.display(),
                    e
                ))
            })?;
        if chain.is_empty() {
            return Err(Error::Credential(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }
        let chain_len = chain.len();

        let key = match key_path {
            Some(key_path) => {
                let key_pem = std::fs::read(key_path).map_err(|e| {
                    Error::Credential(format!("failed to read {}: {}", key_path.display(), e))
                })?;
                rustls_pemfile::private_key(&mut &key_pem[..])
                    .map_err(|e| {
                        Error::Credential(format!("malformed key in {}: {}", key_path.display(), e))
                    })?
                    .ok_or_else(|| {
                        Error::Credential(format!(
                            "no private key found in {}",
                            key_path.display()
                        ))
                    })?
            }
            // combined layout: the key shares the certificate file
            None => rustls_pemfile::private_key(&mut &cert_pem[..])
                .map_err(|e| {
                    Error::Credential(format!("malformed key in {}: {}", cert_path.display(), e))
                })?
                .ok_or_else(|| {
                    Error::Credential(format!(
                        "no private key found in {}",
                        cert_path.display()
                    ))
                })?,
        };

        let builder = rustls::ServerConfig::builder();
        let config = match client_cert_mode {
            ClientCertMode::None => builder.with_no_client_auth(),
            ClientCertMode::Request => {
                builder.with_client_cert_verifier(Arc::new(CertRequestVerifier::new()))
            }
        }
        .with_single_cert(chain, key)
        .map_err(|e| Error::Credential(format!("unusable certificate/key pair: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            chain_len,
            client_cert_mode,
        })
    }

    /// Number of certificates offered to the peer.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    pub fn client_cert_mode(&self) -> ClientCertMode {
        self.client_cert_mode
    }

    fn config(&self) -> Arc<rustls::ServerConfig> {
        self.config.clone()
    }
}

impl fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("chain_len", &self.chain_len)
            .field("client_cert_mode", &self.client_cert_mode)
            .finish()
    }
}

/// Verifier for `ClientCertMode::Request`: solicits a certificate without
/// requiring one. A presented certificate must parse and be inside its
/// validity window; identity policy beyond that belongs to the backend.
#[derive(Debug)]
struct CertRequestVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl CertRequestVerifier {
    fn new() -> Self {
        Self {
            supported_algs: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for CertRequestVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_validity_window(end_entity.as_ref(), now)?;
        Ok(ClientCertVerified::assertion())
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

/// Reject certificates outside their validity window or that fail to parse.
fn check_validity_window(der: &[u8], now: UnixTime) -> Result<(), rustls::Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
    let validity = cert.validity();
    let now = now.as_secs() as i64;
    if validity.not_after.timestamp() < now {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::Expired,
        ));
    }
    if validity.not_before.timestamp() > now {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::NotValidYet,
        ));
    }
    Ok(())
}

/// RFC1123 formatted date.
struct HttpDate(SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// A redirect reply steering the client to the HTTPS form of its request.
fn redirect_response(location: &str, now: SystemTime) -> Vec<u8> {
    let body = format!(
        "<html><head><title>301 Moved Permanently</title></head><body>\n\
        <h1>Moved Permanently</h1>\n\
        Moved to: <a href=\"{}\">{}</a>\n\
        </body></html>\n",
        location, location,
    );
    format!(
        "HTTP/1.1 301 Moved Permanently\r\n\
        Date: {}\r\n\
        Location: {}\r\n\
        Connection: close\r\n\
        Content-Length: {}\r\n\
        Content-Type: text/html; charset=UTF-8\r\n\
        \r\n\
        {}",
        HttpDate(now),
        location,
        body.len(),
        body,
    )
    .into_bytes()
}

/// A minimal reply for requests that cannot be routed.
fn bad_request_response(now: SystemTime) -> Vec<u8> {
    let body = "<html><head><title>400 Bad Request</title></head><body>\n\
        <h1>Bad Request</h1>\n\
        You sent a request that this server couldn't route.\n\
        </body></html>\n";
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
        Date: {}\r\n\
        Connection: close\r\n\
        Content-Length: {}\r\n\
        Content-Type: text/html; charset=UTF-8\r\n\
        \r\n\
        {}",
        HttpDate(now),
        body.len(),
        body,
    )
    .into_bytes()
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    for i in 0..haystack.len() {
        if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// Length of the request head if the buffer already holds the blank line
/// terminating it.
fn head_end(request: &[u8]) -> Option<usize> {
    let crlf = find(b"\r\n\r\n", request).map(|pos| pos + 4);
    let lf = find(b"\n\n", request).map(|pos| pos + 2);
    match (crlf, lf) {
        (Some(crlf), Some(lf)) => Some(crlf.min(lf)),
        (crlf, lf) => crlf.or(lf),
    }
}

struct RequestHead {
    path: String,
    host: Option<String>,
}

/// Parse the request line and the `Host` header out of a complete head.
/// Nothing else is examined; everything past the router is an opaque pipe.
fn parse_request_head(head: &[u8]) -> Result<RequestHead, Error> {
    let head =
        std::str::from_utf8(head).map_err(|_| Error::Routing("request head is not valid UTF-8"))?;
    let mut lines = head.lines();
    let request_line = lines.next().ok_or(Error::Routing("empty request"))?;
    let mut parts = request_line.split(' ').filter(|part| !part.is_empty());
    parts.next().ok_or(Error::Routing("missing method"))?;
    let path = parts
        .next()
        .ok_or(Error::Routing("missing request target"))?
        .to_string();

    let mut host = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                let value = value.trim();
                if !value.is_empty() {
                    host = Some(value.to_string());
                }
                break;
            }
        }
    }
    Ok(RequestHead { path, host })
}

/// Role a connection is serving, assigned at classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Plain,
    Tls,
    RedirectOnly,
}

/// Per-role backend channels resolved from the activation directory.
#[derive(Debug)]
struct BackendTargets {
    http: PathBuf,
    https: Option<PathBuf>,
}

/// Wait for the activation helper, resolve the backend sockets, and bind the
/// public listener. Fatal failures leave nothing bound.
fn bind_from_activation(
    directory: &Path,
    port: u16,
    tls_enabled: bool,
) -> Result<(TcpListener, BackendTargets), Error> {
    let marker = directory.join(READY_MARKER);
    let mut attempts = 0;
    while !marker.exists() {
        attempts += 1;
        if attempts >= READY_POLL_ATTEMPTS {
            return Err(Error::Activation(format!(
                "no readiness marker in {} after {} attempts",
                directory.display(),
                READY_POLL_ATTEMPTS
            )));
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }

    let http = require_socket(directory, HTTP_SOCKET)?;
    let https = if tls_enabled {
        let https = require_socket(directory, HTTPS_SOCKET)?;
        require_socket(directory, HTTP_REDIRECT_SOCKET)?;
        Some(https)
    } else {
        None
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .map_err(|e| Error::Activation(format!("failed to bind {}: {}", addr, e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::Activation(format!("failed to make listener nonblocking: {}", e)))?;

    Ok((listener, BackendTargets { http, https }))
}

fn require_socket(directory: &Path, name: &str) -> Result<PathBuf, Error> {
    let path = directory.join(name);
    if !path.exists() {
        return Err(Error::Activation(format!(
            "missing activation socket {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Transport state of one connection. A connection is never simultaneously
/// handshaking and established.
enum Transport {
    Plain,
    TlsHandshaking(Box<rustls::ServerConnection>),
    TlsEstablished(Box<rustls::ServerConnection>),
}

impl Transport {
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain => false,
            Transport::TlsHandshaking(session) | Transport::TlsEstablished(session) => {
                session.wants_write()
            }
        }
    }
}

/// Byte-stream link to the backend worker for one connection.
struct BackendLink {
    stream: UnixStream,
    to_backend: Vec<u8>,
    to_client: Vec<u8>,
    client_eof: bool,
    backend_eof: bool,
    backend_shut: bool,
    client_shut: bool,
}

impl BackendLink {
    fn attach(target: &Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(target).map_err(Error::BackendUnavailable)?;
        stream
            .set_nonblocking(true)
            .map_err(Error::BackendUnavailable)?;
        Ok(Self {
            stream,
            to_backend: Vec::new(),
            to_client: Vec::new(),
            client_eof: false,
            backend_eof: false,
            backend_shut: false,
            client_shut: false,
        })
    }

    /// Whether more backend output can be buffered right now. The TLS side
    /// gates on a drained session so a stalled client cannot make the
    /// session buffer grow without bound.
    fn can_read_backend(&self, transport: &Transport) -> bool {
        match transport {
            Transport::Plain => self.to_client.len() < RELAY_BUFFER_LIMIT,
            Transport::TlsEstablished(session) => !session.wants_write(),
            Transport::TlsHandshaking(_) => false,
        }
    }

    fn finished(&self, transport: &Transport) -> bool {
        self.client_eof
            && self.backend_eof
            && self.to_backend.is_empty()
            && self.to_client.is_empty()
            && !transport.wants_write()
    }
}

#[derive(Debug, PartialEq)]
enum ConnectionState {
    /// Waiting for the first byte to decide plain vs TLS.
    Classify,
    Handshaking,
    /// Redirect-only role: gathering the request head.
    ReceiveRequest,
    /// Flushing a locally generated reply.
    SendResponse,
    Relay,
    Done,
}

struct Connection {
    id: u64,
    socket: TcpStream,
    peer: IpAddr,
    kind: Option<ListenerKind>,
    transport: Transport,
    state: ConnectionState,
    request: Vec<u8>,
    response: Vec<u8>,
    response_sent: usize,
    backend: Option<BackendLink>,
    saw_request: bool,
    last_active: Instant,
}

impl Connection {
    fn new(id: u64, socket: TcpStream, peer: IpAddr, now: Instant) -> Self {
        Self {
            id,
            socket,
            peer,
            kind: None,
            transport: Transport::Plain,
            state: ConnectionState::Classify,
            request: Vec::new(),
            response: Vec::new(),
            response_sent: 0,
            backend: None,
            saw_request: false,
            last_active: now,
        }
    }

    fn fail(&mut self, error: Error) {
        warn!(id = self.id, peer = %self.peer, error = %error, "dropping connection");
        self.state = ConnectionState::Done;
    }
}

/// Decide what an accepted connection is by peeking at its first byte.
fn poll_classify(
    conn: &mut Connection,
    tls: Option<&TlsCredentials>,
    backends: &BackendTargets,
    now: Instant,
) {
    assert_eq!(conn.state, ConnectionState::Classify);
    let mut first = [0; 1];
    match socket::recv(conn.socket.as_raw_fd(), &mut first, MsgFlags::MSG_PEEK) {
        Ok(received) if received > 0 => {}
        Err(nix::Error::Sys(Errno::EAGAIN)) => return,
        _ => {
            // closure or other error before a single byte arrived
            conn.state = ConnectionState::Done;
            return;
        }
    }
    conn.last_active = now;

    match tls {
        None => {
            conn.kind = Some(ListenerKind::Plain);
            attach_backend(conn, &backends.http);
        }
        Some(credentials) => {
            if first[0] == TLS_HANDSHAKE_RECORD {
                conn.kind = Some(ListenerKind::Tls);
                match rustls::ServerConnection::new(credentials.config()) {
                    Ok(session) => {
                        conn.transport = Transport::TlsHandshaking(Box::new(session));
                        conn.state = ConnectionState::Handshaking;
                        poll_handshake(conn, backends, now);
                    }
                    Err(e) => conn.fail(Error::Handshake(e)),
                }
                return;
            }
            // plaintext while TLS is expected: decoy role, never forwarded
            conn.kind = Some(ListenerKind::RedirectOnly);
            conn.state = ConnectionState::ReceiveRequest;
            poll_receive_request(conn, now);
            return;
        }
    }

    // go straight on to the relay instead of going through another
    // iteration of the select() loop
    if conn.state == ConnectionState::Relay {
        poll_relay(conn, now);
    }
}

fn attach_backend(conn: &mut Connection, target: &Path) {
    match BackendLink::attach(target) {
        Ok(link) => {
            debug!(id = conn.id, kind = ?conn.kind, backend = %target.display(), "attached backend");
            conn.backend = Some(link);
            conn.state = ConnectionState::Relay;
        }
        Err(error) => conn.fail(error),
    }
}

/// Advance the handshake by one non-blocking step.
fn poll_handshake(conn: &mut Connection, backends: &BackendTargets, now: Instant) {
    assert_eq!(conn.state, ConnectionState::Handshaking);
    let session = match &mut conn.transport {
        Transport::TlsHandshaking(session) => session,
        _ => panic!("handshaking connection without a handshaking transport"),
    };

    match session.read_tls(&mut conn.socket) {
        Ok(0) => {
            // peer went away mid-handshake
            conn.state = ConnectionState::Done;
            return;
        }
        Ok(_) => conn.last_active = now,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(_) => {
            conn.state = ConnectionState::Done;
            return;
        }
    }

    if let Err(e) = session.process_new_packets() {
        // flush the alert if the socket takes it, then drop; no HTTP bytes
        // are ever sent for malformed TLS
        let _ = session.write_tls(&mut conn.socket);
        conn.fail(Error::Handshake(e));
        return;
    }

    while session.wants_write() {
        match session.write_tls(&mut conn.socket) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => {
                conn.state = ConnectionState::Done;
                return;
            }
        }
    }

    if !session.is_handshaking() {
        let session = match std::mem::replace(&mut conn.transport, Transport::Plain) {
            Transport::TlsHandshaking(session) => session,
            _ => unreachable!(),
        };
        conn.transport = Transport::TlsEstablished(session);
        debug!(id = conn.id, "TLS established");
        match backends.https.as_deref() {
            Some(target) => attach_backend(conn, target),
            None => conn.fail(Error::BackendUnavailable(io::Error::new(
                io::ErrorKind::NotFound,
                "no TLS backend configured",
            ))),
        }
        if conn.state == ConnectionState::Relay {
            poll_relay(conn, now);
        }
    }
}

/// Redirect-only role: receive bytes until the request head is complete,
/// then queue the local reply.
fn poll_receive_request(conn: &mut Connection, now: Instant) {
    assert_eq!(conn.state, ConnectionState::ReceiveRequest);
    let mut buf = [0; 1 << 15];
    let received = match socket::recv(conn.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
        Ok(received) if received > 0 => received,
        Err(nix::Error::Sys(Errno::EAGAIN)) => return,
        _ => {
            // closure or other error
            conn.state = ConnectionState::Done;
            return;
        }
    };
    conn.last_active = now;
    conn.request.extend(&buf[..received]);

    let reply = if let Some(end) = head_end(&conn.request) {
        match parse_request_head(&conn.request[..end]) {
            Ok(RequestHead {
                path,
                host: Some(host),
            }) => {
                let location = format!("https://{}{}", host, path);
                Some(redirect_response(&location, SystemTime::now()))
            }
            Ok(RequestHead { host: None, .. }) => {
                debug!(id = conn.id, error = %Error::Routing("missing Host header"), "bad request");
                Some(bad_request_response(SystemTime::now()))
            }
            Err(error) => {
                debug!(id = conn.id, error = %error, "bad request");
                Some(bad_request_response(SystemTime::now()))
            }
        }
    } else if conn.request.len() > MAX_REQUEST_HEAD {
        debug!(id = conn.id, error = %Error::Routing("request head too long"), "bad request");
        Some(bad_request_response(SystemTime::now()))
    } else {
        None // wait for more bytes
    };

    if let Some(reply) = reply {
        conn.response = reply;
        conn.request = Vec::new(); // request not needed anymore
        conn.state = ConnectionState::SendResponse;
        poll_send_response(conn, now);
    }
}

/// Flush a locally generated reply, then close.
fn poll_send_response(conn: &mut Connection, now: Instant) {
    assert_eq!(conn.state, ConnectionState::SendResponse);
    let sent = match socket::send(
        conn.socket.as_raw_fd(),
        &conn.response[conn.response_sent..],
        MsgFlags::empty(),
    ) {
        Ok(sent) if sent > 0 => sent,
        Err(nix::Error::Sys(Errno::EAGAIN)) => return,
        _ => {
            // closure or other error
            conn.state = ConnectionState::Done;
            return;
        }
    };
    conn.last_active = now;
    conn.response_sent += sent;
    if conn.response_sent == conn.response.len() {
        conn.state = ConnectionState::Done;
    }
}

/// Move bytes between the client and the backend, decrypting/encrypting on
/// the client side when the transport is TLS. No protocol reinterpretation.
fn poll_relay(conn: &mut Connection, now: Instant) {
    assert_eq!(conn.state, ConnectionState::Relay);
    let Connection {
        socket,
        transport,
        backend,
        state,
        saw_request,
        last_active,
        ..
    } = conn;
    let link = backend.as_mut().expect("relay without backend link");

    match relay_step(socket, transport, link, saw_request) {
        Ok(()) => {
            *last_active = now;
            if link.finished(transport) {
                *state = ConnectionState::Done;
            }
        }
        Err(()) => *state = ConnectionState::Done,
    }
}

fn relay_step(
    socket: &mut TcpStream,
    transport: &mut Transport,
    link: &mut BackendLink,
    saw_request: &mut bool,
) -> Result<(), ()> {
    // client -> relay buffer
    if !link.client_eof && link.to_backend.len() < RELAY_BUFFER_LIMIT {
        match transport {
            Transport::Plain => {
                let mut buf = [0; 1 << 15];
                match socket::recv(socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                    Ok(0) => link.client_eof = true,
                    Ok(received) => {
                        *saw_request = true;
                        link.to_backend.extend(&buf[..received]);
                    }
                    Err(nix::Error::Sys(Errno::EAGAIN)) => {}
                    Err(_) => return Err(()),
                }
            }
            Transport::TlsEstablished(session) => {
                match session.read_tls(socket) {
                    Ok(0) => link.client_eof = true,
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => return Err(()),
                }
                let io_state = match session.process_new_packets() {
                    Ok(io_state) => io_state,
                    Err(_) => {
                        let _ = session.write_tls(socket);
                        return Err(());
                    }
                };
                if io_state.peer_has_closed() {
                    link.client_eof = true;
                }
                let available = io_state.plaintext_bytes_to_read();
                if available > 0 {
                    *saw_request = true;
                    let start = link.to_backend.len();
                    link.to_backend.resize(start + available, 0);
                    session
                        .reader()
                        .read_exact(&mut link.to_backend[start..])
                        .map_err(|_| ())?;
                }
            }
            Transport::TlsHandshaking(_) => panic!("relay on a handshaking transport"),
        }
    }

    // relay buffer -> backend
    if !link.to_backend.is_empty() {
        match link.stream.write(&link.to_backend) {
            Ok(written) => {
                link.to_backend.drain(..written);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => return Err(()),
        }
    }
    if link.client_eof && link.to_backend.is_empty() && !link.backend_shut {
        let _ = link.stream.shutdown(Shutdown::Write);
        link.backend_shut = true;
    }

    // backend -> relay buffer
    if !link.backend_eof && link.can_read_backend(transport) {
        let mut buf = [0; 1 << 15];
        match link.stream.read(&mut buf) {
            Ok(0) => link.backend_eof = true,
            Ok(received) => link.to_client.extend(&buf[..received]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => return Err(()),
        }
    }

    // relay buffer -> client
    match transport {
        Transport::Plain => {
            if !link.to_client.is_empty() {
                match socket::send(socket.as_raw_fd(), &link.to_client, MsgFlags::empty()) {
                    Ok(sent) => {
                        link.to_client.drain(..sent);
                    }
                    Err(nix::Error::Sys(Errno::EAGAIN)) => {}
                    Err(_) => return Err(()),
                }
            }
            if link.backend_eof && link.to_client.is_empty() && !link.client_shut {
                let _ = socket.shutdown(Shutdown::Write);
                link.client_shut = true;
            }
        }
        Transport::TlsEstablished(session) => {
            if !link.to_client.is_empty() {
                session
                    .writer()
                    .write_all(&link.to_client)
                    .map_err(|_| ())?;
                link.to_client.clear();
            }
            if link.backend_eof && !link.client_shut {
                session.send_close_notify();
                link.client_shut = true;
            }
            while session.wants_write() {
                match session.write_tls(socket) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return Err(()),
                }
            }
        }
        Transport::TlsHandshaking(_) => panic!("relay on a handshaking transport"),
    }

    Ok(())
}

/// Close connections that never produced routable bytes within the timeout.
/// Established relays are governed by their peers, not by this sweep.
fn poll_check_timeout(conn: &mut Connection, timeout: Option<Duration>, now: Instant) {
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return,
    };
    let waiting_for_client = match conn.state {
        ConnectionState::Classify
        | ConnectionState::Handshaking
        | ConnectionState::ReceiveRequest
        | ConnectionState::SendResponse => true,
        ConnectionState::Relay => !conn.saw_request,
        ConnectionState::Done => false,
    };
    if waiting_for_client && now.duration_since(conn.last_active) >= timeout {
        debug!(id = conn.id, "connection timed out");
        conn.state = ConnectionState::Done;
    }
}

fn register_interest(conn: &Connection, recv_set: &mut FdSet, send_set: &mut FdSet) {
    let fd = conn.socket.as_raw_fd();
    match conn.state {
        ConnectionState::Classify
        | ConnectionState::Handshaking
        | ConnectionState::ReceiveRequest => {
            recv_set.insert(fd);
            if conn.transport.wants_write() {
                send_set.insert(fd);
            }
        }
        ConnectionState::SendResponse => {
            send_set.insert(fd);
        }
        ConnectionState::Relay => {
            let link = conn.backend.as_ref().expect("relay without backend link");
            if !link.client_eof && link.to_backend.len() < RELAY_BUFFER_LIMIT {
                recv_set.insert(fd);
            }
            if conn.transport.wants_write() || !link.to_client.is_empty() {
                send_set.insert(fd);
            }
            let backend_fd = link.stream.as_raw_fd();
            if !link.backend_eof && link.can_read_backend(&conn.transport) {
                recv_set.insert(backend_fd);
            }
            if !link.to_backend.is_empty() {
                send_set.insert(backend_fd);
            }
        }
        ConnectionState::Done => {}
    }
}

fn connection_ready(conn: &Connection, recv_set: &mut FdSet, send_set: &mut FdSet) -> bool {
    let fd = conn.socket.as_raw_fd();
    if recv_set.contains(fd) || send_set.contains(fd) {
        return true;
    }
    if let Some(link) = conn.backend.as_ref() {
        let backend_fd = link.stream.as_raw_fd();
        if recv_set.contains(backend_fd) || send_set.contains(backend_fd) {
            return true;
        }
    }
    false
}

fn dispatch_connection(
    conn: &mut Connection,
    tls: Option<&TlsCredentials>,
    backends: &BackendTargets,
    now: Instant,
) {
    match conn.state {
        ConnectionState::Classify => poll_classify(conn, tls, backends, now),
        ConnectionState::Handshaking => poll_handshake(conn, backends, now),
        ConnectionState::ReceiveRequest => poll_receive_request(conn, now),
        ConnectionState::SendResponse => poll_send_response(conn, now),
        ConnectionState::Relay => poll_relay(conn, now),
        ConnectionState::Done => {}
    }
}

/// The server: one public listener, the connection table, and the loop
/// state. Explicitly owned; `init` constructs it and `cleanup` consumes it,
/// so a second init without an intervening cleanup is unrepresentable.
pub struct ServerState {
    listener: TcpListener,
    port: u16,
    tls: Option<TlsCredentials>,
    backends: BackendTargets,
    connections: Vec<Connection>,
    next_id: u64,
    idle_since: Option<Instant>,
    request_timeout: Option<Duration>,
    max_connections: Option<usize>,
}

impl ServerState {
    /// One-time setup: load credentials, wait for the activation helper,
    /// resolve the backend sockets and bind the public port. Fatal errors
    /// abort initialization without leaving a bound listener behind.
    pub fn init(
        activation_dir: &Path,
        port: u16,
        certificate_path: Option<&Path>,
        key_path: Option<&Path>,
        client_cert_mode: ClientCertMode,
    ) -> Result<Self, Error> {
        let tls = certificate_path
            .map(|cert_path| TlsCredentials::load(cert_path, key_path, client_cert_mode))
            .transpose()?;
        let (listener, backends) = bind_from_activation(activation_dir, port, tls.is_some())?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Activation(format!("failed to read bound address: {}", e)))?
            .port();
        info!(
            port,
            tls = tls.is_some(),
            chain_len = tls.as_ref().map(TlsCredentials::chain_len).unwrap_or(0),
            "listening"
        );
        Ok(Self {
            listener,
            port,
            tls,
            backends,
            connections: Vec::new(),
            next_id: 0,
            idle_since: Some(Instant::now()),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            max_connections: None,
        })
    }

    /// The actually bound port (useful when `init` was given port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current number of live connections.
    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// How long a connection may sit without routable bytes before it is
    /// closed. `None` disables the sweep.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    /// Stop accepting while at this many live connections.
    pub fn set_max_connections(&mut self, limit: Option<usize>) {
        self.max_connections = limit;
    }

    /// Advance the loop by exactly one iteration, waiting at most `timeout`
    /// for readiness. Returns whether any event was dispatched.
    pub fn poll_event(&mut self, timeout: Duration) -> bool {
        let mut recv_set = FdSet::new();
        let mut send_set = FdSet::new();

        let at_capacity =
            matches!(self.max_connections, Some(limit) if self.connections.len() >= limit);
        if !at_capacity {
            recv_set.insert(self.listener.as_raw_fd());
        }
        for conn in self.connections.iter() {
            register_interest(conn, &mut recv_set, &mut send_set);
        }

        let mut timeval = TimeVal::from(libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        });
        match select(
            None,
            Some(&mut recv_set),
            Some(&mut send_set),
            None,
            Some(&mut timeval),
        ) {
            Ok(_) => {}
            Err(e) => {
                if e.as_errno() == Some(Errno::EINTR) {
                    return false; // interrupted by signal
                } else {
                    panic!("select() failed: {}", e)
                }
            }
        }

        let now = Instant::now();
        let mut dispatched = false;

        if !at_capacity && recv_set.contains(self.listener.as_raw_fd()) {
            self.accept_connection(now);
            dispatched = true;
        }

        let mut index = 0;
        while index < self.connections.len() {
            poll_check_timeout(&mut self.connections[index], self.request_timeout, now);

            if self.connections[index].state != ConnectionState::Done
                && connection_ready(&self.connections[index], &mut recv_set, &mut send_set)
            {
                dispatch_connection(
                    &mut self.connections[index],
                    self.tls.as_ref(),
                    &self.backends,
                    now,
                );
                dispatched = true;
            }

            if self.connections[index].state == ConnectionState::Done {
                // clean out finished connection
                let conn = self.connections.remove(index);
                debug!(id = conn.id, peer = %conn.peer, kind = ?conn.kind, "connection closed");
                dispatched = true;
                if self.connections.is_empty() {
                    self.idle_since = Some(now);
                }
            } else {
                index += 1;
            }
        }

        dispatched
    }

    /// Run the loop until there have been no connections for `idle_timeout`.
    pub fn run(&mut self, idle_timeout: Duration) {
        // granularity of the inactivity sweep while connections are live
        const RUN_TICK: Duration = Duration::from_millis(250);
        loop {
            let wait = if self.connections.is_empty() {
                let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
                let elapsed = idle_since.elapsed();
                if elapsed >= idle_timeout {
                    return;
                }
                idle_timeout - elapsed
            } else {
                RUN_TICK
            };
            self.poll_event(wait);
        }
    }

    /// Release every listener and connection. New connection attempts
    /// against the previously bound port are refused once this returns.
    pub fn cleanup(self) {
        debug!(
            port = self.port,
            connections = self.connections.len(),
            "server cleanup"
        );
        for conn in &self.connections {
            let _ = conn.socket.shutdown(Shutdown::Both);
        }
        // dropping self closes the listener and every remaining descriptor
    }

    /// Accept one connection and classify it right away rather than going
    /// through another iteration of the select() loop.
    fn accept_connection(&mut self, now: Instant) {
        let (stream, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // failed to accept, but try to keep serving existing connections
                warn!("accept() failed: {}", e);
                return;
            }
        };
        stream
            .set_nonblocking(true)
            .expect("set_nonblocking failed");

        let id = self.next_id;
        self.next_id += 1;
        debug!(id, peer = %addr, "accepted connection");
        self.idle_since = None;

        self.connections
            .push(Connection::new(id, stream, addr.ip(), now));
        let index = self.connections.len() - 1;
        poll_classify(
            &mut self.connections[index],
            self.tls.as_ref(),
            &self.backends,
            now,
        );
    }
}
