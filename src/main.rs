use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tlsgate::{ClientCertMode, ServerState};

const DEFAULT_PORT: u16 = 9090;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

struct Options {
    activation_dir: PathBuf,
    port: u16,
    certificate: Option<PathBuf>,
    key: Option<PathBuf>,
    client_cert_mode: ClientCertMode,
    idle_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_connections: Option<usize>,
}

impl Options {
    fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().expect("expected at least one argument");
        let activation_dir = match args.next().as_deref() {
            None | Some("--help") => {
                usage(&name); // no activation directory given
                std::process::exit(0);
            }
            Some(dir) => PathBuf::from(dir),
        };
        let mut options = Self {
            activation_dir,
            port: DEFAULT_PORT,
            certificate: None,
            key: None,
            client_cert_mode: ClientCertMode::None,
            idle_timeout: None,
            request_timeout: Some(Duration::from_secs(30)),
            max_connections: None,
        };
        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    options.port = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--cert" => {
                    options.certificate =
                        Some(PathBuf::from(args.next().context("missing path after --cert")?));
                }
                "--key" => {
                    options.key =
                        Some(PathBuf::from(args.next().context("missing path after --key")?));
                }
                "--request-client-certs" => {
                    options.client_cert_mode = ClientCertMode::Request;
                }
                "--idle-timeout" => {
                    let number = args.next().context("missing number after --idle-timeout")?;
                    let secs: u64 = number
                        .parse()
                        .with_context(|| format!("idle-timeout number {} is invalid", number))?;
                    options.idle_timeout = Some(Duration::from_secs(secs));
                }
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let secs: u64 = number
                        .parse()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    options.request_timeout = match secs {
                        0 => None,
                        secs => Some(Duration::from_secs(secs)),
                    };
                }
                "--maxconn" => {
                    let number = args.next().context("missing number after --maxconn")?;
                    options.max_connections = Some(
                        number
                            .parse()
                            .with_context(|| format!("maxconn number {} is invalid", number))?,
                    );
                }
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }
        if options.key.is_some() && options.certificate.is_none() {
            return Err(anyhow!("--key given without --cert"));
        }
        Ok(options)
    }
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/activation-dir [flags]\n\n\
        flags:\t--port number (default: {})\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPass 0 to let the system choose any free port for you.\n\n\
        \t--cert filename (default: no TLS)\n\
        \t\tServer certificate in PEM format. The file may carry a\n\
        \t\tcertificate chain and may also contain the private key.\n\n\
        \t--key filename (default: key is read from the --cert file)\n\
        \t\tPrivate key in PEM format.\n\n\
        \t--request-client-certs\n\
        \t\tAsk TLS clients for a certificate. Clients without one\n\
        \t\tare still served.\n\n\
        \t--idle-timeout secs (default: run until signalled)\n\
        \t\tExit once there have been no connections for this long.\n\n\
        \t--timeout secs (default: 30)\n\
        \t\tIf a connection produces no routable bytes for more than\n\
        \t\tthis many seconds, it will be closed. Set to zero to\n\
        \t\tdisable timeouts.\n\n\
        \t--maxconn number (default: system maximum)\n\
        \t\tSpecifies how many concurrent connections to accept.\n\n",
        argv0, DEFAULT_PORT,
    );
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tlsgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = Options::from_command_line()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = ServerState::init(
        &options.activation_dir,
        options.port,
        options.certificate.as_deref(),
        options.key.as_deref(),
        options.client_cert_mode,
    )
    .context("failed to initialize server")?;
    server.set_request_timeout(options.request_timeout);
    server.set_max_connections(options.max_connections);

    println!(
        "{}/{} listening on port {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        server.port(),
    );

    // main loop
    match options.idle_timeout {
        Some(idle_timeout) => server.run(idle_timeout),
        None => {
            while is_running() {
                server.poll_event(Duration::from_millis(500));
            }
        }
    }

    server.cleanup();
    Ok(())
}
