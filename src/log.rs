//! Logging.
//!
//! Interpose logs through `tracing`.  The level filter sits behind a
//! reload handle so a configuration reload can change verbosity without a
//! restart; output goes to stdout, stderr, a file or syslog per the daemon
//! configuration.

use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogLevel, LogTarget, LoggingConfig};

/// The subscriber stack below the output layer.
type Stack = Layered<reload::Layer<EnvFilter, Registry>, Registry>;

//----------- Logger -----------------------------------------------------------

/// The handle onto the installed logger.
#[derive(Debug)]
pub struct Logger {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl Logger {
    /// Install the global subscriber.
    ///
    /// This runs once, with the fallback configuration, before the
    /// configuration file has been read; [`Logger::apply`] switches to the
    /// configured filter afterwards.
    ///
    /// ## Panics
    ///
    /// Panics if a global `tracing` subscriber is already installed.
    pub fn launch(config: &LoggingConfig) -> Result<&'static Logger, String> {
        let (filter, handle) = reload::Layer::new(filter_for(config)?);

        let output: Box<dyn Layer<Stack> + Send + Sync> = match &config.target {
            LogTarget::Stdout => FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                .with_writer(io::stdout)
                .boxed(),
            LogTarget::Stderr => FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                .with_writer(io::stderr)
                .boxed(),
            LogTarget::File(path) => {
                // Color codes never belong in a log file.
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| format!("cannot open log file '{path}': {err}"))?;
                FmtLayer::new().with_ansi(false).with_writer(file).boxed()
            }
            LogTarget::Syslog => SyslogLayer::connect()?.boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(output)
            .init();

        Ok(Box::leak(Box::new(Self { filter: handle })))
    }

    /// Swap the active filter for a freshly configured one.
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), String> {
        let filter = filter_for(config)?;
        self.filter
            .reload(filter)
            .map_err(|err| format!("cannot swap the log filter: {err}"))
    }
}

/// Translate the configured level and trace targets into an [`EnvFilter`].
///
/// Built fresh on every apply; a filter cannot be amended in place.
fn filter_for(config: &LoggingConfig) -> Result<EnvFilter, String> {
    let mut filter = EnvFilter::default().add_directive(level_filter(config.level).into());
    for directive in &config.trace_targets {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|_| format!("invalid trace target '{directive}'"))?,
        );
    }
    Ok(filter)
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warning => LevelFilter::WARN,
        LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
    }
}

//----------- SyslogLayer ------------------------------------------------------

/// A `tracing` layer speaking the BSD syslog protocol (RFC 3164).
struct SyslogLayer {
    sender: SyslogSender,
    host: String,
    ident: String,
    pid: u32,
}

/// Where syslog lines go.
enum SyslogSender {
    Local(UnixDatagram),
    Stream(Mutex<TcpStream>),
    Udp(UdpSocket, SocketAddr),
}

impl SyslogLayer {
    /// Find a syslog endpoint: the well-known local datagram sockets
    /// first, then TCP 601, then UDP 514.
    fn connect() -> Result<Self, String> {
        const SOCKET_PATHS: [&str; 3] = ["/dev/log", "/var/run/syslog", "/var/run/log"];

        let sender = SOCKET_PATHS
            .iter()
            .find_map(|path| {
                let socket = UnixDatagram::unbound().ok()?;
                socket.connect(path).ok()?;
                Some(SyslogSender::Local(socket))
            })
            .or_else(|| {
                TcpStream::connect((Ipv4Addr::LOCALHOST, 601))
                    .ok()
                    .map(|stream| SyslogSender::Stream(Mutex::new(stream)))
            })
            .or_else(|| {
                let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
                let server = SocketAddr::from((Ipv4Addr::LOCALHOST, 514));
                Some(SyslogSender::Udp(socket, server))
            })
            .ok_or_else(|| "no reachable syslog endpoint".to_string())?;

        let ident = std::env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "interposed".into());
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            sender,
            host,
            ident,
            pid: std::process::id(),
        })
    }

    /// The RFC 3164 PRI value: facility times eight plus severity, with
    /// the facility fixed to "user".
    fn priority(level: &Level) -> u8 {
        let severity = match *level {
            Level::ERROR => 3,
            Level::WARN => 4,
            Level::INFO => 6,
            Level::DEBUG | Level::TRACE => 7,
        };
        (1 << 3) + severity
    }
}

impl SyslogSender {
    fn emit(&self, line: &[u8]) -> io::Result<()> {
        match self {
            Self::Local(socket) => socket.send(line).map(|_| ()),
            Self::Udp(socket, server) => socket.send_to(line, server).map(|_| ()),
            Self::Stream(stream) => {
                let mut stream = stream.lock().unwrap();
                stream.write_all(line)?;
                stream.flush()
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let pri = Self::priority(event.metadata().level());

        // RFC 3164 wants "Mmm dd hh:mm:ss" in local time, with the day
        // padded to two characters by a space.
        let stamp = jiff::Zoned::now().strftime("%b %e %T");

        let mut text = String::new();
        event.record(&mut MessageText(&mut text));

        let line = format!(
            "<{pri}>{stamp} {host} {ident}[{pid}]: {text}\n",
            host = self.host,
            ident = self.ident,
            pid = self.pid,
        );
        if let Err(err) = self.sender.emit(line.as_bytes()) {
            eprintln!("syslog delivery failed: {err}");
        }
    }
}

/// Pulls the human-readable message out of a structured event record.
struct MessageText<'a>(&'a mut String);

impl Visit for MessageText<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        }
    }
}
