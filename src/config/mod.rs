//! Configuration.
//!
//! The whole configuration lives in one hierarchical TOML file with a
//! versioned on-disk specification (`config::file`).  Parsing yields the
//! runtime `Config` (settings) and the `PolicyDb` (every policy-derived
//! object); a reload builds both from scratch and installs them atomically,
//! so a partial load never replaces a running configuration.

use std::fmt;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ArgMatches;

use crate::capture::CaptureConfig;
use crate::policy::PolicyDb;

pub mod file;

//----------- ConfigError ------------------------------------------------------

/// A fatal configuration problem.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(String),

    /// The file is not valid TOML or has the wrong shape.
    Format(String),

    /// A value is out of range or malformed.
    BadValue(String),

    /// An object refers to another that does not exist.
    UnresolvedReference {
        /// What kind of object is referenced.
        kind: &'static str,

        /// The missing name.
        name: String,
    },

    /// A signature failed to compile.
    Signature(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(reason) => write!(f, "cannot read configuration: {reason}"),
            Self::Format(reason) => write!(f, "malformed configuration: {reason}"),
            Self::BadValue(reason) => write!(f, "bad configuration value: {reason}"),
            Self::UnresolvedReference { kind, name } => {
                write!(f, "reference to unknown {kind} '{name}'")
            }
            Self::Signature(reason) => write!(f, "bad signature: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

//----------- Logging types ----------------------------------------------------

/// Where log output goes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LogTarget {
    File(Utf8PathBuf),
    Syslog,
    #[default]
    Stdout,
    Stderr,
}

/// The minimum level that gets logged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// The logging section of the daemon configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    pub target: LogTarget,
    pub level: LogLevel,

    /// Additional per-target trace directives, tracing filter syntax.
    pub trace_targets: Vec<String>,
}

//----------- Daemon types -----------------------------------------------------

/// A user to drop privileges to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserId {
    Named(String),
}

/// A group to drop privileges to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupId {
    Named(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Daemon-mode settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    pub logging: LoggingConfig,
    pub pid_file: Option<Utf8PathBuf>,
    pub identity: Option<(UserId, GroupId)>,
    pub daemonize: bool,
}

//----------- Listener types ---------------------------------------------------

/// One acceptor's bind settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    /// 0 disables the listener.
    pub port: u16,

    /// Concurrent accept loops for this listener.
    pub workers: u16,
}

impl ListenerConfig {
    pub fn disabled() -> Self {
        Self { port: 0, workers: 0 }
    }

    pub fn enabled(&self) -> bool {
        self.port != 0
    }
}

/// All acceptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenersConfig {
    pub tcp: ListenerConfig,
    pub tls: ListenerConfig,
    pub udp: ListenerConfig,
    pub dtls: ListenerConfig,
    pub socks: ListenerConfig,
    pub redirect: ListenerConfig,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            tcp: ListenerConfig { port: 50080, workers: 2 },
            tls: ListenerConfig { port: 50443, workers: 2 },
            udp: ListenerConfig { port: 50080, workers: 1 },
            dtls: ListenerConfig::disabled(),
            socks: ListenerConfig { port: 1080, workers: 2 },
            redirect: ListenerConfig::disabled(),
        }
    }
}

//----------- SocksConfig ------------------------------------------------------

/// SOCKS acceptor behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksConfig {
    /// Resolve FQDN targets asynchronously.
    pub async_dns: bool,

    /// Query AAAA before A for FQDN targets.
    pub prefer_ipv6: bool,

    /// Fall back to the other address family when the first yields
    /// nothing.
    pub mixed_ip_versions: bool,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            async_dns: true,
            prefer_ipv6: false,
            mixed_ip_versions: true,
        }
    }
}

//----------- TlsSettings ------------------------------------------------------

/// Process-wide TLS interception settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    /// Directory holding the signing CA and the trust store, and under
    /// which the spoofed certificate cache may be persisted.
    pub certs_path: Utf8PathBuf,

    /// Password protecting the signing CA key.
    pub certs_ca_key_password: Option<String>,

    /// NSS-format key log file, if secrets are to be exported.
    pub sslkeylog_file: Option<Utf8PathBuf>,

    /// Lifetime of cached OCSP verdicts, seconds.
    pub ocsp_status_ttl: u64,

    /// Lifetime of cached CRL verdicts, seconds.
    pub crl_status_ttl: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certs_path: "/etc/interpose/certs".into(),
            certs_ca_key_password: None,
            sslkeylog_file: None,
            ocsp_status_ttl: 1800,
            crl_status_ttl: 86400,
        }
    }
}

//----------- CacheConfig ------------------------------------------------------

/// Capacities of the process-wide caches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub dns: usize,
    pub certs: usize,
    pub ocsp: usize,
    pub crl: usize,
    pub whitelist: usize,
    pub tickets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dns: 2000,
            certs: 500,
            ocsp: 500,
            crl: 500,
            whitelist: 500,
            tickets: 500,
        }
    }
}

//----------- ControlConfig ----------------------------------------------------

/// The control-plane listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlConfig {
    /// 0 disables the control plane.
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { port: 50500 }
    }
}

//----------- Config -----------------------------------------------------------

/// The runtime settings of the daemon.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Where the configuration was loaded from.
    pub path: Option<Utf8PathBuf>,

    pub daemon: DaemonConfig,
    pub listeners: ListenersConfig,

    /// Nameservers used by the SOCKS resolver, first one wins.
    pub nameservers: Vec<IpAddr>,

    pub socks: SocksConfig,
    pub tls: TlsSettings,
    pub capture: CaptureConfig,

    /// Directory of replacement assets.
    pub messages_dir: Utf8PathBuf,

    pub control: ControlConfig,
    pub caches: CacheConfig,
}

impl Config {
    /// Register the configuration arguments on the command line.
    pub fn setup_cli(cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path of the configuration file"),
        )
    }

    /// Initialize from command-line arguments, without touching the file
    /// system yet.
    pub fn init(matches: &ArgMatches) -> Self {
        let mut config = Self::default();
        config.path = matches.get_one::<String>("config").map(Utf8PathBuf::from);
        config
    }

    /// Load and parse the configuration file.
    pub fn load_from_file(path: &Utf8Path) -> Result<(Self, PolicyDb), ConfigError> {
        let spec = file::Spec::load(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let (mut config, db) = spec.parse()?;
        config.path = Some(path.to_path_buf());
        Ok((config, db))
    }

    /// Write the configuration back, round-tripping every loaded field.
    pub fn save_to_file(&self, db: &PolicyDb, path: &Utf8Path) -> Result<(), ConfigError> {
        let spec = file::Spec::build(self, db);
        spec.save(path).map_err(|e| ConfigError::Io(e.to_string()))
    }
}
