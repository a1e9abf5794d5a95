//! Version 1 of the configuration file.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::config::{
    CacheConfig, Config, ConfigError, ControlConfig, DaemonConfig, GroupId, ListenerConfig,
    ListenersConfig, LogLevel, LogTarget, LoggingConfig, SocksConfig, TlsSettings, UserId,
};
use crate::inspect::signature::{
    FlowMatch, Sensor, Signature, SENSOR_DETECTION, SENSOR_STARTTLS,
};
use crate::policy::profiles::{
    AlgDnsProfile, AuthProfile, CaptureFormat, ContentProfile, ContentRule, DetectionMode,
    DetectionProfile, LbMethod, OcspMode, OcspStaplingMode, OverrideTimeoutType, RoutingProfile,
    ScriptProfile, ScriptType, TlsProfile,
};
use crate::policy::{
    AddressObject, NatMode, PolicyAction, PolicyDb, PolicyRule, PortRange, ProfileSet,
};
use crate::session::flow::Side;

//----------- Spec -------------------------------------------------------------

/// A configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// Process-wide settings.
    pub settings: SettingsSpec,

    /// Daemon-mode settings.
    pub daemon: DaemonSpec,

    pub proto_objects: Vec<ProtoObjectSpec>,
    pub port_objects: Vec<PortObjectSpec>,
    pub address_objects: Vec<AddressObjectSpec>,

    pub detection_profiles: Vec<DetectionProfileSpec>,
    pub content_profiles: Vec<ContentProfileSpec>,
    pub tls_profiles: Vec<TlsProfileSpec>,
    pub alg_dns_profiles: Vec<AlgDnsProfileSpec>,
    pub auth_profiles: Vec<AuthProfileSpec>,
    pub script_profiles: Vec<ScriptProfileSpec>,
    pub routing_profiles: Vec<RoutingProfileSpec>,

    /// The ordered rule list.
    pub policy: Vec<PolicyRuleSpec>,

    pub starttls_signatures: Vec<SignatureSpec>,
    pub detection_signatures: Vec<SignatureSpec>,
}

//--- Conversion

impl Spec {
    /// Parse into the runtime configuration and the policy database.
    pub fn parse(self) -> Result<(Config, PolicyDb), ConfigError> {
        let mut db = PolicyDb::default();

        for spec in self.proto_objects {
            db.protos.insert(spec.name.clone().into(), spec.id);
        }
        for spec in self.port_objects {
            db.ports.insert(
                spec.name.clone().into(),
                PortRange::new(spec.start, spec.end),
            );
        }
        for spec in self.address_objects {
            let object = spec.parse()?;
            db.addresses
                .insert(object.name().to_string().into(), Arc::new(object));
        }

        for spec in self.detection_profiles {
            let profile = spec.parse()?;
            db.detection_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.content_profiles {
            let profile = spec.parse();
            db.content_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.tls_profiles {
            let profile = spec.parse()?;
            db.tls_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.alg_dns_profiles {
            let profile = spec.parse();
            db.alg_dns_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.auth_profiles {
            let profile = spec.parse();
            db.auth_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.script_profiles {
            let profile = spec.parse()?;
            db.script_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }
        for spec in self.routing_profiles {
            let profile = spec.parse()?;
            db.routing_profiles
                .insert(profile.name.clone(), Arc::new(profile));
        }

        for spec in self.policy {
            let rule = spec.parse(&db)?;
            db.rules.push(rule);
        }

        db.starttls_sensor = Arc::new(parse_sensor(SENSOR_STARTTLS, self.starttls_signatures)?);
        db.detection_sensor = Arc::new(parse_sensor(SENSOR_DETECTION, self.detection_signatures)?);

        let config = Config {
            path: None,
            daemon: self.daemon.parse()?,
            listeners: self.settings.parse_listeners(),
            nameservers: self
                .settings
                .nameservers
                .iter()
                .map(|ns| {
                    ns.parse()
                        .map_err(|_| ConfigError::BadValue(format!("nameserver '{ns}'")))
                })
                .collect::<Result<_, _>>()?,
            socks: SocksConfig {
                async_dns: self.settings.socks.async_dns,
                prefer_ipv6: self.settings.socks.prefer_ipv6,
                mixed_ip_versions: self.settings.socks.mixed_ip_versions,
            },
            tls: TlsSettings {
                certs_path: self.settings.certs_path.clone(),
                certs_ca_key_password: self.settings.certs_ca_key_password.clone(),
                sslkeylog_file: self.settings.sslkeylog_file.clone(),
                ocsp_status_ttl: self.settings.ssl_ocsp_status_ttl,
                crl_status_ttl: self.settings.ssl_crl_status_ttl,
            },
            capture: CaptureConfig {
                write_payload_dir: self.settings.write_payload_dir.clone(),
                write_payload_file_prefix: self.settings.write_payload_file_prefix.clone(),
                write_payload_file_suffix: self.settings.write_payload_file_suffix.clone(),
            },
            messages_dir: self.settings.messages_dir.clone(),
            control: ControlConfig {
                port: self.settings.control_port,
            },
            caches: CacheConfig {
                dns: self.settings.caches.dns,
                certs: self.settings.caches.certs,
                ocsp: self.settings.caches.ocsp,
                crl: self.settings.caches.crl,
                whitelist: self.settings.caches.whitelist,
                tickets: self.settings.caches.tickets,
            },
        };

        Ok((config, db))
    }

    /// Build into this specification.
    ///
    /// Object sections are emitted sorted by name so that saving is
    /// deterministic; the policy keeps its significant order.
    pub fn build(config: &Config, db: &PolicyDb) -> Self {
        let mut proto_objects: Vec<_> = db
            .protos
            .iter()
            .map(|(name, id)| ProtoObjectSpec {
                name: name.to_string(),
                id: *id,
            })
            .collect();
        proto_objects.sort_by(|a, b| a.name.cmp(&b.name));

        let mut port_objects: Vec<_> = db
            .ports
            .iter()
            .map(|(name, range)| PortObjectSpec {
                name: name.to_string(),
                start: range.lo(),
                end: range.hi(),
            })
            .collect();
        port_objects.sort_by(|a, b| a.name.cmp(&b.name));

        let mut address_objects: Vec<_> = db
            .addresses
            .values()
            .map(|object| AddressObjectSpec::build(object))
            .collect();
        address_objects.sort_by(|a, b| a.name.cmp(&b.name));

        let mut detection_profiles: Vec<_> = db
            .detection_profiles
            .values()
            .map(|p| DetectionProfileSpec::build(p))
            .collect();
        detection_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut content_profiles: Vec<_> = db
            .content_profiles
            .values()
            .map(|p| ContentProfileSpec::build(p))
            .collect();
        content_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut tls_profiles: Vec<_> = db
            .tls_profiles
            .values()
            .map(|p| TlsProfileSpec::build(p))
            .collect();
        tls_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut alg_dns_profiles: Vec<_> = db
            .alg_dns_profiles
            .values()
            .map(|p| AlgDnsProfileSpec::build(p))
            .collect();
        alg_dns_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut auth_profiles: Vec<_> = db
            .auth_profiles
            .values()
            .map(|p| AuthProfileSpec::build(p))
            .collect();
        auth_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut script_profiles: Vec<_> = db
            .script_profiles
            .values()
            .map(|p| ScriptProfileSpec::build(p))
            .collect();
        script_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut routing_profiles: Vec<_> = db
            .routing_profiles
            .values()
            .map(|p| RoutingProfileSpec::build(p))
            .collect();
        routing_profiles.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            settings: SettingsSpec::build(config),
            daemon: DaemonSpec::build(&config.daemon),
            proto_objects,
            port_objects,
            address_objects,
            detection_profiles,
            content_profiles,
            tls_profiles,
            alg_dns_profiles,
            auth_profiles,
            script_profiles,
            routing_profiles,
            policy: db
                .rules
                .iter()
                .map(|rule| PolicyRuleSpec::build(rule, db))
                .collect(),
            starttls_signatures: build_sensor(&db.starttls_sensor),
            detection_signatures: build_sensor(&db.detection_sensor),
        }
    }
}

//----------- SettingsSpec -----------------------------------------------------

/// Process-wide settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SettingsSpec {
    pub plaintext_port: u16,
    pub plaintext_workers: u16,
    pub ssl_port: u16,
    pub ssl_workers: u16,
    pub udp_port: u16,
    pub udp_workers: u16,
    pub dtls_port: u16,
    pub dtls_workers: u16,
    pub socks_port: u16,
    pub socks_workers: u16,
    pub redirect_port: u16,
    pub redirect_workers: u16,

    pub nameservers: Vec<String>,

    pub certs_path: Utf8PathBuf,
    pub certs_ca_key_password: Option<String>,
    pub sslkeylog_file: Option<Utf8PathBuf>,
    pub ssl_ocsp_status_ttl: u64,
    pub ssl_crl_status_ttl: u64,

    pub messages_dir: Utf8PathBuf,

    pub write_payload_dir: Utf8PathBuf,
    pub write_payload_file_prefix: String,
    pub write_payload_file_suffix: String,

    pub control_port: u16,

    pub socks: SocksSpec,
    pub caches: CachesSpec,
}

impl Default for SettingsSpec {
    fn default() -> Self {
        let listeners = ListenersConfig::default();
        let tls = TlsSettings::default();
        let capture = CaptureConfig::default();
        Self {
            plaintext_port: listeners.tcp.port,
            plaintext_workers: listeners.tcp.workers,
            ssl_port: listeners.tls.port,
            ssl_workers: listeners.tls.workers,
            udp_port: listeners.udp.port,
            udp_workers: listeners.udp.workers,
            dtls_port: listeners.dtls.port,
            dtls_workers: listeners.dtls.workers,
            socks_port: listeners.socks.port,
            socks_workers: listeners.socks.workers,
            redirect_port: listeners.redirect.port,
            redirect_workers: listeners.redirect.workers,
            nameservers: Vec::new(),
            certs_path: tls.certs_path,
            certs_ca_key_password: None,
            sslkeylog_file: None,
            ssl_ocsp_status_ttl: tls.ocsp_status_ttl,
            ssl_crl_status_ttl: tls.crl_status_ttl,
            messages_dir: "/etc/interpose/msg".into(),
            write_payload_dir: capture.write_payload_dir,
            write_payload_file_prefix: capture.write_payload_file_prefix,
            write_payload_file_suffix: capture.write_payload_file_suffix,
            control_port: ControlConfig::default().port,
            socks: SocksSpec::default(),
            caches: CachesSpec::default(),
        }
    }
}

impl SettingsSpec {
    fn parse_listeners(&self) -> ListenersConfig {
        ListenersConfig {
            tcp: ListenerConfig {
                port: self.plaintext_port,
                workers: self.plaintext_workers,
            },
            tls: ListenerConfig {
                port: self.ssl_port,
                workers: self.ssl_workers,
            },
            udp: ListenerConfig {
                port: self.udp_port,
                workers: self.udp_workers,
            },
            dtls: ListenerConfig {
                port: self.dtls_port,
                workers: self.dtls_workers,
            },
            socks: ListenerConfig {
                port: self.socks_port,
                workers: self.socks_workers,
            },
            redirect: ListenerConfig {
                port: self.redirect_port,
                workers: self.redirect_workers,
            },
        }
    }

    fn build(config: &Config) -> Self {
        Self {
            plaintext_port: config.listeners.tcp.port,
            plaintext_workers: config.listeners.tcp.workers,
            ssl_port: config.listeners.tls.port,
            ssl_workers: config.listeners.tls.workers,
            udp_port: config.listeners.udp.port,
            udp_workers: config.listeners.udp.workers,
            dtls_port: config.listeners.dtls.port,
            dtls_workers: config.listeners.dtls.workers,
            socks_port: config.listeners.socks.port,
            socks_workers: config.listeners.socks.workers,
            redirect_port: config.listeners.redirect.port,
            redirect_workers: config.listeners.redirect.workers,
            nameservers: config.nameservers.iter().map(|ns| ns.to_string()).collect(),
            certs_path: config.tls.certs_path.clone(),
            certs_ca_key_password: config.tls.certs_ca_key_password.clone(),
            sslkeylog_file: config.tls.sslkeylog_file.clone(),
            ssl_ocsp_status_ttl: config.tls.ocsp_status_ttl,
            ssl_crl_status_ttl: config.tls.crl_status_ttl,
            messages_dir: config.messages_dir.clone(),
            write_payload_dir: config.capture.write_payload_dir.clone(),
            write_payload_file_prefix: config.capture.write_payload_file_prefix.clone(),
            write_payload_file_suffix: config.capture.write_payload_file_suffix.clone(),
            control_port: config.control.port,
            socks: SocksSpec {
                async_dns: config.socks.async_dns,
                prefer_ipv6: config.socks.prefer_ipv6,
                mixed_ip_versions: config.socks.mixed_ip_versions,
            },
            caches: CachesSpec {
                dns: config.caches.dns,
                certs: config.caches.certs,
                ocsp: config.caches.ocsp,
                crl: config.caches.crl,
                whitelist: config.caches.whitelist,
                tickets: config.caches.tickets,
            },
        }
    }
}

/// SOCKS acceptor settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SocksSpec {
    pub async_dns: bool,
    pub prefer_ipv6: bool,
    pub mixed_ip_versions: bool,
}

impl Default for SocksSpec {
    fn default() -> Self {
        let socks = SocksConfig::default();
        Self {
            async_dns: socks.async_dns,
            prefer_ipv6: socks.prefer_ipv6,
            mixed_ip_versions: socks.mixed_ip_versions,
        }
    }
}

/// Cache capacities.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CachesSpec {
    pub dns: usize,
    pub certs: usize,
    pub ocsp: usize,
    pub crl: usize,
    pub whitelist: usize,
    pub tickets: usize,
}

impl Default for CachesSpec {
    fn default() -> Self {
        let caches = CacheConfig::default();
        Self {
            dns: caches.dns,
            certs: caches.certs,
            ocsp: caches.ocsp,
            crl: caches.crl,
            whitelist: caches.whitelist,
            tickets: caches.tickets,
        }
    }
}

//----------- DaemonSpec -------------------------------------------------------

/// Daemon-mode settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DaemonSpec {
    pub log_target: String,
    pub log_level: String,
    pub trace_targets: Vec<String>,
    pub pid_file: Option<Utf8PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub daemonize: bool,
}

impl DaemonSpec {
    fn parse(self) -> Result<DaemonConfig, ConfigError> {
        let target = match self.log_target.as_str() {
            "" | "stdout" => LogTarget::Stdout,
            "stderr" => LogTarget::Stderr,
            "syslog" => LogTarget::Syslog,
            path => LogTarget::File(path.into()),
        };
        let level = match self.log_level.as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "" | "info" => LogLevel::Info,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            other => {
                return Err(ConfigError::BadValue(format!("log level '{other}'")));
            }
        };
        let identity = match (self.user, self.group) {
            (Some(user), Some(group)) => {
                Some((UserId::Named(user), GroupId::Named(group)))
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::BadValue(
                    "user and group must be set together".into(),
                ));
            }
        };
        Ok(DaemonConfig {
            logging: LoggingConfig {
                target,
                level,
                trace_targets: self.trace_targets,
            },
            pid_file: self.pid_file,
            identity,
            daemonize: self.daemonize,
        })
    }

    fn build(config: &DaemonConfig) -> Self {
        let log_target = match &config.logging.target {
            LogTarget::Stdout => "stdout".to_string(),
            LogTarget::Stderr => "stderr".to_string(),
            LogTarget::Syslog => "syslog".to_string(),
            LogTarget::File(path) => path.to_string(),
        };
        let log_level = match config.logging.level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
        .to_string();
        let (user, group) = match &config.identity {
            Some((UserId::Named(user), GroupId::Named(group))) => {
                (Some(user.clone()), Some(group.clone()))
            }
            None => (None, None),
        };
        Self {
            log_target,
            log_level,
            trace_targets: config.logging.trace_targets.clone(),
            pid_file: config.pid_file.clone(),
            user,
            group,
            daemonize: config.daemonize,
        }
    }
}

//----------- Object specs -----------------------------------------------------

/// A protocol object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ProtoObjectSpec {
    pub name: String,
    pub id: u8,
}

/// A port range object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct PortObjectSpec {
    pub name: String,
    pub start: u16,
    pub end: u16,
}

/// An address object; type 0 is a CIDR, type 1 an FQDN.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AddressObjectSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: u8,

    pub cidr: Option<String>,
    pub fqdn: Option<String>,
}

impl AddressObjectSpec {
    fn parse(self) -> Result<AddressObject, ConfigError> {
        match self.kind {
            0 => {
                let cidr = self.cidr.ok_or_else(|| {
                    ConfigError::BadValue(format!("address '{}' has no cidr", self.name))
                })?;
                let net = cidr.parse().map_err(|_| {
                    ConfigError::BadValue(format!("address '{}': bad cidr '{cidr}'", self.name))
                })?;
                Ok(AddressObject::Cidr {
                    name: self.name.into(),
                    net,
                })
            }
            1 => {
                let fqdn = self.fqdn.ok_or_else(|| {
                    ConfigError::BadValue(format!("address '{}' has no fqdn", self.name))
                })?;
                Ok(AddressObject::Fqdn {
                    name: self.name.into(),
                    fqdn: fqdn.to_ascii_lowercase().into(),
                })
            }
            other => Err(ConfigError::BadValue(format!(
                "address '{}': unknown type {other}",
                self.name
            ))),
        }
    }

    fn build(object: &AddressObject) -> Self {
        match object {
            AddressObject::Cidr { name, net } => Self {
                name: name.to_string(),
                kind: 0,
                cidr: Some(net.to_string()),
                fqdn: None,
            },
            AddressObject::Fqdn { name, fqdn } => Self {
                name: name.to_string(),
                kind: 1,
                cidr: None,
                fqdn: Some(fqdn.to_string()),
            },
        }
    }
}

//----------- Profile specs ----------------------------------------------------

/// A detection profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DetectionProfileSpec {
    pub name: String,

    /// 0 none, 1 post, 2 pre.
    pub mode: u8,
}

impl DetectionProfileSpec {
    fn parse(self) -> Result<DetectionProfile, ConfigError> {
        let mode = match self.mode {
            0 => DetectionMode::None,
            1 => DetectionMode::Post,
            2 => DetectionMode::Pre,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "detection profile '{}': unknown mode {other}",
                    self.name
                )));
            }
        };
        Ok(DetectionProfile {
            name: self.name.into(),
            mode,
        })
    }

    fn build(profile: &DetectionProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            mode: match profile.mode {
                DetectionMode::None => 0,
                DetectionMode::Post => 1,
                DetectionMode::Pre => 2,
            },
        }
    }
}

/// A content profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ContentProfileSpec {
    pub name: String,
    pub write_payload: bool,
    pub write_format: String,
    pub content_rules: Vec<ContentRuleSpec>,
}

/// One content rewrite rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ContentRuleSpec {
    #[serde(rename = "match")]
    pub matching: String,
    pub replace: String,
    pub fill_length: bool,
    pub replace_each_nth: u32,
}

impl ContentProfileSpec {
    fn parse(self) -> ContentProfile {
        ContentProfile {
            name: self.name.into(),
            write_payload: self.write_payload,
            write_format: CaptureFormat::from_str_lossy(&self.write_format),
            content_rules: self
                .content_rules
                .into_iter()
                .map(|rule| ContentRule {
                    matching: rule.matching,
                    replace: rule.replace,
                    fill_length: rule.fill_length,
                    replace_each_nth: rule.replace_each_nth,
                })
                .collect(),
        }
    }

    fn build(profile: &ContentProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            write_payload: profile.write_payload,
            write_format: profile.write_format.as_str().to_string(),
            content_rules: profile
                .content_rules
                .iter()
                .map(|rule| ContentRuleSpec {
                    matching: rule.matching.clone(),
                    replace: rule.replace.clone(),
                    fill_length: rule.fill_length,
                    replace_each_nth: rule.replace_each_nth,
                })
                .collect(),
        }
    }
}

/// A TLS profile.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct TlsProfileSpec {
    pub name: String,
    pub inspect: bool,
    pub allow_untrusted_issuers: bool,
    pub allow_invalid_certs: bool,
    pub allow_self_signed: bool,
    pub failed_certcheck_replacement: bool,
    pub failed_certcheck_override: bool,
    pub failed_certcheck_override_timeout: u64,

    /// 0 absolute, 1 idle.
    pub failed_certcheck_override_timeout_type: u8,

    pub use_pfs: bool,
    pub left_use_pfs: bool,
    pub right_use_pfs: bool,
    pub left_disable_reuse: bool,
    pub right_disable_reuse: bool,

    /// 0 off, 1 leaf only, 2 full chain.
    pub ocsp_mode: u8,
    pub ocsp_stapling: bool,

    /// 0 loose, 1 strict, 2 require.
    pub ocsp_stapling_mode: u8,

    pub sni_filter_bypass: Vec<String>,
    pub sni_filter_use_dns_cache: bool,
    pub sni_filter_use_dns_domain_tree: bool,
    pub redirect_warning_ports: Vec<u16>,
    pub sslkeylog: bool,
}

impl Default for TlsProfileSpec {
    fn default() -> Self {
        Self::build(&TlsProfile::default())
    }
}

impl TlsProfileSpec {
    fn parse(self) -> Result<TlsProfile, ConfigError> {
        let override_timeout_type = match self.failed_certcheck_override_timeout_type {
            0 => OverrideTimeoutType::Absolute,
            1 => OverrideTimeoutType::Idle,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "tls profile '{}': unknown override timeout type {other}",
                    self.name
                )));
            }
        };
        let ocsp_mode = match self.ocsp_mode {
            0 => OcspMode::Off,
            1 => OcspMode::Leaf,
            2 => OcspMode::FullChain,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "tls profile '{}': unknown ocsp mode {other}",
                    self.name
                )));
            }
        };
        let ocsp_stapling_mode = match self.ocsp_stapling_mode {
            0 => OcspStaplingMode::Loose,
            1 => OcspStaplingMode::Strict,
            2 => OcspStaplingMode::Require,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "tls profile '{}': unknown ocsp stapling mode {other}",
                    self.name
                )));
            }
        };
        Ok(TlsProfile {
            name: self.name.into(),
            inspect: self.inspect,
            allow_untrusted_issuers: self.allow_untrusted_issuers,
            allow_invalid_certs: self.allow_invalid_certs,
            allow_self_signed: self.allow_self_signed,
            failed_certcheck_replacement: self.failed_certcheck_replacement,
            failed_certcheck_override: self.failed_certcheck_override,
            failed_certcheck_override_timeout: Duration::from_secs(
                self.failed_certcheck_override_timeout,
            ),
            override_timeout_type,
            use_pfs: self.use_pfs,
            left_use_pfs: self.left_use_pfs,
            right_use_pfs: self.right_use_pfs,
            left_disable_reuse: self.left_disable_reuse,
            right_disable_reuse: self.right_disable_reuse,
            ocsp_mode,
            ocsp_stapling: self.ocsp_stapling,
            ocsp_stapling_mode,
            sni_filter_bypass: self.sni_filter_bypass,
            sni_filter_use_dns_cache: self.sni_filter_use_dns_cache,
            sni_filter_use_dns_domain_tree: self.sni_filter_use_dns_domain_tree,
            redirect_warning_ports: self.redirect_warning_ports.into_iter().collect(),
            sslkeylog: self.sslkeylog,
        })
    }

    fn build(profile: &TlsProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            inspect: profile.inspect,
            allow_untrusted_issuers: profile.allow_untrusted_issuers,
            allow_invalid_certs: profile.allow_invalid_certs,
            allow_self_signed: profile.allow_self_signed,
            failed_certcheck_replacement: profile.failed_certcheck_replacement,
            failed_certcheck_override: profile.failed_certcheck_override,
            failed_certcheck_override_timeout: profile
                .failed_certcheck_override_timeout
                .as_secs(),
            failed_certcheck_override_timeout_type: match profile.override_timeout_type {
                OverrideTimeoutType::Absolute => 0,
                OverrideTimeoutType::Idle => 1,
            },
            use_pfs: profile.use_pfs,
            left_use_pfs: profile.left_use_pfs,
            right_use_pfs: profile.right_use_pfs,
            left_disable_reuse: profile.left_disable_reuse,
            right_disable_reuse: profile.right_disable_reuse,
            ocsp_mode: match profile.ocsp_mode {
                OcspMode::Off => 0,
                OcspMode::Leaf => 1,
                OcspMode::FullChain => 2,
            },
            ocsp_stapling: profile.ocsp_stapling,
            ocsp_stapling_mode: match profile.ocsp_stapling_mode {
                OcspStaplingMode::Loose => 0,
                OcspStaplingMode::Strict => 1,
                OcspStaplingMode::Require => 2,
            },
            sni_filter_bypass: profile.sni_filter_bypass.clone(),
            sni_filter_use_dns_cache: profile.sni_filter_use_dns_cache,
            sni_filter_use_dns_domain_tree: profile.sni_filter_use_dns_domain_tree,
            redirect_warning_ports: profile.redirect_warning_ports.iter().copied().collect(),
            sslkeylog: profile.sslkeylog,
        }
    }
}

/// A DNS ALG profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AlgDnsProfileSpec {
    pub name: String,
    pub match_request_id: bool,
    pub randomize_id: bool,
    pub cached_responses: bool,
}

impl AlgDnsProfileSpec {
    fn parse(self) -> AlgDnsProfile {
        AlgDnsProfile {
            name: self.name.into(),
            match_request_id: self.match_request_id,
            randomize_id: self.randomize_id,
            cached_responses: self.cached_responses,
        }
    }

    fn build(profile: &AlgDnsProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            match_request_id: profile.match_request_id,
            randomize_id: profile.randomize_id,
            cached_responses: profile.cached_responses,
        }
    }
}

/// An authentication profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AuthProfileSpec {
    pub name: String,
    pub authenticate: bool,
    pub resolve: bool,
}

impl AuthProfileSpec {
    fn parse(self) -> AuthProfile {
        AuthProfile {
            name: self.name.into(),
            authenticate: self.authenticate,
            resolve: self.resolve,
        }
    }

    fn build(profile: &AuthProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            authenticate: profile.authenticate,
            resolve: profile.resolve,
        }
    }
}

/// A script profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ScriptProfileSpec {
    pub name: String,
    pub module_path: Utf8PathBuf,

    /// 0 python, 1 golang.
    #[serde(rename = "type")]
    pub kind: u8,
}

impl ScriptProfileSpec {
    fn parse(self) -> Result<ScriptProfile, ConfigError> {
        let script_type = match self.kind {
            0 => ScriptType::Python,
            1 => ScriptType::Golang,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "script profile '{}': unknown type {other}",
                    self.name
                )));
            }
        };
        Ok(ScriptProfile {
            name: self.name.into(),
            module_path: self.module_path,
            script_type,
        })
    }

    fn build(profile: &ScriptProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            module_path: profile.module_path.clone(),
            kind: match profile.script_type {
                ScriptType::Python => 0,
                ScriptType::Golang => 1,
            },
        }
    }
}

/// A routing profile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RoutingProfileSpec {
    pub name: String,
    pub dnat_addresses: Vec<String>,
    pub dnat_ports: Vec<String>,

    /// "rr", "l3" or "l4".
    pub dnat_lb_method: String,
}

impl RoutingProfileSpec {
    fn parse(self) -> Result<RoutingProfile, ConfigError> {
        let dnat_lb_method = match self.dnat_lb_method.as_str() {
            "" | "rr" => LbMethod::RoundRobin,
            "l3" => LbMethod::L3,
            "l4" => LbMethod::L4,
            other => {
                return Err(ConfigError::BadValue(format!(
                    "routing profile '{}': unknown lb method '{other}'",
                    self.name
                )));
            }
        };
        Ok(RoutingProfile {
            name: self.name.into(),
            dnat_addresses: self.dnat_addresses,
            dnat_ports: self.dnat_ports,
            dnat_lb_method,
        })
    }

    fn build(profile: &RoutingProfile) -> Self {
        Self {
            name: profile.name.to_string(),
            dnat_addresses: profile.dnat_addresses.clone(),
            dnat_ports: profile.dnat_ports.clone(),
            dnat_lb_method: match profile.dnat_lb_method {
                LbMethod::RoundRobin => "rr",
                LbMethod::L3 => "l3",
                LbMethod::L4 => "l4",
            }
            .to_string(),
        }
    }
}

//----------- PolicyRuleSpec ---------------------------------------------------

/// One rule of the ordered policy.
///
/// Address, port and profile fields reference objects by name; an empty
/// list means "any" and a missing profile reference means "none".
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct PolicyRuleSpec {
    pub proto: Option<String>,
    pub src: Vec<String>,
    pub sport: Vec<String>,
    pub dst: Vec<String>,
    pub dport: Vec<String>,

    /// "accept" or "deny".
    pub action: String,

    /// "none", "auto" or "pool".
    pub nat: String,

    pub tls_profile: Option<String>,
    pub detection_profile: Option<String>,
    pub content_profile: Option<String>,
    pub auth_profile: Option<String>,
    pub alg_dns_profile: Option<String>,
    pub script_profile: Option<String>,
    pub routing_profile: Option<String>,
}

impl PolicyRuleSpec {
    fn parse(self, db: &PolicyDb) -> Result<PolicyRule, ConfigError> {
        let proto = match &self.proto {
            None => 0,
            Some(name) => *db.protos.get(name.as_str()).ok_or_else(|| {
                ConfigError::UnresolvedReference {
                    kind: "proto object",
                    name: name.clone(),
                }
            })?,
        };

        let resolve_addresses = |names: &[String]| {
            names
                .iter()
                .map(|name| {
                    db.addresses.get(name.as_str()).cloned().ok_or_else(|| {
                        ConfigError::UnresolvedReference {
                            kind: "address object",
                            name: name.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let resolve_ports = |names: &[String]| {
            names
                .iter()
                .map(|name| {
                    db.ports.get(name.as_str()).copied().ok_or_else(|| {
                        ConfigError::UnresolvedReference {
                            kind: "port object",
                            name: name.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let action = match self.action.as_str() {
            "" | "accept" => PolicyAction::Accept,
            "deny" => PolicyAction::Deny,
            other => {
                return Err(ConfigError::BadValue(format!("rule action '{other}'")));
            }
        };
        let nat = match self.nat.as_str() {
            "" | "none" => NatMode::None,
            "auto" => NatMode::Auto,
            "pool" => NatMode::Pool,
            other => {
                return Err(ConfigError::BadValue(format!("rule nat '{other}'")));
            }
        };

        macro_rules! resolve_profile {
            ($field:expr, $map:expr, $kind:literal) => {
                match &$field {
                    None => None,
                    Some(name) => Some($map.get(name.as_str()).cloned().ok_or_else(|| {
                        ConfigError::UnresolvedReference {
                            kind: $kind,
                            name: name.clone(),
                        }
                    })?),
                }
            };
        }

        let profiles = ProfileSet {
            content: resolve_profile!(self.content_profile, db.content_profiles, "content profile"),
            detection: resolve_profile!(
                self.detection_profile,
                db.detection_profiles,
                "detection profile"
            ),
            tls: resolve_profile!(self.tls_profile, db.tls_profiles, "tls profile"),
            auth: resolve_profile!(self.auth_profile, db.auth_profiles, "auth profile"),
            alg_dns: resolve_profile!(self.alg_dns_profile, db.alg_dns_profiles, "alg dns profile"),
            script: resolve_profile!(self.script_profile, db.script_profiles, "script profile"),
            routing: resolve_profile!(self.routing_profile, db.routing_profiles, "routing profile"),
        };

        Ok(PolicyRule {
            proto,
            src: resolve_addresses(&self.src)?,
            src_ports: resolve_ports(&self.sport)?,
            dst: resolve_addresses(&self.dst)?,
            dst_ports: resolve_ports(&self.dport)?,
            action,
            nat,
            profiles,
            cnt_matches: AtomicU64::new(0),
        })
    }

    fn build(rule: &PolicyRule, db: &PolicyDb) -> Self {
        // The rule keeps resolved values, not the referencing names; the
        // names are recovered from the object tables.  Objects sharing a
        // value are interchangeable on reload.
        let proto_name = |proto: u8| {
            db.protos
                .iter()
                .find(|(_, id)| **id == proto)
                .map(|(name, _)| name.to_string())
        };
        let port_names = |ranges: &[PortRange]| {
            ranges
                .iter()
                .filter_map(|range| {
                    db.ports
                        .iter()
                        .find(|(_, r)| *r == range)
                        .map(|(name, _)| name.to_string())
                })
                .collect()
        };

        Self {
            proto: if rule.proto == 0 {
                None
            } else {
                proto_name(rule.proto)
            },
            src: rule.src.iter().map(|a| a.name().to_string()).collect(),
            sport: port_names(&rule.src_ports),
            dst: rule.dst.iter().map(|a| a.name().to_string()).collect(),
            dport: port_names(&rule.dst_ports),
            action: match rule.action {
                PolicyAction::Accept => "accept",
                PolicyAction::Deny => "deny",
            }
            .to_string(),
            nat: match rule.nat {
                NatMode::None => "none",
                NatMode::Auto => "auto",
                NatMode::Pool => "pool",
            }
            .to_string(),
            tls_profile: rule.profiles.tls.as_ref().map(|p| p.name.to_string()),
            detection_profile: rule
                .profiles
                .detection
                .as_ref()
                .map(|p| p.name.to_string()),
            content_profile: rule.profiles.content.as_ref().map(|p| p.name.to_string()),
            auth_profile: rule.profiles.auth.as_ref().map(|p| p.name.to_string()),
            alg_dns_profile: rule.profiles.alg_dns.as_ref().map(|p| p.name.to_string()),
            script_profile: rule.profiles.script.as_ref().map(|p| p.name.to_string()),
            routing_profile: rule.profiles.routing.as_ref().map(|p| p.name.to_string()),
        }
    }
}

//----------- SignatureSpec ----------------------------------------------------

/// A flow signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SignatureSpec {
    pub name: String,
    pub cat: String,
    pub severity: u8,
    pub flow: Vec<FlowMatchSpec>,
}

/// One submatcher of a signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct FlowMatchSpec {
    /// "L" or "R".
    pub side: String,

    /// "regex" or "simple".
    #[serde(rename = "type")]
    pub kind: String,

    pub signature: String,
    pub bytes_start: usize,
    pub bytes_max: usize,
}

fn parse_sensor(group: u16, specs: Vec<SignatureSpec>) -> Result<Sensor, ConfigError> {
    let mut signatures = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut matches = Vec::with_capacity(spec.flow.len());
        for flow in &spec.flow {
            let side = flow
                .side
                .chars()
                .next()
                .and_then(Side::from_tag)
                .ok_or_else(|| {
                    ConfigError::Signature(format!(
                        "signature '{}': bad side '{}'",
                        spec.name, flow.side
                    ))
                })?;
            let submatch = match flow.kind.as_str() {
                "regex" => FlowMatch::regex(
                    &spec.name,
                    side,
                    flow.bytes_start,
                    flow.bytes_max,
                    &flow.signature,
                )
                .map_err(|e| ConfigError::Signature(e.to_string()))?,
                "simple" => {
                    FlowMatch::literal(side, flow.bytes_start, flow.bytes_max, &flow.signature)
                }
                other => {
                    return Err(ConfigError::Signature(format!(
                        "signature '{}': unknown match type '{other}'",
                        spec.name
                    )));
                }
            };
            matches.push(submatch);
        }
        signatures.push(Arc::new(Signature {
            name: spec.name.into(),
            category: spec.cat.into(),
            severity: spec.severity,
            matches,
        }));
    }
    Ok(Sensor::new(group, signatures))
}

fn build_sensor(sensor: &Sensor) -> Vec<SignatureSpec> {
    sensor
        .signatures
        .iter()
        .map(|signature| SignatureSpec {
            name: signature.name.to_string(),
            cat: signature.category.to_string(),
            severity: signature.severity,
            flow: signature
                .matches
                .iter()
                .map(|m| FlowMatchSpec {
                    side: m.side.tag().to_string(),
                    kind: if m.is_regex() { "regex" } else { "simple" }.to_string(),
                    signature: m.pattern.clone(),
                    bytes_start: m.offset,
                    bytes_max: m.max_bytes,
                })
                .collect(),
        })
        .collect()
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = "v1"

[settings]
plaintext-port = 50080
nameservers = ["1.1.1.1", "8.8.8.8"]

[daemon]
log-level = "debug"

[[proto-objects]]
name = "tcp"
id = 6

[[port-objects]]
name = "p80"
start = 80
end = 80

[[address-objects]]
name = "any"
type = 0
cidr = "0.0.0.0/0"

[[address-objects]]
name = "corp-portal"
type = 1
fqdn = "Portal.Example.COM"

[[tls-profiles]]
name = "inspect"
inspect = true
sni-filter-bypass = ["bank.example"]

[[alg-dns-profiles]]
name = "dns"
cached-responses = true

[[policy]]
proto = "tcp"
src = ["any"]
dst = ["any"]
dport = ["p80"]
action = "accept"
tls-profile = "inspect"
alg-dns-profile = "dns"

[[detection-signatures]]
name = "http/get|post"
cat = "www"
severity = 5

[[detection-signatures.flow]]
side = "L"
type = "regex"
signature = '^(GET|POST) '
bytes-start = 0
bytes-max = 64
"#;

    #[test]
    fn sample_parses_and_resolves() {
        let spec: crate::config::file::Spec = toml::from_str(SAMPLE).unwrap();
        let (config, db) = spec.parse().unwrap();

        assert_eq!(config.nameservers.len(), 2);
        assert_eq!(config.daemon.logging.level, LogLevel::Debug);
        assert_eq!(db.rules.len(), 1);
        assert_eq!(db.rules[0].proto, 6);
        assert_eq!(db.rules[0].dst_ports[0].lo(), 80);
        assert!(db.rules[0].profiles.tls.as_ref().unwrap().inspect);
        assert!(db.rules[0].profiles.alg_dns.as_ref().unwrap().cached_responses);

        // FQDN objects normalize to lowercase.
        match db.addresses.get("corp-portal").map(|a| &**a) {
            Some(AddressObject::Fqdn { fqdn, .. }) => {
                assert_eq!(&**fqdn, "portal.example.com");
            }
            other => panic!("unexpected object: {other:?}"),
        }

        assert_eq!(db.detection_sensor.signatures.len(), 1);
        assert_eq!(&*db.detection_sensor.signatures[0].category, "www");
    }

    #[test]
    fn unresolved_profile_reference_is_fatal() {
        let bad = SAMPLE.replace("tls-profile = \"inspect\"", "tls-profile = \"missing\"");
        let spec: crate::config::file::Spec = toml::from_str(&bad).unwrap();
        match spec.parse() {
            Err(ConfigError::UnresolvedReference { kind, name }) => {
                assert_eq!(kind, "tls profile");
                assert_eq!(name, "missing");
            }
            other => panic!("expected unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_preserves_semantics() {
        let spec: crate::config::file::Spec = toml::from_str(SAMPLE).unwrap();
        let (config, db) = spec.parse().unwrap();

        let rebuilt = crate::config::file::Spec::build(&config, &db);
        let text = toml::to_string_pretty(&rebuilt).unwrap();
        let reloaded: crate::config::file::Spec = toml::from_str(&text).unwrap();
        let (config2, db2) = reloaded.parse().unwrap();

        assert_eq!(config, config2);
        assert_eq!(db.rules.len(), db2.rules.len());
        assert_eq!(db.rules[0].proto, db2.rules[0].proto);
        assert_eq!(db.rules[0].action, db2.rules[0].action);
        assert_eq!(
            db.rules[0].profiles.tls.as_ref().unwrap().sni_filter_bypass,
            db2.rules[0].profiles.tls.as_ref().unwrap().sni_filter_bypass
        );
        assert_eq!(db.addresses.len(), db2.addresses.len());
        assert_eq!(db.ports.len(), db2.ports.len());
        assert_eq!(
            db.detection_sensor.signatures.len(),
            db2.detection_sensor.signatures.len()
        );
    }
}
