use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{crate_authors, crate_version};
use interpose::{
    center::Center,
    config::{Config, LoggingConfig},
    daemon::{daemonize, ListenSockets},
    manager,
    tls::TlsContext,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const MAX_SYSTEMD_FD_SOCKETS: usize = 32;

const DEFAULT_CONFIG_PATH: &str = "/etc/interpose/interpose.toml";

fn main() -> ExitCode {
    // Initialize the logger in fallback mode.
    let logger = match interpose::log::Logger::launch(&LoggingConfig::default()) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("Interpose couldn't start logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Set up the command-line interface.
    let cmd = clap::Command::new("interposed")
        .version(crate_version!())
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let cmd = Config::setup_cli(cmd);

    // Process command-line arguments.
    let matches = cmd.get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_CONFIG_PATH));

    if matches.get_flag("check_config") {
        match Config::load_from_file(&config_path) {
            Ok(_) => return ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("Interpose couldn't be configured: {error}");
                return ExitCode::FAILURE;
            }
        }
    }

    // Load the configuration file.  A broken configuration never gets to
    // run.
    let (config, db) = match Config::load_from_file(&config_path) {
        Ok(loaded) => loaded,
        Err(error) => {
            error!("Interpose couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Activate the configured logging setup.
    if let Err(error) = logger.apply(&config.daemon.logging) {
        error!("Interpose couldn't apply the logging setup: {error}");
        return ExitCode::FAILURE;
    }

    // Pin the TLS cryptography provider before any engine is built.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("A TLS cryptography provider was already installed");
        return ExitCode::FAILURE;
    }

    // Load the signing CA.  Missing material is fatal when any profile
    // wants interception; otherwise inspection is simply unavailable.
    let inspecting = db.tls_profiles.values().any(|p| p.inspect);
    let tls = match TlsContext::load(
        &config.tls.certs_path,
        config.tls.certs_ca_key_password.as_deref(),
        config.tls.sslkeylog_file.as_ref(),
    ) {
        Ok(tls) => Some(tls),
        Err(error) if inspecting => {
            error!("Interpose cannot inspect TLS: {error}");
            return ExitCode::FAILURE;
        }
        Err(error) => {
            warn!("TLS inspection unavailable: {error}");
            None
        }
    };

    // Bind to listen addresses before daemonizing.
    let Ok(listen_sockets) = bind_listen_sockets(&config) else {
        return ExitCode::FAILURE;
    };

    if let Err(err) = daemonize(&config.daemon) {
        error!("Failed to daemonize: {err}");
        return ExitCode::FAILURE;
    }

    // Prepare the center.
    let (app_cmd_tx, mut app_cmd_rx) = mpsc::unbounded_channel();
    let center = Arc::new(Center::new(config, db, tls, app_cmd_tx));

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        // Spawn the units.
        let mut unit_txs = Default::default();
        if let Err(err) = manager::spawn(&center, &mut unit_txs, listen_sockets).await {
            error!("Failed to spawn units: {err}");
            return ExitCode::FAILURE;
        }

        // Termination escalates: graceful on the first signal, forced on
        // the second, abort on anything after that.
        let mut terminate_count = 0u32;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler");

        loop {
            let signalled = tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(error) = res {
                        error!("Listening for CTRL-C (SIGINT) failed: {error}");
                        return ExitCode::FAILURE;
                    }
                    true
                }

                _ = sigterm.recv() => true,

                _ = manager::forward_app_cmds(&mut app_cmd_rx, &unit_txs) => false,

                _ = tokio::time::sleep(Duration::from_secs(1)), if terminate_count > 0 => {
                    if center.session_count() == 0 {
                        info!("All sessions drained");
                        return ExitCode::SUCCESS;
                    }
                    false
                }
            };

            if !signalled {
                continue;
            }

            terminate_count += 1;
            match terminate_count {
                1 => {
                    info!(
                        "Terminating; {} sessions draining (signal again to force)",
                        center.session_count()
                    );
                    center.begin_termination();
                    manager::terminate_all(&unit_txs);
                }
                2 => {
                    warn!("Forced termination");
                    return ExitCode::SUCCESS;
                }
                _ => {
                    eprintln!("Enforced exit.");
                    std::process::abort();
                }
            }
        }
    })
}

/// Bind every listen address the configuration refers to.
///
/// Addresses already covered by service-manager sockets are left alone.
/// All failures are reported before giving up.
fn bind_listen_sockets(config: &Config) -> Result<ListenSockets, ()> {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    let mut sockets = ListenSockets::gather(Some(MAX_SYSTEMD_FD_SOCKETS));

    let any = |port: u16| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

    let mut result = Ok(());
    let listeners = &config.listeners;
    for listener in [&listeners.tcp, &listeners.tls, &listeners.redirect, &listeners.socks] {
        if listener.enabled() {
            if let Err(err) = sockets.ensure_tcp(any(listener.port)) {
                error!("{err}");
                result = Err(());
            }
        }
    }
    if listeners.udp.enabled() {
        if let Err(err) = sockets.ensure_udp(any(listeners.udp.port)) {
            error!("{err}");
            result = Err(());
        }
    }
    if config.control.port != 0 {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.control.port);
        if let Err(err) = sockets.ensure_tcp(addr) {
            error!("{err}");
            result = Err(());
        }
    }

    result.map(|_| sockets)
}
