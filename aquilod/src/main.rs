//! Aquilo Daemon (aquilod)
//!
//! Background service for cooling device telemetry and control. Polls sensor
//! channels on a fixed cadence, evaluates user-authored control profiles,
//! actuates fan/pump duty cycles with fail-safe handling, and exposes live
//! state to GUI/CLI clients over a Unix domain socket.
//!
//! # Lifecycle
//! - Readiness: the socket is bound only after initial device discovery
//!   completes, so a connectable socket implies a populated registry.
//! - Shutdown: SIGINT/SIGTERM stops the tick loop, drains in-flight device
//!   I/O within a bounded grace period and exits. Actuators are left at
//!   their last-applied duty, not the fail-safe duty - hardware with its own
//!   thermal fallback takes over from there.

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use aquilo_core::constants::timing;
use aquilo_core::sim::{SimDeviceSpec, SimFactory};
use aquilo_core::{DriverRegistry, JsonProfileStore};
use aquilod::config::DaemonConfig;
use aquilod::engine::Engine;
use aquilod::server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Platform helpers
// ============================================================================

/// Default socket path per OS layout
fn get_default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/aquilod.sock"
    } else {
        "/var/run/aquilod.sock"
    }
}

// ============================================================================
// Hardening
// ============================================================================

/// Set restrictive umask
fn set_secure_umask() {
    // 0077 = owner has all permissions, group/other have none
    // SAFETY: umask is always safe to call - it simply sets the file creation mask for the process.
    unsafe { libc::umask(0o077) };
    debug!("Umask set to 0077");
}

/// Change to root directory (prevent directory-based attacks)
fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
    debug!("Working directory set to /");
}

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("aquilod {} - Aquilo cooling control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    aquilod [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -s, --socket PATH   Socket path (auto-detected per OS)");
    eprintln!("    -c, --config PATH   Config file path");
    eprintln!("    -p, --profiles PATH Profile store path");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    AQUILO_LOG          Log level (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("aquilod {}", VERSION);
}

struct CliArgs {
    socket_path: Option<String>,
    config_path: Option<PathBuf>,
    profiles_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        socket_path: None,
        config_path: None,
        profiles_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--socket" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --socket requires a path argument");
                    std::process::exit(1);
                }
                cli.socket_path = Some(args[i].clone());
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                cli.config_path = Some(PathBuf::from(&args[i]));
            }
            "-p" | "--profiles" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --profiles requires a path argument");
                    std::process::exit(1);
                }
                cli.profiles_path = Some(PathBuf::from(&args[i]));
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    cli
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging() {
    let log_level = std::env::var("AQUILO_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer journald on systemd systems, fall back to stdout
    let use_journald = Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // PHASE 0: Panic handler so a panicking task is always visible in logs
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("PANIC at {}: {}", location, message);
    }));

    // PHASE 1: Parse arguments before any state changes
    let cli = parse_args();

    // PHASE 2: Hardening
    set_secure_umask();

    // PHASE 3: Logging
    init_logging();
    info!("STARTUP: aquilod {} starting", VERSION);

    // PHASE 4: Configuration and profile store (before chdir so relative
    // paths given on the command line still resolve)
    let config_path = cli.config_path.unwrap_or_else(DaemonConfig::default_path);
    let config = match DaemonConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    let store = match cli.profiles_path {
        Some(path) => JsonProfileStore::new(path),
        None => JsonProfileStore::at_default_path(),
    };
    info!("STARTUP: Profile store: {:?}", store.path());

    let socket_path = cli
        .socket_path
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(|| get_default_socket_path().to_string());

    secure_working_directory();

    // PHASE 5: Driver families
    let mut drivers = DriverRegistry::new();
    if !config.sim_devices.is_empty() {
        let specs: Vec<SimDeviceSpec> = config.sim_devices.iter().map(Into::into).collect();
        drivers.register(Box::new(SimFactory::new(specs)));
    }
    info!("STARTUP: Driver families: {:?}", drivers.families());

    // PHASE 6: Engine init - initial discovery gates readiness
    let engine = Engine::new(config, drivers, Box::new(store));
    let online = match engine.init().await {
        Ok(online) => online,
        Err(e) => {
            error!("Engine initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("READY: {} devices online, accepting clients", online);

    // PHASE 7: Control loop
    let control_handle = tokio::spawn(engine.clone().run());

    // PHASE 8: Signal handling
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("SIGNAL: shutdown requested");
        signal_engine.request_shutdown();
    });

    // PHASE 9: Server (binds after readiness)
    let result = server::run_server(&socket_path, engine.clone()).await;

    // PHASE 10: Drain the control loop within the bounded grace period
    engine.request_shutdown();
    if tokio::time::timeout(timing::SHUTDOWN_DRAIN, control_handle)
        .await
        .is_err()
    {
        warn!("Control loop did not drain within {:?}", timing::SHUTDOWN_DRAIN);
    }

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("SHUTDOWN: aquilod terminated gracefully");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
