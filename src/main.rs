//! Sniffer Daemon Binary
//!
//! This is the main entry point for the sniffer daemon. It loads the
//! configuration, applies command line overrides, sets up logging and runs
//! the sniffer event loop until a signal or a `stop` command arrives.

use airsniff::{
    daemon::{ConfigManager, DaemonConfig, DaemonUtils, Sniffer},
    Result, SnifferError,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{
    path::{Path, PathBuf},
    process,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "/etc/airsniff/snifferd.toml";

fn cli() -> Command {
    Command::new("snifferd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("802.11 monitor-mode sniffer daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (toml, json, yaml)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("interface")
                .short('i')
                .long("interface")
                .value_name("INTERFACE")
                .help("Monitor-mode interface to capture on, one worker each")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("pid-file")
                .short('p')
                .long("pid-file")
                .value_name("FILE")
                .help("PID file path"),
        )
        .arg(
            Arg::new("no-hop")
                .long("no-hop")
                .help("Stay on the current channel")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("control")
                .long("control")
                .value_name("PATH")
                .help("Control socket path"),
        )
}

fn main() {
    let matches = cli().get_matches();

    let config = match load_configuration(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snifferd: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("snifferd: {}", e);
        process::exit(1);
    }

    info!("Starting snifferd v{}", env!("CARGO_PKG_VERSION"));

    // Raw capture sockets need CAP_NET_RAW
    if !DaemonUtils::is_privileged() {
        error!("snifferd requires root privileges for raw socket access");
        process::exit(1);
    }

    let pid_file = config.general.pid_file.clone();
    if let Some(path) = &pid_file {
        match DaemonUtils::is_daemon_running(path) {
            Ok(true) => {
                error!("snifferd is already running (PID file exists: {})", path.display());
                process::exit(1);
            }
            Ok(false) => {}
            Err(e) => warn!("Ignoring unreadable PID file {}: {}", path.display(), e),
        }
        if let Err(e) = DaemonUtils::create_pid_file(path) {
            error!("Failed to create PID file {}: {}", path.display(), e);
            process::exit(1);
        }
    }

    let result = run_sniffer(&config);

    if let Some(path) = &pid_file {
        if let Err(e) = DaemonUtils::remove_pid_file(path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    match result {
        Ok(()) => info!("snifferd shutdown complete"),
        Err(e) => {
            error!("snifferd error: {}", e);
            process::exit(1);
        }
    }
}

/// Load the configuration file and apply command line overrides
fn load_configuration(matches: &ArgMatches) -> Result<DaemonConfig> {
    let path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut manager = if Path::new(&path).exists() {
        ConfigManager::load_from_file(&path)?
    } else {
        ConfigManager::new()
    };

    let config = manager.config_mut();
    if let Some(interfaces) = matches.get_many::<String>("interface") {
        config.capture.interfaces = interfaces.cloned().collect();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(pid_file) = matches.get_one::<String>("pid-file") {
        config.general.pid_file = Some(PathBuf::from(pid_file));
    }
    if matches.get_flag("no-hop") {
        config.channels.hopping = false;
    }
    if let Some(control) = matches.get_one::<String>("control") {
        config.control.enabled = true;
        config.control.socket_path = PathBuf::from(control);
    }

    let validation = manager.validate_config(manager.get_config());
    for warning in &validation.warnings {
        eprintln!("snifferd: warning: {}", warning);
    }
    if !validation.valid {
        return Err(SnifferError::Config(format!(
            "Configuration validation failed: {}",
            validation.errors.join(", ")
        )));
    }

    Ok(manager.into_config())
}

/// Initialize logging system
fn init_logging(config: &DaemonConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = EnvFilter::try_new(level)
        .map_err(|e| SnifferError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.targets);

    let installed = if config.logging.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
    installed.map_err(|e| SnifferError::System(format!("Failed to install logger: {}", e)))
}

/// Build the sniffer and run it until shutdown
fn run_sniffer(config: &DaemonConfig) -> Result<()> {
    info!(
        "Capturing on {} with {} tracking buckets",
        config.capture.interfaces.join(", "),
        config.table.buckets
    );

    let mut sniffer = Sniffer::from_config(config)?;
    sniffer.install_signal_handlers()?;
    sniffer.run()?;

    let status = sniffer.status();
    info!(
        "Tracked {} access points and {} stations from {} frames",
        status.access_points, status.stations, status.capture.frames_decoded
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = cli().get_matches_from([
            "snifferd",
            "-c",
            "/nonexistent/snifferd.toml",
            "-i",
            "mon0",
            "-i",
            "mon1",
            "-l",
            "debug",
            "--no-hop",
            "--control",
            "/tmp/other.sock",
        ]);
        let config = load_configuration(&matches).unwrap();
        assert_eq!(config.capture.interfaces, vec!["mon0", "mon1"]);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.channels.hopping);
        assert_eq!(config.control.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.general.pid_file, None);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let matches = cli().get_matches_from(["snifferd", "-c", "/nonexistent/snifferd.toml", "-l", "chatty"]);
        assert!(load_configuration(&matches).is_err());
    }
}
