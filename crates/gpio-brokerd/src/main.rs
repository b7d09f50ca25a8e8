//! GPIO Resource Broker Daemon
//!
//! Main entry point for gpio-brokerd.
//! Watches for GPIO chips, publishes them on the object bus and serves line
//! requests until SIGTERM or SIGINT.

use anyhow::{Context, anyhow};
use clap::Parser;
use gpio_brokerd::hotplug::{self, Device};
use gpio_brokerd::http_api::{self, AppState};
use gpio_brokerd::{
    BUS_API_VERSION, BackendKind, Broker, BrokerConfig, ChipOpener, DEFAULT_CONFIG_PATH,
    EventSender, ObjectBus, SimBackend, SystemdNotifier,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn version() -> String {
    format!(
        "{} (bus API version {})",
        env!("CARGO_PKG_VERSION"),
        BUS_API_VERSION
    )
}

/// GPIO resource broker
#[derive(Debug, Parser)]
#[command(name = "gpio-brokerd", version = version(), about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = BrokerConfig::load_or_default(&args.config)?;
    config.validate()?;

    init_logging(args.debug || config.logging.debug)?;
    info!(config = %args.config.display(), "gpio-brokerd: starting");

    match run_daemon(config).await {
        Ok(()) => {
            info!("gpio-brokerd: exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "gpio-brokerd: exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging; `RUST_LOG` takes precedence
fn init_logging(debug: bool) -> anyhow::Result<()> {
    let default = if debug { "info,gpio_brokerd=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to set logger: {}", e))
}

async fn run_daemon(config: BrokerConfig) -> anyhow::Result<()> {
    let bus = ObjectBus::new(config.bus.signal_capacity);
    let (opener, present) = open_backend(&config)?;
    let mut broker = Broker::new(opener, Arc::new(bus.clone()));
    let tx = broker.sender();

    let (stop_tx, stop_rx) = watch::channel(false);

    let listen_addr = config.listen_addr()?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    let server = tokio::spawn(http_api::serve(
        listener,
        AppState::new(bus.clone(), tx.clone()),
        stopped(stop_rx.clone()),
    ));

    start_hotplug(&config, &tx)?;
    hotplug::announce(present, &tx)?;

    let notifier = SystemdNotifier::new();
    notifier.notify_ready()?;

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("signal handling failed: {}", e);
        }
        let _ = stop_tx.send(true);
    });

    let result = broker.run(stopped(stop_rx)).await;

    notifier.notify_stopping()?;
    server.abort();
    result?;

    info!("gpio-brokerd: graceful shutdown complete");
    Ok(())
}

type Backend = (Arc<dyn ChipOpener>, Vec<Device>);

fn open_backend(config: &BrokerConfig) -> anyhow::Result<Backend> {
    match config.hotplug.backend {
        BackendKind::Sim => {
            let backend = SimBackend::with_chips(&config.sim_chips()?);
            let present = backend
                .chip_names()
                .into_iter()
                .map(|name| {
                    let devnode = backend.dev_path(&name);
                    Device::new(name, devnode)
                })
                .collect();
            info!("using simulated chips");
            Ok((Arc::new(backend), present))
        }
        BackendKind::Cdev => open_cdev(config),
    }
}

#[cfg(target_os = "linux")]
fn open_cdev(config: &BrokerConfig) -> anyhow::Result<Backend> {
    let present = hotplug::enumerate_chips(&config.hotplug.dev_dir)?;
    info!(chips = present.len(), dev_dir = %config.hotplug.dev_dir.display(), "found gpio chips");
    Ok((Arc::new(gpio_brokerd::CdevBackend), present))
}

#[cfg(not(target_os = "linux"))]
fn open_cdev(_config: &BrokerConfig) -> anyhow::Result<Backend> {
    Err(anyhow!("the cdev backend is only available on Linux"))
}

#[cfg(target_os = "linux")]
fn start_hotplug(config: &BrokerConfig, tx: &EventSender) -> anyhow::Result<()> {
    if config.hotplug.backend == BackendKind::Cdev {
        let monitor = hotplug::UeventMonitor::new(config.hotplug.dev_dir.clone())?;
        tokio::spawn(monitor.run(tx.clone()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn start_hotplug(_config: &BrokerConfig, _tx: &EventSender) -> anyhow::Result<()> {
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolve on SIGTERM or SIGINT. SIGHUP is logged and ignored.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("gpio-brokerd: received SIGTERM");
                return Ok(());
            }
            _ = int.recv() => {
                info!("gpio-brokerd: received SIGINT");
                return Ok(());
            }
            _ = hup.recv() => {
                info!("gpio-brokerd: ignoring SIGHUP");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version_mentions_bus_api() {
        let rendered = Args::command().render_version();
        assert!(rendered.contains(env!("CARGO_PKG_VERSION")));
        assert!(rendered.contains(&format!("(bus API version {})", BUS_API_VERSION)));
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["gpio-brokerd"]).unwrap();
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.debug);

        let args = Args::try_parse_from(["gpio-brokerd", "-d", "-c", "/tmp/b.toml"]).unwrap();
        assert!(args.debug);
        assert_eq!(args.config, PathBuf::from("/tmp/b.toml"));

        assert!(Args::try_parse_from(["gpio-brokerd", "extra"]).is_err());
    }

    #[test]
    fn test_sim_backend_lists_configured_chips() {
        let config: BrokerConfig = toml::from_str(
            r#"
[hotplug]
backend = "sim"

[[sim.chips]]
name = "gpiochip0"
num_lines = 4
"#,
        )
        .unwrap();

        let (_, present) = open_backend(&config).unwrap();
        assert_eq!(
            present,
            vec![Device::new("gpiochip0", Some(PathBuf::from("/dev/gpiochip0")))]
        );
    }
}
