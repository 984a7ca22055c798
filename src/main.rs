//! Volume Attach CLI
//!
//! Operator-facing front end to the attachment layer: report host
//! properties, inspect Fibre Channel HBAs, trigger rescans and drive a
//! connector through attach, detach and extend.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_attach::{
    AttachConfig, ConnectionProperties, ConnectorFactory, ConnectorOptions, DeviceInfo,
    ExecutorRef, LinuxFibreChannel, ProbeContext, ProcessExecutor, RecordingExecutor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Attach - host-side volume attachment tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "VOLUME_ATTACH_CONFIG")]
    config: Option<PathBuf>,

    /// Command prefix for privileged operations
    #[arg(long, env = "ROOT_HELPER")]
    root_helper: Option<String>,

    /// IP address reported in host properties
    #[arg(long, env = "MY_IP")]
    my_ip: Option<String>,

    /// Request multipath
    #[arg(long, env = "MULTIPATH")]
    multipath: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Record commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Print collected metrics on exit
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the host properties for this machine
    Properties {
        /// Reported host name
        #[arg(long)]
        host: Option<String>,
        /// Fail when multipathd is not running
        #[arg(long)]
        enforce_multipath: bool,
    },
    /// List the protocols the factory accepts on this host
    Protocols,
    /// List Fibre Channel HBAs
    Hbas,
    /// Rescan every FC host for a LUN
    Rescan {
        #[arg(long)]
        lun: u64,
    },
    /// Attach a volume
    Connect(VolumeArgs),
    /// Detach a volume
    Disconnect(VolumeArgs),
    /// Existing local paths of a volume
    Paths(VolumeArgs),
    /// Pick up a backend resize
    Extend(VolumeArgs),
}

#[derive(clap::Args, Debug)]
struct VolumeArgs {
    /// Connector protocol, e.g. FIBRE_CHANNEL
    #[arg(long)]
    protocol: String,

    /// Connection properties as a JSON object
    #[arg(long)]
    props: String,

    /// Storage driver name passed to the connector
    #[arg(long)]
    driver: Option<String>,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    let executor: ExecutorRef = if args.dry_run {
        Arc::new(RecordingExecutor::new())
    } else {
        ProcessExecutor::shared()
    };

    info!("Volume attach {} (root helper: {})", volume_attach::VERSION, config.root_helper);

    run(&args, &config, executor)?;

    if args.print_metrics {
        print!("{}", volume_attach::metrics::gather_text()?);
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<AttachConfig> {
    let mut config = match &args.config {
        Some(path) => AttachConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AttachConfig::default(),
    };
    if let Some(root_helper) = &args.root_helper {
        config.root_helper = root_helper.clone();
    }
    if let Some(my_ip) = &args.my_ip {
        config.my_ip = my_ip.clone();
    }
    if args.multipath {
        config.multipath = true;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: &AttachConfig, executor: ExecutorRef) -> anyhow::Result<()> {
    match &args.command {
        Command::Properties {
            host,
            enforce_multipath,
        } => {
            let mut ctx = ProbeContext::from_config(config, executor);
            ctx.enforce_multipath |= *enforce_multipath;
            if let Some(host) = host {
                ctx = ctx.host(host.clone());
            }
            let props = volume_attach::initiator::collect_properties(&ctx)?;
            println!("{}", serde_json::to_string_pretty(&props)?);
        }
        Command::Protocols => {
            for protocol in factory(config, executor).protocols() {
                println!("{}", protocol);
            }
        }
        Command::Hbas => {
            let hbas = LinuxFibreChannel::from_config(config, executor).discover_hbas();
            println!("{}", serde_json::to_string_pretty(&hbas)?);
        }
        Command::Rescan { lun } => {
            let fc = LinuxFibreChannel::from_config(config, executor);
            let hbas = fc.discover_hbas();
            info!("Rescanning {} HBAs for LUN {}", hbas.len(), lun);
            fc.rescan_hosts(&hbas, *lun);
        }
        Command::Connect(volume) => {
            let (connector, props) = connector(config, executor, volume)?;
            let device = connector.connect_volume(&props)?;
            println!("{}", serde_json::to_string_pretty(&device)?);
        }
        Command::Disconnect(volume) => {
            let (connector, props) = connector(config, executor, volume)?;
            let device = props
                .get_str("device_path")
                .map(|path| DeviceInfo::new("block", path));
            connector.disconnect_volume(&props, device.as_ref())?;
        }
        Command::Paths(volume) => {
            let (connector, props) = connector(config, executor, volume)?;
            for path in connector.get_volume_paths(&props)? {
                println!("{}", path);
            }
        }
        Command::Extend(volume) => {
            let (connector, props) = connector(config, executor, volume)?;
            match connector.extend_volume(&props)? {
                Some(size) => println!("{}", size),
                None => println!("unknown"),
            }
        }
    }
    Ok(())
}

fn factory(config: &AttachConfig, executor: ExecutorRef) -> ConnectorFactory {
    ConnectorFactory::builder()
        .from_config(config)
        .executor(executor)
        .build()
}

fn connector(
    config: &AttachConfig,
    executor: ExecutorRef,
    volume: &VolumeArgs,
) -> anyhow::Result<(volume_attach::ConnectorRef, ConnectionProperties)> {
    let value: serde_json::Value =
        serde_json::from_str(&volume.props).context("parsing --props")?;
    let props = ConnectionProperties::from_value(value)?;

    let mut options = ConnectorOptions::from_config(config);
    if let Some(driver) = &volume.driver {
        options = options.driver(driver.clone());
    }
    let connector = factory(config, executor).build(&volume.protocol, options)?;
    Ok((connector, props))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
