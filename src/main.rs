//! `labdrive` command-line entry point.
//!
//! ```bash
//! labdrive plan --config config/tracker.example.toml --csv plan.csv
//! labdrive track --config config/tracker.example.toml
//! labdrive track --config config/tracker.example.toml --simulate
//! labdrive query --tcp 192.168.0.254:5001 "*IDN?"
//! labdrive query --serial /dev/ttyUSB0 --baud 19200 "1TP?"
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labdrive::config::AppConfig;
use labdrive::logging::{self, OutputFormat, TracingConfig};
use labdrive::run;
use labdrive_core::transport::reply_text;
use labdrive_core::{SharedTransport, Transport};
use labdrive_motion::Tracker;
use labdrive_transport::{LineConfig, TcpTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "labdrive")]
#[command(about = "Instrument transports and multi-drive trajectory tracking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan the configured trajectory and print or export it
    Plan {
        #[arg(long, default_value = labdrive::config::DEFAULT_PATH)]
        config: PathBuf,
        /// Write `time,speed,position` samples to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Print the full sampled trajectory as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the configured trajectory on all enabled drives (Ctrl-C stops all)
    Track {
        #[arg(long, default_value = labdrive::config::DEFAULT_PATH)]
        config: PathBuf,
        /// Use simulated drives instead of connecting
        #[arg(long)]
        simulate: bool,
    },

    /// Send one text command and print the reply
    Query {
        /// `host:port` of a socket instrument
        #[arg(long, conflicts_with = "serial")]
        tcp: Option<String>,
        /// Serial device path
        #[arg(long)]
        serial: Option<String>,
        #[arg(long, default_value_t = 9600)]
        baud: u32,
        /// Use `\r\n` terminators instead of `\n`
        #[arg(long)]
        crlf: bool,
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { config, csv, json } => plan(config, csv, json),
        Commands::Track { config, simulate } => track(config, simulate).await,
        Commands::Query {
            tcp,
            serial,
            baud,
            crlf,
            timeout_ms,
            command,
        } => {
            logging::init(TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact))
                .map_err(anyhow::Error::msg)?;
            let mut line = if crlf {
                LineConfig::crlf()
            } else {
                LineConfig::default()
            };
            line.timeout = Duration::from_millis(timeout_ms);
            let transport = open_text_transport(tcp, serial, baud, line)?;
            query(transport, &command).await
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn plan(path: PathBuf, csv_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = AppConfig::load_from(&path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    config.validate_settings()?;
    let planned = labdrive_motion::Plan::new(config.trajectory.params).context("planning trajectory")?;
    let trajectory = run::plan(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&trajectory)?);
        return Ok(());
    }

    println!("{:<14} {:>9} {:>9} {:>10} {:>10}", "segment", "start s", "length s", "from m", "v_end m/s");
    for seg in &planned.segments {
        println!(
            "{:<14} {:>9.3} {:>9.3} {:>10.4} {:>10.4}",
            format!("{:?}", seg.kind),
            seg.start,
            seg.duration,
            seg.from,
            seg.v_end
        );
    }
    println!(
        "period {:.3} s, {} samples at dt {} s, {} cycle(s)",
        planned.duration(),
        trajectory.len(),
        trajectory.dt,
        config.trajectory.cycles
    );

    if let Some(csv_path) = csv_path {
        let mut writer = csv::Writer::from_path(&csv_path)
            .with_context(|| format!("creating {}", csv_path.display()))?;
        writer.write_record(["time", "speed", "position"])?;
        for i in 0..trajectory.len() {
            writer.write_record([
                format!("{:.4}", trajectory.times[i]),
                format!("{:.6}", trajectory.speeds[i]),
                format!("{:.6}", trajectory.positions[i]),
            ])?;
        }
        writer.flush()?;
        println!("wrote {}", csv_path.display());
    }
    Ok(())
}

async fn track(path: PathBuf, simulate: bool) -> Result<()> {
    let config = load_config(&path)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, config = %path.display(), simulate, "starting run");

    let tracker = Tracker::new(config.tracker)?;
    let stopper = tracker.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping all drives");
            stopper.stop_all();
        }
    });

    let outcome = run::run(&config, &tracker, simulate).await;
    ctrl_c.abort();
    let outcome = outcome?;

    for report in &outcome.reports {
        println!(
            "{:<12} ticks {:>6}  max error {:.5} m  {}",
            report.drive,
            report.ticks,
            report.max_error,
            if report.stopped { "stopped" } else { "finished" }
        );
    }
    if let Some(log) = outcome.log_path {
        println!("log: {}", log.display());
    }
    Ok(())
}

fn open_text_transport(
    tcp: Option<String>,
    serial: Option<String>,
    baud: u32,
    line: LineConfig,
) -> Result<SharedTransport> {
    match (tcp, serial) {
        (Some(address), None) => Ok(Arc::new(TcpTransport::tcp(address, line))),
        #[cfg(feature = "serial")]
        (None, Some(path)) => {
            let settings = labdrive_transport::SerialSettings::new(path, baud);
            Ok(Arc::new(labdrive_transport::SerialTransport::serial(settings, line)))
        }
        #[cfg(not(feature = "serial"))]
        (None, Some(_)) => {
            let _ = baud;
            bail!("serial support is not compiled in (enable the `serial` feature)")
        }
        _ => bail!("give exactly one of --tcp or --serial"),
    }
}

async fn query(transport: SharedTransport, command: &str) -> Result<()> {
    transport
        .open()
        .await
        .with_context(|| format!("opening {}", transport.describe()))?;
    let result = transport.query(command.as_bytes()).await;
    if let Err(e) = transport.close().await {
        warn!(error = %e, "closing transport failed");
    }
    let reply = result.with_context(|| format!("querying {}", transport.describe()))?;
    println!("{}", reply_text(&reply)?);
    Ok(())
}
