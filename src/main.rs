//! CLI Entry Point for gpib-daq
//!
//! Provides a command-line front-end for:
//! - Continuous or timed measurement (`read`)
//! - Checking that an instrument answers (`identify`)
//! - Inspecting and editing saved settings (`config`)
//!
//! # Usage
//!
//! ```bash
//! gpib-daq read --duration 10 --output run.csv
//! gpib-daq read --mock
//! gpib-daq identify --resource TCPIP0::192.168.1.50::5025::SOCKET
//! gpib-daq config set-resource GPIB0::22::INSTR
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gpib_daq::config::Settings;
use gpib_daq::hardware::mock::MockInstrument;
use gpib_daq::hardware::{ResourceAddress, TransportFactory, VisaTransportFactory};
use gpib_daq::logging::{self, LoggingConfig, OutputFormat};
use gpib_daq::{ChannelSink, MeasurementEvent, RunSummary, Session, SessionController, SessionEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Parser)]
#[command(name = "gpib-daq")]
#[command(about = "Resilient GPIB/VISA instrument polling", long_about = None)]
struct Cli {
    /// Settings file (defaults to the user configuration directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the instrument until Ctrl-C or the duration elapses
    Read {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Resource string overriding the saved one
        #[arg(long)]
        resource: Option<String>,

        /// Use the simulated instrument
        #[arg(long)]
        mock: bool,

        /// Append measurements to a CSV file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Connect, print the identification string and disconnect
    Identify {
        #[arg(long)]
        resource: Option<String>,

        #[arg(long)]
        mock: bool,
    },

    /// Show or edit saved settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Save a new default resource string
    SetResource { resource: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load settings")?;

    let level = logging::parse_log_level(&settings.log_level).map_err(anyhow::Error::msg)?;
    logging::init(LoggingConfig::new(level).with_format(cli.log_format)).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Read {
            duration,
            resource,
            mock,
            output,
            json,
        } => {
            let controller = build_controller(&settings, resource, mock)?;
            read(controller, duration, output, json).await
        }
        Commands::Identify { resource, mock } => {
            let (controller, _events) = build_controller(&settings, resource, mock)?;
            let identity = controller.connect().await.context("Connect failed")?;
            println!("{identity}");
            controller.disconnect().await?;
            Ok(())
        }
        Commands::Config { action } => configure(settings, cli.config, action),
    }
}

type Events = mpsc::UnboundedReceiver<SessionEvent>;

fn build_controller(
    settings: &Settings,
    resource: Option<String>,
    mock: bool,
) -> Result<(SessionController, Events)> {
    let resource = resource.unwrap_or_else(|| settings.resource_name.clone());
    resource
        .parse::<ResourceAddress>()
        .with_context(|| format!("Unusable resource '{resource}'"))?;
    settings.policy.validate().map_err(anyhow::Error::msg)?;

    let factory: Arc<dyn TransportFactory> = if mock {
        MockInstrument::new()
            .with_latency(Duration::from_millis(20))
            .factory()
    } else {
        Arc::new(VisaTransportFactory::from_settings(settings))
    };

    let session = Session::new(resource, factory).with_policy(settings.policy.clone());
    let (sink, events) = ChannelSink::new();
    Ok((SessionController::new(Arc::new(session), Arc::new(sink)), events))
}

async fn read(
    (controller, mut events): (SessionController, Events),
    duration: Option<f64>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut recorder = match output {
        Some(path) => Some(Recorder::create(path)?),
        None => None,
    };

    let mut status = controller.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            eprintln!("[{current}]");
        }
    });

    let identity = controller.connect().await.context("Connect failed")?;
    eprintln!("Instrument: {identity}");
    eprintln!("Started at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    match duration {
        Some(seconds) if seconds > 0.0 => {
            controller.start_for_duration(Duration::from_secs_f64(seconds))?
        }
        Some(seconds) => bail!("--duration must be positive, got {seconds}"),
        None => controller.start_unbounded()?,
    }
    let started = Instant::now();

    let mut interrupts = forward_interrupts();
    let summary = supervise(&controller, &mut events, &mut interrupts, |event| {
        report(event, started, json, recorder.as_mut())
    })
    .await?;

    while let Ok(event) = events.try_recv() {
        report(&event, started, json, recorder.as_mut())?;
    }
    if let Some(recorder) = recorder.as_mut() {
        recorder.flush()?;
    }

    controller.disconnect().await?;
    print_summary(summary.as_ref());
    Ok(())
}

/// Relay every Ctrl-C into a channel through a single long-lived listener.
fn forward_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        while (&mut interrupt).await.is_ok() {
            interrupt.set(tokio::signal::ctrl_c());
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Report events until the run ends. The first interrupt requests Stop, a second one
/// gives up on the run.
async fn supervise(
    controller: &SessionController,
    events: &mut Events,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
    mut on_event: impl FnMut(&SessionEvent) -> Result<()>,
) -> Result<Option<RunSummary>> {
    let finished = controller.wait();
    tokio::pin!(finished);
    let mut stopping = false;

    loop {
        tokio::select! {
            summary = &mut finished => return Ok(summary?),
            Some(event) = events.recv() => on_event(&event)?,
            Some(()) = interrupts.recv() => {
                if stopping {
                    bail!("Interrupted again, exiting without waiting for the run to finish");
                }
                eprintln!("Stopping... (Ctrl-C again to force exit)");
                stopping = true;
                if let Err(err) = controller.stop() {
                    tracing::warn!(error = %err, "Stop request ignored");
                }
            }
        }
    }
}

fn report(
    event: &SessionEvent,
    started: Instant,
    json: bool,
    recorder: Option<&mut Recorder>,
) -> Result<()> {
    let elapsed_ms = started.elapsed().as_millis();
    if json {
        println!("{}", serde_json::to_string(event)?);
    }
    match event {
        SessionEvent::Measurement(measurement) => {
            if !json {
                println!("Time: {elapsed_ms}ms - Reading: {}", measurement.reading);
            }
            if let Some(recorder) = recorder {
                recorder.record(elapsed_ms, measurement)?;
            }
        }
        SessionEvent::Failure(failure) if !json => eprintln!("Error: {failure}"),
        SessionEvent::Failure(_) => {}
    }
    Ok(())
}

fn print_summary(summary: Option<&RunSummary>) {
    if let Some(summary) = summary {
        eprintln!(
            "Run ended ({:?}): {} measurements, {} failures",
            summary.outcome, summary.measurements, summary.failures
        );
        if let Some(error) = &summary.last_error {
            eprintln!("Last error: {error}");
        }
    }
}

fn configure(settings: Settings, path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        ConfigAction::SetResource { resource } => {
            let updated = Settings {
                resource_name: resource,
                ..settings
            };
            updated.validate()?;
            match path {
                Some(path) => updated.save_to(path)?,
                None => updated.save()?,
            }
            println!("Resource set to {}", updated.resource_name);
            Ok(())
        }
    }
}

/// CSV sink for measurements.
#[cfg(feature = "storage_csv")]
struct Recorder {
    writer: csv::Writer<std::fs::File>,
}

#[cfg(feature = "storage_csv")]
impl Recorder {
    fn create(path: PathBuf) -> Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !exists {
            writer.write_record(["timestamp", "elapsed_ms", "sequence", "reading"])?;
        }
        Ok(Self { writer })
    }

    fn record(&mut self, elapsed_ms: u128, measurement: &MeasurementEvent) -> Result<()> {
        self.writer.write_record([
            chrono::Utc::now().to_rfc3339(),
            elapsed_ms.to_string(),
            measurement.sequence.to_string(),
            measurement.reading.clone(),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
struct Recorder;

#[cfg(not(feature = "storage_csv"))]
impl Recorder {
    fn create(_path: PathBuf) -> Result<Self> {
        bail!("CSV output not enabled. Rebuild with --features storage_csv")
    }

    fn record(&mut self, _elapsed_ms: u128, _measurement: &MeasurementEvent) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
