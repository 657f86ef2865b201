//! Command-line front end.
//!
//! ```bash
//! xpd_acq start --pi Billinge --saf 300564 --wavelength 0.1812
//! xpd_acq list
//! xpd_acq summarize 3
//! xpd_acq run 0 3 --md operator=tl
//! ```
//!
//! `run` drives the simulated devices from `hardware::mock`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;

use xpd_acq::beamtime::{open_beamtime, start_beamtime, Beamtime};
use xpd_acq::config::{Settings, DEFAULT_CONFIG_FILE};
use xpd_acq::experiment::{CustomizedRunEngine, Document, InvokeOptions};
use xpd_acq::hardware::mock::MockDevices;
use xpd_acq::logging;
use xpd_acq::metadata::MetadataMap;

/// XPD acquisition - scan plans with automatic dark frames
#[derive(Parser, Debug)]
#[command(name = "xpd_acq")]
#[command(about = "Run X-ray powder diffraction scans with automatic dark frames")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the directory layout and a new beamtime
    Start {
        /// PI last name
        #[arg(long)]
        pi: String,
        /// Safety approval form number
        #[arg(long)]
        saf: String,
        /// Additional experimenters
        #[arg(long = "experimenter")]
        experimenters: Vec<String>,
        /// X-ray wavelength in angstrom
        #[arg(long)]
        wavelength: Option<f64>,
    },
    /// List experiments, scan plans and samples
    List,
    /// Dry-run summary of a scan plan
    Summarize {
        /// Scan plan index
        plan: usize,
    },
    /// Run a scan plan on a sample (simulated devices)
    Run {
        /// Sample index
        sample: usize,
        /// Scan plan index
        plan: usize,
        /// Skip automatic dark frames
        #[arg(long)]
        no_dark: bool,
        /// Check that every run was completely written
        #[arg(long)]
        verify_write: bool,
        /// Extra run metadata as key=value (values parsed as JSON when possible)
        #[arg(long = "md", value_parser = parse_md)]
        metadata: Vec<(String, Value)>,
    },
}

fn parse_md(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn require_beamtime(settings: &Settings) -> Result<Beamtime> {
    match open_beamtime(settings)? {
        Some(bt) => Ok(bt),
        None => bail!(
            "no beamtime under {}; run `xpd_acq start` first",
            settings.yaml_dir().display()
        ),
    }
}

fn print_document(doc: &Document) {
    match doc {
        Document::Start(start) => println!(
            "start  {}  {}{}",
            start.uid,
            start.plan_type,
            if start.is_dark_frame() { " (dark)" } else { "" }
        ),
        Document::Event(event) => {
            let row: Vec<String> = event.data.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("  event {:>3}  {}", event.seq_num, row.join("  "));
        }
        Document::Stop(stop) => println!("stop   {}  {}", stop.run_uid, stop.exit_status),
        Document::Descriptor(_) => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    logging::init(&settings);

    match cli.command {
        Command::Start {
            pi,
            saf,
            experimenters,
            wavelength,
        } => {
            let bt = start_beamtime(&settings, &pi, &saf, &experimenters, wavelength)?;
            println!("{}", bt);
        }
        Command::List => {
            println!("{}", require_beamtime(&settings)?);
        }
        Command::Summarize { plan } => {
            let bt = require_beamtime(&settings)?;
            let sp = bt.scanplan(plan)?;
            println!("{}", sp.summary(settings.acquisition.frame_acq_time)?);
        }
        Command::Run {
            sample,
            plan,
            no_dark,
            verify_write,
            metadata,
        } => {
            let bt = require_beamtime(&settings)?;
            let devices = MockDevices::new();
            let xrun = CustomizedRunEngine::new(bt, devices.device_set(), settings)?;

            let options = InvokeOptions {
                verify_write,
                ..xrun.default_options()
            }
            .with_sub(Box::new(print_document));
            let options = if no_dark { options.auto_dark(false) } else { options };

            let md: MetadataMap = metadata.into_iter().collect();
            let uids = xrun.invoke(sample, plan, options, md).await?;
            info!(runs = uids.len(), "done");
            for uid in uids {
                println!("{}", uid);
            }
        }
    }
    Ok(())
}
