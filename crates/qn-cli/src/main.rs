//! qncorr CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod inspect;
mod run;

#[derive(Parser)]
#[command(name = "qncorr")]
#[command(about = "qncorr - Q-vector calibration and acceptance corrections")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process an event stream, applying available calibration and collecting new calibration
    Run {
        /// Run configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Events, one JSON object per line
        #[arg(short, long)]
        events: PathBuf,

        /// Calibration input from a previous pass (JSON)
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Process label the calibration is looked up and collected under
        #[arg(long, default_value = qn_correct::ALL_PROCESSES)]
        process: String,

        /// Output file for per-event Q-vectors (JSON lines). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the collected calibration here (JSON)
        #[arg(long)]
        calibration_out: Option<PathBuf>,

        /// Write the per-step QA report here (JSON)
        #[arg(long)]
        qa: Option<PathBuf>,

        /// Stage to report: raw, plain, rec, align, twist, rescale, latest
        #[arg(long, default_value = "latest")]
        stage: String,
    },

    /// List the accumulators of a calibration file
    Inspect {
        /// Calibration file (JSON)
        #[arg(long)]
        calibration: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Run {
            config,
            events,
            calibration,
            process,
            output,
            calibration_out,
            qa,
            stage,
        } => {
            run::cmd_run(&run::RunArgs {
                config,
                events,
                calibration,
                process,
                output,
                calibration_out,
                qa,
                stage,
            })
        }
        Commands::Inspect { calibration } => inspect::cmd_inspect(&calibration),
    }
}
