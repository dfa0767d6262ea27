use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use forcetrace_cli::{commands, AcquireOptions, AppConfig};
use forcetrace_core::Result;

#[derive(Parser, Debug)]
#[command(name = "forcetrace", version, about = "Force sensor acquisition and calibration")]
struct Cli {
    /// TOML configuration file (defaults to ./forcetrace.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture from the serial board until Enter, Ctrl-C or --duration
    Acquire {
        #[arg(long)]
        port: Option<String>,

        #[arg(long)]
        baud: Option<u32>,

        #[arg(long)]
        channels: Option<usize>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Unfiltered, uncalibrated capture exported as Time,V1..VN
        #[arg(long)]
        raw: bool,

        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        calibration_dir: Option<PathBuf>,
    },

    /// Record a calibration dataset for one sensor
    Calibrate {
        /// Two-character sensor label
        #[arg(long)]
        label: String,

        #[arg(long)]
        port: Option<String>,

        #[arg(long)]
        baud: Option<u32>,

        #[arg(long)]
        channels: Option<usize>,

        /// Dataset directory (defaults to calibration.dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Fit conversion functions from a dataset directory
    Fit {
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Polynomial degree, 1 or 2
        #[arg(long)]
        degree: Option<usize>,

        #[arg(long)]
        channels: Option<usize>,
    },

    /// Condition and convert a raw capture
    Reprocess {
        input: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,

        /// Run the streaming noise filter before conditioning
        #[arg(long)]
        streaming: bool,

        #[arg(long)]
        calibration_dir: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_serial(config: &mut AppConfig, port: Option<String>, baud: Option<u32>) {
    if let Some(port) = port {
        config.serial.port = port;
    }
    if let Some(baud) = baud {
        config.serial.baud_rate = baud;
    }
}

async fn run(command: Command, mut config: AppConfig) -> Result<()> {
    match command {
        Command::Acquire {
            port,
            baud,
            channels,
            duration,
            raw,
            output,
            calibration_dir,
        } => {
            apply_serial(&mut config, port, baud);
            if let Some(channels) = channels {
                config.acquisition.channels = channels;
            }
            if let Some(dir) = calibration_dir {
                config.calibration.dir = dir;
            }
            config.validate()?;

            let options = AcquireOptions {
                duration: duration
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64),
                raw,
                output,
                interactive: true,
            };
            if let Some(path) = commands::acquire(&config, options).await? {
                println!("Saved {}", path.display());
            }
        }

        Command::Calibrate {
            label,
            port,
            baud,
            channels,
            dir,
        } => {
            apply_serial(&mut config, port, baud);
            if let Some(channels) = channels {
                config.acquisition.channels = channels;
            }
            config.validate()?;

            let dir = dir.unwrap_or_else(|| config.calibration.dir.clone());
            let path = commands::calibrate(&config, &label, &dir).await?;
            println!("Saved {}", path.display());
        }

        Command::Fit {
            dir,
            degree,
            channels,
        } => {
            if let Some(degree) = degree {
                config.calibration.degree = degree;
            }
            if let Some(channels) = channels {
                config.acquisition.channels = channels;
            }
            config.validate()?;

            let dir = dir.unwrap_or_else(|| config.calibration.dir.clone());
            commands::fit(&config, &dir)?;
        }

        Command::Reprocess {
            input,
            output,
            streaming,
            calibration_dir,
        } => {
            if let Some(dir) = calibration_dir {
                config.calibration.dir = dir;
            }
            config.validate()?;

            let path = commands::reprocess_capture(&config, &input, output.as_deref(), streaming)?;
            println!("Saved {}", path.display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
