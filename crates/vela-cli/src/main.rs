//! Vela pipeline CLI

use clap::{ArgAction, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process;
use tracing::Level;
use vela_ir::Target;
use vela_transform::samples::{find_sample, samples};
use vela_transform::{PipelineConfig, Session, SessionError, Stage};

#[derive(Parser)]
#[command(name = "vela")]
#[command(author = "Guilherme Mendes")]
#[command(version = "0.1.0")]
#[command(about = "Vela IR canonicalization pipeline", long_about = None)]
struct Cli {
    /// Pipeline config (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Last stage to run
    #[arg(long, global = true, value_name = "STAGE")]
    stop_after: Option<Stage>,

    /// Target sub-module for extracted kernels
    #[arg(long, global = true, value_name = "TARGET")]
    target: Option<Target>,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the sample units
    List,

    /// Lists the pipeline stages in execution order
    Stages,

    /// Prints the effective pipeline config
    Config,

    /// Runs the pipeline on a sample and prints the resulting IR
    Run {
        /// Sample name (see `vela list`)
        #[arg(value_name = "SAMPLE")]
        sample: String,

        /// Print the IR before the pipeline runs too
        #[arg(long)]
        before: bool,

        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Runs the pipeline on a sample, or on every sample, and reports errors
    Check {
        /// Sample name (default: all)
        #[arg(value_name = "SAMPLE")]
        sample: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> PipelineConfig {
    let mut config = match &cli.config {
        Some(path) => match PipelineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        },
        None => PipelineConfig::default(),
    };
    if let Some(stage) = cli.stop_after {
        config.stop_after = Some(stage);
    }
    if let Some(target) = cli.target {
        config.kernel_target = target;
    }
    config
}

fn unknown_sample(name: &str) -> ! {
    eprintln!("Error: unknown sample `{}`", name);
    eprintln!("Available samples:");
    for sample in samples() {
        eprintln!("  {}", sample.name);
    }
    process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli);

    match cli.command {
        Commands::List => {
            for sample in samples() {
                println!("{:<14} {}", sample.name, sample.description);
            }
        }

        Commands::Stages => {
            for stage in Stage::ALL {
                let marker = if config.stop_after.map_or(false, |last| stage > last) {
                    " (skipped)"
                } else {
                    ""
                };
                println!("{}{}", stage, marker);
            }
        }

        Commands::Config => match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        },

        Commands::Run { sample, before, output } => {
            let Some(sample) = find_sample(&sample) else {
                unknown_sample(&sample);
            };
            if before {
                match (sample.build)() {
                    Ok(module) => eprintln!("{}", module),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(1);
                    }
                }
            }

            let mut session = Session::new(config);
            let lowered = session.compile_unit(|| sample.lower());
            let dump = match lowered {
                Ok(Some(module)) => module.to_string(),
                Ok(None) => {
                    eprintln!("{}", session.diagnostics().render(true));
                    process::exit(1);
                }
                Err(e) => {
                    eprintln!("{}", session.diagnostics().render(true));
                    eprintln!("Error: {}", e);
                    process::exit(2);
                }
            };

            match output {
                Some(path) => {
                    if let Err(e) = fs::write(&path, dump) {
                        eprintln!("Error writing {}: {}", path.display(), e);
                        process::exit(1);
                    }
                    println!("IR written to: {}", path.display());
                }
                None => print!("{}", dump),
            }
        }

        Commands::Check { sample } => {
            let selected = match sample {
                Some(name) => match find_sample(&name) {
                    Some(sample) => vec![sample],
                    None => unknown_sample(&name),
                },
                None => samples(),
            };

            let mut session = Session::new(config);
            for sample in &selected {
                let result = session.compile_unit(|| sample.lower());
                match result {
                    Ok(Some(_)) => println!("  [ok] {}", sample.name),
                    Ok(None) => println!("  [error] {}", sample.name),
                    Err(SessionError::Fatal(e)) => {
                        println!("  [fatal] {}: {}", sample.name, e);
                        break;
                    }
                    Err(SessionError::Aborted) => break,
                }
            }

            if session.is_aborted() || session.error_count() > 0 {
                eprintln!("\n{}", session.diagnostics().render(true));
                process::exit(1);
            }
            let kernels: usize = session.reports().iter().map(|r| r.kernels.len()).sum();
            println!(
                "\n{} unit(s) passed, {} kernel(s) extracted",
                session.modules().len(),
                kernels
            );
        }
    }
}
