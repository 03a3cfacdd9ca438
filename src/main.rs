//! Mercury CLI
//!
//! Runs the optimizing pipeline over circuits stored in the JSON
//! interchange format.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mercury::pass::Verifier;
use mercury::{Circuit, CompilationUnit, CompilerOptions, ProfileSource, ProfileTypeManager, SchedulePolicy, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mercury")]
#[command(author, version, about = "Optimizing middle-end for a JavaScript AOT/JIT compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a circuit and print its schedule
    Optimize {
        /// Circuit in JSON interchange format
        circuit: PathBuf,
        /// Compiler options (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Profile document (JSON)
        #[arg(short, long, value_name = "FILE")]
        profile: Option<PathBuf>,
        /// Schedule pure gates as late as possible
        #[arg(long)]
        lazy: bool,
        /// Print every gate of the optimized circuit
        #[arg(long)]
        dump: bool,
        /// Write the optimized circuit here
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Check a circuit with the verifier
    Verify {
        /// Circuit in JSON interchange format
        circuit: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Optimize {
            circuit,
            config,
            profile,
            lazy,
            dump,
            output,
        } => optimize(&circuit, config.as_deref(), profile.as_deref(), lazy, dump, output.as_deref()),
        Commands::Verify { circuit } => verify(&circuit),
    };
    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("mercury={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(config: Option<&Path>, lazy: bool) -> anyhow::Result<CompilerOptions> {
    let mut options = match config {
        Some(path) => CompilerOptions::from_json_file(path)
            .with_context(|| format!("reading options from '{}'", path.display()))?,
        None => CompilerOptions::default(),
    };
    if lazy {
        options.schedule_policy = SchedulePolicy::Lazy;
    }
    Ok(options)
}

fn optimize(
    path: &Path,
    config: Option<&Path>,
    profile: Option<&Path>,
    lazy: bool,
    dump: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let options = load_options(config, lazy)?;
    let circuit =
        Circuit::from_json_file(path).with_context(|| format!("reading circuit from '{}'", path.display()))?;
    let manager = Arc::new(ProfileTypeManager::new());
    if let Some(profile) = profile {
        manager
            .load_json_file(profile)
            .with_context(|| format!("reading profile from '{}'", profile.display()))?;
    }

    let start = Instant::now();
    let unit = CompilationUnit::new(circuit, ProfileSource::offline(manager), options);
    let out = unit.compile()?;
    let elapsed = start.elapsed();

    if dump {
        println!("{}", out.circuit.dump_all());
    }
    println!("{}", out.schedule);
    eprintln!("mercury {}: {} live gates in {:?}", VERSION, out.circuit.live_count(), elapsed);
    eprintln!("{}", out.stats);

    if let Some(output) = output {
        std::fs::write(output, out.circuit.to_json()?)
            .with_context(|| format!("writing circuit to '{}'", output.display()))?;
    }
    Ok(())
}

fn verify(path: &Path) -> anyhow::Result<()> {
    let circuit =
        Circuit::from_json_file(path).with_context(|| format!("reading circuit from '{}'", path.display()))?;
    let options = CompilerOptions {
        fatal_verifier: false,
        ..CompilerOptions::default()
    };
    Verifier::new(&options).verify(&circuit)?;
    println!("{}: {} live gates, ok", circuit.info().name, circuit.live_count());
    Ok(())
}
