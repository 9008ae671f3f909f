//! Halfscan: half-open TCP port scanner.
//!
//! Usage:
//!   halfscan <TARGET> [--ports <SPEC> | --port <PORT>] [--output json|pretty]
//!   halfscan scan <TARGET> [OPTIONS]

use clap::Parser;
use halfscan::cli::{self, Cli, Commands, OutputFmt, ScanOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Scan(args)) => run_scan_command(&args.target, &args.options).await,
        None => {
            let Some(target) = cli.target else {
                eprintln!("Error: target argument required (e.g. halfscan 192.168.1.10)");
                eprintln!("Run 'halfscan --help' for usage.");
                std::process::exit(1);
            };
            run_scan_command(&target, &cli.options).await;
        }
    }
}

async fn run_scan_command(target: &str, options: &ScanOptions) {
    if let Err(e) = options.port_spec() {
        eprintln!("Error parsing port spec: {e}");
        std::process::exit(1);
    }

    match cli::run_scan(target, options).await {
        Ok(result) => match options.output {
            OutputFmt::Pretty => print!("{}", cli::format_pretty(&result, target)),
            OutputFmt::Json => println!("{}", cli::format_json(&result)),
        },
        Err(e) => {
            eprintln!("Scan failed: {e}");
            std::process::exit(1);
        }
    }
}
