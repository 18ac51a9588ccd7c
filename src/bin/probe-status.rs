//! Report connection status of every configured probe.

use clap::Parser;
use probe_hub::config::HubConfig;
use probe_hub::inventory;
use std::path::PathBuf;
use std::process::ExitCode;

/// Probe connection status reporter
#[derive(Parser, Debug)]
#[command(name = "probe-status", version)]
struct Args {
    /// Path to the hardware/target catalog
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match HubConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };

    let devices = inventory::scan();
    let status = inventory::all_probe_status(&config.probes, &devices);

    match serde_json::to_string_pretty(&status) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
