//! Search configured probes by interface, VID/PID, serial, or name.
//!
//! Exit codes: 0 when at least one probe matches, 1 when none do, 2 on
//! invalid arguments.

use clap::Parser;
use probe_hub::config::{normalize_usb_id, HubConfig};
use probe_hub::inventory::{search_probes, SearchQuery};
use std::path::PathBuf;
use std::process::ExitCode;

/// Search for debug probes
#[derive(Parser, Debug)]
#[command(name = "probe-finder", version)]
struct Args {
    /// Path to the hardware/target catalog
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Interface type (jlink, cmsis-dap, wch-link, ...)
    #[arg(short, long)]
    interface: Option<String>,

    /// USB vendor id, hex
    #[arg(short, long)]
    vid: Option<String>,

    /// USB product id, hex
    #[arg(short, long)]
    pid: Option<String>,

    /// Serial number
    #[arg(short, long)]
    serial: Option<String>,

    /// Probe name (case-insensitive substring)
    #[arg(short, long)]
    name: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    for (flag, value) in [("--vid", &args.vid), ("--pid", &args.pid)] {
        if let Some(v) = value {
            let normalized = normalize_usb_id(v);
            if normalized.is_empty()
                || normalized.len() > 4
                || !normalized.chars().all(|c| c.is_ascii_hexdigit())
            {
                eprintln!("error: {flag} '{v}' is not a hex USB id");
                return ExitCode::from(2);
            }
        }
    }

    let config = match HubConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let query = SearchQuery {
        interface: args.interface,
        vid: args.vid,
        pid: args.pid,
        serial: args.serial,
        name: args.name,
    };
    let result = search_probes(&config.probes, &query);

    if args.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(2);
            }
        }
    } else {
        println!("Found {} probe(s):", result.count);
        println!();
        for probe in &result.matches {
            println!("ID: {}", probe.id);
            println!("Name: {}", probe.name);
            println!("Interface: {}", probe.interface);
            println!("VID:PID: {}:{}", probe.vendor_id, probe.product_id);
            if probe.serial.is_empty() {
                println!("Serial: N/A");
            } else {
                println!("Serial: {}", probe.serial);
            }
            println!();
        }
    }

    if result.count > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
