//! CLI tool for silicore

#[cfg(feature = "cli")]
use clap::{Parser, ValueEnum};
#[cfg(feature = "cli")]
use silicore::{Computer, Config, Hardware, HardwareSnapshot, Platform, SimulatedBus};
#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::time::Duration;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "silicore")]
#[command(about = "Register-level CPU, mainboard, GPU and drive sensor readout", long_about = None)]
#[command(version)]
struct Cli {
    /// Update interval in milliseconds (defaults to the configured interval)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Number of update passes before printing
    #[arg(short, long, default_value_t = 2)]
    passes: u32,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Configuration file (defaults to ~/.config/silicore/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the diagnostic report instead of the sensor tree
    #[arg(short, long)]
    report: bool,

    /// Run against an empty simulated bus instead of the hardware
    #[arg(long)]
    simulate: bool,
}

#[cfg(feature = "cli")]
fn print_tree(hw: &dyn Hardware, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{} ({})", indent, hw.name(), hw.identifier());
    for sensor in hw.sensors().iter().filter(|s| s.is_active() && !s.is_hidden()) {
        let value = sensor
            .value()
            .map(|v| format!("{:.2} {}", v, sensor.sensor_type().unit()))
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {:<32} {:>16}", indent, sensor.name(), value);
    }
    for sub in hw.sub_hardware() {
        print_tree(sub, depth + 1);
    }
}

#[cfg(feature = "cli")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let interval = cli
        .interval
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.update_interval());

    let platform = if cli.simulate {
        Platform::simulated(SimulatedBus::new(), &config)
    } else {
        Platform::native(&config)
    };
    let mut computer = Computer::new(config, platform);
    computer.open();

    for pass in 0..cli.passes.max(1) {
        if pass > 0 {
            std::thread::sleep(interval);
        }
        computer.update();
    }

    if cli.report {
        println!("{}", computer.report());
    } else {
        match cli.format {
            Format::Json => {
                let snapshot: Vec<HardwareSnapshot> = computer.snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            Format::Text => {
                for hw in computer.hardware() {
                    print_tree(hw, 0);
                }
            }
        }
    }

    computer.close()?;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI features not enabled. Please compile with --features cli");
    std::process::exit(1);
}
