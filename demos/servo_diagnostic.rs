// Servo diagnostic: READ-ONLY status sweep over all leg servos
//
// This tool does NOT move anything: no position, torque or LED writes.
// Run it before the runtime to confirm every board and servo answers.
//
// Usage: cargo run --example servo_diagnostic -- [config.json]

use std::io::{self, Write};
use std::path::PathBuf;

use scarab_runtime::config::RobotConfig;
use scarab_runtime::servo::ServoDriver;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => RobotConfig::load(&path)?,
        None => RobotConfig::default(),
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           Scarab Servo Diagnostic (READ-ONLY)                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only READS from servos - no writes, no movement   ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    for (board, port) in &config.servos.ports {
        println!("Board {}: {} @ {} baud", board, port, config.servos.baudrate);
    }
    println!();

    println!("Step 1: Opening servo boards...");
    let mut driver = match ServoDriver::open(&config) {
        Ok(driver) => {
            println!("  ✓ All serial ports opened");
            driver
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port paths in the config");
            println!("  - Verify the boards are powered and the USB cables connected");
            println!("  - On Linux, check the user is in the dialout group");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading servo status...");
    println!();
    println!("   ID | Board |  Pos |   Angle | Target | Rate ms | Temp |  Vin mV");
    println!("  ----+-------+------+---------+--------+---------+------+--------");

    let mut missing = Vec::new();
    for id in driver.servo_ids() {
        let board = config.servos.boards.get(&id).copied().unwrap_or_default();
        print!("  {:>3} | {:>5} | ", id, board);
        io::stdout().flush()?;

        match driver.read_status(id) {
            Ok(status) => println!(
                "{:>4} | {:>6.2}° | {:>6} | {:>7} | {:>3}° | {:>7}",
                status.position,
                status.angle,
                status.target,
                status.rate,
                status.temperature,
                status.voltage
            ),
            Err(e) => {
                println!("✗ ERROR: {}", e);
                missing.push(id);
            }
        }
    }
    println!();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    if missing.is_empty() {
        println!("All servos responded.");
        println!("  1. Angles near 0° mean the neutral table matches the mounted horns");
        println!("  2. Vin below ~6500 mV means the battery needs charging");
        println!("  3. Temperatures above 60° call for a rest before walking");
    } else {
        println!("⚠ WARNING: No answer from servos {:?}", missing);
        println!("  - Check the servo power supply");
        println!("  - Verify the ids and boards table in the config");
        println!("  - Check the daisy-chain wiring");
    }
    println!();
    println!("Next step: Run 'cargo run -- --dry-run' before driving the servos");

    Ok(())
}
