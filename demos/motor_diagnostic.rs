// Motor diagnostic: READ-ONLY check of the motor bus
//
// Sends only feedback requests (DDSM115) or the id query (DDSM210); nothing
// here changes a motor's mode, id or speed. Use this first before motor_test.
//
// Usage: cargo run --example motor_diagnostic -- [port] [ddsm115|ddsm210]
// Example: cargo run --example motor_diagnostic -- /dev/ttyUSB0

use ddsm_motor_runtime::config::{
    DEFAULT_PORT, DriverConfig, FEEDBACK_READ_TIMEOUT, SCAN_END, SCAN_START,
};
use ddsm_motor_runtime::motor::protocol::ddsm210;
use ddsm_motor_runtime::motor::{Connector, Ddsm115, MotorDriver, SerialConnector};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| DEFAULT_PORT.to_string());
    let variant = args.next().unwrap_or_else(|| "ddsm115".to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             DDSM Motor Diagnostic (READ-ONLY)                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only QUERIES motors - no mode changes, no motion  ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {}", port);
    println!("Firmware:    {}", variant);
    println!();

    let connector = Arc::new(SerialConnector::new(&port));

    println!("Step 1: Opening serial port...");
    if variant.eq_ignore_ascii_case("ddsm210") {
        return query_ddsm210(connector.as_ref());
    }

    let mut driver = Ddsm115::new(connector, DriverConfig::default());
    if !driver.connect() {
        println!("  ✗ Failed to open serial port");
        for message in driver.take_diagnostics() {
            println!("    {}", message);
        }
        println!();
        println!("Troubleshooting:");
        println!("  - Check the port path is correct");
        println!("  - Verify the RS485 adapter is plugged in");
        println!("  - On Linux, add yourself to the dialout group");
        return Ok(());
    }
    println!("  ✓ Serial port opened successfully");
    println!();

    println!("Step 2: Scanning ids {}..={}...", SCAN_START, SCAN_END);
    let found = driver.scan(SCAN_START..=SCAN_END);
    if found.is_empty() {
        println!("  ✗ No DDSM115 answered");
        println!("  - Check motor power supply and A/B wiring");
        println!("  - A DDSM210 needs: motor_diagnostic -- {} ddsm210", port);
        return Ok(());
    }
    println!("  ✓ Motors found: {:?}", found);
    println!();

    println!("Step 3: Reading motor feedback...");
    println!();
    for &id in &found {
        println!("  === Motor {} ===", id);
        match driver.request_feedback(id) {
            Some(feedback) => {
                match feedback.mode {
                    Some(mode) => println!("    Mode:        {:?}", mode),
                    None => println!("    Mode:        unknown (0x{:02X})", feedback.raw[1]),
                }
                println!("    Velocity:    {:.0} rpm", feedback.velocity);
                println!("    Position:    {:.1}°", feedback.position);
                println!("    Current:     {:.2} A", feedback.torque);
                println!("    Temperature: {} °C", feedback.temperature);
                println!("    Error code:  0x{:02X}", feedback.error_code);
                println!("    Raw:         {:02X?}", feedback.raw);
            }
            None => println!("    ✗ No reply"),
        }
        println!();
    }
    driver.disconnect();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Velocity should be 0 or near 0 when the motors are stationary.");
    println!("Error code 0x00 means no fault.");
    println!();
    println!("Next step: Run 'cargo run --example motor_test' with the motors free to spin");

    Ok(())
}

fn query_ddsm210(connector: &dyn Connector) -> Result<(), Box<dyn std::error::Error>> {
    let mut link = connector.open()?;
    println!("  ✓ Serial port opened successfully");
    println!();

    println!("Step 2: Sending DDSM210 id query...");
    link.clear_input()?;
    link.write_frame(&ddsm210::id_query_frame())?;
    match link.read_frame(FEEDBACK_READ_TIMEOUT) {
        Ok(reply) => {
            println!("  ✓ DDSM210 answered: {:02X?}", reply);
            if let Some(mode) = ddsm210::reply_mode(&reply) {
                println!("    Mode: {:?}", mode);
            }
        }
        Err(e) => println!("  ✗ No reply: {}", e),
    }
    Ok(())
}
