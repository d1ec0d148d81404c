// Motor test: Careful, step-by-step test for motor control
//
// IMPORTANT: Run motor_diagnostic FIRST to verify read-only communication.
//
// Usage: cargo run --example motor_test -- [port]
// Example: cargo run --example motor_test -- /dev/ttyUSB0
//
// Safety features:
// - Explicit confirmation before any writes
// - Starts with zero velocity
// - Very slow test speeds
// - Every motor is emergency-stopped on exit

use ddsm_motor_runtime::MotorController;
use ddsm_motor_runtime::config::{DEFAULT_PORT, SCAN_END, SCAN_START};
use ddsm_motor_runtime::motor::Variant;
use std::io::{self, Write};
use std::thread::sleep;
use std::time::Duration;

const TEST_RPM: f32 = 10.0;
const TEST_DURATION: Duration = Duration::from_secs(1);
const PAUSE: Duration = Duration::from_millis(500);

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Get port from args or use default
    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               DDSM Motor Test (WITH WRITES)                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  ⚠  This tool WILL write to motors and cause movement!       ║");
    println!("║  ⚠  Make sure the wheels can spin freely before proceeding!  ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {}", port);
    println!();

    if !confirm("Have you run motor_diagnostic first and verified the motors respond?")? {
        println!(
            "Please run: cargo run --example motor_diagnostic -- {}",
            port
        );
        return Ok(());
    }

    if !confirm("Are the wheels OFF THE GROUND and free to spin?")? {
        println!("Please lift the wheels so they can spin without moving anything.");
        return Ok(());
    }

    println!();
    println!("Connecting (auto-detecting firmware)...");
    let controller = MotorController::serial(&port);
    controller.on_error(|msg| println!("  ! {}", msg));
    if !controller.connect() {
        println!("✗ No DDSM115 or DDSM210 found on {}", port);
        return Ok(());
    }
    let variant = controller.variant();
    println!("✓ Connected: {:?}", variant);
    println!();

    // ========== STEP 1: Find motors ==========
    println!("Step 1: Scanning for motors...");
    let motors = controller.scan(SCAN_START, SCAN_END);
    if motors.is_empty() {
        println!("  ✗ No motors answered - aborting");
        controller.shutdown();
        return Ok(());
    }
    println!("  ✓ Motors: {:?}", motors);
    println!();

    // ========== STEP 2: Zero velocity ==========
    println!("Step 2: Sending ZERO velocity to all motors...");
    println!("  This switches to velocity mode but should NOT cause movement.");
    println!();

    if !confirm("Send zero velocity command?")? {
        controller.shutdown();
        return Ok(());
    }
    for &id in &motors {
        controller.set_velocity(id, 0.0, None);
    }
    sleep(PAUSE);
    for &id in &motors {
        match controller.request_feedback(id, None) {
            Some(f) => println!("    Motor {} velocity: {:.0} rpm (should be ~0)", id, f.velocity),
            None => println!("    Motor {}: no feedback", id),
        }
    }
    println!();

    // ========== STEP 3: Slow velocity test ==========
    println!("Step 3: Slow velocity test");
    println!("  Speed: {} rpm, {:?} per direction", TEST_RPM, TEST_DURATION);
    println!();
    println!("  ⚠  WATCH THE WHEELS - they should spin slowly!");
    println!();

    if !confirm("Proceed with motion test?")? {
        controller.shutdown();
        return Ok(());
    }

    for &id in &motors {
        for (name, rpm) in [("Forward", TEST_RPM), ("Reverse", -TEST_RPM)] {
            println!("  Motor {}: {}...", id, name);
            controller.set_velocity(id, rpm, None);
            sleep(TEST_DURATION);
            if let Some(f) = controller.get_last_feedback(id) {
                println!(
                    "    velocity={:.0} rpm current={:.2} A temp={} °C",
                    f.velocity, f.torque, f.temperature
                );
            }

            // Stop between tests
            controller.stop(id, None);
            sleep(PAUSE);
        }
    }
    println!();

    // ========== STEP 4: Position test (DDSM115 only) ==========
    if variant == Some(Variant::Ddsm115)
        && confirm("Run position test (90° then 180°)?")?
    {
        println!("Step 4: Position test");
        for &id in &motors {
            for degrees in [90.0, 180.0] {
                println!("  Motor {} -> {}°", id, degrees);
                controller.set_position(id, degrees, None);
                sleep(TEST_DURATION);
                if let Some(f) = controller.request_feedback(id, None) {
                    println!("    position={:.1}°", f.position);
                }
            }
        }
        println!();
    }

    // ========== FINAL: Stop and cleanup ==========
    println!("Step 5: Stopping motors...");
    let stats = controller.get_stats();
    controller.shutdown();
    println!("  ✓ Motors stopped");

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Test Complete!                            ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "Commands: {} ok, {} failed, {} coalesced ({:.1}% success)",
        stats.processed, stats.failed, stats.dropped, stats.success_rate
    );
    println!("If the wheels moved as expected, the motor control is working correctly.");
    println!("You can now try the full runtime with: cargo run -- --port {}", port);

    Ok(())
}
