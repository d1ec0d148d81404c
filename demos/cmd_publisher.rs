// Keyboard teleop: W/S spin, SPACE stop, 1-9 select motor, R/F speed, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use ddsm_motor_runtime::config::TOPIC_CMD;
use ddsm_motor_runtime::messages::MotorCommand;
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f32; 3] = [10.0, 40.0, 100.0]; // rpm
const INPUT_TIMEOUT_MS: u64 = 100; // Reset velocity after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Controls: W/S=spin, SPACE=stop, 1-9=motor, R/F=speed, Q=quit");
    info!("Motor 1, speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn publish(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &MotorCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut motor_id: u8 = 1;

    // Persistent velocity state
    let mut rpm = 0.0;
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    // Movement - update velocity and refresh timestamp
                    KeyCode::Char('w') if pressed => {
                        rpm = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        rpm = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    // Immediate stop, out of band on the runtime side
                    KeyCode::Char(' ') if pressed => {
                        rpm = 0.0;
                        publish(publisher, &MotorCommand::Stop { id: motor_id }).await?;
                    }

                    // Motor selection
                    KeyCode::Char(c @ '1'..='9') if pressed => {
                        publish(publisher, &MotorCommand::Stop { id: motor_id }).await?;
                        motor_id = c as u8 - b'0';
                        rpm = 0.0;
                        info!("Motor {}", motor_id);
                    }

                    // Speed control
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => {
                        publish(publisher, &MotorCommand::Stop { id: motor_id }).await?;
                        break;
                    }

                    _ => {}
                }
            }
        }

        // Reset velocity if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            rpm = 0.0;
        }

        // Always publish at ~50Hz
        let cmd = MotorCommand::SetVelocity { id: motor_id, rpm };
        publish(publisher, &cmd).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {} ({} rpm)", label, SPEEDS[idx]);
}
