use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ddsm_motor_runtime::config::{
    ControllerConfig, DEFAULT_BAUDRATE, DEFAULT_PORT, SCAN_END, SCAN_START,
};
use ddsm_motor_runtime::motor::{Connector, SerialConnector, SimBus, VariantPreference};
use ddsm_motor_runtime::{ControllerRegistry, MotorController, runtime};

/// Bridge DDSM115/DDSM210 motors on a serial bus to zenoh
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port of the RS485 adapter
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    #[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// Motor firmware; auto tries both
    #[arg(long, value_enum, default_value_t = VariantPreference::Auto)]
    variant: VariantPreference,

    /// First id to scan
    #[arg(long, default_value_t = SCAN_START)]
    scan_start: u8,

    /// Last id to scan
    #[arg(long, default_value_t = SCAN_END)]
    scan_end: u8,

    /// Run against simulated DDSM115 motors at these ids instead of a port
    #[arg(long, value_delimiter = ',')]
    simulate: Option<Vec<u8>>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let connector: Arc<dyn Connector> = match &args.simulate {
        Some(ids) => {
            info!("Simulating DDSM115 motors {:?}", ids);
            SimBus::ddsm115(ids).connector(&args.port)
        }
        None => Arc::new(SerialConnector::with_baudrate(&args.port, args.baud)),
    };
    let config = ControllerConfig {
        variant: args.variant,
        ..Default::default()
    };

    let registry = ControllerRegistry::new();
    let controller = MotorController::with_registry(connector, config, &registry);

    if !controller.connect() {
        error!("No motors found on {}", args.port);
        std::process::exit(1);
    }
    let found = controller.scan(args.scan_start, args.scan_end);
    info!(
        "{:?} on {}: motors {:?}",
        controller.variant(),
        args.port,
        found
    );

    tokio::select! {
        result = runtime::run(Arc::clone(&controller)) => {
            if let Err(e) = result {
                eprintln!("Runtime error: {}", e);
                registry.shutdown_all();
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping motors");
            registry.shutdown_all();
        }
    }
}
