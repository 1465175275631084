use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zip_robot_runtime::bridge::link::LinkSource;
use zip_robot_runtime::bridge::{Bridge, BridgeConfig};
use zip_robot_runtime::config::{
    DEFAULT_BOOT_TIMEOUT_MS, DEFAULT_HEALTH_ADDR, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SERIAL_PORT, DEFAULT_SOCKET_ADDR, DEFAULT_STREAM_RATE_HZ, DEFAULT_STREAM_TTL_MS,
    RECONNECT_DELAY_MS, SERIAL_BAUD,
};

/// Serial bridge for the ZIP robot
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port of the robot
    #[arg(short, long, default_value = DEFAULT_SERIAL_PORT)]
    port: String,

    #[arg(short, long, default_value_t = SERIAL_BAUD)]
    baud: u32,

    /// Address for socket clients
    #[arg(short, long, default_value = DEFAULT_SOCKET_ADDR)]
    listen: String,

    /// Address for the HTTP health endpoint
    #[arg(long, default_value = DEFAULT_HEALTH_ADDR)]
    health: String,

    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    request_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_BOOT_TIMEOUT_MS)]
    boot_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_STREAM_RATE_HZ)]
    stream_rate_hz: u32,

    #[arg(long, default_value_t = DEFAULT_STREAM_TTL_MS)]
    stream_ttl_ms: u32,

    /// Republish device lines and status over Zenoh
    #[arg(long)]
    zenoh: bool,

    /// Run against an in-process simulated device instead of a serial port
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let bridge = Bridge::new(BridgeConfig {
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        boot_timeout: Duration::from_millis(args.boot_timeout_ms),
        reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
        stream_rate_hz: args.stream_rate_hz,
        stream_ttl_ms: args.stream_ttl_ms,
    });
    let source = if args.simulate {
        LinkSource::Simulated
    } else {
        LinkSource::Serial {
            path: args.port.clone(),
            baud: args.baud,
        }
    };
    info!("Bridge starting: {}", source);

    let telemetry = {
        let bridge = bridge.clone();
        let enabled = args.zenoh;
        async move {
            if enabled {
                bridge.publish_telemetry().await
            } else {
                std::future::pending().await
            }
        }
    };

    let result = tokio::select! {
        _ = bridge.run(source) => Ok(()),
        r = bridge.serve(&args.listen) => r,
        r = bridge.serve_health(&args.health) => r,
        r = telemetry => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    // Leave the robot stopped whatever ended the bridge
    bridge.shutdown().await;
    if let Err(e) = result {
        error!("Bridge error: {}", e);
        std::process::exit(1);
    }
    info!("Bridge stopped");
}
