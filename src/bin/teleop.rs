// Keyboard teleop over the bridge socket: W/S drive, A/D turn, R/F speed,
// space stop, Q quit
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{info, warn};

use zip_robot_runtime::bridge::messages::{ClientMessage, ServerMessage};
use zip_robot_runtime::config::DEFAULT_SOCKET_ADDR;

const SPEEDS: [i32; 3] = [80, 150, 220]; // forward PWM
const TURN_SPEEDS: [i32; 3] = [60, 110, 160]; // yaw PWM
const INPUT_TIMEOUT_MS: u64 = 100; // Zero velocities after this much time with no input

#[derive(Parser, Debug)]
#[command(about = "Keyboard teleop for the ZIP bridge")]
struct Args {
    /// Bridge socket address
    #[arg(short, long, default_value = DEFAULT_SOCKET_ADDR)]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    info!("Connecting to bridge at {}...", args.addr);
    let stream = TcpStream::connect(&args.addr).await?;
    let (reader, mut writer) = stream.into_split();

    // Only failed requests are worth showing
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<ServerMessage>(&line) {
                Ok(ServerMessage::Ack {
                    id,
                    ok: false,
                    error,
                })
                | Ok(ServerMessage::Reply {
                    id,
                    ok: false,
                    error,
                    ..
                }) => {
                    let reason = error.as_deref().unwrap_or("refused");
                    warn!("Request {} failed: {}", id, reason);
                }
                Ok(ServerMessage::Error { message }) => warn!("Bridge: {}", message),
                Ok(_) => {}
                Err(e) => warn!("Unreadable bridge line: {}", e),
            }
        }
    });

    info!("Controls: WS=drive, AD=turn, R/F=speed, SPACE=stop, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&mut writer).await;
    disable_raw_mode()?;

    // Always leave the robot stopped
    send(&mut writer, ClientMessage::StreamStop { id: "quit".into() }).await?;
    result
}

async fn send(
    writer: &mut OwnedWriteHalf,
    msg: ClientMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut line = serde_json::to_string(&msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn run_teleop(
    writer: &mut OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut v = 0;
    let mut w = 0;
    let mut sent = (0, 0);
    let mut streaming = false;
    let mut last_movement_input = Instant::now();
    let mut next_id: u32 = 0;

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        v = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        v = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        w = TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        w = -TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // Hard stop, bypasses the stream
                    KeyCode::Char(' ') if pressed => {
                        next_id += 1;
                        let id = format!("t{}", next_id);
                        send(writer, ClientMessage::StreamStop { id }).await?;
                        streaming = false;
                        v = 0;
                        w = 0;
                        sent = (0, 0);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            v = 0;
            w = 0;
        }

        // The bridge keeps re-sending; only changes go over the socket
        if (v, w) != sent {
            next_id += 1;
            let id = format!("t{}", next_id);
            let msg = if streaming {
                ClientMessage::StreamUpdate { id, v, w }
            } else {
                streaming = true;
                ClientMessage::StreamStart {
                    id,
                    v,
                    w,
                    rate_hz: None,
                    ttl_ms: None,
                }
            };
            send(writer, msg).await?;
            sent = (v, w);
        }
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
