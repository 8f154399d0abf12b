// Keyboard jog: A/D run reverse/forward while held, SPACE stop, H home,
// Z zero position, G go to mark, R/F speed, E e-stop, Q quit
//
// Usage: cargo run --example jog -- [target]
// With a target index the requests are relayed down the chain by the master.

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use stepper_chain_runtime::command::{Command, LIVE};
use stepper_chain_runtime::config::TOPIC_CMD;
use stepper_chain_runtime::messages::{Envelope, Request};
use stepper_chain_runtime::motor::Direction;

const SPEEDS: [f32; 3] = [100.0, 800.0, 4000.0]; // steps/s
const INPUT_TIMEOUT_MS: u64 = 150; // Stop after this much time with no jog key

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let target = std::env::args().nth(1).map(|t| t.parse::<u8>()).transpose()?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Controls: A/D=jog, SPACE=stop, H=home, Z=zero, G=go mark, R/F=speed, E=e-stop, Q=quit");
    info!("Speed: {} steps/s", SPEEDS[0]);

    enable_raw_mode()?;
    let result = run_jog(&publisher, target).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    seq: &mut u64,
    request: Request,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    *seq += 1;
    let envelope = Envelope {
        seq: Some(*seq),
        request,
    };
    publisher.put(serde_json::to_string(&envelope)?).await?;
    Ok(())
}

fn command(target: Option<u8>, command: Command) -> Request {
    Request::Command {
        target,
        queue: LIVE,
        command,
    }
}

async fn run_jog(
    publisher: &zenoh::pubsub::Publisher<'_>,
    target: Option<u8>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut seq = 0u64;

    // Direction currently jogging, if any
    let mut jogging: Option<Direction> = None;
    let mut last_jog_input = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('a') | KeyCode::Char('d') if pressed => {
                        let dir = if code == KeyCode::Char('a') {
                            Direction::Reverse
                        } else {
                            Direction::Forward
                        };
                        if jogging != Some(dir) {
                            let run = Command::Run {
                                dir,
                                steps_per_sec: SPEEDS[speed_idx],
                            };
                            send(publisher, &mut seq, command(target, run)).await?;
                            jogging = Some(dir);
                        }
                        last_jog_input = Instant::now();
                    }

                    KeyCode::Char(' ') if pressed => {
                        let stop = Command::Stop {
                            hiz: false,
                            soft: true,
                        };
                        send(publisher, &mut seq, command(target, stop)).await?;
                        jogging = None;
                    }

                    KeyCode::Char('h') if pressed => {
                        send(publisher, &mut seq, command(target, Command::GoHome)).await?;
                    }
                    KeyCode::Char('z') if pressed => {
                        // Zero wherever the motor stands once it has stopped
                        send(publisher, &mut seq, command(target, Command::WaitStopped)).await?;
                        send(publisher, &mut seq, command(target, Command::ResetPosition)).await?;
                    }
                    KeyCode::Char('g') if pressed => {
                        send(publisher, &mut seq, command(target, Command::GoMark)).await?;
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(SPEEDS.len() - 1);
                        info!("Speed: {} steps/s", SPEEDS[speed_idx]);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        info!("Speed: {} steps/s", SPEEDS[speed_idx]);
                    }

                    KeyCode::Char('e') if pressed => {
                        let estop = Request::Estop {
                            target,
                            hiz: true,
                            soft: false,
                        };
                        send(publisher, &mut seq, estop).await?;
                        jogging = None;
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        // Released: soft stop once the key repeat has gone quiet
        if jogging.is_some() && last_jog_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            let stop = Command::Stop {
                hiz: false,
                soft: true,
            };
            send(publisher, &mut seq, command(target, stop)).await?;
            jogging = None;
        }
    }

    Ok(())
}
