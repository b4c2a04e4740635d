// Keyboard teleop: writes movement commands into the runtime's command file
//
// WASD walk, Q/E turn, R/F body up/down, IJKL body shift, C center,
// 1-4 stance mode, T touch, B balance, Space reset, X torque off,
// +/- speed, Esc quit (sends exit)
//
// Usage: cargo run --example teleop -- [command file]
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

use scarab_runtime::config::RobotConfig;
use scarab_runtime::motion::sequencer::Command;

const SPEEDS: [u32; 3] = [1000, 500, 250]; // ms per 45° of joint travel
const SPEED_LABELS: [&str; 3] = ["LOW", "MED", "HIGH"];
const INPUT_TIMEOUT_MS: u64 = 300; // Stop continuous commands after this much time with no input

struct CommandWriter {
    path: PathBuf,
    next_id: u64,
}

impl CommandWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, next_id: 1 }
    }

    /// Replace the command file with a single fresh record
    fn send(&mut self, command: &str, speed: u32) -> std::io::Result<()> {
        let line = format!("{},{},{}\n", self.next_id, command, speed);
        write_atomic(&self.path, &line)?;
        info!("#{} {} @ {}", self.next_id, command, speed);
        self.next_id += 1;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

fn key_command(code: KeyCode) -> Option<&'static str> {
    let command = match code {
        KeyCode::Char('w') => "forward_two_legged",
        KeyCode::Char('s') => "backward_two_legged",
        KeyCode::Char('a') => "strafe_left_two_legged",
        KeyCode::Char('d') => "strafe_right_two_legged",
        KeyCode::Char('q') => "turn_left_two_legged",
        KeyCode::Char('e') => "turn_right_two_legged",
        KeyCode::Char('r') => "up",
        KeyCode::Char('f') => "down",
        KeyCode::Char('i') => "body_forward",
        KeyCode::Char('k') => "body_backward",
        KeyCode::Char('j') => "body_left",
        KeyCode::Char('l') => "body_right",
        KeyCode::Char('c') => "body_to_center",
        KeyCode::Char('1') => "run_mode",
        KeyCode::Char('2') => "walking_mode",
        KeyCode::Char('3') => "sentry_mode",
        KeyCode::Char('4') => "battle_mode",
        KeyCode::Char('t') => "touch",
        KeyCode::Char('b') => "balance",
        KeyCode::Char(' ') => "reset",
        KeyCode::Char('x') => "disable_torque",
        _ => return None,
    };
    Some(command)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| RobotConfig::default().files.command);

    info!("Writing commands to {}", path.display());
    info!("Controls: WASD=walk, Q/E=turn, R/F=up/down, IJKL=body, 1-4=mode, +/-=speed, Esc=quit");
    info!("Speed: {}", SPEED_LABELS[0]);

    let mut writer = CommandWriter::new(path);
    writer.send("none", SPEEDS[0])?;

    enable_raw_mode()?;
    let result = run_teleop(&mut writer);
    disable_raw_mode()?;

    result
}

fn run_teleop(writer: &mut CommandWriter) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut active: Option<&'static str> = None;
    let mut last_movement_input = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Esc if pressed => {
                        writer.send("exit", SPEEDS[speed_idx])?;
                        break;
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') if pressed => {
                        speed_idx = (speed_idx + 1).min(SPEEDS.len() - 1);
                        info!("Speed: {}", SPEED_LABELS[speed_idx]);
                    }
                    KeyCode::Char('-') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        info!("Speed: {}", SPEED_LABELS[speed_idx]);
                    }
                    code if pressed => {
                        if let Some(name) = key_command(code) {
                            last_movement_input = Instant::now();
                            // Held keys keep the same record; the runtime repeats continuous commands
                            if active != Some(name) {
                                writer.send(name, SPEEDS[speed_idx])?;
                                let continuous = Command::parse(name).is_continuous();
                                active = continuous.then_some(name);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // Replace a continuous command with "none" once the key is released
        if active.is_some()
            && last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS)
        {
            writer.send("none", SPEEDS[speed_idx])?;
            active = None;
        }
    }

    Ok(())
}
