// Robot geometry, gait steps, servo routing and channel paths
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::motion::position::{Joint, LegId};

// Sleep between polls when no new command is pending
pub const IDLE_POLL: Duration = Duration::from_millis(100);

// Attempts per move before the whole command is dropped
pub const MOVE_ATTEMPTS: u32 = 5;

// Servo speed accepted by the pacing formula
pub const MAX_SPEED: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Link lengths of one leg, in cm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegDimensions {
    pub a: f64, // femur
    pub b: f64, // tibia
    pub d: f64, // coxa offset
}

impl Default for LegDimensions {
    fn default() -> Self {
        Self {
            a: 12.0,
            b: 14.5,
            d: 0.0,
        }
    }
}

/// Neutral stance in leg-local coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stance {
    pub horizontal_x: f64,
    pub horizontal_y: f64,
    pub vertical: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub middle_leg_offset: f64,
    pub leg_up: f64,
}

impl Default for Stance {
    fn default() -> Self {
        Self {
            horizontal_x: 10.0,
            horizontal_y: 10.0,
            vertical: 10.0,
            x_offset: 0.0,
            y_offset: 0.0,
            middle_leg_offset: 3.0,
            leg_up: 9.0,
        }
    }
}

/// Leg mount points in the body frame (x forward, y towards legs 1-3)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyGeometry {
    pub mounts: [[f64; 2]; 6],
}

impl Default for BodyGeometry {
    fn default() -> Self {
        Self {
            mounts: [
                [8.0, 5.0],
                [0.0, 6.0],
                [-8.0, 5.0],
                [-8.0, -5.0],
                [0.0, -6.0],
                [8.0, -5.0],
            ],
        }
    }
}

impl BodyGeometry {
    pub fn mount(&self, leg: LegId) -> [f64; 2] {
        self.mounts[leg.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub min: f64,
    pub max: f64,
}

impl Limit {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Servo-frame joint limits, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AngleLimits {
    pub tetta: Limit,
    pub alpha: Limit,
    pub beta: Limit,
    // Max coxa difference between neighbouring legs on one side
    pub tetta_spread: f64,
}

impl Default for AngleLimits {
    fn default() -> Self {
        Self {
            tetta: Limit::new(-90.0, 90.0),
            alpha: Limit::new(-70.0, 90.0),
            beta: Limit::new(-145.0, 0.0),
            tetta_spread: 45.0,
        }
    }
}

impl AngleLimits {
    pub fn for_joint(&self, joint: Joint) -> Limit {
        match joint {
            Joint::Tetta => self.tetta,
            Joint::Alpha => self.alpha,
            Joint::Beta => self.beta,
        }
    }
}

/// Step sizes used when expanding commands into moves
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveSteps {
    pub up_or_down_cm: f64,
    pub move_body_cm: f64,
    pub forward_body_1_leg_cm: f64,
    pub forward_body_2_leg_cm: f64,
    pub reposition_cm: f64,
    pub gait_step_cm: f64,
    pub turn_angle_deg: f64,
    pub body_shift_limit_cm: f64,
}

impl Default for MoveSteps {
    fn default() -> Self {
        Self {
            up_or_down_cm: 2.0,
            move_body_cm: 2.0,
            forward_body_1_leg_cm: 6.0,
            forward_body_2_leg_cm: 6.0,
            reposition_cm: 1.0,
            gait_step_cm: 9.0,
            turn_angle_deg: 20.0,
            body_shift_limit_cm: 6.0,
        }
    }
}

/// Footprint half-spacing of a stance mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeFootprints {
    pub run: Footprint,
    pub walking: Footprint,
    pub sentry: Footprint,
    pub battle: Footprint,
}

impl Default for ModeFootprints {
    fn default() -> Self {
        Self {
            run: Footprint { x: 9.0, y: 9.0 },
            walking: Footprint { x: 10.0, y: 10.0 },
            sentry: Footprint { x: 10.0, y: 10.0 },
            battle: Footprint { x: 10.0, y: 10.0 },
        }
    }
}

/// Touch-down and leveling parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackParams {
    pub touch_step_cm: f64,
    pub touch_attempts: u32,
    pub lift_height_cm: f64,
    // Deadband for pitch and roll, degrees
    pub balance_offset: f64,
    pub balance_step_cm: f64,
    pub max_leg_extension_cm: f64,
    pub read_attempts: u32,
    pub read_retry_ms: u64,
    pub touch_polls: u32,
    pub touch_poll_ms: u64,
}

impl Default for FeedbackParams {
    fn default() -> Self {
        Self {
            touch_step_cm: 4.0,
            touch_attempts: 3,
            lift_height_cm: 12.0,
            balance_offset: 1.5,
            balance_step_cm: 1.0,
            max_leg_extension_cm: 4.0,
            read_attempts: 3,
            read_retry_ms: 10,
            touch_polls: 50,
            touch_poll_ms: 30,
        }
    }
}

/// Servo speeds per move category (ms per 45 degrees of travel)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Speeds {
    pub default: u32,
    pub body: u32,
    pub touch: u32,
    pub balance: u32,
}

impl Default for Speeds {
    fn default() -> Self {
        Self {
            default: 500,
            body: 800,
            touch: 500,
            balance: 1000,
        }
    }
}

/// Servo ids, board routing and calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    // Per leg: [tetta, alpha, beta]
    pub ids: [[u8; 3]; 6],
    // Servo id -> board number
    pub boards: BTreeMap<u8, u8>,
    // Board number -> serial port
    pub ports: BTreeMap<u8, String>,
    // Raw position of each servo at 0 degrees
    pub neutral: BTreeMap<u8, u16>,
    pub baudrate: u32,
    pub timeout_ms: u64,
    pub reset_backoff_ms: u64,
    pub verify_targets: bool,
}

impl Default for ServoConfig {
    fn default() -> Self {
        let board_3 = [3u8, 4, 5, 8, 13, 14, 21, 22, 23];
        let board_4 = [2u8, 9, 10, 11, 12, 15, 16, 17, 20];
        let boards = board_3
            .iter()
            .map(|&id| (id, 3))
            .chain(board_4.iter().map(|&id| (id, 4)))
            .collect();

        let neutral = [
            (2, 480),
            (3, 435),
            (4, 610),
            (5, 500),
            (8, 280),
            (9, 480),
            (10, 550),
            (11, 500),
            (12, 330),
            (13, 305),
            (14, 570),
            (15, 470),
            (16, 560),
            (17, 500),
            (20, 250),
            (21, 480),
            (22, 560),
            (23, 500),
        ]
        .into_iter()
        .collect();

        Self {
            ids: [
                [11, 10, 9],
                [2, 20, 12],
                [17, 16, 15],
                [23, 22, 21],
                [13, 8, 14],
                [5, 4, 3],
            ],
            boards,
            ports: [(3, "/dev/ttyAMA3".to_string()), (4, "/dev/ttyAMA4".to_string())]
                .into_iter()
                .collect(),
            neutral,
            baudrate: 115_200,
            timeout_ms: 100,
            reset_backoff_ms: 2000,
            verify_targets: true,
        }
    }
}

impl ServoConfig {
    pub fn servo_id(&self, leg: LegId, joint: Joint) -> u8 {
        self.ids[leg.index()][joint.index()]
    }

    /// All 18 servo ids in leg/joint order
    pub fn all_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.ids.iter().flatten().copied()
    }
}

/// Files shared with the console and sensor processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelFiles {
    pub command: PathBuf,
    pub contact: PathBuf,
    pub orientation: PathBuf,
}

impl Default for ChannelFiles {
    fn default() -> Self {
        Self {
            command: PathBuf::from("wrk/movement_command.txt"),
            contact: PathBuf::from("wrk/foot_contact.txt"),
            orientation: PathBuf::from("wrk/orientation.txt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub leg: LegDimensions,
    pub stance: Stance,
    pub body: BodyGeometry,
    pub limits: AngleLimits,
    pub moves: MoveSteps,
    pub modes: ModeFootprints,
    pub feedback: FeedbackParams,
    pub speed: Speeds,
    pub servos: ServoConfig,
    pub files: ChannelFiles,
}

impl RobotConfig {
    /// Load a JSON config; missing sections keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leg.a <= 0.0 || self.leg.b <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "link lengths must be positive (a={}, b={})",
                self.leg.a, self.leg.b
            )));
        }

        for id in self.servos.all_ids() {
            let board = self.servos.boards.get(&id).ok_or_else(|| {
                ConfigError::Invalid(format!("servo {} is not routed to a board", id))
            })?;
            if !self.servos.ports.contains_key(board) {
                return Err(ConfigError::Invalid(format!(
                    "board {} (servo {}) has no serial port",
                    board, id
                )));
            }
            if !self.servos.neutral.contains_key(&id) {
                return Err(ConfigError::Invalid(format!(
                    "servo {} has no neutral position",
                    id
                )));
            }
        }

        if self.speed.default > MAX_SPEED {
            return Err(ConfigError::Invalid(format!(
                "default speed {} above {}",
                self.speed.default, MAX_SPEED
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RobotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.servos.all_ids().count(), 18);
    }

    #[test]
    fn test_servo_lookup() {
        let servos = ServoConfig::default();
        assert_eq!(servos.servo_id(LegId::FrontRight, Joint::Tetta), 11);
        assert_eq!(servos.servo_id(LegId::MiddleRight, Joint::Alpha), 20);
        assert_eq!(servos.servo_id(LegId::FrontLeft, Joint::Beta), 3);
        assert_eq!(servos.boards[&20], 4);
        assert_eq!(servos.boards[&23], 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "leg": { "a": 11.0, "b": 15.0, "d": 0.5 }, "moves": { "up_or_down_cm": 3.0 } }"#;
        let config: RobotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.leg.a, 11.0);
        assert_eq!(config.moves.up_or_down_cm, 3.0);
        assert_eq!(config.moves.reposition_cm, 1.0);
        assert_eq!(config.stance, Stance::default());
    }

    #[test]
    fn test_load_missing_file() {
        let result = RobotConfig::load(Path::new("/nonexistent/scarab.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_unrouted_servo_rejected() {
        let mut config = RobotConfig::default();
        config.servos.boards.remove(&11);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
