// Command sequencer
//
// Stage 1 (`expand`) turns a command into a list of moves and never looks at
// the robot. Stage 2 (`Replayer::replay`) runs one move on a scratch
// kinematics engine seeded with the last committed pose; only touch and
// balance moves read the sensors.

use std::f64::consts::FRAC_1_SQRT_2;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::geometry::Geometry;
use super::kinematics::{AbsTarget, Kinematics, MotionFault, WAVE_ORDER};
use super::position::{LegId, MoveType, ServoPosition, Snapshot, Tripod};
use crate::channels::FeedbackSource;
use crate::config::{Footprint, ModeFootprints, RobotConfig};
use crate::messages::Orientation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    StrafeLeft,
    StrafeRight,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Forward,
        Direction::Backward,
        Direction::StrafeLeft,
        Direction::StrafeRight,
    ];

    /// Unit vector in the body frame (x forward, y towards legs 1-3)
    pub fn unit(self) -> [f64; 2] {
        match self {
            Direction::Forward => [1.0, 0.0],
            Direction::Backward => [-1.0, 0.0],
            Direction::StrafeLeft => [0.0, -1.0],
            Direction::StrafeRight => [0.0, 1.0],
        }
    }

    fn walk_name(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::StrafeLeft => "strafe_left",
            Direction::StrafeRight => "strafe_right",
        }
    }

    fn body_name(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::StrafeLeft => "left",
            Direction::StrafeRight => "right",
        }
    }
}

/// Phases of the tripod walk. A walk starts with `Start`, alternates the
/// two strides and closes with the finish matching the last stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkPhase {
    Start,      // _1
    StrideOdd,  // _2
    StrideEven, // _3
    FinishOdd,  // _22
    FinishEven, // _32
}

impl WalkPhase {
    pub const ALL: [WalkPhase; 5] = [
        WalkPhase::Start,
        WalkPhase::StrideOdd,
        WalkPhase::StrideEven,
        WalkPhase::FinishOdd,
        WalkPhase::FinishEven,
    ];

    fn suffix(self) -> &'static str {
        match self {
            WalkPhase::Start => "1",
            WalkPhase::StrideOdd => "2",
            WalkPhase::StrideEven => "3",
            WalkPhase::FinishOdd => "22",
            WalkPhase::FinishEven => "32",
        }
    }

    /// Stepping tripod, leg stride and body stride (in strides)
    fn plan(self) -> (Tripod, f64, f64) {
        match self {
            WalkPhase::Start => (Tripod::Even, 1.0, 1.0),
            WalkPhase::StrideOdd => (Tripod::Odd, 2.0, 1.0),
            WalkPhase::StrideEven => (Tripod::Even, 2.0, 1.0),
            WalkPhase::FinishOdd => (Tripod::Odd, 1.0, 0.0),
            WalkPhase::FinishEven => (Tripod::Even, 1.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StanceMode {
    Run,
    Walking,
    Sentry,
    Battle,
}

impl StanceMode {
    pub const ALL: [StanceMode; 4] = [
        StanceMode::Run,
        StanceMode::Walking,
        StanceMode::Sentry,
        StanceMode::Battle,
    ];

    fn command_name(self) -> &'static str {
        match self {
            StanceMode::Run => "run_mode",
            StanceMode::Walking => "walking_mode",
            StanceMode::Sentry => "sentry_mode",
            StanceMode::Battle => "battle_mode",
        }
    }

    pub fn footprint(self, modes: &ModeFootprints) -> Footprint {
        match self {
            StanceMode::Run => modes.run,
            StanceMode::Walking => modes.walking,
            StanceMode::Sentry => modes.sentry,
            StanceMode::Battle => modes.battle,
        }
    }
}

/// Every command the runtime understands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Walk { direction: Direction, phase: WalkPhase },
    TwoLegged(Direction),
    Diagonal { forward: bool, side: Side },
    WaveGait,
    RippleGait,
    WaveGaitFeedback,
    ForwardFeedback,
    SwitchMode(StanceMode),
    BodyShift(Direction),
    BodyToCenter,
    Up,
    Down,
    Turn(Side),
    Reposition { axis: Axis, widen: bool },
    Reset,
    End,
    Balance,
    Touch,
    Idle,
    DisableTorque,
    Exit,
    Unknown(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        match name {
            "wave_gait" => Command::WaveGait,
            "ripple_gait" => Command::RippleGait,
            "wave_gait_feedback" => Command::WaveGaitFeedback,
            "forward_feedback" => Command::ForwardFeedback,
            "body_to_center" => Command::BodyToCenter,
            "up" => Command::Up,
            "down" => Command::Down,
            "turn_left_two_legged" => Command::Turn(Side::Left),
            "turn_right_two_legged" => Command::Turn(Side::Right),
            "reposition_x_up" => Command::Reposition { axis: Axis::X, widen: true },
            "reposition_x_down" => Command::Reposition { axis: Axis::X, widen: false },
            "reposition_y_up" => Command::Reposition { axis: Axis::Y, widen: true },
            "reposition_y_down" => Command::Reposition { axis: Axis::Y, widen: false },
            "diagonal_forward_left" => Command::Diagonal { forward: true, side: Side::Left },
            "diagonal_forward_right" => Command::Diagonal { forward: true, side: Side::Right },
            "diagonal_backward_left" => Command::Diagonal { forward: false, side: Side::Left },
            "diagonal_backward_right" => Command::Diagonal { forward: false, side: Side::Right },
            "reset" => Command::Reset,
            "end" => Command::End,
            "balance" => Command::Balance,
            "touch" => Command::Touch,
            "none" => Command::Idle,
            "disable_torque" => Command::DisableTorque,
            "exit" => Command::Exit,
            _ => Self::parse_family(name).unwrap_or_else(|| Command::Unknown(name.to_string())),
        }
    }

    fn parse_family(name: &str) -> Option<Self> {
        if let Some(mode) = StanceMode::ALL.into_iter().find(|m| m.command_name() == name) {
            return Some(Command::SwitchMode(mode));
        }
        if let Some(body) = name.strip_prefix("body_") {
            return Direction::ALL
                .into_iter()
                .find(|d| d.body_name() == body)
                .map(Command::BodyShift);
        }
        Direction::ALL.into_iter().find_map(|direction| {
            let rest = name.strip_prefix(direction.walk_name())?.strip_prefix('_')?;
            if rest == "two_legged" {
                return Some(Command::TwoLegged(direction));
            }
            WalkPhase::ALL
                .into_iter()
                .find(|phase| phase.suffix() == rest)
                .map(|phase| Command::Walk { direction, phase })
        })
    }

    /// Held commands that repeat every tick under the same id
    pub fn is_continuous(&self) -> bool {
        matches!(
            self,
            Command::TwoLegged(_)
                | Command::Turn(_)
                | Command::Up
                | Command::Down
                | Command::BodyShift(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Walk { direction, phase } => {
                write!(f, "{}_{}", direction.walk_name(), phase.suffix())
            }
            Command::TwoLegged(direction) => write!(f, "{}_two_legged", direction.walk_name()),
            Command::Diagonal { forward, side } => write!(
                f,
                "diagonal_{}_{}",
                if *forward { "forward" } else { "backward" },
                side.name()
            ),
            Command::WaveGait => f.write_str("wave_gait"),
            Command::RippleGait => f.write_str("ripple_gait"),
            Command::WaveGaitFeedback => f.write_str("wave_gait_feedback"),
            Command::ForwardFeedback => f.write_str("forward_feedback"),
            Command::SwitchMode(mode) => f.write_str(mode.command_name()),
            Command::BodyShift(direction) => write!(f, "body_{}", direction.body_name()),
            Command::BodyToCenter => f.write_str("body_to_center"),
            Command::Up => f.write_str("up"),
            Command::Down => f.write_str("down"),
            Command::Turn(side) => write!(f, "turn_{}_two_legged", side.name()),
            Command::Reposition { axis, widen } => write!(
                f,
                "reposition_{}_{}",
                match axis {
                    Axis::X => "x",
                    Axis::Y => "y",
                },
                if *widen { "up" } else { "down" }
            ),
            Command::Reset => f.write_str("reset"),
            Command::End => f.write_str("end"),
            Command::Balance => f.write_str("balance"),
            Command::Touch => f.write_str("touch"),
            Command::Idle => f.write_str("none"),
            Command::DisableTorque => f.write_str("disable_torque"),
            Command::Exit => f.write_str("exit"),
            Command::Unknown(name) => f.write_str(name),
        }
    }
}

/// One step of a command, replayed against a fresh engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Move {
    BodyMovement {
        delta: [f64; 3],
        // Skip the move if the body would end further than this from center
        #[serde(default)]
        limit: Option<f64>,
    },
    BodyToCenter,
    Endpoint {
        leg: LegId,
        delta: [f64; 3],
    },
    Endpoints {
        legs: Vec<LegId>,
        delta: [f64; 3],
    },
    EndpointAbsolute {
        leg: LegId,
        target: AbsTarget,
    },
    PhasedStep {
        group: Tripod,
        leg_delta: [f64; 2],
        body_delta: [f64; 2],
    },
    WaveGait,
    RippleGait,
    Turn {
        angle_deg: f64,
    },
    SwitchMode {
        mode: StanceMode,
    },
    Reposition {
        delta: [f64; 2],
    },
    Reset,
    End,
    Touch {
        legs: Vec<LegId>,
    },
    Balance,
}

impl Move {
    pub fn body(delta: [f64; 3]) -> Self {
        Move::BodyMovement { delta, limit: None }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Move::BodyMovement { .. } => "body_movement",
            Move::BodyToCenter => "body_to_center",
            Move::Endpoint { .. } => "endpoint",
            Move::Endpoints { .. } => "endpoints",
            Move::EndpointAbsolute { .. } => "endpoint_absolute",
            Move::PhasedStep { .. } => "phased_step",
            Move::WaveGait => "wave_gait",
            Move::RippleGait => "ripple_gait",
            Move::Turn { .. } => "turn",
            Move::SwitchMode { .. } => "switch_mode",
            Move::Reposition { .. } => "reposition",
            Move::Reset => "reset",
            Move::End => "end",
            Move::Touch { .. } => "touch",
            Move::Balance => "balance",
        }
    }

    /// Category of the snapshot committed when the move changes nothing
    fn hold_type(&self) -> MoveType {
        match self {
            Move::BodyMovement { .. } | Move::BodyToCenter | Move::Reset | Move::End => {
                MoveType::Body
            }
            Move::Touch { .. } => MoveType::Touch,
            Move::Balance => MoveType::Balance,
            _ => MoveType::Endpoint,
        }
    }
}

fn scaled(unit: [f64; 2], k: f64) -> [f64; 2] {
    [unit[0] * k, unit[1] * k]
}

/// Stage 1: command -> moves. Unknown commands expand to nothing.
pub fn expand(command: &Command, config: &RobotConfig) -> Vec<Move> {
    let steps = &config.moves;
    let stride = steps.forward_body_2_leg_cm;

    match command {
        Command::Walk { direction, phase } => {
            let (group, legs, body) = phase.plan();
            let unit = direction.unit();
            vec![Move::PhasedStep {
                group,
                leg_delta: scaled(unit, stride * legs),
                body_delta: scaled(unit, stride * body),
            }]
        }
        Command::TwoLegged(direction) => {
            let unit = direction.unit();
            [Tripod::Even, Tripod::Odd]
                .into_iter()
                .map(|group| Move::PhasedStep {
                    group,
                    leg_delta: scaled(unit, stride),
                    body_delta: scaled(unit, stride / 2.0),
                })
                .collect()
        }
        Command::Diagonal { forward, side } => {
            let unit = [
                if *forward { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 },
                match side {
                    Side::Left => -FRAC_1_SQRT_2,
                    Side::Right => FRAC_1_SQRT_2,
                },
            ];
            [Tripod::Odd, Tripod::Even]
                .into_iter()
                .map(|group| Move::PhasedStep {
                    group,
                    leg_delta: scaled(unit, stride),
                    body_delta: scaled(unit, stride / 2.0),
                })
                .collect()
        }
        Command::WaveGait => vec![Move::WaveGait],
        Command::RippleGait => vec![Move::RippleGait],
        Command::WaveGaitFeedback => {
            let reach = steps.forward_body_1_leg_cm;
            let lift = AbsTarget {
                z: Some(config.feedback.lift_height_cm),
                ..AbsTarget::default()
            };
            WAVE_ORDER
                .into_iter()
                .flat_map(|leg| {
                    [
                        Move::EndpointAbsolute { leg, target: lift },
                        Move::Endpoint {
                            leg,
                            delta: [reach, 0.0, 0.0],
                        },
                        Move::Touch { legs: vec![leg] },
                        Move::body([reach / WAVE_ORDER.len() as f64, 0.0, 0.0]),
                    ]
                })
                .collect()
        }
        Command::ForwardFeedback => {
            let up = config.stance.leg_up;
            [Tripod::Odd, Tripod::Even]
                .into_iter()
                .flat_map(|group| {
                    [
                        Move::Endpoints {
                            legs: group.legs().to_vec(),
                            delta: [stride, 0.0, up],
                        },
                        Move::Touch {
                            legs: group.legs().to_vec(),
                        },
                        Move::Touch {
                            legs: LegId::ALL.to_vec(),
                        },
                        Move::Balance,
                        Move::body([stride / 2.0, 0.0, 0.0]),
                    ]
                })
                .collect()
        }
        Command::SwitchMode(mode) => vec![Move::SwitchMode { mode: *mode }],
        Command::BodyShift(direction) => {
            let [dx, dy] = scaled(direction.unit(), steps.move_body_cm);
            vec![Move::BodyMovement {
                delta: [dx, dy, 0.0],
                limit: Some(steps.body_shift_limit_cm),
            }]
        }
        Command::BodyToCenter => vec![Move::BodyToCenter],
        Command::Up => vec![Move::body([0.0, 0.0, steps.up_or_down_cm])],
        Command::Down => vec![Move::body([0.0, 0.0, -steps.up_or_down_cm])],
        // Positive angles turn from x towards y, i.e. to the right
        Command::Turn(side) => {
            let angle = match side {
                Side::Left => -steps.turn_angle_deg,
                Side::Right => steps.turn_angle_deg,
            };
            vec![Move::Turn { angle_deg: angle }]
        }
        Command::Reposition { axis, widen } => {
            let step = if *widen {
                steps.reposition_cm
            } else {
                -steps.reposition_cm
            };
            let delta = match axis {
                Axis::X => [step, 0.0],
                Axis::Y => [0.0, step],
            };
            vec![Move::Reposition { delta }]
        }
        Command::Reset => vec![Move::Reset],
        Command::End => vec![Move::End],
        Command::Balance => vec![Move::Balance; 3],
        Command::Touch => vec![Move::Touch {
            legs: LegId::ALL.to_vec(),
        }],
        Command::Idle | Command::DisableTorque | Command::Exit => Vec::new(),
        Command::Unknown(name) => {
            warn!("Unknown command '{}', nothing to do", name);
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tilt {
    Negative,
    Level,
    Positive,
}

impl Tilt {
    pub fn classify(angle: f64, deadband: f64) -> Self {
        if angle < -deadband {
            Tilt::Negative
        } else if angle > deadband {
            Tilt::Positive
        } else {
            Tilt::Level
        }
    }
}

/// Legs pushed down for one pitch/roll combination, with their weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelingRule {
    pub pitch: Tilt,
    pub roll: Tilt,
    pub legs: &'static [(LegId, f64)],
}

pub static LEVELING_TABLE: [LevelingRule; 8] = [
    LevelingRule {
        pitch: Tilt::Negative,
        roll: Tilt::Level,
        legs: &[(LegId::BackLeft, 1.0), (LegId::MiddleLeft, 1.0), (LegId::FrontLeft, 1.0)],
    },
    LevelingRule {
        pitch: Tilt::Positive,
        roll: Tilt::Level,
        legs: &[(LegId::FrontRight, 1.0), (LegId::MiddleRight, 1.0), (LegId::BackRight, 1.0)],
    },
    LevelingRule {
        pitch: Tilt::Level,
        roll: Tilt::Positive,
        legs: &[(LegId::FrontRight, 1.0), (LegId::FrontLeft, 1.0)],
    },
    LevelingRule {
        pitch: Tilt::Level,
        roll: Tilt::Negative,
        legs: &[(LegId::BackRight, 1.0), (LegId::BackLeft, 1.0)],
    },
    LevelingRule {
        pitch: Tilt::Negative,
        roll: Tilt::Positive,
        legs: &[(LegId::FrontLeft, 1.0), (LegId::MiddleLeft, 0.5), (LegId::FrontRight, 0.5)],
    },
    LevelingRule {
        pitch: Tilt::Negative,
        roll: Tilt::Negative,
        legs: &[(LegId::BackLeft, 1.0), (LegId::MiddleLeft, 0.5), (LegId::BackRight, 0.5)],
    },
    LevelingRule {
        pitch: Tilt::Positive,
        roll: Tilt::Positive,
        legs: &[(LegId::FrontRight, 1.0), (LegId::MiddleRight, 0.5), (LegId::FrontLeft, 0.5)],
    },
    LevelingRule {
        pitch: Tilt::Positive,
        roll: Tilt::Negative,
        legs: &[(LegId::BackRight, 1.0), (LegId::MiddleRight, 0.5), (LegId::BackLeft, 0.5)],
    },
];

/// Correction for a reading, or `None` inside the deadband
pub fn leveling_rule(orientation: Orientation, deadband: f64) -> Option<&'static LevelingRule> {
    let pitch = Tilt::classify(orientation.pitch, deadband);
    let roll = Tilt::classify(orientation.roll, deadband);
    LEVELING_TABLE
        .iter()
        .find(|rule| rule.pitch == pitch && rule.roll == roll)
}

/// Stage 2: replays moves against the kinematic model
pub struct Replayer<'a> {
    geometry: &'a Geometry,
    config: &'a RobotConfig,
}

impl<'a> Replayer<'a> {
    pub fn new(geometry: &'a Geometry, config: &'a RobotConfig) -> Self {
        Self { geometry, config }
    }

    /// Snapshots committed while running `mv` from `position`; never empty
    pub fn replay(
        &self,
        mv: &Move,
        position: &ServoPosition,
        feedback: &mut dyn FeedbackSource,
    ) -> Result<Vec<Snapshot>, MotionFault> {
        let mut engine = Kinematics::from_position(self.geometry, self.config, position)?;

        match mv {
            Move::BodyMovement { delta, limit } => self.body_movement(&mut engine, *delta, *limit)?,
            Move::BodyToCenter => engine.body_to_center(true)?,
            Move::Endpoint { leg, delta } => engine.leg_movement(*leg, *delta)?,
            Move::Endpoints { legs, delta } => engine.legs_movement(legs, *delta)?,
            Move::EndpointAbsolute { leg, target } => {
                engine.move_leg_endpoint_abs(*leg, *target, true)?
            }
            Move::PhasedStep {
                group,
                leg_delta,
                body_delta,
            } => engine.phased_step(*group, *leg_delta, *body_delta)?,
            Move::WaveGait => engine.wave_gait()?,
            Move::RippleGait => engine.ripple_gait()?,
            Move::Turn { angle_deg } => engine.turn(*angle_deg)?,
            Move::SwitchMode { mode } => engine.switch_mode(mode.footprint(&self.config.modes))?,
            Move::Reposition { delta } => {
                let current = engine.legs_offsets();
                engine.reposition_legs(Footprint {
                    x: current.x + delta[0],
                    y: current.y + delta[1],
                })?
            }
            Move::Reset => engine.reset()?,
            Move::End => engine.end()?,
            Move::Touch { legs } => self.touch(&mut engine, legs, feedback)?,
            Move::Balance => self.balance(&mut engine, feedback)?,
        }

        let mut sequence = engine.into_sequence();
        if sequence.is_empty() {
            // Nothing moved: hold the input pose
            sequence.push(Snapshot {
                move_type: mv.hold_type(),
                angles: *position,
            });
        }
        debug!("Move '{}' -> {} snapshots", mv.tag(), sequence.len());
        Ok(sequence)
    }

    fn body_movement(
        &self,
        engine: &mut Kinematics<'_>,
        delta: [f64; 3],
        limit: Option<f64>,
    ) -> Result<(), MotionFault> {
        if let Some(limit) = limit {
            let [x, y] = engine.body_delta_xy();
            if (x + delta[0]).abs() > limit || (y + delta[1]).abs() > limit {
                info!("Body shift limit of {} cm reached, holding", limit);
                return Ok(());
            }
        }
        engine.body_movement(delta, true)
    }

    /// Lower the listed legs that report no contact, a step at a time
    fn touch(
        &self,
        engine: &mut Kinematics<'_>,
        legs: &[LegId],
        feedback: &mut dyn FeedbackSource,
    ) -> Result<(), MotionFault> {
        let params = &self.config.feedback;
        for attempt in 1..=params.touch_attempts {
            let contact = feedback.foot_contact();
            let airborne: Vec<LegId> = legs
                .iter()
                .copied()
                .filter(|&leg| !contact.is_grounded(leg))
                .collect();
            if airborne.is_empty() {
                break;
            }

            debug!(
                "Touch attempt {}/{}: contact {}, lowering {:?}",
                attempt, params.touch_attempts, contact, airborne
            );
            for leg in airborne {
                engine.extend_leg(leg, params.touch_step_cm, &contact)?;
            }
            engine.snapshot(MoveType::Touch)?;
        }
        Ok(())
    }

    /// Ground a hanging leg first; otherwise level the body from pitch and roll
    fn balance(
        &self,
        engine: &mut Kinematics<'_>,
        feedback: &mut dyn FeedbackSource,
    ) -> Result<(), MotionFault> {
        let params = &self.config.feedback;
        let contact = feedback.foot_contact();
        let orientation = feedback.orientation();

        if let Some(leg) = contact.airborne().next() {
            info!("Leg {} not grounded ({}), extending it", leg, contact);
            engine.extend_leg(leg, params.balance_step_cm, &contact)?;
            return engine.snapshot(MoveType::Balance);
        }

        match leveling_rule(orientation, params.balance_offset) {
            Some(rule) => {
                debug!(
                    "Leveling pitch {:.2} roll {:.2} with {:?}",
                    orientation.pitch, orientation.roll, rule.legs
                );
                for &(leg, weight) in rule.legs {
                    engine.move_leg_endpoint(leg, [0.0, 0.0, -params.balance_step_cm * weight])?;
                }
                engine.snapshot(MoveType::Balance)
            }
            None => {
                debug!(
                    "Level within {}° (pitch {:.2}, roll {:.2})",
                    params.balance_offset, orientation.pitch, orientation.roll
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::ScriptedFeedback;
    use crate::motion::geometry::FootPoint;

    fn setup() -> (Geometry, RobotConfig) {
        let config = RobotConfig::default();
        (Geometry::new(config.leg, config.limits), config)
    }

    fn neutral(geometry: &Geometry, config: &RobotConfig) -> ServoPosition {
        Kinematics::neutral(geometry, config).unwrap().current_position()
    }

    fn feet_of(geometry: &Geometry, config: &RobotConfig, position: &ServoPosition) -> [FootPoint; 6] {
        Kinematics::from_position(geometry, config, position).unwrap().feet()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("forward_1"),
            Command::Walk {
                direction: Direction::Forward,
                phase: WalkPhase::Start
            }
        );
        assert_eq!(
            Command::parse("strafe_left_32"),
            Command::Walk {
                direction: Direction::StrafeLeft,
                phase: WalkPhase::FinishEven
            }
        );
        assert_eq!(
            Command::parse("backward_two_legged"),
            Command::TwoLegged(Direction::Backward)
        );
        assert_eq!(Command::parse("body_left"), Command::BodyShift(Direction::StrafeLeft));
        assert_eq!(Command::parse("battle_mode"), Command::SwitchMode(StanceMode::Battle));
        assert_eq!(Command::parse(" exit \n"), Command::Exit);
        assert_eq!(Command::parse("hit_1"), Command::Unknown("hit_1".to_string()));
        assert_eq!(Command::parse("forward_4"), Command::Unknown("forward_4".to_string()));
        assert_eq!(Command::parse("body_up"), Command::Unknown("body_up".to_string()));
    }

    #[test]
    fn test_command_names_are_stable() {
        for name in [
            "forward_22",
            "strafe_right_3",
            "diagonal_backward_left",
            "turn_right_two_legged",
            "reposition_y_down",
            "run_mode",
            "body_to_center",
            "wave_gait_feedback",
            "none",
        ] {
            assert_eq!(Command::parse(name).to_string(), name);
        }
    }

    #[test]
    fn test_continuous_commands() {
        assert!(Command::parse("forward_two_legged").is_continuous());
        assert!(Command::parse("turn_left_two_legged").is_continuous());
        assert!(Command::parse("up").is_continuous());
        assert!(Command::parse("body_backward").is_continuous());
        assert!(!Command::parse("forward_1").is_continuous());
        assert!(!Command::parse("battle_mode").is_continuous());
        assert!(!Command::parse("exit").is_continuous());
    }

    #[test]
    fn test_expand_forward_1() {
        let config = RobotConfig::default();
        let moves = expand(&Command::parse("forward_1"), &config);
        assert_eq!(
            moves,
            vec![Move::PhasedStep {
                group: Tripod::Even,
                leg_delta: [6.0, 0.0],
                body_delta: [6.0, 0.0],
            }]
        );
    }

    #[test]
    fn test_expand_unknown_and_control_commands() {
        let config = RobotConfig::default();
        assert!(expand(&Command::parse("jump"), &config).is_empty());
        assert!(expand(&Command::Exit, &config).is_empty());
        assert!(expand(&Command::Idle, &config).is_empty());
        assert_eq!(expand(&Command::Balance, &config), vec![Move::Balance; 3]);
    }

    #[test]
    fn test_expand_wave_gait_feedback() {
        let config = RobotConfig::default();
        let moves = expand(&Command::WaveGaitFeedback, &config);
        assert_eq!(moves.len(), 24);
        assert_eq!(
            moves[2],
            Move::Touch {
                legs: vec![LegId::FrontRight]
            }
        );
        assert_eq!(moves[4].tag(), "endpoint_absolute");
    }

    #[test]
    fn test_move_serialization() {
        let json = serde_json::to_string(&Move::Touch {
            legs: vec![LegId::FrontRight, LegId::BackLeft],
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"touch","legs":[1,4]}"#);

        let parsed: Move = serde_json::from_str(r#"{"type":"body_movement","delta":[0.0,0.0,2.0]}"#).unwrap();
        assert_eq!(parsed, Move::body([0.0, 0.0, 2.0]));
    }

    #[test]
    fn test_replay_forward_1_from_neutral() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::grounded();

        let mut position = start;
        for mv in expand(&Command::parse("forward_1"), &config) {
            let sequence = replayer.replay(&mv, &position, &mut feedback).unwrap();
            position = sequence.last().unwrap().angles;
        }

        let step = config.moves.forward_body_2_leg_cm;
        let before = feet_of(&geometry, &config, &start);
        let after = feet_of(&geometry, &config, &position);
        for leg in Tripod::Even.legs() {
            let (b, a) = (before[leg.index()], after[leg.index()]);
            assert!(a.distance(&b) <= 0.1, "leg {} moved: {:?} -> {:?}", leg, b, a);
        }
        for leg in Tripod::Odd.legs() {
            let (b, a) = (before[leg.index()], after[leg.index()]);
            assert!((a.x - (b.x - step)).abs() <= 0.1, "leg {}: {:?} -> {:?}", leg, b, a);
            assert!((a.y - b.y).abs() <= 0.1);
            assert!((a.z - b.z).abs() <= 0.1);
        }
    }

    #[test]
    fn test_touch_all_grounded_holds_pose() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::grounded();

        let sequence = replayer
            .replay(&Move::Touch { legs: LegId::ALL.to_vec() }, &start, &mut feedback)
            .unwrap();

        assert_eq!(
            sequence,
            vec![Snapshot {
                move_type: MoveType::Touch,
                angles: start
            }]
        );
    }

    #[test]
    fn test_touch_lowers_until_contact() {
        let (geometry, mut config) = setup();
        config.feedback.max_leg_extension_cm = 5.0;
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::with_contacts(&["101111", "111111"]);

        let sequence = replayer
            .replay(&Move::Touch { legs: LegId::ALL.to_vec() }, &start, &mut feedback)
            .unwrap();

        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence[0].move_type, MoveType::Touch);
        let before = feet_of(&geometry, &config, &start);
        let after = feet_of(&geometry, &config, &sequence[0].angles);
        let lowered = before[1].z - after[1].z;
        assert!((lowered - config.feedback.touch_step_cm).abs() <= 0.05);
        assert!(after[0].distance(&before[0]) <= 0.05);
    }

    #[test]
    fn test_touch_stops_after_attempts() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        // Leg 2 never reports contact; only leg 2 is being placed
        let mut feedback = ScriptedFeedback::with_contacts(&["101111"; 5]);

        let result = replayer.replay(
            &Move::Touch {
                legs: vec![LegId::MiddleRight],
            },
            &start,
            &mut feedback,
        );

        // Second step already pushes 8 cm below the other feet
        assert!(matches!(
            result,
            Err(MotionFault::Distance {
                leg: LegId::MiddleRight,
                ..
            })
        ));
    }

    #[test]
    fn test_leveling_table_is_complete() {
        let tilts = [Tilt::Negative, Tilt::Level, Tilt::Positive];
        for pitch in tilts {
            for roll in tilts {
                let matches = LEVELING_TABLE
                    .iter()
                    .filter(|r| r.pitch == pitch && r.roll == roll)
                    .count();
                let expected = if pitch == Tilt::Level && roll == Tilt::Level { 0 } else { 1 };
                assert_eq!(matches, expected, "pitch {:?} roll {:?}", pitch, roll);
            }
        }
    }

    #[test]
    fn test_balance_applies_each_rule() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let before = feet_of(&geometry, &config, &start);
        let replayer = Replayer::new(&geometry, &config);
        let step = config.feedback.balance_step_cm;

        let reading = |tilt: Tilt| match tilt {
            Tilt::Negative => -3.0,
            Tilt::Level => 0.5,
            Tilt::Positive => 3.0,
        };

        for rule in LEVELING_TABLE.iter() {
            let mut feedback = ScriptedFeedback::grounded().tilted(reading(rule.pitch), reading(rule.roll));
            let sequence = replayer.replay(&Move::Balance, &start, &mut feedback).unwrap();
            assert_eq!(sequence.len(), 1);
            assert_eq!(sequence[0].move_type, MoveType::Balance);

            let after = feet_of(&geometry, &config, &sequence[0].angles);
            for leg in LegId::ALL {
                let weight = rule
                    .legs
                    .iter()
                    .find(|(l, _)| *l == leg)
                    .map_or(0.0, |(_, w)| *w);
                let dz = after[leg.index()].z - before[leg.index()].z;
                assert!(
                    (dz + step * weight).abs() <= 0.05,
                    "rule {:?}/{:?} leg {}: dz {}",
                    rule.pitch,
                    rule.roll,
                    leg,
                    dz
                );
            }
        }
    }

    #[test]
    fn test_balance_pitch_negative_moves_left_side() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::grounded().tilted(-2.0, 1.0);

        let sequence = replayer.replay(&Move::Balance, &start, &mut feedback).unwrap();

        let before = feet_of(&geometry, &config, &start);
        let after = feet_of(&geometry, &config, &sequence[0].angles);
        for leg in [LegId::BackLeft, LegId::MiddleLeft, LegId::FrontLeft] {
            assert!((after[leg.index()].z - before[leg.index()].z + 1.0).abs() <= 0.05);
        }
        for leg in [LegId::FrontRight, LegId::MiddleRight, LegId::BackRight] {
            assert!(after[leg.index()].distance(&before[leg.index()]) <= 0.05);
        }
    }

    #[test]
    fn test_balance_grounds_hanging_leg_first() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::with_contacts(&["110111"]).tilted(5.0, 5.0);

        let sequence = replayer.replay(&Move::Balance, &start, &mut feedback).unwrap();

        let before = feet_of(&geometry, &config, &start);
        let after = feet_of(&geometry, &config, &sequence[0].angles);
        for leg in LegId::ALL {
            let dz = after[leg.index()].z - before[leg.index()].z;
            let expected = if leg == LegId::BackRight { -1.0 } else { 0.0 };
            assert!((dz - expected).abs() <= 0.05, "leg {}: dz {}", leg, dz);
        }
    }

    #[test]
    fn test_balance_level_holds_pose() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::grounded().tilted(1.0, -1.5);

        let sequence = replayer.replay(&Move::Balance, &start, &mut feedback).unwrap();

        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence[0].angles, start);
    }

    #[test]
    fn test_body_shift_limit_holds() {
        let (geometry, config) = setup();
        let start = neutral(&geometry, &config);
        let replayer = Replayer::new(&geometry, &config);
        let mut feedback = ScriptedFeedback::grounded();
        let shift = Move::BodyMovement {
            delta: [2.5, 0.0, 0.0],
            limit: Some(config.moves.body_shift_limit_cm),
        };

        let mut position = start;
        let mut moved = 0;
        for _ in 0..5 {
            let sequence = replayer.replay(&shift, &position, &mut feedback).unwrap();
            let next = sequence.last().unwrap().angles;
            if next != position {
                moved += 1;
            }
            position = next;
        }

        assert_eq!(moved, 2);
    }
}
