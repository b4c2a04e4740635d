// Joint-angle poses of the whole robot
//
// A pose carries its unit convention in the type: `KinematicPosition` holds
// leg-local radians, `ServoPosition` holds per-leg-corrected degrees. The two
// only meet through the conversions in `geometry`.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Leg numbering, going clockwise from the front right leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LegId {
    FrontRight = 1,
    MiddleRight = 2,
    BackRight = 3,
    BackLeft = 4,
    MiddleLeft = 5,
    FrontLeft = 6,
}

impl LegId {
    pub const ALL: [LegId; 6] = [
        LegId::FrontRight,
        LegId::MiddleRight,
        LegId::BackRight,
        LegId::BackLeft,
        LegId::MiddleLeft,
        LegId::FrontLeft,
    ];

    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Zero-based index for per-leg arrays
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(LegId::FrontRight),
            2 => Some(LegId::MiddleRight),
            3 => Some(LegId::BackRight),
            4 => Some(LegId::BackLeft),
            5 => Some(LegId::MiddleLeft),
            6 => Some(LegId::FrontLeft),
            _ => None,
        }
    }
}

impl From<LegId> for u8 {
    fn from(leg: LegId) -> Self {
        leg.number()
    }
}

impl TryFrom<u8> for LegId {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        LegId::from_number(number).ok_or_else(|| format!("no leg numbered {}", number))
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Alternating leg groups of the tripod gait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tripod {
    Odd,  // 1, 3, 5
    Even, // 2, 4, 6
}

impl Tripod {
    pub fn legs(self) -> [LegId; 3] {
        match self {
            Tripod::Odd => [LegId::FrontRight, LegId::BackRight, LegId::MiddleLeft],
            Tripod::Even => [LegId::MiddleRight, LegId::BackLeft, LegId::FrontLeft],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    Tetta, // coxa
    Alpha, // femur
    Beta,  // tibia
}

impl Joint {
    pub const ALL: [Joint; 3] = [Joint::Tetta, Joint::Alpha, Joint::Beta];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Joint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Joint::Tetta => "tetta",
            Joint::Alpha => "alpha",
            Joint::Beta => "beta",
        };
        f.write_str(name)
    }
}

/// Three joint angles of one leg
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LegAngles {
    pub tetta: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl LegAngles {
    pub fn new(tetta: f64, alpha: f64, beta: f64) -> Self {
        Self { tetta, alpha, beta }
    }

    pub fn get(&self, joint: Joint) -> f64 {
        match joint {
            Joint::Tetta => self.tetta,
            Joint::Alpha => self.alpha,
            Joint::Beta => self.beta,
        }
    }
}

/// Leg-local radians, as used inside the kinematics engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kinematic {}

/// Per-leg-corrected degrees, as sent to the servos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Servo {}

/// The 18 joint angles of the robot in one unit convention
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointAngles<F> {
    legs: [LegAngles; 6],
    frame: PhantomData<F>,
}

pub type KinematicPosition = JointAngles<Kinematic>;
pub type ServoPosition = JointAngles<Servo>;

impl<F> JointAngles<F> {
    pub fn from_legs(legs: [LegAngles; 6]) -> Self {
        Self {
            legs,
            frame: PhantomData,
        }
    }

    pub fn leg(&self, leg: LegId) -> &LegAngles {
        &self.legs[leg.index()]
    }

    pub fn with_leg(mut self, leg: LegId, angles: LegAngles) -> Self {
        self.legs[leg.index()] = angles;
        self
    }

    pub fn get(&self, leg: LegId, joint: Joint) -> f64 {
        self.leg(leg).get(joint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LegId, &LegAngles)> {
        LegId::ALL.into_iter().zip(self.legs.iter())
    }

    /// Largest absolute difference over all 18 joints
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        self.iter()
            .flat_map(|(leg, angles)| {
                Joint::ALL
                    .into_iter()
                    .map(move |joint| (angles.get(joint) - other.get(leg, joint)).abs())
            })
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for ServoPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (leg, angles)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(
                f,
                "{}: {:.2} {:.2} {:.2}",
                leg, angles.tetta, angles.alpha, angles.beta
            )?;
        }
        Ok(())
    }
}

/// Move category a snapshot was committed under; selects servo pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    Body,
    Endpoint,
    Touch,
    Balance,
}

impl MoveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveType::Body => "body",
            MoveType::Endpoint => "endpoint",
            MoveType::Touch => "touch",
            MoveType::Balance => "balance",
        }
    }
}

impl fmt::Display for MoveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed pose
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub move_type: MoveType,
    pub angles: ServoPosition,
}
