// Line formats shared with the console and the sensor processes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::motion::position::LegId;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandParseError {
    #[error("expected 3 comma-separated fields, got {0}")]
    FieldCount(usize),

    #[error("invalid command id '{0}'")]
    BadId(String),

    #[error("invalid speed '{0}'")]
    BadSpeed(String),
}

/// Command from the console -> runtime: `<id>,<command>,<speed>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: u64,
    pub command: String,
    pub speed: u32,
}

impl FromStr for CommandRecord {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let [id, command, speed] = fields.as_slice() else {
            return Err(CommandParseError::FieldCount(fields.len()));
        };

        Ok(Self {
            id: id
                .parse()
                .map_err(|_| CommandParseError::BadId(id.to_string()))?,
            command: command.to_string(),
            speed: speed
                .parse()
                .map_err(|_| CommandParseError::BadSpeed(speed.to_string()))?,
        })
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.id, self.command, self.speed)
    }
}

/// Foot contact bitmask, one flag per leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootContact {
    grounded: [bool; 6],
}

impl FootContact {
    pub const ALL_GROUNDED: FootContact = FootContact {
        grounded: [true; 6],
    };

    pub fn from_grounded(grounded: [bool; 6]) -> Self {
        Self { grounded }
    }

    /// Parse the first comma-separated field of a contact line, e.g. `"101111,..."`
    pub fn parse(line: &str) -> Option<Self> {
        let mask = line.trim().split(',').next()?.trim();
        if mask.len() != 6 {
            return None;
        }

        let mut grounded = [false; 6];
        for (flag, c) in grounded.iter_mut().zip(mask.chars()) {
            *flag = match c {
                '1' => true,
                '0' => false,
                _ => return None,
            };
        }
        Some(Self { grounded })
    }

    pub fn is_grounded(&self, leg: LegId) -> bool {
        self.grounded[leg.index()]
    }

    pub fn grounded_count(&self) -> usize {
        self.grounded.iter().filter(|&&g| g).count()
    }

    pub fn airborne(&self) -> impl Iterator<Item = LegId> + '_ {
        LegId::ALL.into_iter().filter(|&leg| !self.is_grounded(leg))
    }
}

impl Default for FootContact {
    fn default() -> Self {
        Self::ALL_GROUNDED
    }
}

impl fmt::Display for FootContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &g in &self.grounded {
            f.write_str(if g { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Body orientation from the IMU process, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub pitch: f64,
    pub roll: f64,
}

impl Orientation {
    /// Parse `<pitch>,<roll>`
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',').map(str::trim);
        let pitch = fields.next()?.parse().ok()?;
        let roll = fields.next()?.parse().ok()?;
        Some(Self { pitch, roll })
    }
}
