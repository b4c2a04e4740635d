// Motion pipeline for the hexapod
//
// Provides:
// - Leg geometry solver and servo/kinematic frame conversion
// - Six-leg kinematic body model with committed snapshots
// - Command expansion and move replay, including touch-down and leveling

pub mod geometry;
pub mod kinematics;
pub mod leg;
pub mod position;
pub mod sequencer;

pub use geometry::{FootPoint, Geometry, ReachError};
pub use kinematics::{AbsTarget, Kinematics, MotionFault};
pub use position::{Joint, LegId, MoveType, ServoPosition, Snapshot, Tripod};
pub use sequencer::{Command, Move, Replayer, expand};
