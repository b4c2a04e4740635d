// Servo control for the hexapod legs
//
// Provides:
// - Serial bus servo protocol (framing, checksum, retries, port recovery)
// - High-level driver mapping joints to servos and pacing moves

mod driver;
pub mod protocol;

pub use driver::{travel_rate, Actuator, DryRun, ServoDriver, ServoStatus};
pub use protocol::{BusError, ServoBus, SerialTransport, Transport};
