// High-level servo driver for the hexapod
//
// Maps the 18 joints onto their servo ids and boards, converts servo-frame
// degrees to raw positions and paces every send by the largest joint travel.

use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::protocol::{
    angle_to_position, position_to_angle, BusError, SerialTransport, ServoBus, Transport,
};
use crate::channels::FeedbackSource;
use crate::config::{Limit, RobotConfig, ServoConfig};
use crate::motion::position::{Joint, LegAngles, LegId, ServoPosition};

/// Read-back angles beyond this are treated as garbage
pub const MAX_READ_ANGLE: f64 = 150.0;
pub const ANGLE_READ_ATTEMPTS: u32 = 5;

/// Milliseconds of travel for the largest joint move at `speed` (ms per 45°)
pub fn travel_rate(speed: u32, max_diff: f64) -> u16 {
    (speed as f64 * max_diff / 45.0)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16
}

/// Something that can put the robot into a servo-frame position
pub trait Actuator {
    /// Send and wait out the travel time
    fn send_paced(&mut self, position: &ServoPosition, speed: u32) -> Result<(), BusError>;

    /// Send, then stop early as soon as another foot reports contact
    fn send_touching(
        &mut self,
        position: &ServoPosition,
        speed: u32,
        feedback: &mut dyn FeedbackSource,
    ) -> Result<(), BusError>;

    fn disable_torque(&mut self) -> Result<(), BusError>;
}

/// Diagnostic readings of one servo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoStatus {
    pub id: u8,
    pub position: i16,
    pub angle: f64,
    pub target: u16,
    pub rate: u16,
    pub temperature: u8,
    pub voltage: u16,
}

pub struct ServoDriver<T: Transport = SerialTransport> {
    boards: BTreeMap<u8, ServoBus<T>>,
    servos: ServoConfig,
    tetta_limit: Limit,
    last_sent: Option<ServoPosition>,
    touch_polls: u32,
    touch_poll: Duration,
    pace: bool,
}

impl ServoDriver<SerialTransport> {
    /// Open every board named in the config
    pub fn open(config: &RobotConfig) -> Result<Self, BusError> {
        let servos = &config.servos;
        let timeout = Duration::from_millis(servos.timeout_ms);
        let backoff = Duration::from_millis(servos.reset_backoff_ms);

        let mut boards = BTreeMap::new();
        for (&board, port) in &servos.ports {
            info!("Opening servo board {} on {} @ {} baud", board, port, servos.baudrate);
            boards.insert(board, ServoBus::open(port, servos.baudrate, timeout, backoff)?);
        }
        Ok(Self::with_buses(boards, config))
    }
}

impl<T: Transport> ServoDriver<T> {
    pub fn with_buses(boards: BTreeMap<u8, ServoBus<T>>, config: &RobotConfig) -> Self {
        Self {
            boards,
            servos: config.servos.clone(),
            tetta_limit: config.limits.tetta,
            last_sent: None,
            touch_polls: config.feedback.touch_polls,
            touch_poll: Duration::from_millis(config.feedback.touch_poll_ms),
            pace: true,
        }
    }

    fn board(&mut self, id: u8) -> Result<&mut ServoBus<T>, BusError> {
        let board = self
            .servos
            .boards
            .get(&id)
            .ok_or(BusError::UnknownServo(id))?;
        self.boards.get_mut(board).ok_or(BusError::UnknownServo(id))
    }

    fn neutral(&self, id: u8) -> Result<u16, BusError> {
        self.servos
            .neutral
            .get(&id)
            .copied()
            .ok_or(BusError::UnknownServo(id))
    }

    /// Raw targets for every joint, in leg/joint order
    fn targets(&self, position: &ServoPosition) -> Result<Vec<(u8, u16)>, BusError> {
        let mut targets = Vec::with_capacity(18);
        for (leg, angles) in position.iter() {
            for joint in Joint::ALL {
                let id = self.servos.servo_id(leg, joint);
                let angle = angles.get(joint);
                if joint == Joint::Tetta && !self.tetta_limit.contains(angle) {
                    return Err(BusError::AngleOutOfRange { id, angle });
                }
                targets.push((id, angle_to_position(self.neutral(id)?, angle)));
            }
        }
        Ok(targets)
    }

    /// Send all 18 joints with the same rate. Nothing is sent if any
    /// joint fails validation.
    pub fn send_position(&mut self, position: &ServoPosition, rate: u16) -> Result<(), BusError> {
        let targets = self.targets(position)?;
        let verify = self.servos.verify_targets;
        for (id, target) in targets {
            self.board(id)?.move_to_position(id, target, rate, verify)?;
        }
        self.last_sent = Some(*position);
        Ok(())
    }

    /// Present angle of one servo, re-read while it is implausible
    pub fn read_angle(&mut self, id: u8) -> Result<f64, BusError> {
        let neutral = self.neutral(id)?;
        let mut angle = 0.0;
        for attempt in 1..=ANGLE_READ_ATTEMPTS {
            angle = position_to_angle(neutral, self.board(id)?.read_position(id)?);
            if angle.abs() <= MAX_READ_ANGLE {
                return Ok(angle);
            }
            debug!(
                "Servo {} reported {:.2}° (attempt {}/{})",
                id, angle, attempt, ANGLE_READ_ATTEMPTS
            );
        }
        Err(BusError::AngleOutOfRange { id, angle })
    }

    /// Present position of the whole robot
    pub fn read_position(&mut self) -> Result<ServoPosition, BusError> {
        let mut legs = [LegAngles::default(); 6];
        for leg in LegId::ALL {
            let mut angles = [0.0; 3];
            for joint in Joint::ALL {
                angles[joint.index()] = self.read_angle(self.servos.servo_id(leg, joint))?;
            }
            legs[leg.index()] = LegAngles::new(angles[0], angles[1], angles[2]);
        }
        let position = ServoPosition::from_legs(legs);
        debug!("Read current angles: {}", position);
        Ok(position)
    }

    /// Load or unload every servo, board by board
    pub fn set_torque(&mut self, enabled: bool) -> Result<(), BusError> {
        info!("Torque {} on all servos", if enabled { "on" } else { "off" });
        for (&id, board) in &self.servos.boards {
            let bus = self
                .boards
                .get_mut(board)
                .ok_or(BusError::UnknownServo(id))?;
            bus.set_torque(id, enabled)?;
        }
        Ok(())
    }

    pub fn read_status(&mut self, id: u8) -> Result<ServoStatus, BusError> {
        let neutral = self.neutral(id)?;
        let bus = self.board(id)?;
        let position = bus.read_position(id)?;
        let (target, rate) = bus.read_target(id)?;
        Ok(ServoStatus {
            id,
            position,
            angle: position_to_angle(neutral, position),
            target,
            rate,
            temperature: bus.read_temperature(id)?,
            voltage: bus.read_voltage(id)?,
        })
    }

    pub fn servo_ids(&self) -> Vec<u8> {
        self.servos.all_ids().collect()
    }

    /// Rate for a move from the last sent (or read-back) position
    fn rate_to(&mut self, position: &ServoPosition, speed: u32) -> Result<u16, BusError> {
        let reference = match self.last_sent {
            Some(sent) => sent,
            None => self.read_position()?,
        };
        let max_diff = position.max_abs_diff(&reference);
        let rate = travel_rate(speed, max_diff);
        debug!("Max joint travel {:.2}° at speed {} -> rate {} ms", max_diff, speed, rate);
        Ok(rate)
    }
}

impl<T: Transport> Actuator for ServoDriver<T> {
    fn send_paced(&mut self, position: &ServoPosition, speed: u32) -> Result<(), BusError> {
        let rate = self.rate_to(position, speed)?;
        self.send_position(position, rate)?;
        if self.pace {
            sleep(Duration::from_millis(rate as u64));
        }
        Ok(())
    }

    fn send_touching(
        &mut self,
        position: &ServoPosition,
        speed: u32,
        feedback: &mut dyn FeedbackSource,
    ) -> Result<(), BusError> {
        let rate = self.rate_to(position, speed)?;
        let initial = feedback.foot_contact();
        self.send_position(position, rate)?;

        for poll in 1..=self.touch_polls {
            let contact = feedback.foot_contact();
            if contact.grounded_count() > initial.grounded_count() {
                info!("Contact {} -> {} after {} polls, holding", initial, contact, poll);
                let current = self.read_position()?;
                return self.send_position(&current, 0);
            }
            sleep(self.touch_poll);
        }
        debug!("No new contact after {} polls", self.touch_polls);
        Ok(())
    }

    fn disable_torque(&mut self) -> Result<(), BusError> {
        self.set_torque(false)
    }
}

/// Actuator that only logs, paced like the real one
#[derive(Debug, Default)]
pub struct DryRun {
    last_sent: Option<ServoPosition>,
    pace: bool,
}

impl DryRun {
    pub fn new(pace: bool) -> Self {
        Self {
            last_sent: None,
            pace,
        }
    }
}

impl Actuator for DryRun {
    fn send_paced(&mut self, position: &ServoPosition, speed: u32) -> Result<(), BusError> {
        let reference = self.last_sent.unwrap_or(*position);
        let rate = travel_rate(speed, position.max_abs_diff(&reference));
        info!("[dry run] rate {} ms: {}", rate, position);
        self.last_sent = Some(*position);
        if self.pace {
            sleep(Duration::from_millis(rate as u64));
        }
        Ok(())
    }

    fn send_touching(
        &mut self,
        position: &ServoPosition,
        speed: u32,
        _feedback: &mut dyn FeedbackSource,
    ) -> Result<(), BusError> {
        debug!("Dry run: touch send without contact watch");
        self.send_paced(position, speed)
    }

    fn disable_torque(&mut self) -> Result<(), BusError> {
        warn!("[dry run] torque off");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::ScriptedFeedback;
    use crate::servo::protocol::testing::MockTransport;
    use crate::servo::protocol::{build_packet, Command};

    fn driver(config: &RobotConfig) -> ServoDriver<MockTransport> {
        let boards = config
            .servos
            .ports
            .keys()
            .map(|&board| (board, ServoBus::new(MockTransport::default(), Duration::ZERO)))
            .collect();
        let mut driver = ServoDriver::with_buses(boards, config);
        driver.pace = false;
        driver.touch_poll = Duration::ZERO;
        driver
    }

    fn config() -> RobotConfig {
        let mut config = RobotConfig::default();
        config.servos.verify_targets = false;
        config
    }

    fn queue_position_reply(driver: &mut ServoDriver<MockTransport>, id: u8, raw: i16) {
        let board = driver.servos.boards[&id];
        let bus = driver.boards.get_mut(&board).unwrap();
        bus.transport_mut()
            .queue(build_packet(id, Command::PosRead, &raw.to_le_bytes()));
    }

    fn frames(driver: &ServoDriver<MockTransport>, board: u8) -> &[Vec<u8>] {
        &driver.boards[&board].transport().written
    }

    #[test]
    fn test_travel_rate() {
        assert_eq!(travel_rate(500, 45.0), 500);
        assert_eq!(travel_rate(500, 9.0), 100);
        assert_eq!(travel_rate(1000, 0.0), 0);
        assert_eq!(travel_rate(250, 10.0), 56);
    }

    #[test]
    fn test_send_position_routes_to_boards() {
        let config = config();
        let mut driver = driver(&config);
        let zero = ServoPosition::from_legs([LegAngles::default(); 6]);

        driver.send_position(&zero, 300).unwrap();

        assert_eq!(frames(&driver, 3).len(), 9);
        assert_eq!(frames(&driver, 4).len(), 9);
        // Servo 11 (leg 1 tetta) lives on board 4 with neutral 500
        let frame = frames(&driver, 4)
            .iter()
            .find(|frame| frame[2] == 11)
            .unwrap();
        assert_eq!(&frame[5..9], &[0xF4, 0x01, 0x2C, 0x01]);
    }

    #[test]
    fn test_tetta_out_of_range_sends_nothing() {
        let config = config();
        let mut driver = driver(&config);
        let bad = ServoPosition::from_legs([LegAngles::default(); 6])
            .with_leg(LegId::BackLeft, LegAngles::new(120.0, 0.0, 0.0));

        let result = driver.send_position(&bad, 300);

        assert!(matches!(result, Err(BusError::AngleOutOfRange { id: 23, .. })));
        assert!(frames(&driver, 3).is_empty());
        assert!(frames(&driver, 4).is_empty());
    }

    #[test]
    fn test_read_angle_skips_garbage() {
        let config = config();
        let mut driver = driver(&config);
        // Servo 9 neutral 480: 480 + 1000 is far past 150°
        queue_position_reply(&mut driver, 9, 1480);
        queue_position_reply(&mut driver, 9, 530);

        assert_eq!(driver.read_angle(9).unwrap(), 12.0);
    }

    #[test]
    fn test_read_angle_gives_up() {
        let config = config();
        let mut driver = driver(&config);
        for _ in 0..ANGLE_READ_ATTEMPTS {
            queue_position_reply(&mut driver, 9, 1480);
        }

        assert!(matches!(
            driver.read_angle(9),
            Err(BusError::AngleOutOfRange { id: 9, .. })
        ));
    }

    #[test]
    fn test_torque_is_sent_per_board() {
        let config = config();
        let mut driver = driver(&config);

        driver.disable_torque().unwrap();

        for board in [3, 4] {
            let frames = frames(&driver, board);
            assert_eq!(frames.len(), 9);
            assert!(frames
                .iter()
                .all(|f| f[4] == Command::LoadOrUnloadWrite as u8 && f[5] == 0));
        }
    }

    #[test]
    fn test_touching_send_freezes_on_new_contact() {
        let config = config();
        let mut driver = driver(&config);
        let zero = ServoPosition::from_legs([LegAngles::default(); 6]);
        driver.last_sent = Some(zero);
        for id in config.servos.all_ids() {
            let neutral = config.servos.neutral[&id] as i16;
            queue_position_reply(&mut driver, id, neutral);
        }
        let mut feedback = ScriptedFeedback::with_contacts(&["110111", "110111", "111111"]);

        driver.send_touching(&zero, 500, &mut feedback).unwrap();

        // 18 moves, 18 position reads, then 18 moves at rate 0
        let moves: Vec<&Vec<u8>> = [3, 4]
            .iter()
            .flat_map(|&b| frames(&driver, b))
            .filter(|f| f[4] == Command::MoveTimeWrite as u8)
            .collect();
        assert_eq!(moves.len(), 36);
        assert!(moves[moves.len() - 1][7..9] == [0, 0]);
    }

    #[test]
    fn test_touching_send_without_new_contact_sends_once() {
        let config = config();
        let mut driver = driver(&config);
        let zero = ServoPosition::from_legs([LegAngles::default(); 6]);
        driver.last_sent = Some(zero);
        let script = vec!["110111"; config.feedback.touch_polls as usize + 1];
        let mut feedback = ScriptedFeedback::with_contacts(&script);

        driver.send_touching(&zero, 500, &mut feedback).unwrap();

        let written: Vec<&Vec<u8>> = [3, 4].iter().flat_map(|&b| frames(&driver, b)).collect();
        assert_eq!(written.len(), 18);
        assert!(written.iter().all(|f| f[4] == Command::MoveTimeWrite as u8));
        assert!(feedback.contacts.is_empty());
        assert_eq!(driver.last_sent, Some(zero));
    }

    #[test]
    fn test_dry_run_tracks_last_sent() {
        let mut dry = DryRun::new(false);
        let zero = ServoPosition::from_legs([LegAngles::default(); 6]);
        dry.send_paced(&zero, 500).unwrap();
        assert_eq!(dry.last_sent, Some(zero));
    }
}
