// Serial bus servo protocol (0x55 0x55 framing)
//
// Packet format: [0x55, 0x55, ID, Length, Command, Params..., Checksum]
// Length counts itself, the command byte and the params. Replies use the
// same framing and echo the servo id and command.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

/// Default serial configuration for the servo boards
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Attempts for every write and every read request
pub const BUS_ATTEMPTS: u32 = 3;

/// Degrees per raw position unit
pub const DEGREES_PER_UNIT: f64 = 0.24;
/// Highest raw position a servo accepts
pub const MAX_POSITION: u16 = 1000;

/// Packet header bytes
const HEADER: [u8; 2] = [0x55, 0x55];

/// Command set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoveTimeWrite = 1,
    MoveTimeRead = 2,
    MoveStop = 12,
    AngleLimitWrite = 20,
    AngleLimitRead = 21,
    TempRead = 26,
    VinRead = 27,
    PosRead = 28,
    LoadOrUnloadWrite = 31,
    LoadOrUnloadRead = 32,
    LedCtrlWrite = 33,
    LedCtrlRead = 34,
}

/// Error types for servo bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Write to {port} failed after {attempts} attempts: {source}")]
    WriteFailed {
        port: String,
        attempts: u32,
        source: io::Error,
    },

    #[error("No valid reply from servo {id} to {command:?} after {attempts} attempts")]
    NoResponse {
        id: u8,
        command: Command,
        attempts: u32,
    },

    #[error("Servo {0} is not routed to any board")]
    UnknownServo(u8),

    #[error("Servo {id} angle {angle:.2}° out of range")]
    AngleOutOfRange { id: u8, angle: f64 },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Why a single reply read was rejected
#[derive(Debug, thiserror::Error)]
enum ReplyFault {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("bad header or checksum: {0:02X?}")]
    Corrupt(Vec<u8>),

    #[error("reply from servo {id} to command {command}")]
    Mismatch { id: u8, command: u8 },
}

/// Byte stream to one servo board
pub trait Transport: Read + Write + Send {
    fn name(&self) -> &str;

    /// Close and reopen the underlying port
    fn reset(&mut self) -> Result<()>;

    /// Drop unread input before a request
    fn clear_input(&mut self) -> Result<()>;
}

/// Serial port transport with DTR asserted
pub struct SerialTransport {
    name: String,
    baudrate: u32,
    timeout: Duration,
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = Self::connect(name, baudrate, timeout)?;
        Ok(Self {
            name: name.to_string(),
            baudrate,
            timeout,
            port,
        })
    }

    fn connect(name: &str, baudrate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
        let mut port = serialport::new(name, baudrate).timeout(timeout).open()?;
        port.write_data_terminal_ready(true)?;
        Ok(port)
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) -> Result<()> {
        warn!("Resetting serial port {}", self.name);
        self.port = Self::connect(&self.name, self.baudrate, self.timeout)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Calculate checksum over everything after the header
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    (!sum & 0xFF) as u8
}

/// Build a packet with header and checksum
pub fn build_packet(id: u8, command: Command, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 3) as u8; // length + command + params
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(command as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));

    packet
}

/// Check header, declared length and checksum of a complete frame
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() < 6 || frame[..2] != HEADER {
        return false;
    }
    let length = frame[3] as usize;
    if frame.len() != length + 3 {
        return false;
    }
    let (body, sum) = frame[2..].split_at(frame.len() - 3);
    checksum(body) == sum[0]
}

/// Raw position for an angle, relative to the servo's neutral position
pub fn angle_to_position(neutral: u16, angle: f64) -> u16 {
    let raw = neutral as f64 + (angle / DEGREES_PER_UNIT).round();
    if raw < 0.0 {
        warn!("Raw target {} below 0 for angle {:.2}, clamping", raw, angle);
        return 0;
    }
    if raw > MAX_POSITION as f64 {
        warn!("Raw target {} above {} for angle {:.2}, clamping", raw, MAX_POSITION, angle);
        return MAX_POSITION;
    }
    raw as u16
}

pub fn position_to_angle(neutral: u16, position: i16) -> f64 {
    let angle = (position as f64 - neutral as f64) * DEGREES_PER_UNIT;
    (angle * 100.0).round() / 100.0
}

/// One servo board
pub struct ServoBus<T: Transport = SerialTransport> {
    transport: T,
    backoff: Duration,
}

impl ServoBus<SerialTransport> {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration, backoff: Duration) -> Result<Self> {
        let transport = SerialTransport::open(port_name, baudrate, timeout)?;
        Ok(Self::new(transport, backoff))
    }
}

impl<T: Transport> ServoBus<T> {
    pub fn new(transport: T, backoff: Duration) -> Self {
        Self { transport, backoff }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Sleep out the backoff, then reopen the port
    fn recover(&mut self) {
        sleep(self.backoff);
        if let Err(e) = self.transport.reset() {
            warn!("Reset of {} failed: {}", self.transport.name(), e);
        }
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        let mut attempt = 1;
        loop {
            let sent = self
                .transport
                .write_all(packet)
                .and_then(|_| self.transport.flush());
            match sent {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= BUS_ATTEMPTS => {
                    return Err(BusError::WriteFailed {
                        port: self.transport.name().to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Write to {} failed (attempt {}/{}): {}",
                        self.transport.name(),
                        attempt,
                        BUS_ATTEMPTS,
                        e
                    );
                    self.recover();
                    attempt += 1;
                }
            }
        }
    }

    fn read_reply(&mut self, id: u8, command: Command, payload_len: usize) -> std::result::Result<Vec<u8>, ReplyFault> {
        let mut frame = vec![0u8; payload_len + 6];
        self.transport.read_exact(&mut frame)?;

        if !verify_checksum(&frame) {
            return Err(ReplyFault::Corrupt(frame));
        }
        if frame[2] != id || frame[4] != command as u8 {
            return Err(ReplyFault::Mismatch {
                id: frame[2],
                command: frame[4],
            });
        }
        Ok(frame[5..5 + payload_len].to_vec())
    }

    /// Send a read command and return the reply payload
    fn request(&mut self, id: u8, command: Command, payload_len: usize) -> Result<Vec<u8>> {
        let packet = build_packet(id, command, &[]);
        for attempt in 1..=BUS_ATTEMPTS {
            if let Err(e) = self.transport.clear_input() {
                debug!("Cannot clear input of {}: {}", self.transport.name(), e);
            }
            self.send_packet(&packet)?;

            match self.read_reply(id, command, payload_len) {
                Ok(payload) => return Ok(payload),
                Err(e) => debug!(
                    "Servo {} {:?} reply rejected (attempt {}/{}): {}",
                    id, command, attempt, BUS_ATTEMPTS, e
                ),
            }
        }
        Err(BusError::NoResponse {
            id,
            command,
            attempts: BUS_ATTEMPTS,
        })
    }

    fn request_u16_pair(&mut self, id: u8, command: Command) -> Result<(u16, u16)> {
        let payload = self.request(id, command, 4)?;
        Ok((
            u16::from_le_bytes([payload[0], payload[1]]),
            u16::from_le_bytes([payload[2], payload[3]]),
        ))
    }

    // === Writes ===

    /// Move to a raw position (0-1000) over `rate` milliseconds
    pub fn move_time_write(&mut self, id: u8, position: u16, rate: u16) -> Result<()> {
        let [p0, p1] = position.to_le_bytes();
        let [r0, r1] = rate.to_le_bytes();
        let packet = build_packet(id, Command::MoveTimeWrite, &[p0, p1, r0, r1]);
        debug!("Servo {}: position {} over {} ms", id, position, rate);
        self.send_packet(&packet)
    }

    /// Move, then confirm the servo accepted the target; re-send on mismatch
    pub fn move_to_position(&mut self, id: u8, position: u16, rate: u16, verify: bool) -> Result<()> {
        for attempt in 1..=BUS_ATTEMPTS {
            self.move_time_write(id, position, rate)?;
            if !verify {
                return Ok(());
            }
            match self.read_target(id) {
                Ok((target, _)) if target == position => return Ok(()),
                Ok((target, _)) => debug!(
                    "Servo {} holds target {} instead of {} (attempt {}/{})",
                    id, target, position, attempt, BUS_ATTEMPTS
                ),
                Err(e) => debug!("Servo {} target not confirmed: {}", id, e),
            }
        }
        warn!(
            "Servo {} did not confirm target {} after {} attempts",
            id, position, BUS_ATTEMPTS
        );
        Ok(())
    }

    pub fn move_stop(&mut self, id: u8) -> Result<()> {
        self.send_packet(&build_packet(id, Command::MoveStop, &[]))
    }

    pub fn set_angle_limit(&mut self, id: u8, min: u16, max: u16) -> Result<()> {
        let [a0, a1] = min.to_le_bytes();
        let [b0, b1] = max.to_le_bytes();
        self.send_packet(&build_packet(id, Command::AngleLimitWrite, &[a0, a1, b0, b1]))
    }

    /// Load (hold position) or unload the motor. No reply.
    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        debug!("Servo {}: torque {}", id, if enabled { "on" } else { "off" });
        self.send_packet(&build_packet(id, Command::LoadOrUnloadWrite, &[enabled as u8]))
    }

    /// The LED is active-low on the wire
    pub fn set_led(&mut self, id: u8, on: bool) -> Result<()> {
        self.send_packet(&build_packet(id, Command::LedCtrlWrite, &[!on as u8]))
    }

    // === Reads ===

    /// Target position and rate of the last move command
    pub fn read_target(&mut self, id: u8) -> Result<(u16, u16)> {
        self.request_u16_pair(id, Command::MoveTimeRead)
    }

    /// Present position; may be negative past the low end
    pub fn read_position(&mut self, id: u8) -> Result<i16> {
        let payload = self.request(id, Command::PosRead, 2)?;
        Ok(i16::from_le_bytes([payload[0], payload[1]]))
    }

    /// Temperature in Celsius
    pub fn read_temperature(&mut self, id: u8) -> Result<u8> {
        Ok(self.request(id, Command::TempRead, 1)?[0])
    }

    /// Supply voltage in mV
    pub fn read_voltage(&mut self, id: u8) -> Result<u16> {
        let payload = self.request(id, Command::VinRead, 2)?;
        Ok(u16::from_le_bytes([payload[0], payload[1]]))
    }

    pub fn read_angle_limit(&mut self, id: u8) -> Result<(u16, u16)> {
        self.request_u16_pair(id, Command::AngleLimitRead)
    }

    pub fn read_torque(&mut self, id: u8) -> Result<bool> {
        Ok(self.request(id, Command::LoadOrUnloadRead, 1)?[0] == 1)
    }

    pub fn read_led(&mut self, id: u8) -> Result<bool> {
        Ok(self.request(id, Command::LedCtrlRead, 1)?[0] == 0)
    }
}
