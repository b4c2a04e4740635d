// File-based channels to the console and sensor processes
//
// Every channel is a single line rewritten in place by another process. Reads
// are best-effort: a missing or partial line is retried a few times and then
// replaced by a safe default.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RobotConfig;
use crate::messages::{CommandRecord, FootContact, Orientation};

/// Source of operator commands
pub trait CommandSource {
    /// Latest command, or `None` when nothing usable is pending
    fn poll(&mut self) -> Option<CommandRecord>;
}

/// Source of foot contact and body orientation
pub trait FeedbackSource {
    fn foot_contact(&mut self) -> FootContact;
    fn orientation(&mut self) -> Orientation;
}

fn read_first_line(path: &Path) -> std::io::Result<String> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().next().unwrap_or_default().to_string())
}

/// Polls the movement command file
#[derive(Debug, Clone)]
pub struct FileCommands {
    path: PathBuf,
}

impl FileCommands {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CommandSource for FileCommands {
    fn poll(&mut self) -> Option<CommandRecord> {
        let line = match read_first_line(&self.path) {
            Ok(line) => line,
            Err(e) => {
                debug!("Command file {} unreadable: {}", self.path.display(), e);
                return None;
            }
        };
        match line.parse() {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Ignoring command line '{}': {}", line, e);
                None
            }
        }
    }
}

/// Reads the contact and orientation files written by the sensor processes
#[derive(Debug, Clone)]
pub struct FileFeedback {
    contact_path: PathBuf,
    orientation_path: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl FileFeedback {
    pub fn new(contact_path: impl Into<PathBuf>, orientation_path: impl Into<PathBuf>) -> Self {
        Self {
            contact_path: contact_path.into(),
            orientation_path: orientation_path.into(),
            attempts: 3,
            retry_delay: Duration::from_millis(10),
        }
    }

    pub fn from_config(config: &RobotConfig) -> Self {
        Self {
            attempts: config.feedback.read_attempts.max(1),
            retry_delay: Duration::from_millis(config.feedback.read_retry_ms),
            ..Self::new(&config.files.contact, &config.files.orientation)
        }
    }

    fn read_with_retry<T>(&self, path: &Path, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        for attempt in 1..=self.attempts {
            match read_first_line(path) {
                Ok(line) => match parse(&line) {
                    Some(value) => return Some(value),
                    None => debug!(
                        "Malformed line '{}' in {} (attempt {}/{})",
                        line,
                        path.display(),
                        attempt,
                        self.attempts
                    ),
                },
                Err(e) => debug!(
                    "Cannot read {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    self.attempts,
                    e
                ),
            }
            if attempt < self.attempts {
                sleep(self.retry_delay);
            }
        }
        None
    }
}

impl FeedbackSource for FileFeedback {
    fn foot_contact(&mut self) -> FootContact {
        self.read_with_retry(&self.contact_path, FootContact::parse)
            .unwrap_or_else(|| {
                warn!(
                    "No valid contact reading in {}, assuming all legs grounded",
                    self.contact_path.display()
                );
                FootContact::ALL_GROUNDED
            })
    }

    fn orientation(&mut self) -> Orientation {
        self.read_with_retry(&self.orientation_path, Orientation::parse)
            .unwrap_or_else(|| {
                warn!(
                    "No valid orientation in {}, assuming level",
                    self.orientation_path.display()
                );
                Orientation::default()
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// Feedback that replays queued contact readings, then reports all grounded
    #[derive(Debug, Default)]
    pub struct ScriptedFeedback {
        pub contacts: VecDeque<FootContact>,
        orientation: Orientation,
    }

    impl ScriptedFeedback {
        pub fn grounded() -> Self {
            Self::default()
        }

        pub fn with_contacts(lines: &[&str]) -> Self {
            Self {
                contacts: lines
                    .iter()
                    .map(|line| FootContact::parse(line).unwrap())
                    .collect(),
                ..Self::default()
            }
        }

        pub fn tilted(mut self, pitch: f64, roll: f64) -> Self {
            self.orientation = Orientation { pitch, roll };
            self
        }
    }

    impl FeedbackSource for ScriptedFeedback {
        fn foot_contact(&mut self) -> FootContact {
            self.contacts.pop_front().unwrap_or(FootContact::ALL_GROUNDED)
        }

        fn orientation(&mut self) -> Orientation {
            self.orientation
        }
    }

    /// Command source fed from a queue; empty polls return `None`
    #[derive(Debug, Default)]
    pub struct QueuedCommands {
        pub queue: VecDeque<CommandRecord>,
    }

    impl QueuedCommands {
        pub fn new(lines: &[&str]) -> Self {
            Self {
                queue: lines.iter().map(|line| line.parse().unwrap()).collect(),
            }
        }
    }

    impl CommandSource for QueuedCommands {
        fn poll(&mut self) -> Option<CommandRecord> {
            self.queue.pop_front()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::position::LegId;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("scarab-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_poll_command_file() {
        let path = temp_file("cmd.txt", "7,up,400\n");
        let mut commands = FileCommands::new(&path);
        let record = commands.poll().unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.command, "up");
        assert_eq!(record.speed, 400);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_malformed_command_is_no_command() {
        let path = temp_file("bad-cmd.txt", "7,up\n");
        assert_eq!(FileCommands::new(&path).poll(), None);
        assert_eq!(FileCommands::new("/nonexistent/cmd.txt").poll(), None);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_contact_file() {
        let contact = temp_file("contact.txt", "110111,0\n");
        let orientation = temp_file("orientation.txt", "1.5,-3.25\n");
        let mut feedback = FileFeedback::new(&contact, &orientation);

        let reading = feedback.foot_contact();
        assert!(!reading.is_grounded(LegId::BackRight));
        assert_eq!(reading.grounded_count(), 5);

        let tilt = feedback.orientation();
        assert_eq!(tilt.pitch, 1.5);
        assert_eq!(tilt.roll, -3.25);

        fs::remove_file(contact).ok();
        fs::remove_file(orientation).ok();
    }

    #[test]
    fn test_missing_feedback_defaults() {
        let mut feedback = FileFeedback::new("/nonexistent/contact", "/nonexistent/orientation");
        feedback.retry_delay = Duration::ZERO;
        assert_eq!(feedback.foot_contact(), FootContact::ALL_GROUNDED);
        assert_eq!(feedback.orientation(), Orientation::default());
    }

    #[test]
    fn test_short_contact_defaults() {
        let contact = temp_file("short-contact.txt", "1101\n");
        let mut feedback = FileFeedback::new(&contact, "/nonexistent/orientation");
        feedback.retry_delay = Duration::ZERO;
        assert_eq!(feedback.foot_contact(), FootContact::ALL_GROUNDED);
        fs::remove_file(contact).ok();
    }
}
