// Movement executor: poll loop with bounded retries
// Commands are expanded into moves, every move is replayed against the tracked
// position and its snapshots are paced out to the servos one by one.
// Cancellation is only observed between moves, never mid-send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;

use tracing::{debug, error, info, warn};

// local imports
use crate::channels::{CommandSource, FeedbackSource, FileCommands, FileFeedback};
use crate::config::{IDLE_POLL, MAX_SPEED, MOVE_ATTEMPTS, RobotConfig};
use crate::motion::geometry::Geometry;
use crate::motion::kinematics::{Kinematics, MotionFault};
use crate::motion::position::{MoveType, ServoPosition, Snapshot};
use crate::motion::sequencer::{Command, Move, Replayer, expand};
use crate::servo::{Actuator, BusError, DryRun, ServoDriver};

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error(transparent)]
    Motion(#[from] MotionFault),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("move '{tag}' failed {attempts} times, last: {fault}")]
    Exhausted {
        tag: &'static str,
        attempts: u32,
        fault: MotionFault,
    },

    #[error("servo bus: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorPhase {
    Idle,
    Dispatching,
    Stepping,
    Retrying,
    Aborted,
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Handled,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorState {
    /// Last committed servo-frame position
    pub position: ServoPosition,
    pub speed: u32,
    pub last_command_id: Option<u64>,
    pub phase: ExecutorPhase,
}

pub struct MovementExecutor<A, F, C> {
    config: RobotConfig,
    geometry: Geometry,
    actuator: A,
    feedback: F,
    commands: C,
    state: ExecutorState,
    cancel: Arc<AtomicBool>,
}

impl<A, F, C> MovementExecutor<A, F, C>
where
    A: Actuator,
    F: FeedbackSource,
    C: CommandSource,
{
    /// Executor tracking the neutral stance
    pub fn new(config: RobotConfig, actuator: A, feedback: F, commands: C) -> Result<Self, MotionFault> {
        let geometry = Geometry::new(config.leg, config.limits);
        let position = Kinematics::neutral(&geometry, &config)?.current_position();
        let speed = config.speed.default;

        Ok(Self {
            config,
            geometry,
            actuator,
            feedback,
            commands,
            state: ExecutorState {
                position,
                speed,
                last_command_id: None,
                phase: ExecutorPhase::Idle,
            },
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    /// Flag that stops the loop at the next move boundary
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Poll until `exit` or cancellation
    pub fn run(&mut self) {
        info!(
            "Movement executor started: speed {}, {}ms idle poll",
            self.state.speed,
            IDLE_POLL.as_millis()
        );

        while !self.cancelled() {
            match self.poll_once() {
                Tick::Idle => sleep(IDLE_POLL),
                Tick::Handled => {}
                Tick::Exit => {
                    info!("Exit command received");
                    break;
                }
            }
        }

        info!("Movement executor stopped");
    }

    /// Read and handle at most one command
    pub fn poll_once(&mut self) -> Tick {
        let Some(record) = self.commands.poll() else {
            return Tick::Idle;
        };
        let command = Command::parse(&record.command);

        // Same id again: already done, unless the operator is holding a key
        if self.state.last_command_id == Some(record.id) && !command.is_continuous() {
            return Tick::Idle;
        }
        self.state.last_command_id = Some(record.id);

        match command {
            Command::Exit => return Tick::Exit,
            Command::Idle => return Tick::Idle,
            Command::DisableTorque => {
                if let Err(e) = self.actuator.disable_torque() {
                    error!("Failed to disable torque: {}", e);
                }
                return Tick::Handled;
            }
            _ => {}
        }

        self.update_speed(record.speed);
        info!("Command {}: '{}' at speed {}", record.id, command, self.state.speed);

        match self.execute(&command) {
            Ok(()) => debug!("Command {} '{}' done", record.id, command),
            Err(e) => {
                self.state.phase = ExecutorPhase::Aborted;
                error!("Command {} '{}' dropped: {}", record.id, command, e);
            }
        }
        self.state.phase = ExecutorPhase::Idle;
        Tick::Handled
    }

    fn update_speed(&mut self, speed: u32) {
        if speed == self.state.speed {
            return;
        }
        if speed > MAX_SPEED {
            warn!(
                "Speed {} above {}, keeping {}",
                speed, MAX_SPEED, self.state.speed
            );
            return;
        }
        info!("Speed set to {}", speed);
        self.state.speed = speed;
    }

    fn execute(&mut self, command: &Command) -> Result<(), CommandError> {
        self.state.phase = ExecutorPhase::Dispatching;
        let moves = expand(command, &self.config);
        debug!("'{}' expands to {} moves", command, moves.len());

        for mv in &moves {
            if self.cancelled() {
                warn!("Cancelled, skipping the rest of '{}'", command);
                break;
            }
            self.run_move(mv)?;
        }
        Ok(())
    }

    /// Run one move, correcting the body height between failed attempts
    fn run_move(&mut self, mv: &Move) -> Result<(), CommandError> {
        let mut attempt = 1;
        loop {
            self.state.phase = ExecutorPhase::Stepping;
            match self.step(mv) {
                Ok(()) => return Ok(()),
                Err(MoveError::Bus(e)) => return Err(CommandError::Bus(e)),
                Err(MoveError::Motion(fault)) => {
                    warn!(
                        "Move '{}' attempt {}/{} failed: {}",
                        mv.tag(),
                        attempt,
                        MOVE_ATTEMPTS,
                        fault
                    );
                    self.state.phase = ExecutorPhase::Retrying;
                    self.correct(&fault)?;

                    if attempt >= MOVE_ATTEMPTS {
                        return Err(CommandError::Exhausted {
                            tag: mv.tag(),
                            attempts: attempt,
                            fault,
                        });
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Replay a move from the tracked position and send its snapshots
    fn step(&mut self, mv: &Move) -> Result<(), MoveError> {
        let sequence = Replayer::new(&self.geometry, &self.config).replay(
            mv,
            &self.state.position,
            &mut self.feedback,
        )?;

        for snapshot in &sequence {
            self.send_snapshot(snapshot)?;
        }
        if let Some(last) = sequence.last() {
            self.state.position = last.angles;
        }
        Ok(())
    }

    /// Raise the body after a reach or coxa fault (lower it if that fails),
    /// lower it after an overextension
    fn correct(&mut self, fault: &MotionFault) -> Result<(), BusError> {
        let lift = self.config.moves.up_or_down_cm;
        let up = Move::body([0.0, 0.0, lift]);
        let down = Move::body([0.0, 0.0, -lift]);
        let plan = match fault {
            MotionFault::Distance { .. } => vec![down],
            MotionFault::Reach { .. } | MotionFault::Tetta { .. } => vec![up, down],
        };

        for correction in &plan {
            match self.step(correction) {
                Ok(()) => {
                    info!("Corrected body height with {:?}", correction);
                    return Ok(());
                }
                Err(MoveError::Bus(e)) => return Err(e),
                Err(MoveError::Motion(e)) => warn!("Corrective move failed: {}", e),
            }
        }
        Ok(())
    }

    fn send_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), BusError> {
        let speeds = self.config.speed;
        debug!("Sending {} snapshot: {}", snapshot.move_type, snapshot.angles);
        match snapshot.move_type {
            MoveType::Touch => {
                self.actuator
                    .send_touching(&snapshot.angles, speeds.touch, &mut self.feedback)
            }
            MoveType::Body => self.actuator.send_paced(&snapshot.angles, speeds.body),
            MoveType::Balance => self.actuator.send_paced(&snapshot.angles, speeds.balance),
            MoveType::Endpoint => self.actuator.send_paced(&snapshot.angles, self.state.speed),
        }
    }
}

/// Run the executor on a blocking thread until exit or Ctrl+C
async fn run_executor<A, F, C>(
    mut executor: MovementExecutor<A, F, C>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    A: Actuator + Send + 'static,
    F: FeedbackSource + Send + 'static,
    C: CommandSource + Send + 'static,
{
    let cancel = executor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current move");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    tokio::task::spawn_blocking(move || executor.run()).await?;
    Ok(())
}

pub async fn run(config: RobotConfig, dry_run: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config.validate()?;

    let commands = FileCommands::new(&config.files.command);
    let feedback = FileFeedback::from_config(&config);
    info!("Polling commands from {}", config.files.command.display());
    info!(
        "Reading contact from {}, orientation from {}",
        config.files.contact.display(),
        config.files.orientation.display()
    );

    if dry_run {
        info!("Dry run: servo output is only logged");
        let executor = MovementExecutor::new(config, DryRun::new(true), feedback, commands)?;
        run_executor(executor).await
    } else {
        let driver = ServoDriver::open(&config)?;
        let executor = MovementExecutor::new(config, driver, feedback, commands)?;
        run_executor(executor).await
    }
}
