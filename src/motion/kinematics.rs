// Kinematic body model
//
// Owns the six legs and an append-only history of committed snapshots. Every
// primitive mutates the legs and optionally commits a snapshot; the snapshot
// boundaries are what the executor paces servo output against.

use tracing::debug;

use super::geometry::{FootPoint, Geometry, ReachError, round_to};
use super::leg::Leg;
use super::position::{
    KinematicPosition, LegId, MoveType, ServoPosition, Snapshot, Tripod,
};
use crate::config::{Footprint, RobotConfig};
use crate::messages::FootContact;

/// Neighbouring legs on the same side of the body
const ADJACENT_LEGS: [(LegId, LegId); 4] = [
    (LegId::FrontRight, LegId::MiddleRight),
    (LegId::MiddleRight, LegId::BackRight),
    (LegId::BackLeft, LegId::MiddleLeft),
    (LegId::MiddleLeft, LegId::FrontLeft),
];

/// Leg order of the wave gait
pub const WAVE_ORDER: [LegId; 6] = [
    LegId::FrontRight,
    LegId::MiddleRight,
    LegId::BackRight,
    LegId::FrontLeft,
    LegId::MiddleLeft,
    LegId::BackLeft,
];

/// Leg pairs of the ripple gait, stepped in this order
const RIPPLE_PAIRS: [[LegId; 2]; 3] = [
    [LegId::FrontRight, LegId::BackLeft],
    [LegId::MiddleRight, LegId::FrontLeft],
    [LegId::BackRight, LegId::MiddleLeft],
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MotionFault {
    #[error("leg {leg}: {source}")]
    Reach {
        leg: LegId,
        #[source]
        source: ReachError,
    },

    #[error("coxa spread between legs {first} and {second} is {spread:.2}° (limit {limit:.2}°)")]
    Tetta {
        first: LegId,
        second: LegId,
        spread: f64,
        limit: f64,
    },

    #[error("leg {leg} would reach {extension:.2} cm below the ground (limit {limit:.2} cm)")]
    Distance {
        leg: LegId,
        extension: f64,
        limit: f64,
    },
}

/// Target for an absolute foot placement; unset axes keep their reference
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct AbsTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    // Height above the lowest foot
    pub z: Option<f64>,
}

/// Neutral foot points for a footprint of half-spacing `x` by `y`
fn stance_feet(config: &RobotConfig, footprint: Footprint) -> [FootPoint; 6] {
    let s = &config.stance;
    let z = -s.vertical;
    [
        FootPoint::new(footprint.x - s.x_offset, footprint.y - s.y_offset, z),
        FootPoint::new(-s.x_offset, footprint.y - s.y_offset + s.middle_leg_offset, z),
        FootPoint::new(-footprint.x - s.x_offset, footprint.y - s.y_offset, z),
        FootPoint::new(-footprint.x - s.x_offset, -footprint.y - s.y_offset, z),
        FootPoint::new(-s.x_offset, -footprint.y - s.y_offset - s.middle_leg_offset, z),
        FootPoint::new(footprint.x - s.x_offset, -footprint.y - s.y_offset, z),
    ]
}

/// Rotate a point about the body center, positive angles from x towards y
fn rotate(point: [f64; 2], angle_deg: f64) -> [f64; 2] {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    [
        point[0] * cos - point[1] * sin,
        point[0] * sin + point[1] * cos,
    ]
}

fn build_legs(
    mut make: impl FnMut(LegId) -> Result<Leg, MotionFault>,
) -> Result<[Leg; 6], MotionFault> {
    let [l1, l2, l3, l4, l5, l6] = LegId::ALL.map(&mut make);
    Ok([l1?, l2?, l3?, l4?, l5?, l6?])
}

pub struct Kinematics<'a> {
    geometry: &'a Geometry,
    config: &'a RobotConfig,
    legs: [Leg; 6],
    history: Vec<Snapshot>,
}

impl<'a> Kinematics<'a> {
    /// Engine in the configured neutral stance, with an empty history
    pub fn neutral(geometry: &'a Geometry, config: &'a RobotConfig) -> Result<Self, MotionFault> {
        let footprint = Footprint {
            x: config.stance.horizontal_x,
            y: config.stance.horizontal_y,
        };
        let feet = stance_feet(config, footprint);
        let legs = build_legs(|id| {
            Leg::new(id, feet[id.index()], geometry).map_err(|source| MotionFault::Reach { leg: id, source })
        })?;
        Ok(Self {
            geometry,
            config,
            legs,
            history: Vec::new(),
        })
    }

    /// Engine seeded from a committed servo-frame pose
    pub fn from_position(
        geometry: &'a Geometry,
        config: &'a RobotConfig,
        position: &ServoPosition,
    ) -> Result<Self, MotionFault> {
        let kinematic = position.to_kinematic();
        let legs = build_legs(|id| {
            Leg::from_angles(id, kinematic.leg(id), geometry)
                .map_err(|source| MotionFault::Reach { leg: id, source })
        })?;
        Ok(Self {
            geometry,
            config,
            legs,
            history: Vec::new(),
        })
    }

    pub fn history(&self) -> &[Snapshot] {
        &self.history
    }

    pub fn into_sequence(self) -> Vec<Snapshot> {
        self.history
    }

    pub fn leg(&self, leg: LegId) -> &Leg {
        &self.legs[leg.index()]
    }

    pub fn feet(&self) -> [FootPoint; 6] {
        self.legs.map(|leg| leg.foot())
    }

    pub fn kinematic_position(&self) -> KinematicPosition {
        KinematicPosition::from_legs(self.legs.map(|leg| *leg.angles()))
    }

    pub fn current_position(&self) -> ServoPosition {
        self.kinematic_position().to_servo()
    }

    /// Validate the current pose and append it to the history
    pub fn snapshot(&mut self, move_type: MoveType) -> Result<(), MotionFault> {
        let position = self.current_position();
        for (leg, angles) in position.iter() {
            self.geometry
                .check_limits(angles)
                .map_err(|source| MotionFault::Reach { leg, source })?;
        }
        self.check_tettas_of(&position)?;

        debug!("Snapshot '{}': {}", move_type, position);
        self.history.push(Snapshot {
            move_type,
            angles: position,
        });
        Ok(())
    }

    pub fn check_tettas(&self) -> Result<(), MotionFault> {
        self.check_tettas_of(&self.current_position())
    }

    fn check_tettas_of(&self, position: &ServoPosition) -> Result<(), MotionFault> {
        let limit = self.config.limits.tetta_spread;
        for (first, second) in ADJACENT_LEGS {
            let spread = (position.leg(first).tetta - position.leg(second).tetta).abs();
            if spread > limit {
                return Err(MotionFault::Tetta {
                    first,
                    second,
                    spread,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Move one foot by a delta, without committing
    pub fn move_leg_endpoint(&mut self, leg: LegId, delta: [f64; 3]) -> Result<(), MotionFault> {
        let [dx, dy, dz] = delta;
        self.legs[leg.index()]
            .move_end_point(dx, dy, dz, self.geometry)
            .map_err(|source| MotionFault::Reach { leg, source })
    }

    pub fn leg_movement(&mut self, leg: LegId, delta: [f64; 3]) -> Result<(), MotionFault> {
        self.move_leg_endpoint(leg, delta)?;
        self.snapshot(MoveType::Endpoint)
    }

    /// Move several feet by the same delta, then commit once
    pub fn legs_movement(&mut self, legs: &[LegId], delta: [f64; 3]) -> Result<(), MotionFault> {
        for &leg in legs {
            self.move_leg_endpoint(leg, delta)?;
        }
        self.snapshot(MoveType::Endpoint)
    }

    /// Place one foot at an absolute target; `z` is measured from the lowest foot
    pub fn move_leg_endpoint_abs(
        &mut self,
        leg: LegId,
        target: AbsTarget,
        commit: bool,
    ) -> Result<(), MotionFault> {
        let foot = self.leg(leg).foot();
        let min_z = self.lowest_foot_z();

        let x = target.x.unwrap_or(foot.x);
        let y = target.y.unwrap_or(foot.y);
        let z = target.z.unwrap_or(foot.z - min_z);
        let delta = [
            round_to(x - foot.x, 1),
            round_to(y - foot.y, 1),
            round_to(z - foot.z + min_z, 1),
        ];

        self.move_leg_endpoint(leg, delta)?;
        if commit {
            self.snapshot(MoveType::Endpoint)?;
        }
        Ok(())
    }

    /// Translate the body; every planted foot moves the opposite way
    pub fn body_movement(&mut self, delta: [f64; 3], commit: bool) -> Result<(), MotionFault> {
        if delta == [0.0; 3] {
            return Ok(());
        }

        let [dx, dy, dz] = delta;
        for leg in LegId::ALL {
            self.legs[leg.index()]
                .move_mount_point(dx, dy, dz, self.geometry)
                .map_err(|source| MotionFault::Reach { leg, source })?;
        }
        self.check_tettas()?;

        if commit {
            self.snapshot(MoveType::Body)?;
        }
        Ok(())
    }

    fn lowest_foot_z(&self) -> f64 {
        self.legs
            .iter()
            .map(|leg| leg.foot().z)
            .fold(f64::INFINITY, f64::min)
    }

    /// Body offset from the centroid of the feet, in x and y
    pub fn body_delta_xy(&self) -> [f64; 2] {
        let feet = self.feet();
        let n = feet.len() as f64;
        let avg_x = feet.iter().map(|f| f.x).sum::<f64>() / n;
        let avg_y = feet.iter().map(|f| f.y).sum::<f64>() / n;
        [
            round_to(-avg_x - self.config.stance.x_offset, 2),
            round_to(-avg_y - self.config.stance.y_offset, 2),
        ]
    }

    pub fn body_to_center(&mut self, commit: bool) -> Result<(), MotionFault> {
        let [dx, dy] = self.body_delta_xy();
        self.body_movement([-dx, -dy, 0.0], commit)
    }

    /// Center the body and restore the neutral height
    pub fn reset(&mut self) -> Result<(), MotionFault> {
        self.body_to_center(true)?;
        let height = -self.leg(LegId::FrontRight).foot().z;
        let dz = round_to(height - self.config.stance.vertical, 2);
        self.body_movement([0.0, 0.0, -dz], true)
    }

    /// Reset, then put the body down on the ground
    pub fn end(&mut self) -> Result<(), MotionFault> {
        self.reset()?;
        self.body_movement([0.0, 0.0, -self.config.stance.vertical], true)
    }

    /// Current footprint half-spacing, measured on legs 1, 3 and 6
    pub fn legs_offsets(&self) -> Footprint {
        let front_right = self.leg(LegId::FrontRight).foot();
        let back_right = self.leg(LegId::BackRight).foot();
        let front_left = self.leg(LegId::FrontLeft).foot();
        Footprint {
            x: round_to(((front_right.x - back_right.x) / 2.0).abs(), 1),
            y: round_to(((front_right.y - front_left.y) / 2.0).abs(), 1),
        }
    }

    /// Move every foot to the stance of the given footprint, one tripod at a time
    pub fn reposition_legs(&mut self, footprint: Footprint) -> Result<(), MotionFault> {
        let targets = stance_feet(self.config, footprint);
        let up = self.config.stance.leg_up;

        for group in [Tripod::Even, Tripod::Odd] {
            for leg in group.legs() {
                let foot = self.leg(leg).foot();
                let target = targets[leg.index()];
                self.move_leg_endpoint(leg, [target.x - foot.x, target.y - foot.y, up])?;
            }
            self.snapshot(MoveType::Endpoint)?;
            for leg in group.legs() {
                self.move_leg_endpoint(leg, [0.0, 0.0, -up])?;
            }
            self.snapshot(MoveType::Endpoint)?;
        }
        Ok(())
    }

    pub fn switch_mode(&mut self, footprint: Footprint) -> Result<(), MotionFault> {
        self.reset()?;
        let current = self.legs_offsets();
        if current != footprint {
            debug!(
                "Repositioning from {:?} to {:?}",
                current, footprint
            );
            self.reposition_legs(footprint)?;
        }
        Ok(())
    }

    /// One tripod lifts, steps by `leg_delta` and comes down, after the body
    /// has shifted by `body_delta` over all six feet
    pub fn phased_step(
        &mut self,
        group: Tripod,
        leg_delta: [f64; 2],
        body_delta: [f64; 2],
    ) -> Result<(), MotionFault> {
        let up = self.config.stance.leg_up;
        self.body_movement([body_delta[0], body_delta[1], 0.0], true)?;

        for leg in group.legs() {
            self.move_leg_endpoint(leg, [leg_delta[0], leg_delta[1], up])?;
        }
        self.snapshot(MoveType::Endpoint)?;

        for leg in group.legs() {
            self.move_leg_endpoint(leg, [0.0, 0.0, -up])?;
        }
        self.snapshot(MoveType::Endpoint)
    }

    /// Rotate the robot about its center
    ///
    /// Each tripod in turn steps its feet around the body center by `angle_deg`;
    /// the body then rotates over the planted feet, bringing them back to
    /// their original body-relative positions.
    pub fn turn(&mut self, angle_deg: f64) -> Result<(), MotionFault> {
        let up = self.config.stance.leg_up;

        for group in [Tripod::Even, Tripod::Odd] {
            for leg in group.legs() {
                let [dx, dy] = self.rotation_delta(leg, angle_deg);
                self.move_leg_endpoint(leg, [dx, dy, up])?;
            }
            self.snapshot(MoveType::Endpoint)?;
            for leg in group.legs() {
                self.move_leg_endpoint(leg, [0.0, 0.0, -up])?;
            }
            self.snapshot(MoveType::Endpoint)?;
        }

        for leg in LegId::ALL {
            let [dx, dy] = self.rotation_delta(leg, -angle_deg);
            self.move_leg_endpoint(leg, [dx, dy, 0.0])?;
        }
        self.check_tettas()?;
        self.snapshot(MoveType::Body)
    }

    /// Foot delta, in the leg frame, of rotating that foot about the body center
    fn rotation_delta(&self, leg: LegId, angle_deg: f64) -> [f64; 2] {
        let mount = self.config.body.mount(leg);
        let foot = self.leg(leg).foot();
        let [x, y] = rotate([mount[0] + foot.x, mount[1] + foot.y], angle_deg);
        [round_to(x - mount[0] - foot.x, 2), round_to(y - mount[1] - foot.y, 2)]
    }

    /// Legs step forward one at a time while the body creeps along
    pub fn wave_gait(&mut self) -> Result<(), MotionFault> {
        let step = self.config.moves.gait_step_cm;
        let up = self.config.stance.leg_up;
        let body_step = step / WAVE_ORDER.len() as f64;

        self.move_leg_endpoint(WAVE_ORDER[0], [step, 0.0, up])?;
        self.snapshot(MoveType::Endpoint)?;

        for pair in WAVE_ORDER.windows(2) {
            self.move_leg_endpoint(pair[0], [0.0, 0.0, -up])?;
            self.move_leg_endpoint(pair[1], [step, 0.0, up])?;
            self.body_movement([body_step, 0.0, 0.0], true)?;
        }

        self.move_leg_endpoint(WAVE_ORDER[5], [0.0, 0.0, -up])?;
        self.body_movement([body_step, 0.0, 0.0], true)
    }

    /// Opposite leg pairs step in turn, overlapping with the body shift
    pub fn ripple_gait(&mut self) -> Result<(), MotionFault> {
        let step = self.config.moves.gait_step_cm;
        let up = self.config.stance.leg_up;
        // Body shares per snapshot, summing to one full step
        let shares = [step / 6.0, step / 3.0, step / 3.0, step / 6.0];

        for (i, pair) in RIPPLE_PAIRS.iter().enumerate() {
            if i > 0 {
                for &leg in &RIPPLE_PAIRS[i - 1] {
                    self.move_leg_endpoint(leg, [0.0, 0.0, -up])?;
                }
            }
            for &leg in pair {
                self.move_leg_endpoint(leg, [step, 0.0, up])?;
            }
            self.body_movement([shares[i], 0.0, 0.0], false)?;
            self.snapshot(MoveType::Endpoint)?;
        }

        for &leg in &RIPPLE_PAIRS[2] {
            self.move_leg_endpoint(leg, [0.0, 0.0, -up])?;
        }
        self.body_movement([shares[3], 0.0, 0.0], false)?;
        self.snapshot(MoveType::Endpoint)
    }

    /// Lower one foot by `step`, refusing to push it more than the configured
    /// extension below the lowest other grounded foot
    pub fn extend_leg(
        &mut self,
        leg: LegId,
        step: f64,
        contact: &FootContact,
    ) -> Result<(), MotionFault> {
        let target_z = self.leg(leg).foot().z - step;
        let ground = LegId::ALL
            .into_iter()
            .filter(|&other| other != leg && contact.is_grounded(other))
            .map(|other| self.leg(other).foot().z)
            .reduce(f64::min);

        if let Some(ground) = ground {
            let extension = round_to(ground - target_z, 2);
            let limit = self.config.feedback.max_leg_extension_cm;
            if extension > limit {
                return Err(MotionFault::Distance {
                    leg,
                    extension,
                    limit,
                });
            }
        }
        self.move_leg_endpoint(leg, [0.0, 0.0, -step])
    }
}
