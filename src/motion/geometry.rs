// Leg geometry: foot point <-> joint angles for one leg, and the conversions
// between the kinematic frame and each physical servo's frame.
//
// A leg is a yaw joint (tetta) followed by a two-link planar arm: femur `a`
// driven by alpha, tibia `b` driven by beta. `d` is an optional horizontal
// offset between the yaw axis and the femur joint.

use std::cell::RefCell;
use std::collections::HashMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::position::{
    Joint, JointAngles, Kinematic, KinematicPosition, LegAngles, LegId, ServoPosition,
};
use crate::config::{AngleLimits, LegDimensions};

/// Planar solutions kept before the cache is flushed
const SOLVER_CACHE_CAPACITY: usize = 4096;

/// Mounting of each coxa servo: where its zero points in the leg-local frame
/// (degrees) and which way it turns
#[derive(Debug, Clone, Copy)]
struct TettaFrame {
    phase: f64,
    sign: f64,
}

const TETTA_FRAMES: [TettaFrame; 6] = [
    TettaFrame { phase: 45.0, sign: 1.0 },
    TettaFrame { phase: 90.0, sign: 1.0 },
    TettaFrame { phase: 135.0, sign: 1.0 },
    TettaFrame { phase: -135.0, sign: -1.0 },
    TettaFrame { phase: -90.0, sign: -1.0 },
    TettaFrame { phase: -45.0, sign: -1.0 },
];

/// A point in a leg's local frame, relative to its mount, in cm
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FootPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl FootPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn offset(self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    pub fn distance(&self, other: &FootPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReachError {
    #[error("target is {distance:.2} cm away, leg reaches {max:.2} cm")]
    TooFar { distance: f64, max: f64 },

    #[error("target is {distance:.2} cm away, inside the {min:.2} cm dead zone")]
    TooClose { distance: f64, min: f64 },

    #[error("{joint} at {angle:.2}° is outside [{min}, {max}]")]
    JointLimit {
        joint: Joint,
        angle: f64,
        min: f64,
        max: f64,
    },
}

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Wrap degrees into (-180, 180]
fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees % 360.0;
    if wrapped > 180.0 {
        wrapped - 360.0
    } else if wrapped <= -180.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

/// Two-link planar solve by the law of cosines
///
/// # Arguments
/// * `l` - Horizontal distance from the femur joint to the foot
/// * `dz` - Height of the foot relative to the femur joint
///
/// # Returns
/// `(alpha, beta)` in radians: femur elevation and knee bend (0 = straight)
fn planar_solve(a: f64, b: f64, l: f64, dz: f64) -> Result<(f64, f64), ReachError> {
    let distance = l.hypot(dz);
    if distance > a + b {
        return Err(ReachError::TooFar {
            distance,
            max: a + b,
        });
    }
    let min = (a - b).abs();
    if distance < min || distance == 0.0 {
        return Err(ReachError::TooClose { distance, min });
    }

    let alpha1 = ((a * a + distance * distance - b * b) / (2.0 * a * distance))
        .clamp(-1.0, 1.0)
        .acos();
    let beta1 = ((a * a + b * b - distance * distance) / (2.0 * a * b))
        .clamp(-1.0, 1.0)
        .acos();

    Ok((alpha1 + dz.atan2(l), PI - beta1))
}

/// Leg solver shared by all six legs, with a memo of planar solutions
#[derive(Debug)]
pub struct Geometry {
    dims: LegDimensions,
    limits: AngleLimits,
    cache: RefCell<HashMap<(i64, i64), Result<(f64, f64), ReachError>>>,
}

impl Geometry {
    pub fn new(dims: LegDimensions, limits: AngleLimits) -> Self {
        Self {
            dims,
            limits,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Foot point -> kinematic joint angles (radians, 4 decimals)
    pub fn solve(&self, foot: FootPoint) -> Result<LegAngles, ReachError> {
        let tetta = foot.y.atan2(foot.x);
        let mount_x = self.dims.d * tetta.cos();
        let mount_y = self.dims.d * tetta.sin();

        let l = round_to((foot.x - mount_x).hypot(foot.y - mount_y), 2);
        let dz = round_to(foot.z, 2);
        let (alpha, beta) = self.planar(l, dz)?;

        Ok(LegAngles::new(
            round_to(tetta, 4),
            round_to(alpha, 4),
            round_to(beta, 4),
        ))
    }

    /// Kinematic joint angles -> foot point (cm, 2 decimals)
    pub fn unsolve(&self, angles: &LegAngles) -> FootPoint {
        let LegDimensions { a, b, d } = self.dims;
        let reach = d + a * angles.alpha.cos() + b * (angles.alpha - angles.beta).cos();
        let height = a * angles.alpha.sin() + b * (angles.alpha - angles.beta).sin();

        FootPoint::new(
            round_to(reach * angles.tetta.cos(), 2),
            round_to(reach * angles.tetta.sin(), 2),
            round_to(height, 2),
        )
    }

    /// Check servo-frame angles against the configured joint limits
    pub fn check_limits(&self, servo: &LegAngles) -> Result<(), ReachError> {
        for joint in Joint::ALL {
            let limit = self.limits.for_joint(joint);
            let angle = servo.get(joint);
            if !limit.contains(angle) {
                return Err(ReachError::JointLimit {
                    joint,
                    angle,
                    min: limit.min,
                    max: limit.max,
                });
            }
        }
        Ok(())
    }

    pub fn cached_solutions(&self) -> usize {
        self.cache.borrow().len()
    }

    fn planar(&self, l: f64, dz: f64) -> Result<(f64, f64), ReachError> {
        let key = ((l * 100.0).round() as i64, (dz * 100.0).round() as i64);
        if let Some(hit) = self.cache.borrow().get(&key) {
            return hit.clone();
        }

        let result = planar_solve(self.dims.a, self.dims.b, l, dz);
        trace!("Planar solve l={} dz={} -> {:?}", l, dz, result);

        let mut cache = self.cache.borrow_mut();
        if cache.len() >= SOLVER_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(key, result.clone());
        result
    }
}

pub fn tetta_to_servo(leg: LegId, tetta: f64) -> f64 {
    let frame = TETTA_FRAMES[leg.index()];
    round_to(frame.sign * normalize_degrees(tetta.to_degrees() - frame.phase), 2)
}

pub fn tetta_to_kinematic(leg: LegId, degrees: f64) -> f64 {
    let frame = TETTA_FRAMES[leg.index()];
    round_to(normalize_degrees(frame.sign * degrees + frame.phase).to_radians(), 4)
}

pub fn alpha_to_servo(alpha: f64) -> f64 {
    round_to(alpha.to_degrees(), 2)
}

pub fn alpha_to_kinematic(degrees: f64) -> f64 {
    round_to(degrees.to_radians(), 4)
}

pub fn beta_to_servo(beta: f64) -> f64 {
    round_to(-beta.to_degrees(), 2)
}

pub fn beta_to_kinematic(degrees: f64) -> f64 {
    round_to((-degrees).to_radians(), 4)
}

pub fn leg_to_servo(leg: LegId, angles: &LegAngles) -> LegAngles {
    LegAngles::new(
        tetta_to_servo(leg, angles.tetta),
        alpha_to_servo(angles.alpha),
        beta_to_servo(angles.beta),
    )
}

pub fn leg_to_kinematic(leg: LegId, angles: &LegAngles) -> LegAngles {
    LegAngles::new(
        tetta_to_kinematic(leg, angles.tetta),
        alpha_to_kinematic(angles.alpha),
        beta_to_kinematic(angles.beta),
    )
}

impl JointAngles<Kinematic> {
    pub fn to_servo(&self) -> ServoPosition {
        ServoPosition::from_legs(LegId::ALL.map(|leg| leg_to_servo(leg, self.leg(leg))))
    }
}

impl ServoPosition {
    pub fn to_kinematic(&self) -> KinematicPosition {
        KinematicPosition::from_legs(LegId::ALL.map(|leg| leg_to_kinematic(leg, self.leg(leg))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(LegDimensions::default(), AngleLimits::default())
    }

    fn wrapped_diff_deg(a: f64, b: f64) -> f64 {
        normalize_degrees((a - b).to_degrees()).abs()
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-0.00004, 4), -0.0);
        assert_eq!(round_to(2.5, 0), 3.0);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(190.0), -170.0);
        assert_eq!(normalize_degrees(-180.0), 180.0);
        assert_eq!(normalize_degrees(180.0), 180.0);
        assert_eq!(normalize_degrees(725.0), 5.0);
    }

    #[test]
    fn test_solve_unsolve_inverse() {
        let geometry = geometry();
        for x in [-14.0, -7.5, 0.0, 6.0, 12.5] {
            for y in [-13.0, -4.0, 3.0, 10.0, 16.0] {
                for z in [-18.0, -10.0, -4.0, 2.0] {
                    let foot = FootPoint::new(x, y, z);
                    let Ok(angles) = geometry.solve(foot) else {
                        continue;
                    };
                    let back = geometry.unsolve(&angles);
                    assert!((back.x - x).abs() <= 0.02, "{:?} -> {:?}", foot, back);
                    assert!((back.y - y).abs() <= 0.02, "{:?} -> {:?}", foot, back);
                    assert!((back.z - z).abs() <= 0.02, "{:?} -> {:?}", foot, back);
                }
            }
        }
    }

    #[test]
    fn test_solve_neutral_foot() {
        let angles = geometry().solve(FootPoint::new(10.0, 10.0, -10.0)).unwrap();
        assert!((angles.tetta - PI / 4.0).abs() < 1e-4);
        // alpha = 55.8 - 35.3, beta = 180 - 80.9 (degrees)
        assert!((angles.alpha.to_degrees() - 20.5).abs() < 0.2);
        assert!((angles.beta.to_degrees() - 99.0).abs() < 0.2);
    }

    #[test]
    fn test_solve_out_of_reach() {
        let geometry = geometry();
        let err = geometry.solve(FootPoint::new(20.0, 20.0, -10.0)).unwrap_err();
        assert!(matches!(err, ReachError::TooFar { .. }));

        let err = geometry.solve(FootPoint::new(0.5, 0.5, -0.5)).unwrap_err();
        assert!(matches!(err, ReachError::TooClose { .. }));
    }

    #[test]
    fn test_planar_cache_hits() {
        let geometry = geometry();
        let first = geometry.solve(FootPoint::new(10.0, 10.0, -10.0)).unwrap();
        let second = geometry.solve(FootPoint::new(10.0, 10.0, -10.0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(geometry.cached_solutions(), 1);
    }

    #[test]
    fn test_neutral_headings_map_to_servo_zero() {
        let headings = [45.0, 90.0, 135.0, -135.0, -90.0, -45.0];
        for (leg, heading) in LegId::ALL.into_iter().zip(headings) {
            let servo = tetta_to_servo(leg, f64::to_radians(heading));
            assert!(servo.abs() < 0.01, "leg {} -> {}", leg, servo);
        }
    }

    #[test]
    fn test_servo_frame_round_trip_from_servo() {
        for leg in LegId::ALL {
            for tetta in [-85.0, -40.25, 0.0, 12.5, 89.99] {
                for (alpha, beta) in [(-70.0, -145.0), (0.0, -90.0), (20.51, -99.03), (90.0, 0.0)] {
                    let servo = LegAngles::new(tetta, alpha, beta);
                    let back = leg_to_servo(leg, &leg_to_kinematic(leg, &servo));
                    assert!((back.tetta - tetta).abs() <= 0.01, "leg {} {:?}", leg, back);
                    assert!((back.alpha - alpha).abs() <= 0.01);
                    assert!((back.beta - beta).abs() <= 0.01);
                }
            }
        }
    }

    #[test]
    fn test_servo_frame_round_trip_from_kinematic() {
        for leg in LegId::ALL {
            let heading = TETTA_FRAMES[leg.index()].phase;
            for offset in [-60.0, -5.0, 0.0, 33.3] {
                let kinematic = LegAngles::new(
                    round_to(f64::to_radians(heading + offset), 4),
                    round_to(f64::to_radians(20.5), 4),
                    round_to(f64::to_radians(99.0), 4),
                );
                let back = leg_to_kinematic(leg, &leg_to_servo(leg, &kinematic));
                assert!(wrapped_diff_deg(back.tetta, kinematic.tetta) <= 0.01);
                assert!(wrapped_diff_deg(back.alpha, kinematic.alpha) <= 0.01);
                assert!(wrapped_diff_deg(back.beta, kinematic.beta) <= 0.01);
            }
        }
    }

    #[test]
    fn test_joint_limits() {
        let geometry = geometry();
        assert!(geometry.check_limits(&LegAngles::new(0.0, 20.0, -99.0)).is_ok());

        let err = geometry
            .check_limits(&LegAngles::new(0.0, 20.0, -150.0))
            .unwrap_err();
        assert!(matches!(
            err,
            ReachError::JointLimit {
                joint: Joint::Beta,
                ..
            }
        ));
    }
}
