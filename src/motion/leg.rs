// One leg: a foot point and the joint angles derived from it

use super::geometry::{FootPoint, Geometry, ReachError};
use super::position::{LegAngles, LegId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leg {
    id: LegId,
    foot: FootPoint,
    angles: LegAngles,
}

impl Leg {
    pub fn new(id: LegId, foot: FootPoint, geometry: &Geometry) -> Result<Self, ReachError> {
        let angles = geometry.solve(foot)?;
        Ok(Self { id, foot, angles })
    }

    /// Rebuild a leg from kinematic angles by way of its foot point
    pub fn from_angles(
        id: LegId,
        angles: &LegAngles,
        geometry: &Geometry,
    ) -> Result<Self, ReachError> {
        Self::new(id, geometry.unsolve(angles), geometry)
    }

    pub fn id(&self) -> LegId {
        self.id
    }

    pub fn foot(&self) -> FootPoint {
        self.foot
    }

    pub fn angles(&self) -> &LegAngles {
        &self.angles
    }

    /// Move the foot by a delta. On error the leg is left untouched.
    pub fn move_end_point(
        &mut self,
        dx: f64,
        dy: f64,
        dz: f64,
        geometry: &Geometry,
    ) -> Result<(), ReachError> {
        let target = self.foot.offset(dx, dy, dz);
        let angles = geometry.solve(target)?;
        self.foot = target;
        self.angles = angles;
        Ok(())
    }

    /// Move the mount point (the body) by a delta while the foot stays planted
    pub fn move_mount_point(
        &mut self,
        dx: f64,
        dy: f64,
        dz: f64,
        geometry: &Geometry,
    ) -> Result<(), ReachError> {
        self.move_end_point(-dx, -dy, -dz, geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AngleLimits, LegDimensions};

    fn geometry() -> Geometry {
        Geometry::new(LegDimensions::default(), AngleLimits::default())
    }

    #[test]
    fn test_move_end_point_recomputes_angles() {
        let geometry = geometry();
        let mut leg = Leg::new(LegId::FrontRight, FootPoint::new(10.0, 10.0, -10.0), &geometry).unwrap();
        let before = *leg.angles();

        leg.move_end_point(2.0, 0.0, 1.0, &geometry).unwrap();

        assert_eq!(leg.foot(), FootPoint::new(12.0, 10.0, -9.0));
        assert_eq!(*leg.angles(), geometry.solve(leg.foot()).unwrap());
        assert_ne!(*leg.angles(), before);
    }

    #[test]
    fn test_mount_point_moves_foot_backwards() {
        let geometry = geometry();
        let mut leg = Leg::new(LegId::MiddleLeft, FootPoint::new(0.0, -13.0, -10.0), &geometry).unwrap();

        leg.move_mount_point(3.0, -1.0, 2.0, &geometry).unwrap();

        assert_eq!(leg.foot(), FootPoint::new(-3.0, -12.0, -12.0));
    }

    #[test]
    fn test_unreachable_move_rolls_back() {
        let geometry = geometry();
        let mut leg = Leg::new(LegId::BackLeft, FootPoint::new(-10.0, -10.0, -10.0), &geometry).unwrap();
        let before = leg;

        let result = leg.move_end_point(-30.0, 0.0, 0.0, &geometry);

        assert!(matches!(result, Err(ReachError::TooFar { .. })));
        assert_eq!(leg, before);
    }

    #[test]
    fn test_from_angles_recovers_foot() {
        let geometry = geometry();
        let leg = Leg::new(LegId::BackRight, FootPoint::new(-10.0, 10.0, -10.0), &geometry).unwrap();
        let rebuilt = Leg::from_angles(LegId::BackRight, leg.angles(), &geometry).unwrap();

        assert!(rebuilt.foot().distance(&leg.foot()) < 0.02);
    }
}
