//! Node positions and the propagation delay between them.
//!
//! Positions are always read at transmission time: nodes may move between
//! two frames, so nothing here is cached.

use crate::Error;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, SystemTime};

/// Speed of light in vacuum (meters per second).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Cartesian position (meters).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Source of a node's position over simulated time.
pub trait Mobility {
    fn position(&self, now: SystemTime) -> Position;
}

/// A node that never moves.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fixed(pub Position);

impl Mobility for Fixed {
    fn position(&self, _now: SystemTime) -> Position {
        self.0
    }
}

/// A node moving in a straight line at constant velocity (meters per
/// second) from `origin`, starting at `since`.
#[derive(Clone, Copy, Debug)]
pub struct ConstantVelocity {
    pub origin: Position,
    pub velocity: Position,
    pub since: SystemTime,
}

impl Mobility for ConstantVelocity {
    fn position(&self, now: SystemTime) -> Position {
        let elapsed = match now.duration_since(self.since) {
            Ok(elapsed) => elapsed.as_secs_f64(),
            Err(_) => return self.origin,
        };
        Position {
            x: self.origin.x + self.velocity.x * elapsed,
            y: self.origin.y + self.velocity.y * elapsed,
            z: self.origin.z + self.velocity.z * elapsed,
        }
    }
}

/// Time a signal takes to travel between two positions.
pub trait PropagationDelay {
    fn delay(&mut self, a: &Position, b: &Position) -> Duration;
}

/// Delay proportional to distance.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSpeed {
    speed: f64,
}

impl ConstantSpeed {
    /// Propagate at `speed` meters per second.
    pub fn new(speed: f64) -> Result<Self, Error> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(Error::InvalidSpeed(speed));
        }
        Ok(Self { speed })
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl Default for ConstantSpeed {
    fn default() -> Self {
        Self {
            speed: SPEED_OF_LIGHT,
        }
    }
}

impl PropagationDelay for ConstantSpeed {
    fn delay(&mut self, a: &Position, b: &Position) -> Duration {
        Duration::from_secs_f64(a.distance(b) / self.speed)
    }
}

/// The same delay regardless of distance.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedDelay(pub Duration);

impl PropagationDelay for FixedDelay {
    fn delay(&mut self, _a: &Position, _b: &Position) -> Duration {
        self.0
    }
}

/// A delay drawn uniformly from `[min, max]` for every transmission.
pub struct RandomDelay {
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl RandomDelay {
    pub fn new(min: Duration, max: Duration, seed: u64) -> Result<Self, Error> {
        if min > max {
            return Err(Error::InvalidDelayRange(min, max));
        }
        Ok(Self {
            min,
            max,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl PropagationDelay for RandomDelay {
    fn delay(&mut self, _a: &Position, _b: &Position) -> Duration {
        let nanos = self
            .rng
            .gen_range(self.min.as_nanos() as u64..=self.max.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::time::UNIX_EPOCH;

    #[test_traced]
    fn test_constant_speed() {
        let mut model = ConstantSpeed::default();
        let a = Position::new(0.01, 0.0, 0.0);
        let b = Position::new(190_000.0, 0.0, 0.0);
        let delay = model.delay(&a, &b);
        // 190km at the speed of light is ~633.8us
        assert!(delay > Duration::from_micros(633));
        assert!(delay < Duration::from_micros(634));

        let mut slow = ConstantSpeed::new(1_000.0).unwrap();
        assert_eq!(
            slow.delay(&Position::default(), &Position::new(3.0, 4.0, 0.0)),
            Duration::from_millis(5)
        );
        assert!(matches!(
            ConstantSpeed::new(0.0),
            Err(Error::InvalidSpeed(_))
        ));
    }

    #[test_traced]
    fn test_constant_velocity() {
        let mobility = ConstantVelocity {
            origin: Position::new(1.0, 0.0, 0.0),
            velocity: Position::new(2.0, -1.0, 0.0),
            since: UNIX_EPOCH + Duration::from_secs(1),
        };
        assert_eq!(mobility.position(UNIX_EPOCH), Position::new(1.0, 0.0, 0.0));
        assert_eq!(
            mobility.position(UNIX_EPOCH + Duration::from_secs(3)),
            Position::new(5.0, -2.0, 0.0)
        );
    }

    #[test_traced]
    fn test_random_delay_in_range() {
        let min = Duration::from_millis(1);
        let max = Duration::from_millis(3);
        let mut model = RandomDelay::new(min, max, 7).unwrap();
        for _ in 0..100 {
            let delay = model.delay(&Position::default(), &Position::default());
            assert!(delay >= min && delay <= max);
        }
        assert!(RandomDelay::new(max, min, 7).is_err());
    }
}
