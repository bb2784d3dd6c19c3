//! Predicates that decide whether a received frame is corrupt.

use crate::Error;
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeSet;

/// Decides, per received frame, whether it arrived corrupted (and must be
/// dropped).
pub trait Corruption {
    fn is_corrupt(&mut self, frame: &Bytes) -> bool;
}

/// Corrupts each frame independently with probability `rate`.
pub struct RateErrorModel {
    rate: f64,
    rng: StdRng,
}

impl RateErrorModel {
    pub fn new(rate: f64, seed: u64) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::InvalidErrorRate(rate));
        }
        Ok(Self {
            rate,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Corruption for RateErrorModel {
    fn is_corrupt(&mut self, _frame: &Bytes) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

/// Corrupts the frames at the given (0-based) positions in receive order.
#[derive(Clone, Debug, Default)]
pub struct ListErrorModel {
    corrupt: BTreeSet<u64>,
    seen: u64,
}

impl ListErrorModel {
    pub fn new(corrupt: impl IntoIterator<Item = u64>) -> Self {
        Self {
            corrupt: corrupt.into_iter().collect(),
            seen: 0,
        }
    }
}

impl Corruption for ListErrorModel {
    fn is_corrupt(&mut self, _frame: &Bytes) -> bool {
        let index = self.seen;
        self.seen += 1;
        self.corrupt.contains(&index)
    }
}
