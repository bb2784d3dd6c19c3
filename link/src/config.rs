//! Construction-time configuration.
//!
//! Every field has a default, so a YAML file only needs to name what it
//! changes:
//!
//! ```yaml
//! device:
//!   data_rate: 5Mbps
//!   mtu: 1500
//! queue:
//!   limit:
//!     packets: 100
//! delay:
//!   model: constant_speed
//!   speed: 299792458.0
//! medium:
//!   lookahead: 0.002
//! ```
//!
//! Durations are written in (fractional) seconds.

use crate::{
    error_model::{Corruption, ListErrorModel, RateErrorModel},
    mobility::{ConstantSpeed, FixedDelay, PropagationDelay, RandomDelay, SPEED_OF_LIGHT},
    queue::Limit,
    Error,
};
use serde::{Deserialize, Serialize};
use std::{fmt, fs::File, path::Path, str::FromStr, time::Duration};

/// Transmission speed of an endpoint, in bits per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    /// A rate of `bps` bits per second.
    pub fn new(bps: u64) -> Result<Self, Error> {
        if bps == 0 {
            return Err(Error::ZeroDataRate);
        }
        Ok(Self(bps))
    }

    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Time needed to put `bytes` on the wire (rounded up to the next
    /// nanosecond).
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        let bits = bytes as u128 * 8;
        let nanos = (bits * 1_000_000_000).div_ceil(self.0 as u128);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Default for DataRate {
    fn default() -> Self {
        Self(32_768)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

impl FromStr for DataRate {
    type Err = Error;

    /// Parse strings such as `32768`, `32768b/s`, `5Mbps`, `1.5Gb/s` or
    /// `10KBps` (a capital `B` counts bytes).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidDataRate(s.to_string());
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let multiplier = if unit.is_empty() {
            1.0
        } else {
            let unit = unit
                .strip_suffix("ps")
                .or_else(|| unit.strip_suffix("/s"))
                .ok_or_else(invalid)?;
            let (prefix, width) = match unit.chars().last() {
                Some('b') => (&unit[..unit.len() - 1], 1.0),
                Some('B') => (&unit[..unit.len() - 1], 8.0),
                _ => return Err(invalid()),
            };
            let scale = match prefix.to_ascii_lowercase().as_str() {
                "" => 1.0,
                "k" => 1e3,
                "m" => 1e6,
                "g" => 1e9,
                _ => return Err(invalid()),
            };
            scale * width
        };

        let bps = (value * multiplier).round();
        if !bps.is_finite() || bps > u64::MAX as f64 {
            return Err(invalid());
        }
        Self::new(bps as u64)
    }
}

impl TryFrom<String> for DataRate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(rate: DataRate) -> Self {
        rate.to_string()
    }
}

/// (De)serialize a [Duration] as fractional seconds.
mod seconds {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Per-endpoint transmit parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub data_rate: DataRate,
    pub mtu: u16,
    #[serde(with = "seconds")]
    pub interframe_gap: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            data_rate: DataRate::default(),
            mtu: 1500,
            interframe_gap: Duration::ZERO,
        }
    }
}

/// Transmit queue of every endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub limit: Limit,
}

/// Propagation delay model of the medium.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DelayConfig {
    ConstantSpeed {
        speed: f64,
    },
    Fixed {
        #[serde(with = "seconds")]
        delay: Duration,
    },
    Random {
        #[serde(with = "seconds")]
        min: Duration,
        #[serde(with = "seconds")]
        max: Duration,
        seed: u64,
    },
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self::ConstantSpeed {
            speed: SPEED_OF_LIGHT,
        }
    }
}

impl DelayConfig {
    pub fn build(&self) -> Result<Box<dyn PropagationDelay>, Error> {
        let model: Box<dyn PropagationDelay> = match *self {
            Self::ConstantSpeed { speed } => Box::new(ConstantSpeed::new(speed)?),
            Self::Fixed { delay } => Box::new(FixedDelay(delay)),
            Self::Random { min, max, seed } => Box::new(RandomDelay::new(min, max, seed)?),
        };
        Ok(model)
    }
}

/// Receive error model installed on every endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ErrorModelConfig {
    #[default]
    None,
    Rate {
        rate: f64,
        seed: u64,
    },
    List {
        frames: Vec<u64>,
    },
}

impl ErrorModelConfig {
    /// Build the configured model. Seeds are offset by `salt` so every
    /// endpoint draws an independent stream.
    pub fn build(&self, salt: u64) -> Result<Option<Box<dyn Corruption>>, Error> {
        let model: Box<dyn Corruption> = match self {
            Self::None => return Ok(None),
            Self::Rate { rate, seed } => {
                Box::new(RateErrorModel::new(*rate, seed.wrapping_add(salt))?)
            }
            Self::List { frames } => Box::new(ListErrorModel::new(frames.iter().copied())),
        };
        Ok(Some(model))
    }
}

/// Medium-wide parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// Minimum delay between a transmission and its remote arrival.
    #[serde(with = "seconds")]
    pub lookahead: Duration,
}

/// Everything needed to build a [crate::Simulation].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub queue: QueueConfig,
    pub delay: DelayConfig,
    pub error_model: ErrorModelConfig,
    pub medium: MediumConfig,
}

impl Config {
    /// Load a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
