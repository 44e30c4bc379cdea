/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Construction-time parameters for the three control loops.
//!
//! Defaults match the tuning the session pipeline ships with. Embedders that
//! keep their own settings can deserialize these structs directly; every
//! field is optional thanks to `#[serde(default)]`.

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::{ControlError, Result};

/// Durations travel as whole milliseconds, e.g. `"max_delay": 120`.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use web_time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Jitter buffer playout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterBufferConfig {
    /// Lower bound for the adaptive playout delay
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
    /// Upper bound for the adaptive playout delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Playout delay a fresh buffer starts with
    #[serde(with = "duration_ms")]
    pub target_delay: Duration,
    /// Frames that waited longer than this are never displayed
    #[serde(with = "duration_ms")]
    pub max_frame_age: Duration,
    /// Hard cap on buffered frames
    pub max_frames: usize,
    /// Early polls tolerated before the delay shrinks
    pub early_frames_before_shrink: u32,
    /// Late drops tolerated before the delay grows
    pub late_frames_before_grow: u32,
    /// Multiplier applied when shrinking the delay
    pub shrink_factor: f64,
    /// Multiplier applied when growing the delay
    pub grow_factor: f64,
    /// End-to-end delay above which a released frame is flagged
    #[serde(with = "duration_ms")]
    pub latency_warning: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(120),
            target_delay: Duration::from_millis(50),
            max_frame_age: Duration::from_millis(150),
            max_frames: 10,
            early_frames_before_shrink: 10,
            late_frames_before_grow: 5,
            shrink_factor: 0.9,
            grow_factor: 1.2,
            latency_warning: Duration::from_millis(200),
        }
    }
}

impl JitterBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_delay > self.max_delay {
            return Err(ControlError::invalid(format!(
                "min_delay ({:?}) exceeds max_delay ({:?})",
                self.min_delay, self.max_delay
            )));
        }
        if self.target_delay < self.min_delay || self.target_delay > self.max_delay {
            return Err(ControlError::invalid(format!(
                "target_delay ({:?}) outside [{:?}, {:?}]",
                self.target_delay, self.min_delay, self.max_delay
            )));
        }
        if self.max_frames == 0 {
            return Err(ControlError::invalid("max_frames must be at least 1"));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(ControlError::invalid(format!(
                "shrink_factor must be in (0, 1), got {}",
                self.shrink_factor
            )));
        }
        if !(self.grow_factor > 1.0 && self.grow_factor.is_finite()) {
            return Err(ControlError::invalid(format!(
                "grow_factor must be greater than 1, got {}",
                self.grow_factor
            )));
        }
        Ok(())
    }
}

/// QoS sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Minimum spacing between sampled recomputations
    #[serde(with = "duration_ms")]
    pub update_interval: Duration,
    /// Number of RTT samples kept for mean/jitter
    pub rtt_sample_capacity: usize,
    /// Outstanding pings never expire sooner than this
    #[serde(with = "duration_ms")]
    pub ping_timeout_floor: Duration,
    /// Outstanding pings expire after this many mean RTTs (if above the floor)
    pub ping_timeout_rtt_multiplier: f64,
    /// Hard cap on outstanding pings
    pub max_outstanding_pings: usize,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(2),
            rtt_sample_capacity: 10,
            ping_timeout_floor: Duration::from_secs(5),
            ping_timeout_rtt_multiplier: 4.0,
            max_outstanding_pings: 64,
        }
    }
}

impl QosConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rtt_sample_capacity == 0 {
            return Err(ControlError::invalid("rtt_sample_capacity must be at least 1"));
        }
        if self.max_outstanding_pings == 0 {
            return Err(ControlError::invalid("max_outstanding_pings must be at least 1"));
        }
        if !(self.ping_timeout_rtt_multiplier >= 1.0
            && self.ping_timeout_rtt_multiplier.is_finite())
        {
            return Err(ControlError::invalid(format!(
                "ping_timeout_rtt_multiplier must be at least 1, got {}",
                self.ping_timeout_rtt_multiplier
            )));
        }
        Ok(())
    }
}

/// Encoder bitrate control configuration. Rates are bits per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    pub initial_bitrate: u32,
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    /// Minimum spacing between adjustments
    #[serde(with = "duration_ms")]
    pub adjustment_interval: Duration,
    /// Loss rate (0..1) above which the sharp cut applies
    pub severe_loss: f64,
    /// Loss rate (0..1) from which the moderate cut applies
    pub moderate_loss: f64,
    /// Loss rate (0..1) below which the bitrate steps up
    pub low_loss: f64,
    pub severe_factor: f64,
    pub moderate_factor: f64,
    pub increase_factor: f64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 1_000_000,
            min_bitrate: 500_000,
            max_bitrate: 2_500_000,
            adjustment_interval: Duration::from_secs(2),
            severe_loss: 0.15,
            moderate_loss: 0.05,
            low_loss: 0.02,
            severe_factor: 0.7,
            moderate_factor: 0.85,
            increase_factor: 1.1,
        }
    }
}

impl BitrateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return Err(ControlError::invalid(format!(
                "bitrate bounds [{}, {}] are invalid",
                self.min_bitrate, self.max_bitrate
            )));
        }
        if self.initial_bitrate < self.min_bitrate || self.initial_bitrate > self.max_bitrate {
            return Err(ControlError::invalid(format!(
                "initial_bitrate {} outside [{}, {}]",
                self.initial_bitrate, self.min_bitrate, self.max_bitrate
            )));
        }
        if !(0.0 <= self.low_loss
            && self.low_loss <= self.moderate_loss
            && self.moderate_loss <= self.severe_loss
            && self.severe_loss <= 1.0)
        {
            return Err(ControlError::invalid(format!(
                "loss thresholds must satisfy 0 <= low ({}) <= moderate ({}) <= severe ({}) <= 1",
                self.low_loss, self.moderate_loss, self.severe_loss
            )));
        }
        for (name, factor) in [
            ("severe_factor", self.severe_factor),
            ("moderate_factor", self.moderate_factor),
        ] {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(ControlError::invalid(format!(
                    "{name} must be in (0, 1), got {factor}"
                )));
            }
        }
        if !(self.increase_factor > 1.0 && self.increase_factor.is_finite()) {
            return Err(ControlError::invalid(format!(
                "increase_factor must be greater than 1, got {}",
                self.increase_factor
            )));
        }
        Ok(())
    }
}

/// Everything an [`AdaptiveSession`](crate::AdaptiveSession) needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub jitter_buffer: JitterBufferConfig,
    pub qos: QosConfig,
    pub bitrate: BitrateConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.jitter_buffer.validate()?;
        self.qos.validate()?;
        self.bitrate.validate()
    }
}
