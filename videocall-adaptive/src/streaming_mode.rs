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

//! Discrete network-quality tiers and the thresholds that select them.

use serde::{Deserialize, Serialize};
use std::fmt;
use web_time::Instant;

// --- Classification thresholds (strictly greater-than) ---
const AUDIO_ONLY_RTT_MS: f64 = 800.0;
const AUDIO_ONLY_LOSS_PCT: f64 = 10.0;

const FREEZE_FRAME_RTT_MS: f64 = 400.0;
const FREEZE_FRAME_JITTER_MS: f64 = 60.0;
const FREEZE_FRAME_LOSS_PCT: f64 = 6.0;

const LOW_BANDWIDTH_RTT_MS: f64 = 200.0;
const LOW_BANDWIDTH_JITTER_MS: f64 = 30.0;
const LOW_BANDWIDTH_LOSS_PCT: f64 = 2.0;

/// Delivery mode the pipeline should operate in, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum StreamingMode {
    /// Full frame rate video.
    #[default]
    Normal,
    /// Reduced frame rate.
    LowBandwidth,
    /// Occasional still frames only.
    FreezeFrame,
    /// No video at all.
    AudioOnly,
}

impl StreamingMode {
    /// Frame rate the sender should target in this mode.
    pub fn target_fps(self) -> u32 {
        match self {
            StreamingMode::Normal => 30,
            StreamingMode::LowBandwidth => 15,
            StreamingMode::FreezeFrame => 1,
            StreamingMode::AudioOnly => 0,
        }
    }

    pub fn should_use_still_frames(self) -> bool {
        matches!(self, StreamingMode::FreezeFrame | StreamingMode::AudioOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamingMode::Normal => "normal",
            StreamingMode::LowBandwidth => "low_bandwidth",
            StreamingMode::FreezeFrame => "freeze_frame",
            StreamingMode::AudioOnly => "audio_only",
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of measured network quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosMetrics {
    pub rtt_ms: f64,
    /// Standard deviation of recent RTT samples.
    pub jitter_ms: f64,
    /// Packet loss as a percentage (0..=100).
    pub packet_loss_pct: f64,
    /// When this snapshot was computed.
    pub timestamp: Instant,
}

impl QosMetrics {
    /// Build a snapshot. Negative or NaN readings become zero and infinite
    /// ones saturate at `f64::MAX`.
    pub fn new(rtt_ms: f64, jitter_ms: f64, packet_loss_pct: f64, timestamp: Instant) -> Self {
        Self {
            rtt_ms: sanitize(rtt_ms),
            jitter_ms: sanitize(jitter_ms),
            packet_loss_pct: sanitize(packet_loss_pct),
            timestamp,
        }
    }

    /// Most severe mode whose thresholds this snapshot crosses.
    pub fn recommended_mode(&self) -> StreamingMode {
        let (rtt, jitter, loss) = (self.rtt_ms, self.jitter_ms, self.packet_loss_pct);

        if rtt > AUDIO_ONLY_RTT_MS || loss > AUDIO_ONLY_LOSS_PCT {
            StreamingMode::AudioOnly
        } else if rtt > FREEZE_FRAME_RTT_MS
            || jitter > FREEZE_FRAME_JITTER_MS
            || loss > FREEZE_FRAME_LOSS_PCT
        {
            StreamingMode::FreezeFrame
        } else if rtt > LOW_BANDWIDTH_RTT_MS
            || jitter > LOW_BANDWIDTH_JITTER_MS
            || loss > LOW_BANDWIDTH_LOSS_PCT
        {
            StreamingMode::LowBandwidth
        } else {
            StreamingMode::Normal
        }
    }
}

/// NaN and negative readings carry no information and become zero. An
/// unbounded reading stays the worst possible one.
fn sanitize(value: f64) -> f64 {
    if value.is_nan() || value <= 0.0 {
        0.0
    } else {
        value.min(f64::MAX)
    }
}
