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

//! # videocall-adaptive
//!
//! The control core of an adaptive real-time video session:
//!
//! - [`JitterBuffer`] reorders decoded frames and releases them after an
//!   adaptive playout delay.
//! - [`QosMonitor`] turns ping/pong round trips and packet sequence numbers
//!   into a [`QosMetrics`] snapshot and a discrete [`StreamingMode`].
//! - [`BitrateController`] steers the encoder's target bitrate from reported
//!   packet loss.
//!
//! None of the components perform I/O. Each guards its state with a single
//! mutex, so producers and consumers on different threads can share them
//! through an [`AdaptiveSession`].

pub mod bitrate_controller;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod jitter_buffer;
mod notify;
pub mod qos_monitor;
pub mod session;
pub mod streaming_mode;

pub use bitrate_controller::{
    BitrateAction, BitrateController, BitrateSink, BitrateStats, EncoderControl,
    EncoderControlSender,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BitrateConfig, JitterBufferConfig, QosConfig, SessionConfig};
pub use diagnostics::{DiagEvent, DiagnosticsBus, Metric, MetricValue};
pub use error::{ControlError, Result};
pub use frame::BufferedFrame;
pub use jitter_buffer::{JitterBuffer, JitterBufferStats};
pub use qos_monitor::{QosMonitor, QosStats};
pub use session::{AdaptiveSession, SessionBuilder, SessionStats};
pub use streaming_mode::{QosMetrics, StreamingMode};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a component mutex, recovering the guard if a holder panicked.
///
/// Component state is counters and collections that are never left
/// half-updated across a panic point, so the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
