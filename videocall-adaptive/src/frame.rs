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

//! The per-frame record kept by the jitter buffer.

use web_time::{Duration, Instant};

/// A decoded frame waiting for playout.
///
/// `F` is the caller's handle to the decoded picture (typically an `Arc`);
/// the buffer never looks inside it.
#[derive(Debug, Clone)]
pub struct BufferedFrame<F> {
    /// The caller's handle to the decoded frame.
    pub handle: F,
    /// When the source captured the frame, mapped onto the local clock.
    pub capture_timestamp: Instant,
    /// When the frame was enqueued locally.
    pub receive_timestamp: Instant,
    /// Source-assigned, strictly increasing.
    pub sequence_number: u64,
}

impl<F> BufferedFrame<F> {
    pub fn new(
        handle: F,
        capture_timestamp: Instant,
        receive_timestamp: Instant,
        sequence_number: u64,
    ) -> Self {
        Self {
            handle,
            capture_timestamp,
            receive_timestamp,
            sequence_number,
        }
    }

    /// Time spent in the buffer so far.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.receive_timestamp)
    }

    /// Capture-to-now delay.
    pub fn end_to_end_delay(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.capture_timestamp)
    }

    pub fn into_handle(self) -> F {
        self.handle
    }
}
