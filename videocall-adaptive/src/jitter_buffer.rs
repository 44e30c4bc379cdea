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

//! The JitterBuffer, which reorders decoded frames and releases them for
//! display after an adaptive playout delay.
//!
//! Producers call [`JitterBuffer::add_frame`] from the network-receive path;
//! a display driver polls [`JitterBuffer::get_next_frame`] at its own rate.
//! Each poll makes exactly one decision about the lowest-sequence frame:
//! hold it, drop it as too old, or release it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use web_time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::JitterBufferConfig;
use crate::diagnostics::DiagEvent;
use crate::frame::BufferedFrame;
use crate::{lock, metric, Result};

/// Counters describing what the buffer has done so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JitterBufferStats {
    pub frames_received: u64,
    pub frames_released: u64,
    /// Frames at or below the release gate, or already buffered.
    pub duplicates_dropped: u64,
    /// Every frame removed without being released (age, overflow or late).
    pub old_frames_dropped: u64,
    /// Subset of `old_frames_dropped` evicted to honor the frame cap.
    pub overflow_evictions: u64,
    /// Subset of `old_frames_dropped` dropped at the head while polling.
    pub late_frames_dropped: u64,
    /// Released frames whose end-to-end delay exceeded the warning threshold.
    pub latency_warnings: u64,
    pub buffered_frames: usize,
    pub current_delay_ms: f64,
    pub last_end_to_end_delay_ms: Option<f64>,
}

struct PlayoutState<F> {
    /// Sorted by sequence number; the first entry is the playout candidate.
    frames: BTreeMap<u64, BufferedFrame<F>>,
    current_delay: Duration,
    /// Highest sequence released so far. Anything at or below is stale.
    last_sequence_number: Option<u64>,
    consecutive_early_frames: u32,
    consecutive_late_frames: u32,
    stats: JitterBufferStats,
}

impl<F> PlayoutState<F> {
    fn new(config: &JitterBufferConfig) -> Self {
        Self {
            frames: BTreeMap::new(),
            current_delay: config.target_delay,
            last_sequence_number: None,
            consecutive_early_frames: 0,
            consecutive_late_frames: 0,
            stats: JitterBufferStats::default(),
        }
    }

    fn is_duplicate(&self, seq: u64) -> bool {
        self.last_sequence_number.is_some_and(|last| seq <= last) || self.frames.contains_key(&seq)
    }

    fn insert(&mut self, frame: BufferedFrame<F>, now: Instant, config: &JitterBufferConfig) {
        let seq = frame.sequence_number;
        if self.is_duplicate(seq) {
            log::debug!(
                "[JITTER_BUFFER] Ignoring duplicate or stale frame {} (last released: {:?})",
                seq,
                self.last_sequence_number
            );
            self.stats.duplicates_dropped += 1;
            return;
        }

        self.stats.frames_received += 1;
        self.frames.insert(seq, frame);
        self.evict(now, config);
    }

    fn evict(&mut self, now: Instant, config: &JitterBufferConfig) {
        let before = self.frames.len();
        self.frames.retain(|_, f| f.age(now) <= config.max_frame_age);
        let aged_out = (before - self.frames.len()) as u64;
        if aged_out > 0 {
            log::debug!(
                "[JITTER_BUFFER] Evicted {aged_out} frame(s) older than {:?}",
                config.max_frame_age
            );
            self.stats.old_frames_dropped += aged_out;
        }

        while self.frames.len() > config.max_frames {
            if let Some((seq, _)) = self.frames.pop_first() {
                log::debug!("[JITTER_BUFFER] Buffer over capacity, evicting frame {seq}");
                self.stats.old_frames_dropped += 1;
                self.stats.overflow_evictions += 1;
            }
        }
    }

    fn next_frame(&mut self, now: Instant, config: &JitterBufferConfig) -> Option<F> {
        let (time_in_buffer, seq) = {
            let (&seq, head) = self.frames.first_key_value()?;
            (head.age(now), seq)
        };

        if time_in_buffer < self.current_delay {
            self.consecutive_early_frames += 1;
            if self.consecutive_early_frames > config.early_frames_before_shrink {
                self.current_delay = self
                    .current_delay
                    .mul_f64(config.shrink_factor)
                    .max(config.min_delay);
                self.consecutive_early_frames = 0;
                log::debug!(
                    "[JITTER_BUFFER] Frames keep arriving early, playout delay now {:.2}ms",
                    ms(self.current_delay)
                );
            }
            return None;
        }

        if time_in_buffer > config.max_frame_age {
            self.frames.remove(&seq);
            self.stats.old_frames_dropped += 1;
            self.stats.late_frames_dropped += 1;
            self.consecutive_late_frames += 1;
            log::debug!(
                "[JITTER_BUFFER] Dropping late frame {} after {:.2}ms in buffer",
                seq,
                ms(time_in_buffer)
            );
            if self.consecutive_late_frames > config.late_frames_before_grow {
                self.current_delay = self
                    .current_delay
                    .mul_f64(config.grow_factor)
                    .min(config.max_delay);
                self.consecutive_late_frames = 0;
                log::debug!(
                    "[JITTER_BUFFER] Frames keep arriving late, playout delay now {:.2}ms",
                    ms(self.current_delay)
                );
            }
            return None;
        }

        let frame = self.frames.remove(&seq)?;
        self.last_sequence_number = Some(seq);
        self.consecutive_early_frames = 0;
        self.consecutive_late_frames = 0;
        self.stats.frames_released += 1;

        let e2e = frame.end_to_end_delay(now);
        self.stats.last_end_to_end_delay_ms = Some(ms(e2e));
        if e2e > config.latency_warning {
            self.stats.latency_warnings += 1;
            log::warn!(
                "[JITTER_BUFFER] Frame {} released with {:.2}ms end-to-end delay",
                seq,
                ms(e2e)
            );
        }

        Some(frame.into_handle())
    }

    fn flush(&mut self) {
        let flushed = self.frames.len();
        self.frames.clear();
        self.last_sequence_number = None;
        self.consecutive_early_frames = 0;
        self.consecutive_late_frames = 0;
        log::debug!(
            "[JITTER_BUFFER] Flushed {} frame(s), keeping playout delay {:.2}ms",
            flushed,
            ms(self.current_delay)
        );
    }
}

/// Reorders frames by sequence number and paces their release.
pub struct JitterBuffer<F, C = SystemClock> {
    config: JitterBufferConfig,
    clock: C,
    state: Mutex<PlayoutState<F>>,
}

impl<F> JitterBuffer<F, SystemClock> {
    pub fn new(config: JitterBufferConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<F, C: Clock> JitterBuffer<F, C> {
    pub fn with_clock(config: JitterBufferConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(PlayoutState::new(&config)),
            config,
            clock,
        })
    }

    fn state(&self) -> MutexGuard<'_, PlayoutState<F>> {
        lock(&self.state)
    }

    /// The main entry point for a decoded frame arriving from the network.
    ///
    /// Frames at or below the last released sequence number, or already
    /// buffered, are counted as duplicates and discarded. Out-of-order
    /// arrivals are tolerated and slotted into sequence order.
    pub fn add_frame(&self, handle: F, capture_timestamp: Instant, sequence_number: u64) {
        let now = self.clock.now();
        let frame = BufferedFrame::new(handle, capture_timestamp, now, sequence_number);
        self.state().insert(frame, now, &self.config);
    }

    /// Decide the fate of the lowest-sequence frame.
    ///
    /// Returns `None` both when nothing is ready yet and when the head frame
    /// was dropped as too old; in the latter case the caller may poll again
    /// straight away.
    pub fn get_next_frame(&self) -> Option<F> {
        let now = self.clock.now();
        self.state().next_frame(now, &self.config)
    }

    /// Drop all buffered frames and forget the release gate.
    ///
    /// Used after a stream restart so old sequence numbers cannot shadow the
    /// new stream. The learned playout delay is kept.
    pub fn flush(&self) {
        self.state().flush();
    }

    pub fn buffer_size(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_size() == 0
    }

    pub fn current_delay(&self) -> Duration {
        self.state().current_delay
    }

    pub fn buffer_delay_ms(&self) -> f64 {
        ms(self.current_delay())
    }

    pub fn last_sequence_number(&self) -> Option<u64> {
        self.state().last_sequence_number
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    pub fn stats(&self) -> JitterBufferStats {
        let state = self.state();
        JitterBufferStats {
            buffered_frames: state.frames.len(),
            current_delay_ms: ms(state.current_delay),
            ..state.stats.clone()
        }
    }

    pub fn diagnostics_event(&self) -> DiagEvent {
        let stats = self.stats();
        let mut metrics = vec![
            metric!("frames_buffered", stats.buffered_frames),
            metric!("playout_delay_ms", stats.current_delay_ms),
            metric!("frames_received", stats.frames_received),
            metric!("frames_released", stats.frames_released),
            metric!("duplicates_dropped", stats.duplicates_dropped),
            metric!("old_frames_dropped", stats.old_frames_dropped),
            metric!("latency_warnings", stats.latency_warnings),
        ];
        if let Some(e2e) = stats.last_end_to_end_delay_ms {
            metrics.push(metric!("end_to_end_delay_ms", e2e));
        }
        DiagEvent::new("jitter_buffer", metrics)
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ControlError;

    fn create_test_jitter_buffer() -> (JitterBuffer<u64, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let jb = JitterBuffer::with_clock(JitterBufferConfig::default(), clock.clone()).unwrap();
        (jb, clock)
    }

    fn add(jb: &JitterBuffer<u64, ManualClock>, clock: &ManualClock, seq: u64) {
        jb.add_frame(seq, clock.now(), seq);
    }

    #[test]
    fn starts_at_target_delay() {
        let (jb, _) = create_test_jitter_buffer();
        assert_eq!(jb.current_delay(), Duration::from_millis(50));
        assert_eq!(jb.buffer_size(), 0);
        assert_eq!(jb.last_sequence_number(), None);
        assert_eq!(jb.get_next_frame(), None);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = JitterBufferConfig {
            max_frames: 0,
            ..Default::default()
        };
        assert!(matches!(
            JitterBuffer::<u64>::new(config),
            Err(ControlError::InvalidConfig(_))
        ));
    }

    #[test]
    fn playout_delay_holds_frame() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 1);

        clock.advance_ms(25);
        assert_eq!(jb.get_next_frame(), None);
        assert_eq!(jb.buffer_size(), 1);

        clock.advance_ms(26);
        assert_eq!(jb.get_next_frame(), Some(1));
        assert_eq!(jb.last_sequence_number(), Some(1));
        assert!(jb.is_empty());
    }

    #[test]
    fn reorders_out_of_order_arrivals() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 2);
        add(&jb, &clock, 1);
        add(&jb, &clock, 3);

        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(1));
        assert_eq!(jb.get_next_frame(), Some(2));
        assert_eq!(jb.get_next_frame(), Some(3));
        assert_eq!(jb.get_next_frame(), None);
        assert_eq!(jb.stats().frames_released, 3);
    }

    #[test]
    fn duplicate_in_buffer_is_ignored() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 5);
        add(&jb, &clock, 5);

        assert_eq!(jb.buffer_size(), 1);
        assert_eq!(jb.stats().duplicates_dropped, 1);
    }

    #[test]
    fn frames_at_or_below_release_gate_are_ignored() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 4);
        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(4));

        add(&jb, &clock, 4);
        add(&jb, &clock, 2);
        assert_eq!(jb.buffer_size(), 0);
        assert_eq!(jb.stats().duplicates_dropped, 2);
    }

    #[test]
    fn buffer_capacity_is_enforced() {
        let (jb, clock) = create_test_jitter_buffer();
        for seq in 1..=20 {
            add(&jb, &clock, seq);
        }

        assert_eq!(jb.buffer_size(), 10);
        let stats = jb.stats();
        assert_eq!(stats.overflow_evictions, 10);
        assert_eq!(stats.old_frames_dropped, 10);

        clock.advance_ms(60);
        let released: Vec<u64> = std::iter::from_fn(|| jb.get_next_frame()).collect();
        assert_eq!(released, (11..=20).collect::<Vec<_>>());
    }

    #[test]
    fn aged_frames_are_evicted_on_insert() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 1);
        clock.advance_ms(200);
        add(&jb, &clock, 2);

        assert_eq!(jb.buffer_size(), 1);
        assert_eq!(jb.stats().old_frames_dropped, 1);

        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(2));
    }

    #[test]
    fn aged_head_is_dropped_on_poll() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 1);
        clock.advance_ms(200);

        assert_eq!(jb.get_next_frame(), None);
        assert!(jb.is_empty());
        let stats = jb.stats();
        assert_eq!(stats.late_frames_dropped, 1);
        assert_eq!(stats.old_frames_dropped, 1);
        assert_eq!(stats.frames_released, 0);
        assert_eq!(jb.last_sequence_number(), None);
    }

    #[test]
    fn repeated_early_polls_shrink_delay_to_floor() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 1);

        // Ten early polls are tolerated; the eleventh shrinks the delay.
        for _ in 0..10 {
            assert_eq!(jb.get_next_frame(), None);
        }
        assert_eq!(jb.current_delay(), Duration::from_millis(50));
        assert_eq!(jb.get_next_frame(), None);
        approx::assert_abs_diff_eq!(jb.buffer_delay_ms(), 45.0, epsilon = 1e-6);

        for _ in 0..1000 {
            jb.get_next_frame();
        }
        assert_eq!(jb.current_delay(), Duration::from_millis(20));
    }

    #[test]
    fn repeated_late_drops_grow_delay_to_ceiling() {
        let (jb, clock) = create_test_jitter_buffer();

        for seq in 1..=6 {
            add(&jb, &clock, seq);
            clock.advance_ms(160);
            assert_eq!(jb.get_next_frame(), None);
        }
        approx::assert_abs_diff_eq!(jb.buffer_delay_ms(), 60.0, epsilon = 1e-6);

        for seq in 7..=200 {
            add(&jb, &clock, seq);
            clock.advance_ms(160);
            jb.get_next_frame();
        }
        assert_eq!(jb.current_delay(), Duration::from_millis(120));
    }

    #[test]
    fn release_resets_adaptation_counters() {
        let (jb, clock) = create_test_jitter_buffer();

        for seq in 1..=5 {
            add(&jb, &clock, seq);
            clock.advance_ms(160);
            jb.get_next_frame();
        }
        add(&jb, &clock, 6);
        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(6));

        // Counter restarted, so another five late drops do not grow the delay.
        for seq in 7..=11 {
            add(&jb, &clock, seq);
            clock.advance_ms(160);
            jb.get_next_frame();
        }
        assert_eq!(jb.current_delay(), Duration::from_millis(50));
    }

    #[test]
    fn flush_clears_frames_and_gate_but_keeps_delay() {
        let (jb, clock) = create_test_jitter_buffer();
        for _ in 0..11 {
            add(&jb, &clock, 1);
            jb.get_next_frame();
        }
        let learned = jb.current_delay();
        assert!(learned < Duration::from_millis(50));

        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(1));
        add(&jb, &clock, 2);
        jb.flush();

        assert!(jb.is_empty());
        assert_eq!(jb.last_sequence_number(), None);
        assert_eq!(jb.current_delay(), learned);

        // A restarted stream can reuse low sequence numbers.
        add(&jb, &clock, 1);
        assert_eq!(jb.buffer_size(), 1);
    }

    #[test]
    fn late_end_to_end_delivery_is_flagged() {
        let (jb, clock) = create_test_jitter_buffer();
        let captured = clock.now();
        clock.advance_ms(180);
        jb.add_frame(1, captured, 1);
        clock.advance_ms(60);

        assert_eq!(jb.get_next_frame(), Some(1));
        let stats = jb.stats();
        assert_eq!(stats.latency_warnings, 1);
        approx::assert_abs_diff_eq!(
            stats.last_end_to_end_delay_ms.unwrap(),
            240.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn diagnostics_event_reports_occupancy() {
        let (jb, clock) = create_test_jitter_buffer();
        add(&jb, &clock, 1);
        add(&jb, &clock, 2);

        let event = jb.diagnostics_event();
        assert_eq!(event.subsystem, "jitter_buffer");
        assert_eq!(
            event.metric("frames_buffered"),
            Some(&crate::diagnostics::MetricValue::U64(2))
        );
    }
}
