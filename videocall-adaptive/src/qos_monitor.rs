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

//! Network quality monitoring.
//!
//! The monitor turns raw signals (ping/pong round trips and packet sequence
//! numbers) into a [`QosMetrics`] snapshot at most once per update interval,
//! maps the snapshot onto a [`StreamingMode`], and tells the registered
//! observer when the mode changes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use web_time::{Duration, Instant};

use crate::clock::{elapsed_ms, Clock, SystemClock};
use crate::config::QosConfig;
use crate::diagnostics::DiagEvent;
use crate::notify::Notifier;
use crate::streaming_mode::{QosMetrics, StreamingMode};
use crate::{lock, metric, Result};

/// Observer for streaming mode transitions.
pub type ModeObserver = dyn Fn(StreamingMode) + Send + Sync;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosStats {
    pub pings_sent: u64,
    pub pongs_matched: u64,
    /// Pongs with no outstanding ping (duplicates, or pings already expired).
    pub pongs_unmatched: u64,
    /// Pings discarded without ever seeing a pong.
    pub pings_expired: u64,
    pub outstanding_pings: usize,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub mode_transitions: u64,
    pub current_mode: StreamingMode,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
}

struct QosState {
    current_metrics: QosMetrics,
    current_mode: StreamingMode,
    sent_pings: HashMap<String, Instant>,
    rtt_samples: VecDeque<f64>,
    /// `None` until the first packet seeds it.
    expected_sequence: Option<u64>,
    received_count: u64,
    lost_count: u64,
    reordered_count: u64,
    last_update: Instant,
    /// Bumped on every mode transition; orders observer deliveries.
    generation: u64,
    stats: QosStats,
}

impl QosState {
    fn new(now: Instant, capacity: usize) -> Self {
        Self {
            current_metrics: QosMetrics::new(0.0, 0.0, 0.0, now),
            current_mode: StreamingMode::Normal,
            sent_pings: HashMap::new(),
            rtt_samples: VecDeque::with_capacity(capacity),
            expected_sequence: None,
            received_count: 0,
            lost_count: 0,
            reordered_count: 0,
            last_update: now,
            generation: 0,
            stats: QosStats::default(),
        }
    }

    fn mean_rtt_ms(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            return 0.0;
        }
        self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64
    }

    /// Sample standard deviation of the RTT window around `mean`.
    fn rtt_jitter_ms(&self, mean: f64) -> f64 {
        let n = self.rtt_samples.len();
        if n < 2 {
            return 0.0;
        }
        let sum_sq: f64 = self.rtt_samples.iter().map(|s| (s - mean).powi(2)).sum();
        (sum_sq / (n - 1) as f64).sqrt()
    }

    fn packet_loss_pct(&self) -> f64 {
        let lost = self.lost_count as f64;
        let total = self.received_count as f64 + lost;
        if total == 0.0 {
            return 0.0;
        }
        lost / total * 100.0
    }

    fn push_rtt_sample(&mut self, rtt_ms: f64, capacity: usize) {
        if self.rtt_samples.len() >= capacity {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt_ms);
    }

    fn ping_timeout(&self, config: &QosConfig) -> Duration {
        let rtt_based = Duration::from_secs_f64(
            self.mean_rtt_ms() * config.ping_timeout_rtt_multiplier / 1000.0,
        );
        rtt_based.max(config.ping_timeout_floor)
    }

    fn expire_pings(&mut self, now: Instant, config: &QosConfig) {
        let timeout = self.ping_timeout(config);
        let before = self.sent_pings.len();
        self.sent_pings
            .retain(|_, sent| now.saturating_duration_since(*sent) <= timeout);

        while self.sent_pings.len() > config.max_outstanding_pings {
            let oldest = self
                .sent_pings
                .iter()
                .min_by_key(|(_, sent)| **sent)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.sent_pings.remove(&id);
                }
                None => break,
            }
        }

        let expired = (before - self.sent_pings.len()) as u64;
        if expired > 0 {
            log::warn!("[QOS] Discarding {expired} ping(s) that never received a pong");
            self.stats.pings_expired += expired;
        }
    }

    /// Recompute metrics if the update interval has elapsed.
    fn recompute_if_due(
        &mut self,
        now: Instant,
        config: &QosConfig,
    ) -> Option<(u64, StreamingMode)> {
        if now.saturating_duration_since(self.last_update) < config.update_interval {
            return None;
        }
        self.last_update = now;

        let rtt = self.mean_rtt_ms();
        let jitter = self.rtt_jitter_ms(rtt);
        let loss = self.packet_loss_pct();
        self.current_metrics = QosMetrics::new(rtt, jitter, loss, now);
        log::debug!(
            "[QOS] rtt={:.1}ms jitter={:.1}ms loss={:.2}% over {} sample(s)",
            rtt,
            jitter,
            loss,
            self.rtt_samples.len()
        );

        self.evaluate_mode()
    }

    fn evaluate_mode(&mut self) -> Option<(u64, StreamingMode)> {
        let mode = self.current_metrics.recommended_mode();
        if mode == self.current_mode {
            return None;
        }
        log::info!(
            "[QOS] Streaming mode {} -> {} (rtt={:.1}ms jitter={:.1}ms loss={:.2}%)",
            self.current_mode,
            mode,
            self.current_metrics.rtt_ms,
            self.current_metrics.jitter_ms,
            self.current_metrics.packet_loss_pct
        );
        self.current_mode = mode;
        self.generation += 1;
        self.stats.mode_transitions += 1;
        Some((self.generation, mode))
    }
}

/// Aggregates RTT, jitter and loss into a streaming mode.
pub struct QosMonitor<C = SystemClock> {
    config: QosConfig,
    clock: C,
    state: Mutex<QosState>,
    notifier: Notifier<StreamingMode, ModeObserver>,
}

impl QosMonitor<SystemClock> {
    pub fn new(config: QosConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> QosMonitor<C> {
    pub fn with_clock(config: QosConfig, clock: C) -> Result<Self> {
        config.validate()?;
        let state = QosState::new(clock.now(), config.rtt_sample_capacity);
        Ok(Self {
            config,
            clock,
            state: Mutex::new(state),
            notifier: Notifier::new(None),
        })
    }

    /// Register the observer told about every mode transition.
    pub fn with_mode_observer(
        mut self,
        observer: impl Fn(StreamingMode) + Send + Sync + 'static,
    ) -> Self {
        let observer: Box<ModeObserver> = Box::new(observer);
        self.notifier = Notifier::new(Some(observer));
        self
    }

    pub(crate) fn with_boxed_observer(mut self, observer: Option<Box<ModeObserver>>) -> Self {
        self.notifier = Notifier::new(observer);
        self
    }

    fn state(&self) -> MutexGuard<'_, QosState> {
        lock(&self.state)
    }

    fn notify(&self, transition: Option<(u64, StreamingMode)>) {
        if let Some((generation, mode)) = transition {
            self.notifier.deliver(generation, mode, |observer, mode| observer(mode));
        }
    }

    /// Remember when `ping_id` was sent. Reusing an id overwrites its send time.
    pub fn record_ping_sent(&self, ping_id: impl Into<String>) {
        let now = self.clock.now();
        let mut state = self.state();
        state.expire_pings(now, &self.config);
        state.sent_pings.insert(ping_id.into(), now);
        state.stats.pings_sent += 1;
        state.expire_pings(now, &self.config);
    }

    /// Match a pong against its ping and record the round trip.
    ///
    /// Returns the measured RTT in milliseconds, or `None` for a pong with no
    /// outstanding ping.
    pub fn record_pong_received(&self, ping_id: &str) -> Option<f64> {
        let now = self.clock.now();
        let (rtt, transition) = {
            let mut state = self.state();
            let rtt = match state.sent_pings.remove(ping_id) {
                Some(sent) => {
                    let rtt = elapsed_ms(now, sent);
                    state.push_rtt_sample(rtt, self.config.rtt_sample_capacity);
                    state.stats.pongs_matched += 1;
                    Some(rtt)
                }
                None => {
                    log::debug!("[QOS] Ignoring unmatched pong {ping_id}");
                    state.stats.pongs_unmatched += 1;
                    None
                }
            };
            state.expire_pings(now, &self.config);
            let transition = match rtt {
                Some(_) => state.recompute_if_due(now, &self.config),
                None => None,
            };
            (rtt, transition)
        };
        self.notify(transition);
        rtt
    }

    /// Account for a received packet, counting any sequence gap as loss.
    pub fn record_packet_received(&self, sequence: u64) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state();
            match state.expected_sequence {
                Some(expected) if sequence > expected => {
                    state.lost_count = state.lost_count.saturating_add(sequence - expected);
                    state.expected_sequence = Some(sequence.saturating_add(1));
                }
                Some(expected) if sequence < expected => {
                    state.reordered_count += 1;
                }
                _ => state.expected_sequence = Some(sequence.saturating_add(1)),
            }
            state.received_count = state.received_count.saturating_add(1);
            state.recompute_if_due(now, &self.config)
        };
        self.notify(transition);
    }

    /// Replace the metrics with externally measured values and re-evaluate
    /// the mode immediately, regardless of the update interval.
    pub fn update_qos(&self, rtt_ms: f64, jitter_ms: f64, packet_loss_pct: f64) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state();
            state.current_metrics = QosMetrics::new(rtt_ms, jitter_ms, packet_loss_pct, now);
            state.evaluate_mode()
        };
        self.notify(transition);
    }

    /// Recompute metrics from the collected samples if the update interval
    /// has elapsed. Cheap to call opportunistically; at most one caller per
    /// interval performs the recomputation.
    pub fn recompute_if_due(&self) {
        let now = self.clock.now();
        let transition = self.state().recompute_if_due(now, &self.config);
        self.notify(transition);
    }

    pub fn get_current_mode(&self) -> StreamingMode {
        self.state().current_mode
    }

    pub fn get_current_metrics(&self) -> QosMetrics {
        self.state().current_metrics
    }

    pub fn outstanding_pings(&self) -> usize {
        self.state().sent_pings.len()
    }

    pub fn config(&self) -> &QosConfig {
        &self.config
    }

    pub fn stats(&self) -> QosStats {
        let state = self.state();
        QosStats {
            outstanding_pings: state.sent_pings.len(),
            packets_received: state.received_count,
            packets_lost: state.lost_count,
            packets_reordered: state.reordered_count,
            current_mode: state.current_mode,
            rtt_ms: state.current_metrics.rtt_ms,
            jitter_ms: state.current_metrics.jitter_ms,
            packet_loss_pct: state.current_metrics.packet_loss_pct,
            ..state.stats.clone()
        }
    }

    pub fn diagnostics_event(&self) -> DiagEvent {
        let stats = self.stats();
        DiagEvent::new(
            "qos",
            vec![
                metric!("mode", stats.current_mode.as_str()),
                metric!("target_fps", stats.current_mode.target_fps()),
                metric!("rtt_ms", stats.rtt_ms),
                metric!("jitter_ms", stats.jitter_ms),
                metric!("packet_loss_pct", stats.packet_loss_pct),
                metric!("outstanding_pings", stats.outstanding_pings),
                metric!("pings_expired", stats.pings_expired),
                metric!("mode_transitions", stats.mode_transitions),
            ],
        )
    }
}
