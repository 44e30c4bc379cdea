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

//! Loss-driven encoder bitrate control.
//!
//! Loss reports accumulate between adjustments. Once per adjustment interval
//! the accumulated loss rate picks one of four actions: a sharp cut, a
//! moderate cut, a gentle increase, or holding steady inside the hysteresis
//! band. The encoder hears about the result only when the value changes.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use web_time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::BitrateConfig;
use crate::diagnostics::DiagEvent;
use crate::notify::Notifier;
use crate::{lock, metric, Result};

/// Anything that can retarget the video encoder.
pub trait BitrateSink: Send + Sync {
    fn set_bitrate(&self, bits_per_second: u32);
}

impl<F> BitrateSink for F
where
    F: Fn(u32) + Send + Sync,
{
    fn set_bitrate(&self, bits_per_second: u32) {
        self(bits_per_second)
    }
}

/// Control messages understood by the encoder task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncoderControl {
    UpdateBitrate { target_bitrate_bps: u32 },
}

/// Forwards bitrate changes to an encoder task over a channel.
#[derive(Debug, Clone)]
pub struct EncoderControlSender(pub flume::Sender<EncoderControl>);

impl BitrateSink for EncoderControlSender {
    fn set_bitrate(&self, bits_per_second: u32) {
        let msg = EncoderControl::UpdateBitrate {
            target_bitrate_bps: bits_per_second,
        };
        if let Err(e) = self.0.try_send(msg) {
            log::warn!("[BITRATE] Encoder control channel rejected update: {e}");
        }
    }
}

/// What an adjustment did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitrateAction {
    SevereDecrease,
    Decrease,
    Hold,
    Increase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitrateStats {
    pub current_bitrate: u32,
    /// Adjustment cycles evaluated, including holds.
    pub adjustments: u64,
    pub decreases: u64,
    pub increases: u64,
    pub last_loss_rate: Option<f64>,
}

struct BitrateState {
    current_bitrate: u32,
    packets_lost: u64,
    packets_sent: u64,
    last_adjustment: Instant,
    generation: u64,
    stats: BitrateStats,
}

impl BitrateState {
    fn adjust(&mut self, config: &BitrateConfig) -> (BitrateAction, f64) {
        let loss_rate = if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        };
        self.packets_lost = 0;
        self.packets_sent = 0;

        let current = self.current_bitrate as f64;
        let (action, target) = if loss_rate > config.severe_loss {
            (BitrateAction::SevereDecrease, current * config.severe_factor)
        } else if loss_rate >= config.moderate_loss {
            (BitrateAction::Decrease, current * config.moderate_factor)
        } else if loss_rate < config.low_loss {
            (BitrateAction::Increase, current * config.increase_factor)
        } else {
            (BitrateAction::Hold, current)
        };

        self.current_bitrate =
            (target.round() as u32).clamp(config.min_bitrate, config.max_bitrate);
        (action, loss_rate)
    }
}

/// AIMD-style target bitrate for the local video encoder.
pub struct BitrateController<C = SystemClock> {
    config: BitrateConfig,
    clock: C,
    state: Mutex<BitrateState>,
    sink: Notifier<u32, dyn BitrateSink>,
}

impl BitrateController<SystemClock> {
    pub fn new(config: BitrateConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> BitrateController<C> {
    pub fn with_clock(config: BitrateConfig, clock: C) -> Result<Self> {
        config.validate()?;
        let state = BitrateState {
            current_bitrate: config.initial_bitrate,
            packets_lost: 0,
            packets_sent: 0,
            last_adjustment: clock.now(),
            generation: 0,
            stats: BitrateStats::default(),
        };
        Ok(Self {
            config,
            clock,
            state: Mutex::new(state),
            sink: Notifier::new(None),
        })
    }

    /// Register the encoder that receives bitrate changes.
    pub fn with_sink(mut self, sink: impl BitrateSink + 'static) -> Self {
        let sink: Box<dyn BitrateSink> = Box::new(sink);
        self.sink = Notifier::new(Some(sink));
        self
    }

    pub(crate) fn with_boxed_sink(mut self, sink: Option<Box<dyn BitrateSink>>) -> Self {
        self.sink = Notifier::new(sink);
        self
    }

    fn state(&self) -> MutexGuard<'_, BitrateState> {
        lock(&self.state)
    }

    /// Accumulate a loss report and adjust the bitrate if an adjustment is
    /// due. Returns the action taken, or `None` while still accumulating.
    pub fn report_packet_loss(&self, lost: u64, sent: u64) -> Option<BitrateAction> {
        let now = self.clock.now();
        let (action, change) = {
            let mut state = self.state();
            state.packets_lost = state.packets_lost.saturating_add(lost);
            state.packets_sent = state.packets_sent.saturating_add(sent);

            if now.saturating_duration_since(state.last_adjustment)
                < self.config.adjustment_interval
            {
                return None;
            }
            state.last_adjustment = now;

            let previous = state.current_bitrate;
            let (action, loss_rate) = state.adjust(&self.config);
            state.stats.adjustments += 1;
            state.stats.last_loss_rate = Some(loss_rate);

            let current = state.current_bitrate;
            let change = if current != previous {
                if current < previous {
                    state.stats.decreases += 1;
                } else {
                    state.stats.increases += 1;
                }
                state.generation += 1;
                log::info!(
                    "[BITRATE] {:?} at {:.1}% loss: {} -> {} bps",
                    action,
                    loss_rate * 100.0,
                    previous,
                    current
                );
                Some((state.generation, current))
            } else {
                log::debug!(
                    "[BITRATE] {:?} at {:.1}% loss, staying at {} bps",
                    action,
                    loss_rate * 100.0,
                    current
                );
                None
            };
            (action, change)
        };

        if let Some((generation, bitrate)) = change {
            self.sink.deliver(generation, bitrate, |sink, bps| sink.set_bitrate(bps));
        }
        Some(action)
    }

    pub fn current_bitrate(&self) -> u32 {
        self.state().current_bitrate
    }

    pub fn config(&self) -> &BitrateConfig {
        &self.config
    }

    pub fn stats(&self) -> BitrateStats {
        let state = self.state();
        BitrateStats {
            current_bitrate: state.current_bitrate,
            ..state.stats.clone()
        }
    }

    pub fn diagnostics_event(&self) -> DiagEvent {
        let stats = self.stats();
        let mut metrics = vec![
            metric!("target_bitrate_kbps", (stats.current_bitrate / 1000) as u64),
            metric!("adjustments", stats.adjustments),
            metric!("decreases", stats.decreases),
            metric!("increases", stats.increases),
        ];
        if let Some(loss) = stats.last_loss_rate {
            metrics.push(metric!("loss_rate", loss));
        }
        DiagEvent::new("bitrate", metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use web_time::Duration;

    fn create_controller(
        initial: u32,
    ) -> (BitrateController<ManualClock>, ManualClock, Arc<Mutex<Vec<u32>>>) {
        let clock = ManualClock::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = BitrateConfig {
            initial_bitrate: initial,
            ..Default::default()
        };
        let controller = BitrateController::with_clock(config, clock.clone())
            .unwrap()
            .with_sink(move |bps| sink.lock().unwrap().push(bps));
        (controller, clock, seen)
    }

    fn next_window(clock: &ManualClock) {
        clock.advance(Duration::from_secs(2));
    }

    #[test]
    fn accumulates_until_interval_elapses() {
        let (controller, clock, seen) = create_controller(1_000_000);
        assert_eq!(controller.report_packet_loss(50, 100), None);
        clock.advance_ms(1999);
        assert_eq!(controller.report_packet_loss(0, 100), None);
        assert_eq!(controller.current_bitrate(), 1_000_000);

        clock.advance_ms(1);
        // 50 lost of 300 sent = 16.7%
        assert_eq!(
            controller.report_packet_loss(0, 100),
            Some(BitrateAction::SevereDecrease)
        );
        assert_eq!(controller.current_bitrate(), 700_000);
        assert_eq!(*seen.lock().unwrap(), vec![700_000]);
    }

    #[test]
    fn loss_bands_pick_actions() {
        let cases = [
            (20, 100, BitrateAction::SevereDecrease, 700_000),
            (15, 100, BitrateAction::Decrease, 850_000),
            (5, 100, BitrateAction::Decrease, 850_000),
            (3, 100, BitrateAction::Hold, 1_000_000),
            (2, 100, BitrateAction::Hold, 1_000_000),
            (1, 100, BitrateAction::Increase, 1_100_000),
        ];
        for (lost, sent, action, expected) in cases {
            let (controller, clock, _) = create_controller(1_000_000);
            next_window(&clock);
            assert_eq!(controller.report_packet_loss(lost, sent), Some(action));
            assert_eq!(controller.current_bitrate(), expected, "{lost}/{sent}");
        }
    }

    #[test]
    fn no_traffic_counts_as_clean() {
        let (controller, clock, _) = create_controller(1_000_000);
        next_window(&clock);
        assert_eq!(
            controller.report_packet_loss(0, 0),
            Some(BitrateAction::Increase)
        );
    }

    #[test]
    fn accumulators_reset_each_cycle() {
        let (controller, clock, _) = create_controller(1_000_000);
        next_window(&clock);
        controller.report_packet_loss(50, 100);
        next_window(&clock);
        assert_eq!(
            controller.report_packet_loss(0, 100),
            Some(BitrateAction::Increase)
        );
    }

    #[test]
    fn never_exceeds_max() {
        let max = BitrateConfig::default().max_bitrate;
        let (controller, clock, seen) = create_controller(max);
        for _ in 0..10 {
            next_window(&clock);
            controller.report_packet_loss(0, 1000);
            assert_eq!(controller.current_bitrate(), max);
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn never_drops_below_min() {
        let min = BitrateConfig::default().min_bitrate;
        let (controller, clock, seen) = create_controller(min);
        for _ in 0..10 {
            next_window(&clock);
            controller.report_packet_loss(500, 1000);
            assert_eq!(controller.current_bitrate(), min);
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(controller.stats().adjustments, 10);
    }

    #[test]
    fn cut_is_clamped_to_min() {
        let (controller, clock, seen) = create_controller(600_000);
        next_window(&clock);
        controller.report_packet_loss(30, 100);
        assert_eq!(controller.current_bitrate(), 500_000);
        assert_eq!(*seen.lock().unwrap(), vec![500_000]);
    }

    #[test]
    fn encoder_channel_receives_updates() {
        let clock = ManualClock::new();
        let (tx, rx) = flume::unbounded();
        let controller = BitrateController::with_clock(BitrateConfig::default(), clock.clone())
            .unwrap()
            .with_sink(EncoderControlSender(tx));

        next_window(&clock);
        controller.report_packet_loss(0, 100);
        assert_eq!(
            rx.try_recv().unwrap(),
            EncoderControl::UpdateBitrate {
                target_bitrate_bps: 1_100_000
            }
        );
    }

    #[test]
    fn stats_track_direction() {
        let (controller, clock, _) = create_controller(1_000_000);
        next_window(&clock);
        controller.report_packet_loss(0, 100);
        next_window(&clock);
        controller.report_packet_loss(40, 100);
        next_window(&clock);
        controller.report_packet_loss(3, 100);

        let stats = controller.stats();
        assert_eq!(stats.adjustments, 3);
        assert_eq!(stats.increases, 1);
        assert_eq!(stats.decreases, 1);
        assert_eq!(stats.current_bitrate, 770_000);
        assert_eq!(stats.last_loss_rate, Some(0.03));
    }

    #[test]
    fn racing_reports_reach_the_sink_in_order() {
        let (controller, clock, seen) = create_controller(1_000_000);
        let controller = Arc::new(controller);

        let workers: Vec<_> = (0..4u64)
            .map(|worker| {
                let controller = controller.clone();
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        next_window(&clock);
                        let lost = if (i + worker) % 2 == 0 { 0 } else { 30 };
                        controller.report_packet_loss(lost, 100);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        let stats = controller.stats();
        assert_eq!(seen.len() as u64, stats.increases + stats.decreases);
        assert!(seen.windows(2).all(|pair| pair[0] != pair[1]));
        assert_eq!(seen.last().copied(), Some(controller.current_bitrate()));
    }
}
