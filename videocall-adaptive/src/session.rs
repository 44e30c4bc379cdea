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

//! The per-call owner of the three control loops.
//!
//! A session builds the jitter buffer, QoS monitor and bitrate controller
//! from one [`SessionConfig`], wires up the observers, and hands out shared
//! handles so the network-receive side and the display side can each hold
//! what they need.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bitrate_controller::{BitrateController, BitrateSink, BitrateStats};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::diagnostics::{DiagEvent, DiagnosticsBus};
use crate::jitter_buffer::{JitterBuffer, JitterBufferStats};
use crate::qos_monitor::{ModeObserver, QosMonitor, QosStats};
use crate::streaming_mode::StreamingMode;
use crate::Result;

/// Combined statistics of every component in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub jitter_buffer: JitterBufferStats,
    pub qos: QosStats,
    pub bitrate: BitrateStats,
}

/// Configures an [`AdaptiveSession`] carrying frames of type `F`, timed by
/// clock `C`.
pub struct SessionBuilder<F, C = SystemClock> {
    config: SessionConfig,
    mode_observer: Option<Box<ModeObserver>>,
    bitrate_sink: Option<Box<dyn BitrateSink>>,
    diagnostics: Option<DiagnosticsBus>,
    stream_id: Option<String>,
    _session: PhantomData<fn() -> (F, C)>,
}

impl<F, C> SessionBuilder<F, C> {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            mode_observer: None,
            bitrate_sink: None,
            diagnostics: None,
            stream_id: None,
            _session: PhantomData,
        }
    }

    pub fn on_mode_change(
        mut self,
        observer: impl Fn(StreamingMode) + Send + Sync + 'static,
    ) -> Self {
        let observer: Box<ModeObserver> = Box::new(observer);
        self.mode_observer = Some(observer);
        self
    }

    pub fn bitrate_sink(mut self, sink: impl BitrateSink + 'static) -> Self {
        let sink: Box<dyn BitrateSink> = Box::new(sink);
        self.bitrate_sink = Some(sink);
        self
    }

    /// Publish onto an existing bus instead of a fresh one.
    pub fn diagnostics_bus(mut self, bus: DiagnosticsBus) -> Self {
        self.diagnostics = Some(bus);
        self
    }

    /// Tag published diagnostics, e.g. "alice->bob".
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }
}

impl<F> SessionBuilder<F, SystemClock> {
    pub fn build(self) -> Result<AdaptiveSession<F, SystemClock>> {
        self.build_with_clock(SystemClock)
    }
}

impl<F, C: Clock + Clone> SessionBuilder<F, C> {
    pub fn build_with_clock(self, clock: C) -> Result<AdaptiveSession<F, C>> {
        self.config.validate()?;
        let jitter_buffer = JitterBuffer::with_clock(self.config.jitter_buffer, clock.clone())?;
        let qos = QosMonitor::with_clock(self.config.qos, clock.clone())?
            .with_boxed_observer(self.mode_observer);
        let bitrate = BitrateController::with_clock(self.config.bitrate, clock)?
            .with_boxed_sink(self.bitrate_sink);

        log::debug!(
            "[SESSION] Control loops ready for stream {:?}",
            self.stream_id.as_deref().unwrap_or("<unnamed>")
        );

        Ok(AdaptiveSession {
            jitter_buffer: Arc::new(jitter_buffer),
            qos: Arc::new(qos),
            bitrate: Arc::new(bitrate),
            diagnostics: self.diagnostics.unwrap_or_default(),
            stream_id: self.stream_id,
        })
    }
}

/// Playout, QoS and bitrate control for one video call.
pub struct AdaptiveSession<F, C = SystemClock> {
    jitter_buffer: Arc<JitterBuffer<F, C>>,
    qos: Arc<QosMonitor<C>>,
    bitrate: Arc<BitrateController<C>>,
    diagnostics: DiagnosticsBus,
    stream_id: Option<String>,
}

impl<F> AdaptiveSession<F, SystemClock> {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::builder(config).build()
    }
}

impl<F, C: Clock> AdaptiveSession<F, C> {
    pub fn builder(config: SessionConfig) -> SessionBuilder<F, C> {
        SessionBuilder::new(config)
    }

    pub fn jitter_buffer(&self) -> &Arc<JitterBuffer<F, C>> {
        &self.jitter_buffer
    }

    pub fn qos_monitor(&self) -> &Arc<QosMonitor<C>> {
        &self.qos
    }

    pub fn bitrate_controller(&self) -> &Arc<BitrateController<C>> {
        &self.bitrate
    }

    pub fn diagnostics(&self) -> &DiagnosticsBus {
        &self.diagnostics
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// The underlying stream restarted (e.g. after a reconnect).
    pub fn restart_stream(&self) {
        log::info!(
            "[SESSION] Stream restart, flushing {} buffered frame(s)",
            self.jitter_buffer.buffer_size()
        );
        self.jitter_buffer.flush();
    }

    pub fn current_mode(&self) -> StreamingMode {
        self.qos.get_current_mode()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            jitter_buffer: self.jitter_buffer.stats(),
            qos: self.qos.stats(),
            bitrate: self.bitrate.stats(),
        }
    }

    pub fn diagnostics_events(&self) -> Vec<DiagEvent> {
        let events = [
            self.jitter_buffer.diagnostics_event(),
            self.qos.diagnostics_event(),
            self.bitrate.diagnostics_event(),
        ];
        events
            .into_iter()
            .map(|event| match &self.stream_id {
                Some(id) => event.with_stream_id(id.clone()),
                None => event,
            })
            .collect()
    }

    /// Publish one event per component. Returns how many were accepted.
    pub fn publish_diagnostics(&self) -> usize {
        self.diagnostics_events()
            .into_iter()
            .map(|event| self.diagnostics.publish(event))
            .filter(|accepted| *accepted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::JitterBufferConfig;
    use crate::ControlError;
    use std::sync::Mutex;
    use web_time::Duration;

    #[test]
    fn invalid_config_fails_to_build() {
        let config = SessionConfig {
            jitter_buffer: JitterBufferConfig {
                max_frames: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(AdaptiveSession::<u64>::new(config), Err(ControlError::InvalidConfig(_))));
    }

    #[test]
    fn observers_are_wired_through() {
        let clock = ManualClock::new();
        let modes = Arc::new(Mutex::new(Vec::new()));
        let rates = Arc::new(Mutex::new(Vec::new()));
        let (m, r) = (modes.clone(), rates.clone());

        let session = AdaptiveSession::<u64, ManualClock>::builder(SessionConfig::default())
            .on_mode_change(move |mode| m.lock().unwrap().push(mode))
            .bitrate_sink(move |bps| r.lock().unwrap().push(bps))
            .build_with_clock(clock.clone())
            .unwrap();

        session.qos_monitor().update_qos(900.0, 0.0, 0.0);
        clock.advance(Duration::from_secs(2));
        session.bitrate_controller().report_packet_loss(30, 100);

        assert_eq!(session.current_mode(), StreamingMode::AudioOnly);
        assert_eq!(*modes.lock().unwrap(), vec![StreamingMode::AudioOnly]);
        assert_eq!(*rates.lock().unwrap(), vec![700_000]);
    }

    #[test]
    fn builder_carries_the_frame_type() {
        let clock = ManualClock::new();
        let session = AdaptiveSession::<String, ManualClock>::builder(SessionConfig::default())
            .stream_id("carol->dave")
            .build_with_clock(clock.clone())
            .unwrap();

        session
            .jitter_buffer()
            .add_frame("keyframe".to_string(), clock.now(), 1);
        clock.advance_ms(60);
        assert_eq!(
            session.jitter_buffer().get_next_frame().as_deref(),
            Some("keyframe")
        );
    }

    #[test]
    fn default_clock_session_builds_without_annotations() {
        let session = AdaptiveSession::<Vec<u8>>::builder(SessionConfig::default())
            .build()
            .unwrap();
        assert_eq!(session.current_mode(), StreamingMode::Normal);
        assert!(session.jitter_buffer().is_empty());
    }

    #[test]
    fn restart_flushes_buffer() {
        let clock = ManualClock::new();
        let session = AdaptiveSession::<u64, ManualClock>::builder(SessionConfig::default())
            .build_with_clock(clock.clone())
            .unwrap();
        let jb = session.jitter_buffer().clone();
        jb.add_frame(7, clock.now(), 7);
        clock.advance_ms(60);
        assert_eq!(jb.get_next_frame(), Some(7));
        jb.add_frame(8, clock.now(), 8);

        session.restart_stream();
        assert_eq!(jb.buffer_size(), 0);
        assert_eq!(jb.last_sequence_number(), None);
    }

    #[test]
    fn publishes_one_event_per_component() {
        let session = AdaptiveSession::<u64, ManualClock>::builder(SessionConfig::default())
            .stream_id("alice->bob")
            .build_with_clock(ManualClock::new())
            .unwrap();
        let rx = session.diagnostics().subscribe();

        assert_eq!(session.publish_diagnostics(), 3);
        let subsystems: Vec<String> = rx.try_iter().map(|e| e.subsystem).collect();
        assert_eq!(subsystems, vec!["jitter_buffer", "qos", "bitrate"]);
    }

    #[test]
    fn stats_cover_every_component() {
        let session = AdaptiveSession::<u64, ManualClock>::builder(SessionConfig::default())
            .build_with_clock(ManualClock::new())
            .unwrap();
        let stats = session.stats();
        approx::assert_abs_diff_eq!(stats.jitter_buffer.current_delay_ms, 50.0, epsilon = 1e-9);
        assert_eq!(stats.qos.current_mode, StreamingMode::Normal);
        assert_eq!(stats.bitrate.current_bitrate, 1_000_000);
    }
}
