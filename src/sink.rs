//! Where finished measurements and user-facing messages go.

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::measurement::Measurement;
use crate::types::InfoCode;

/// Receiver of decoded measurements, owned by the host application
pub trait MeasurementSink: Send + Sync {
    /// Persist one finished measurement
    fn emit(&self, measurement: Measurement);

    /// Show a progress or error message
    fn report_info(&self, code: InfoCode, arg: i64);
}

/// Everything a sink can receive, as a single message
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A finished measurement
    Measurement(Measurement),
    /// A progress or error message with its argument
    Info(InfoCode, i64),
}

/// Forwards sink calls over a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving half of its channel
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: SinkEvent) {
        if self.sender.send(event).is_err() {
            warn!("Sink receiver dropped, discarding event");
        }
    }
}

impl MeasurementSink for ChannelSink {
    fn emit(&self, measurement: Measurement) {
        self.send(SinkEvent::Measurement(measurement));
    }

    fn report_info(&self, code: InfoCode, arg: i64) {
        self.send(SinkEvent::Info(code, arg));
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, in order
    #[must_use]
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emitted measurements so far
    #[must_use]
    pub fn measurements(&self) -> Vec<Measurement> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Measurement(m) => Some(m),
                SinkEvent::Info(..) => None,
            })
            .collect()
    }

    /// Reported info codes so far
    #[must_use]
    pub fn infos(&self) -> Vec<(InfoCode, i64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Info(code, arg) => Some((code, arg)),
                SinkEvent::Measurement(_) => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        debug!("Recorded {:?}", event);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl MeasurementSink for RecordingSink {
    fn emit(&self, measurement: Measurement) {
        self.push(SinkEvent::Measurement(measurement));
    }

    fn report_info(&self, code: InfoCode, arg: i64) {
        self.push(SinkEvent::Info(code, arg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_recording_sink_splits_events() {
        let sink = RecordingSink::new();
        sink.report_info(InfoCode::StepOnScale, 0);
        sink.emit(Measurement::new(70.0, Utc::now()));

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.infos(), vec![(InfoCode::StepOnScale, 0)]);
        assert_eq!(sink.measurements().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut receiver) = ChannelSink::channel();
        sink.report_info(InfoCode::LowBattery, 10);

        assert_eq!(
            receiver.recv().await,
            Some(SinkEvent::Info(InfoCode::LowBattery, 10))
        );

        drop(receiver);
        // must not panic once the receiver is gone
        sink.emit(Measurement::new(70.0, Utc::now()));
    }
}
