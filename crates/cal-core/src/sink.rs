//! Outbound events: what the bench shows to a viewer and hands to recorders.
//!
//! The state machine never knows who is listening. It emits through a
//! [`Sink`]; [`BroadcastSink`] fans the events out to any number of
//! subscribers over `tokio::sync::broadcast`.

use crate::data::{Measurement, MeasurementSummary};
use crate::parameters::Parameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Default broadcast buffer per channel.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Event intended for a live display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerEvent {
    /// The machine entered a state.
    StateEntered {
        /// State name
        state: String,
    },
    /// Fresh parameter snapshot from an instrument.
    Parameters {
        /// Instrument id
        instrument: String,
        /// Snapshot
        parameters: Parameters,
    },
    /// An automatic run started.
    RunStarted {
        /// Unique id of the run
        run_uid: String,
        /// Number of steps in the control loop
        steps: usize,
        /// Step the run starts from (non-zero after a pause)
        start_index: usize,
    },
    /// One step was archived.
    StepArchived {
        /// Experiment id of the record
        exp_id: String,
        /// Flat control-loop index
        index: usize,
    },
    /// The control loop was exhausted.
    RunComplete {
        /// Unique id of the run
        run_uid: String,
        /// Number of steps executed
        steps: usize,
    },
    /// Informational message.
    Message {
        /// Text
        text: String,
    },
    /// An action failed and the machine parked in its error state.
    Error {
        /// State whose action failed
        state: String,
        /// Failure description
        message: String,
    },
}

/// One archived measurement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// `<YYYYMMDD>_<HHMMSS>_<ordinal>`
    pub exp_id: String,
    /// Name of the sequence the step belongs to
    pub sequence_name: String,
    /// Position of the sequence in the series
    pub series_index: usize,
    /// Position of the step within its sequence
    pub sequence_index: usize,
    /// Time the record was built
    pub timestamp: DateTime<Utc>,
    /// Metadata selected by the sequence's inclusion flags
    pub metadata: BTreeMap<String, Value>,
    /// Compressed measurements keyed by instrument id
    pub measurements: BTreeMap<String, MeasurementSummary>,
}

/// Event intended for persistent recorders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecorderEvent {
    /// Raw samples for one instrument and step.
    Samples {
        /// Flat control-loop index
        index: usize,
        /// Samples
        measurement: Measurement,
    },
    /// A complete archived step.
    Record(ArchiveRecord),
}

/// Destination for bench output.
pub trait Sink: Send + Sync {
    /// Publish to live displays.
    fn emit_to_viewer(&self, event: ViewerEvent);

    /// Publish to recorders.
    fn emit_to_recorder(&self, event: RecorderEvent);
}

/// Sink that fans events out over two broadcast channels.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    viewer: broadcast::Sender<ViewerEvent>,
    recorder: broadcast::Sender<RecorderEvent>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

impl BroadcastSink {
    /// Create a sink with `capacity` buffered events per channel.
    pub fn new(capacity: usize) -> Self {
        let (viewer, _) = broadcast::channel(capacity.max(1));
        let (recorder, _) = broadcast::channel(capacity.max(1));
        Self { viewer, recorder }
    }

    /// Subscribe to viewer events.
    pub fn subscribe_viewer(&self) -> broadcast::Receiver<ViewerEvent> {
        self.viewer.subscribe()
    }

    /// Subscribe to recorder events.
    pub fn subscribe_recorder(&self) -> broadcast::Receiver<RecorderEvent> {
        self.recorder.subscribe()
    }
}

impl Sink for BroadcastSink {
    fn emit_to_viewer(&self, event: ViewerEvent) {
        // No subscribers is fine.
        let _ = self.viewer.send(event);
    }

    fn emit_to_recorder(&self, event: RecorderEvent) {
        let _ = self.recorder.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe_viewer();
        sink.emit_to_viewer(ViewerEvent::StateEntered {
            state: "Moving".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ViewerEvent::StateEntered {
                state: "Moving".into()
            }
        );
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let sink = BroadcastSink::default();
        sink.emit_to_recorder(RecorderEvent::Samples {
            index: 0,
            measurement: Measurement::new("sr830"),
        });
    }

    #[test]
    fn viewer_event_serialises_with_tag() {
        let json = serde_json::to_value(ViewerEvent::Message { text: "hi".into() }).unwrap();
        assert_eq!(json["event"], "message");
        assert_eq!(json["text"], "hi");
    }
}
