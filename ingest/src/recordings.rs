use crate::api::IngestError;
use crate::request::RawEvent;

/// External session-recording transform. It may rewrite or expand the
/// batch before normalization; the shipped implementation only gatekeeps
/// payload shape, the real rewrite runs elsewhere.
pub trait RecordingTransform {
    fn transform(&self, events: Vec<RawEvent>) -> Result<Vec<RawEvent>, IngestError>;
}

/// Passes analytics events through untouched and validates that snapshot
/// events carry the fields the replay pipeline cannot live without.
pub struct SnapshotGate;

impl RecordingTransform for SnapshotGate {
    fn transform(&self, events: Vec<RawEvent>) -> Result<Vec<RawEvent>, IngestError> {
        for event in &events {
            if event.event != "$snapshot" {
                continue;
            }
            if !event.properties.contains_key("$session_id") {
                return Err(IngestError::InvalidSessionPayload(String::from(
                    "$snapshot events must contain property $session_id",
                )));
            }
            if !event.properties.contains_key("$snapshot_data") {
                return Err(IngestError::InvalidSessionPayload(String::from(
                    "$snapshot events must contain property $snapshot_data",
                )));
            }
        }
        Ok(events)
    }
}
