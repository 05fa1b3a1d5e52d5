use std::collections::HashMap;
use std::io::prelude::*;

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

use crate::api::IngestError;
use crate::team::Team;

#[derive(Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Unsupported,

    #[serde(rename = "gzip", alias = "gzip-js")]
    Gzip,

    #[serde(rename = "lz64")]
    Lz64,
}

/// Query parameters shared by all SDK generations. Older SDKs send
/// credentials and timestamps here rather than in the payload.
#[derive(Deserialize, Default)]
pub struct EventQuery {
    pub compression: Option<Compression>,

    #[serde(alias = "ver")]
    pub lib_version: Option<String>,

    /// posthog-js style sent_at: digits (epoch) or ISO-8601
    #[serde(rename = "_")]
    pub sent_at: Option<String>,

    pub api_key: Option<String>,
    pub token: Option<String>,
    pub project_id: Option<String>,
}

/// Form body sent by SDKs that post url-encoded data. The JSON payload
/// lives in `data`, usually base64-encoded.
#[derive(Debug, Deserialize, Default)]
pub struct EventFormData {
    pub data: Option<String>,
    pub compression: Option<Compression>,
    pub sent_at: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(rename = "$token", skip_serializing_if = "Option::is_none")]
    pub dollar_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(rename = "$distinct_id", skip_serializing_if = "Option::is_none")]
    pub dollar_distinct_id: Option<Value>,
    // Arbitrary JSON values accepted here, older SDKs send numbers and maps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<Value>,

    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,

    /// Client-declared send time, only read from single-event payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    /// Explicit tenant for the personal-credential auth path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Value>,

    // Passed through for downstream ingestion to parse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<HashMap<String, Value>>,
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<HashMap<String, Value>>,
}

static GZIP_MAGIC_NUMBERS: [u8; 3] = [0x1f, 0x8b, 8];

/// Server-library batch convention: a mapping wrapping the authoritative
/// event array, with credentials and sent_at at the top level.
#[derive(Debug, Deserialize)]
pub struct BatchedRequest {
    #[serde(rename = "$token")]
    pub dollar_token: Option<String>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub sent_at: Option<String>,
    pub project_id: Option<Value>,
    pub batch: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawRequest {
    /// Batch wrapper (server SDKs) - must come first so a mapping with a
    /// `batch` key is never mistaken for a single event
    Batch(BatchedRequest),
    /// Array of events (browser SDKs)
    Array(Vec<RawEvent>),
    /// Single event
    One(Box<RawEvent>),
}

impl RawRequest {
    /// Decompress and unmarshall a request body. Gzip is detected from the
    /// payload's first bytes rather than trusting the compression parameter,
    /// which a sizable portion of clients omit. lz-string has no usable
    /// magic prefix, so that one stays parameter-driven.
    #[instrument(skip_all)]
    pub fn from_bytes(
        bytes: Bytes,
        compression: Option<Compression>,
    ) -> Result<RawRequest, IngestError> {
        tracing::debug!(len = bytes.len(), "decoding new request");

        if bytes.is_empty() {
            return Err(IngestError::NoData);
        }

        let payload = if bytes.starts_with(&GZIP_MAGIC_NUMBERS) {
            let mut d = GzDecoder::new(bytes.reader());
            let mut s = String::new();
            d.read_to_string(&mut s).map_err(|e| {
                tracing::error!("failed to decode gzip: {}", e);
                IngestError::RequestDecodingError(String::from("invalid gzip data"))
            })?;
            s
        } else if matches!(compression, Some(Compression::Lz64)) {
            let encoded = String::from_utf8(bytes.into()).map_err(|e| {
                tracing::error!("failed to decode lz64 body: {}", e);
                IngestError::RequestDecodingError(String::from("invalid body encoding"))
            })?;
            let decompressed = lz_str::decompress_from_base64(encoded.trim()).ok_or_else(|| {
                IngestError::RequestDecodingError(String::from("invalid lz64 data"))
            })?;
            String::from_utf16(&decompressed).map_err(|e| {
                tracing::error!("failed to decode lz64 utf16: {}", e);
                IngestError::RequestDecodingError(String::from("invalid lz64 data"))
            })?
        } else {
            String::from_utf8(bytes.into()).map_err(|e| {
                tracing::error!("failed to decode body: {}", e);
                IngestError::RequestDecodingError(String::from("invalid body encoding"))
            })?
        };

        if payload.trim().is_empty() {
            return Err(IngestError::NoData);
        }

        tracing::debug!(json = payload, "decoded request data");
        let request = serde_json::from_str::<RawRequest>(&payload)?;

        // An empty event set is indistinguishable from an empty body for
        // clients, and is rejected here before credentials are even looked at
        match &request {
            RawRequest::Batch(batch) if batch.batch.is_empty() => Err(IngestError::NoData),
            RawRequest::Array(events) if events.is_empty() => Err(IngestError::NoData),
            _ => Ok(request),
        }
    }

    /// Resolves the payload into the authoritative event sequence. For batch
    /// wrappers this happens before any per-event processing.
    pub fn events(self) -> Vec<RawEvent> {
        match self {
            RawRequest::Batch(req) => req.batch,
            RawRequest::Array(events) => events,
            RawRequest::One(event) => vec![*event],
        }
    }

    /// The `sent_at` field of a mapping payload. Arrays carry no
    /// request-level send time.
    pub fn sent_at_field(&self) -> Option<&str> {
        match self {
            RawRequest::Batch(req) => req.sent_at.as_deref(),
            RawRequest::One(event) => event.sent_at.as_deref(),
            RawRequest::Array(_) => None,
        }
    }

    /// Token discovery inside the payload. Sequences defer to their first
    /// element (Mixpanel Swift SDK convention), mappings are checked
    /// directly.
    pub fn extract_token(&self) -> Option<String> {
        match self {
            RawRequest::Batch(req) => non_empty(req.dollar_token.clone())
                .or_else(|| non_empty(req.token.clone()))
                .or_else(|| non_empty(req.api_key.clone())),
            RawRequest::One(event) => event.extract_token(),
            RawRequest::Array(events) => events.first().and_then(RawEvent::extract_token),
        }
    }

    /// Explicit tenant id for the personal-credential path, with the same
    /// first-element unwrap as token discovery.
    pub fn project_id_field(&self) -> Option<&Value> {
        match self {
            RawRequest::Batch(req) => req.project_id.as_ref(),
            RawRequest::One(event) => event.project_id.as_ref(),
            RawRequest::Array(events) => events.first().and_then(|e| e.project_id.as_ref()),
        }
    }
}

// Fallback chains are ordered lists of pure extractors so precedence stays
// independently testable. An empty string counts as absent for each source,
// letting the next one take over.
const TOKEN_SOURCES: [fn(&RawEvent) -> Option<String>; 4] = [
    |e| non_empty(e.dollar_token.clone()),              // JS identify call
    |e| non_empty(e.token.clone()),                     // JS reloadFeatures call
    |e| non_empty(e.api_key.clone()),                   // server-side libraries
    |e| value_to_opt_string(e.properties.get("token")), // JS capture call
];

const DISTINCT_ID_SOURCES: [fn(&RawEvent) -> Option<&Value>; 3] = [
    |e| e.dollar_distinct_id.as_ref(),
    |e| e.properties.get("distinct_id"),
    |e| e.distinct_id.as_ref(),
];

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn value_to_opt_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub const DISTINCT_ID_MAX_LENGTH: usize = 200;

impl RawEvent {
    pub fn extract_token(&self) -> Option<String> {
        TOKEN_SOURCES.iter().find_map(|source| source(self))
    }

    /// Extracts, stringifies and trims the distinct_id to 200 chars.
    /// SDKs send it in one of three places and as arbitrary JSON scalars or
    /// containers, which we best-effort stringify.
    pub fn extract_distinct_id(&self) -> Result<String, IngestError> {
        let value = DISTINCT_ID_SOURCES
            .iter()
            .find_map(|source| source(self).filter(|v| !v.is_null()))
            .ok_or(IngestError::MissingDistinctId)?;

        let distinct_id = value
            .as_str()
            .map(|s| s.to_owned())
            .unwrap_or_else(|| value.to_string());
        match distinct_id.len() {
            0 => Err(IngestError::MissingDistinctId),
            1..=DISTINCT_ID_MAX_LENGTH => Ok(distinct_id),
            _ => Ok(distinct_id.chars().take(DISTINCT_ID_MAX_LENGTH).collect()),
        }
    }
}

/// Parses a client-declared send time: all-digit values are epoch time
/// (longer than 11 chars means milliseconds), anything else must be
/// ISO-8601 with a zone offset.
pub fn parse_sent_at(raw: &str) -> Result<OffsetDateTime, IngestError> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if raw.len() > 11 {
            // milliseconds; update to 12 if the year passes 5138
            let millis: i128 = raw
                .parse()
                .map_err(|_| IngestError::InvalidSentAt(raw.to_string()))?;
            OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000)
                .map_err(|_| IngestError::InvalidSentAt(raw.to_string()))
        } else {
            let seconds: i64 = raw
                .parse()
                .map_err(|_| IngestError::InvalidSentAt(raw.to_string()))?;
            OffsetDateTime::from_unix_timestamp(seconds)
                .map_err(|_| IngestError::InvalidSentAt(raw.to_string()))
        }
    } else {
        OffsetDateTime::parse(raw, &Iso8601::DEFAULT)
            .map_err(|_| IngestError::InvalidSentAt(raw.to_string()))
    }
}

/// Send-time precedence: query parameter, then mapping payload field, then
/// form field. An empty value counts as absent and falls through to the
/// next source. Absence is not an error and never defaults to now, so that
/// downstream skew correction can tell "not provided" apart.
pub fn resolve_sent_at(
    query: &EventQuery,
    form: &EventFormData,
    payload: &RawRequest,
) -> Result<Option<OffsetDateTime>, IngestError> {
    let raw = query
        .sent_at
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| payload.sent_at_field().filter(|s| !s.is_empty()))
        .or_else(|| form.sent_at.as_deref().filter(|s| !s.is_empty()));

    match raw {
        Some(value) => parse_sent_at(value).map(Some),
        None => Ok(None),
    }
}

/// Request-scoped values shared by every event of the batch.
#[derive(Debug)]
pub struct ProcessingContext {
    pub lib_version: Option<String>,
    pub sent_at: Option<OffsetDateTime>,
    pub team: Team,
    pub now: String,
    pub client_ip: String,
    pub site_url: String,
}

/// The canonical record handed to the delivery backend.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct ProcessedEvent {
    pub uuid: Uuid,
    pub distinct_id: String,
    /// Omitted (not nulled) when the tenant anonymizes IPs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub site_url: String,
    pub data: String,
    pub team_id: i64,
    pub now: String,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_at: Option<OffsetDateTime>,
}

impl ProcessedEvent {
    /// Partition key keeping one user's events ordered within a topic.
    pub fn key(&self) -> String {
        format!("{}:{}", self.team_id, self.distinct_id)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use serde_json::json;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    use super::{
        parse_sent_at, resolve_sent_at, Compression, EventFormData, EventQuery, IngestError,
        RawRequest,
    };

    fn parse(input: &'static str) -> RawRequest {
        RawRequest::from_bytes(input.into(), None).expect("failed to parse")
    }

    #[test]
    fn decode_empty_body_is_no_data() {
        assert!(matches!(
            RawRequest::from_bytes(Bytes::new(), None),
            Err(IngestError::NoData)
        ));
        assert!(matches!(
            RawRequest::from_bytes("   ".into(), None),
            Err(IngestError::NoData)
        ));
    }

    #[test]
    fn decode_empty_event_set_is_no_data() {
        // Same rejection as an empty body, decided before authentication
        assert!(matches!(
            RawRequest::from_bytes("[]".into(), None),
            Err(IngestError::NoData)
        ));
        assert!(matches!(
            RawRequest::from_bytes(r#"{"batch": []}"#.into(), None),
            Err(IngestError::NoData)
        ));
    }

    #[test]
    fn decode_garbage_is_malformed() {
        assert!(matches!(
            RawRequest::from_bytes("not json at all".into(), None),
            Err(IngestError::RequestParsingError(_))
        ));
        // Invalid gzip stream behind the magic bytes
        let bogus = Bytes::from(vec![0x1f, 0x8b, 8, 1, 2, 3]);
        assert!(matches!(
            RawRequest::from_bytes(bogus, None),
            Err(IngestError::RequestDecodingError(_))
        ));
    }

    #[test]
    fn decode_gzipped_event() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(
            &mut encoder,
            br#"{"event": "gzipped", "distinct_id": "id1", "token": "t"}"#,
        )
        .unwrap();
        let bytes = Bytes::from(encoder.finish().unwrap());

        // No compression hint: detected from magic bytes
        let events = RawRequest::from_bytes(bytes, None)
            .expect("failed to parse")
            .events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "gzipped");
    }

    #[test]
    fn decode_lz64_event() {
        let compressed = lz_str::compress_to_base64(
            r#"{"event": "squeezed", "distinct_id": "id1", "token": "t"}"#,
        );
        let events = RawRequest::from_bytes(compressed.into(), Some(Compression::Lz64))
            .expect("failed to parse")
            .events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "squeezed");
    }

    #[test]
    fn decoding_is_idempotent() {
        let body = r#"[{"event": "e1", "distinct_id": "a"}, {"event": "e2", "distinct_id": "b"}]"#;
        let first = parse(body).events();
        let second = parse(body).events();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.event, b.event);
            assert_eq!(
                a.extract_distinct_id().unwrap(),
                b.extract_distinct_id().unwrap()
            );
        }
    }

    #[test]
    fn batch_key_is_authoritative() {
        let events = parse(r#"{"api_key": "tok", "batch": [{"event": "one"}, {"event": "two"}]}"#)
            .events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "one");
        assert_eq!(events[1].event, "two");
    }

    #[test]
    fn token_precedence_in_payload() {
        // Top-level beats nested properties.token
        let req = parse(r#"{"event": "e", "token": "top", "properties": {"token": "nested"}}"#);
        assert_eq!(req.extract_token(), Some("top".to_string()));

        // $token beats token
        let req = parse(r#"{"event": "e", "$token": "js", "token": "reload"}"#);
        assert_eq!(req.extract_token(), Some("js".to_string()));

        // token beats api_key
        let req = parse(r#"{"event": "e", "token": "reload", "api_key": "server"}"#);
        assert_eq!(req.extract_token(), Some("reload".to_string()));

        // properties.token as last resort
        let req = parse(r#"{"event": "e", "properties": {"token": "nested"}}"#);
        assert_eq!(req.extract_token(), Some("nested".to_string()));

        // Arrays defer to their first element
        let req = parse(r#"[{"event": "e", "api_key": "first"}, {"event": "e", "token": "second"}]"#);
        assert_eq!(req.extract_token(), Some("first".to_string()));

        // Batch wrapper carries its own credentials
        let req = parse(r#"{"api_key": "wrapper", "batch": [{"event": "e", "token": "inner"}]}"#);
        assert_eq!(req.extract_token(), Some("wrapper".to_string()));

        assert_eq!(parse(r#"{"event": "e"}"#).extract_token(), None);
    }

    #[test]
    fn empty_token_sources_fall_through() {
        let req = parse(r#"{"event": "e", "$token": "", "token": "reload"}"#);
        assert_eq!(req.extract_token(), Some("reload".to_string()));

        let req = parse(r#"{"event": "e", "api_key": "", "properties": {"token": "nested"}}"#);
        assert_eq!(req.extract_token(), Some("nested".to_string()));

        let req = parse(r#"{"event": "e", "token": "", "properties": {"token": ""}}"#);
        assert_eq!(req.extract_token(), None);

        let req = parse(r#"{"$token": "", "api_key": "wrapper", "batch": [{"event": "e"}]}"#);
        assert_eq!(req.extract_token(), Some("wrapper".to_string()));
    }

    #[test]
    fn empty_sent_at_sources_fall_through() {
        let query = EventQuery {
            sent_at: Some("".to_string()),
            ..Default::default()
        };
        let form = EventFormData {
            sent_at: Some("2000-01-01T00:00:00+00:00".to_string()),
            ..Default::default()
        };
        let payload = parse(r#"{"event": "e", "sent_at": ""}"#);

        let resolved = resolve_sent_at(&query, &form, &payload).unwrap().unwrap();
        assert_eq!(resolved.year(), 2000);

        // All sources empty reads as not provided, not as an error
        let resolved = resolve_sent_at(&query, &EventFormData::default(), &payload).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn distinct_id_precedence() {
        let req = parse(
            r#"{"event": "e", "$distinct_id": "a", "properties": {"distinct_id": "b"}, "distinct_id": "c"}"#,
        );
        let event = &req.events()[0];
        assert_eq!(event.extract_distinct_id().unwrap(), "a");

        let req = parse(r#"{"event": "e", "properties": {"distinct_id": "b"}, "distinct_id": "c"}"#);
        assert_eq!(req.events()[0].extract_distinct_id().unwrap(), "b");

        let req = parse(r#"{"event": "e", "distinct_id": "c"}"#);
        assert_eq!(req.events()[0].extract_distinct_id().unwrap(), "c");

        // Numbers are stringified
        let req = parse(r#"{"event": "e", "distinct_id": 23}"#);
        assert_eq!(req.events()[0].extract_distinct_id().unwrap(), "23");

        // Null values fall through to the next source
        let req = parse(r#"{"event": "e", "$distinct_id": null, "distinct_id": "c"}"#);
        assert_eq!(req.events()[0].extract_distinct_id().unwrap(), "c");

        assert!(matches!(
            parse(r#"{"event": "e"}"#).events()[0].extract_distinct_id(),
            Err(IngestError::MissingDistinctId)
        ));
        assert!(matches!(
            parse(r#"{"event": "e", "distinct_id": ""}"#).events()[0].extract_distinct_id(),
            Err(IngestError::MissingDistinctId)
        ));
    }

    #[test]
    fn distinct_id_trimmed_to_200_chars() {
        let distinct_id: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(222)
            .map(char::from)
            .collect();
        let (expected, _) = distinct_id.split_at(200); // ascii only
        let input = json!([{"event": "e", "distinct_id": distinct_id}]).to_string();

        let parsed = RawRequest::from_bytes(input.into(), None)
            .expect("failed to parse")
            .events();
        assert_eq!(parsed[0].extract_distinct_id().unwrap(), expected);
    }

    #[test]
    fn sent_at_epoch_seconds_and_millis_agree() {
        let seconds = parse_sent_at("1620000000").unwrap();
        let millis = parse_sent_at("1620000000000").unwrap();
        assert_eq!(seconds.unix_timestamp(), 1_620_000_000);
        assert!((seconds - millis).whole_milliseconds().abs() < 1);
    }

    #[test]
    fn sent_at_iso8601() {
        let parsed = parse_sent_at("2021-05-03T00:00:00+00:00").unwrap();
        let expected = OffsetDateTime::parse("2021-05-03T00:00:00Z", &Rfc3339).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn sent_at_garbage_is_fatal() {
        assert!(matches!(
            parse_sent_at("around noon"),
            Err(IngestError::InvalidSentAt(_))
        ));
    }

    #[test]
    fn sent_at_precedence_query_then_payload_then_form() {
        let query = EventQuery {
            sent_at: Some("1620000000".to_string()),
            ..Default::default()
        };
        let form = EventFormData {
            sent_at: Some("2000-01-01T00:00:00+00:00".to_string()),
            ..Default::default()
        };
        let payload = parse(r#"{"event": "e", "sent_at": "2010-01-01T00:00:00+00:00"}"#);

        let resolved = resolve_sent_at(&query, &form, &payload).unwrap().unwrap();
        assert_eq!(resolved.unix_timestamp(), 1_620_000_000);

        let resolved = resolve_sent_at(&EventQuery::default(), &form, &payload)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.year(), 2010);

        let no_payload_field = parse(r#"{"event": "e"}"#);
        let resolved = resolve_sent_at(&EventQuery::default(), &form, &no_payload_field)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.year(), 2000);

        let resolved = resolve_sent_at(
            &EventQuery::default(),
            &EventFormData::default(),
            &no_payload_field,
        )
        .unwrap();
        assert!(resolved.is_none());
    }
}
