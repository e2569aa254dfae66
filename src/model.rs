use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Kinds ───────────────────────────────────────────────────────

/// The two metric families the store knows how to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    /// Last write wins.
    Gauge,
    /// Every write adds its delta to the running sum.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            _ => Err(ProtocolError::UnknownKind(s.to_string())),
        }
    }
}

// ─── Protocol errors ─────────────────────────────────────────────

/// Malformed input from a client. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown metric kind '{0}'")]
    UnknownKind(String),

    #[error("metric '{id}' of kind {kind} is missing its {field}")]
    MissingValue {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("value '{0}' is not a valid number for this metric kind")]
    NotNumeric(String),

    #[error("metric id must not be empty")]
    EmptyId,
}

// ─── Records ─────────────────────────────────────────────────────

/// The payload half of a record. The variant *is* the kind, so a record
/// can never carry both a delta and a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parse the textual value used by the URI update route.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, ProtocolError> {
        match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Self::Gauge)
                .ok_or_else(|| ProtocolError::NotNumeric(raw.to_string())),
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(Self::Counter)
                .map_err(|_| ProtocolError::NotNumeric(raw.to_string())),
        }
    }
}

impl fmt::Display for MetricValue {
    /// Plain-text rendering for `GET /value/{kind}/{name}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge(v) => write!(f, "{v}"),
            Self::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// One named observation. `id` is the merge key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetric", into = "WireMetric")]
pub struct MetricRecord {
    pub id: String,
    pub value: MetricValue,
}

impl MetricRecord {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// False for NaN or infinite gauges, which have no JSON form.
    pub fn is_representable(&self) -> bool {
        match self.value {
            MetricValue::Gauge(v) => v.is_finite(),
            MetricValue::Counter(_) => true,
        }
    }
}

/// On-the-wire shape: `{"id","type","delta"?,"value"?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMetric {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl TryFrom<WireMetric> for MetricRecord {
    type Error = ProtocolError;

    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(ProtocolError::EmptyId);
        }
        let kind: MetricKind = wire.kind.parse()?;
        let value = match kind {
            MetricKind::Gauge => {
                let v = wire.value.ok_or(ProtocolError::MissingValue {
                    id: wire.id.clone(),
                    kind,
                    field: "value",
                })?;
                // JSON has no NaN or infinity; such a gauge could never be exported.
                if !v.is_finite() {
                    return Err(ProtocolError::NotNumeric(v.to_string()));
                }
                MetricValue::Gauge(v)
            }
            MetricKind::Counter => MetricValue::Counter(wire.delta.ok_or(
                ProtocolError::MissingValue {
                    id: wire.id.clone(),
                    kind,
                    field: "delta",
                },
            )?),
        };
        Ok(Self { id: wire.id, value })
    }
}

impl From<MetricRecord> for WireMetric {
    fn from(record: MetricRecord) -> Self {
        let (delta, value) = match record.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: record.id,
            kind: record.value.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

/// Lookup key used by the query routes: `{"id","type"}`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

// ─── Snapshots ───────────────────────────────────────────────────

/// Full-table document `{ "metrics": [...] }`. Used as the persistence file
/// format and as the batch delivery payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPack {
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
}

impl MetricsPack {
    pub fn new(mut metrics: Vec<MetricRecord>) -> Self {
        metrics.sort_by(|a, b| (a.kind(), &a.id).cmp(&(b.kind(), &b.id)));
        Self { metrics }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_counter_and_gauge() {
        let c: MetricRecord =
            serde_json::from_str(r#"{"id":"PollCount","type":"counter","delta":1}"#).unwrap();
        assert_eq!(c, MetricRecord::counter("PollCount", 1));

        let g: MetricRecord =
            serde_json::from_str(r#"{"id":"Alloc","type":"gauge","value":100}"#).unwrap();
        assert_eq!(g, MetricRecord::gauge("Alloc", 100.0));
    }

    #[test]
    fn encodes_only_the_populated_field() {
        let json = serde_json::to_value(MetricRecord::counter("PollCount", 5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "PollCount", "type": "counter", "delta": 5})
        );

        let json = serde_json::to_value(MetricRecord::gauge("Alloc", 1.5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "Alloc", "type": "gauge", "value": 1.5})
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = serde_json::from_str::<MetricRecord>(r#"{"id":"x","type":"histogram","value":1}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown metric kind"));
    }

    #[test]
    fn rejects_kind_without_matching_field() {
        let err = serde_json::from_str::<MetricRecord>(r#"{"id":"x","type":"counter","value":1}"#)
            .unwrap_err();
        assert!(err.to_string().contains("missing its delta"));
    }

    #[test]
    fn parses_uri_values() {
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "42.5").unwrap(),
            MetricValue::Gauge(42.5)
        );
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "7").unwrap(),
            MetricValue::Counter(7)
        );
        assert!(matches!(
            MetricValue::parse(MetricKind::Counter, "7.5"),
            Err(ProtocolError::NotNumeric(_))
        ));
    }

    #[test]
    fn non_finite_gauges_are_not_numbers() {
        for raw in ["NaN", "nan", "inf", "-inf", "infinity"] {
            assert!(
                matches!(
                    MetricValue::parse(MetricKind::Gauge, raw),
                    Err(ProtocolError::NotNumeric(_))
                ),
                "{raw}"
            );
        }
        let wire = WireMetric {
            id: "Bad".into(),
            kind: "gauge".into(),
            delta: None,
            value: Some(f64::INFINITY),
        };
        assert!(matches!(
            MetricRecord::try_from(wire),
            Err(ProtocolError::NotNumeric(_))
        ));
        assert!(!MetricRecord::gauge("Bad", f64::NAN).is_representable());
        assert!(MetricRecord::gauge("Ok", 1.0).is_representable());
    }

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!("GAUGE".parse::<MetricKind>().unwrap(), MetricKind::Gauge);
        assert!("meter".parse::<MetricKind>().is_err());
    }

    #[test]
    fn pack_sorts_by_kind_then_id() {
        let pack = MetricsPack::new(vec![
            MetricRecord::counter("b", 1),
            MetricRecord::gauge("z", 1.0),
            MetricRecord::gauge("a", 1.0),
        ]);
        let ids: Vec<_> = pack.metrics.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "z", "b"]);
    }
}
