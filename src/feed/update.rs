use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeedError;

/// Normalized price tick relayed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Update {
    pub symbol: String,
    pub last_price: f64,
    pub timestamp: String,
}

impl Update {
    pub fn new(symbol: impl Into<String>, last_price: f64, timestamp: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            timestamp: timestamp.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Only the fields we relay; everything else in the instrument row is ignored.
#[derive(Debug, Deserialize)]
struct InstrumentRecord {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: f64,
    timestamp: String,
}

impl From<InstrumentRecord> for Update {
    fn from(record: InstrumentRecord) -> Self {
        Self::new(record.symbol, record.last_price, record.timestamp)
    }
}

/// Decodes one upstream frame.
///
/// Returns `Ok(None)` for every frame that should be discarded silently
/// (partials, inserts, deletes, info and subscribe acknowledgements, updates
/// without a price). An `update` frame that carries a price but does not fit
/// the instrument record shape is a [`FeedError::SchemaMismatch`].
pub fn decode_frame(text: &str) -> Result<Option<Update>, FeedError> {
    let frame: Value = serde_json::from_str(text)?;

    if frame.get("action").and_then(Value::as_str) != Some("update") {
        return Ok(None);
    }

    let record = match frame.get("data") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(records)) => match records.first() {
            Some(record) => record,
            None => return Ok(None),
        },
        Some(other) => {
            return Err(FeedError::SchemaMismatch(format!(
                "`data` must be an array, got {}",
                value_kind(other)
            )))
        }
    };

    let fields = record.as_object().ok_or_else(|| {
        FeedError::SchemaMismatch(format!("data record must be an object, got {}", value_kind(record)))
    })?;

    match fields.get("lastPrice") {
        None | Some(Value::Null) => return Ok(None),
        Some(_) => {}
    }

    InstrumentRecord::deserialize(record)
        .map(|record| Some(Update::from(record)))
        .map_err(|e| FeedError::SchemaMismatch(e.to_string()))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
