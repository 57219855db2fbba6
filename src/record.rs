use std::collections::BTreeMap;

use failure::{format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bytes::ByteKey;

/// An opaque field-name → value envelope, as produced by a record serde.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Record(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The record's upstream transaction tag, when the envelope carries a
    /// `transaction` object with `id` and `total_order` fields.
    pub fn transaction(&self) -> Option<TransactionInfo> {
        let txn = self.0.get("transaction")?;
        let id = txn.get("id")?.as_str()?.to_string();
        let total_order = txn.get("total_order")?.as_i64()?;
        Some(TransactionInfo { id, total_order })
    }
}

impl From<Value> for Record {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Record(map),
            // non-object payloads surface as a single-field envelope
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Record(map)
            }
        }
    }
}

/// Upstream transaction metadata attached to a source record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: String,
    pub total_order: i64,
}

/// One element yielded by an input stream.
///
/// A `None` value is a tombstone: the row under `key` has been deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerRecord {
    pub key: ByteKey,
    pub value: Option<Record>,
    pub timestamp: i64,
    pub txn: Option<TransactionInfo>,
}

impl ConsumerRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Envelope carried by the synthetic `transactions` stream.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TransactionMarker {
    pub status: MarkerStatus,
    pub id: String,
    #[serde(default)]
    pub data_collections: Option<Vec<DataCollection>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum MarkerStatus {
    #[serde(rename = "BEGIN")]
    Begin,
    #[serde(rename = "END")]
    End,
}

/// Per-table event count declared by an END marker.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DataCollection {
    pub data_collection: String,
    pub event_count: u64,
}

impl TransactionMarker {
    /// Decodes a record from the `transactions` stream. An undecodable
    /// marker indicates upstream corruption and is surfaced, never skipped.
    pub fn from_record(record: &Record) -> Result<TransactionMarker, Error> {
        serde_json::from_value(Value::Object(record.fields().clone()))
            .map_err(|e| format_err!("malformed transaction marker: {}", e))
    }
}

/// The materialized output shape: the flat record of the local entity plus,
/// per child entity, the ordered sequence of child records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DenormalizedRecord {
    pub record: Record,
    pub children: BTreeMap<String, Vec<DenormalizedRecord>>,
}
