use failure::{Error, ResultExt};

use crate::record::Record;

/// Decodes raw stream value bytes into a `Record` envelope. Keys are never
/// decoded; the raw key bytes are the primary key.
pub trait RecordSerde {
    fn decode(&self, bytes: &[u8]) -> Result<Record, Error>;
}

/// The built-in serde: values are JSON documents.
pub struct JsonSerde;

impl RecordSerde for JsonSerde {
    fn decode(&self, bytes: &[u8]) -> Result<Record, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).with_context(|_| "undecodable json record value")?;
        Ok(Record::from(value))
    }
}
