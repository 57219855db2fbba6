//! Stream sources and sinks.
//!
//! The engine only sees the `InputTopic`/`OutputTopic` traits; concrete
//! implementations and record codecs are resolved through a registry of
//! constructor functions keyed by stable names, populated at program start.
//! Configuration refers to the names.

mod codec;
mod memory;

use std::collections::BTreeMap;
use std::collections::HashMap;

use failure::{format_err, Error};

pub use self::codec::{JsonSerde, RecordSerde};
pub use self::memory::{MemoryLog, MemoryOutputLog, MemoryOutputTopic, MemoryTopic};

use crate::bytes::ByteKey;
use crate::record::{ConsumerRecord, DenormalizedRecord, Record};

/// A per-entity input stream.
pub trait InputTopic {
    /// The next batch of records, empty when caught up. Yielded records are
    /// visible to `read_by_pk` and covered by the next `commit`.
    fn read_next(&mut self) -> Result<Vec<ConsumerRecord>, Error>;

    /// The current record for a key, over everything yielded so far.
    /// `None` when the key is unknown or tombstoned.
    fn read_by_pk(&mut self, key: &ByteKey) -> Result<Option<Record>, Error>;

    /// Records behind the end of the stream.
    fn lag(&self) -> u64;

    /// Persists the consumed position up to the latest yielded record.
    fn commit(&mut self) -> Result<(), Error>;

    /// Identifier matched against transaction `data_collections` entries
    /// when `topics.prefixed` is on.
    fn table_name(&self) -> &str;

    /// The external topic name, matched raw when `topics.prefixed` is off.
    fn topic_name(&self) -> &str;
}

/// A per-root output stream; repeated writes under one key overwrite.
pub trait OutputTopic {
    fn write(&mut self, key: &ByteKey, record: &DenormalizedRecord) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
}

/// The engine's input topics, one per entity.
pub type Inputs = HashMap<String, Box<dyn InputTopic>>;

/// The engine's output topics, one per denormalized name.
pub type Outputs = HashMap<String, Box<dyn OutputTopic>>;

/// The merged configuration view for one topic: `topics.default` overlaid
/// with `topics.<short name>`.
#[derive(Clone, Debug, Default)]
pub struct TopicSpec {
    short_name: String,
    options: BTreeMap<String, serde_yaml::Value>,
}

impl TopicSpec {
    pub fn new(short_name: String, options: BTreeMap<String, serde_yaml::Value>) -> Self {
        TopicSpec {
            short_name,
            options,
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Which registered topic implementation to construct.
    pub fn kind(&self) -> &str {
        self.str_option("topic.kind").unwrap_or("memory")
    }

    /// Which registered record serde decodes values.
    pub fn value_serde(&self) -> &str {
        self.str_option("value.serde").unwrap_or("json")
    }

    pub fn topic_name(&self) -> String {
        self.str_option("topic.name")
            .unwrap_or(&self.short_name)
            .to_string()
    }

    pub fn table_name(&self) -> String {
        self.str_option("table.name")
            .unwrap_or(&self.short_name)
            .to_string()
    }

    pub fn batch_size(&self) -> usize {
        self.options
            .get("batch.size")
            .and_then(|v| v.as_u64())
            .unwrap_or(500) as usize
    }

    fn str_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

pub type InputCtor = fn(&TopicSpec, &TopicRegistry) -> Result<Box<dyn InputTopic>, Error>;
pub type OutputCtor = fn(&TopicSpec, &TopicRegistry) -> Result<Box<dyn OutputTopic>, Error>;
pub type SerdeCtor = fn() -> Box<dyn RecordSerde>;

/// Constructor functions for topics and serdes, keyed by stable names.
pub struct TopicRegistry {
    inputs: HashMap<String, InputCtor>,
    outputs: HashMap<String, OutputCtor>,
    serdes: HashMap<String, SerdeCtor>,
}

impl TopicRegistry {
    /// A registry holding the built-in `memory` topics and `json` serde.
    pub fn with_defaults() -> Self {
        let mut registry = TopicRegistry {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            serdes: HashMap::new(),
        };
        registry.register_input("memory", memory::input_from_spec);
        registry.register_output("memory", memory::output_from_spec);
        registry.register_serde("json", || Box::new(JsonSerde));
        registry
    }

    pub fn register_input(&mut self, name: &str, ctor: InputCtor) {
        self.inputs.insert(name.to_string(), ctor);
    }

    pub fn register_output(&mut self, name: &str, ctor: OutputCtor) {
        self.outputs.insert(name.to_string(), ctor);
    }

    pub fn register_serde(&mut self, name: &str, ctor: SerdeCtor) {
        self.serdes.insert(name.to_string(), ctor);
    }

    pub fn input(&self, spec: &TopicSpec) -> Result<Box<dyn InputTopic>, Error> {
        let ctor = self
            .inputs
            .get(spec.kind())
            .ok_or_else(|| format_err!("unknown input topic kind '{}'", spec.kind()))?;
        ctor(spec, self)
    }

    pub fn output(&self, spec: &TopicSpec) -> Result<Box<dyn OutputTopic>, Error> {
        let ctor = self
            .outputs
            .get(spec.kind())
            .ok_or_else(|| format_err!("unknown output topic kind '{}'", spec.kind()))?;
        ctor(spec, self)
    }

    pub fn serde(&self, name: &str) -> Result<Box<dyn RecordSerde>, Error> {
        let ctor = self
            .serdes
            .get(name)
            .ok_or_else(|| format_err!("unknown record serde '{}'", name))?;
        Ok(ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec = TopicSpec::new("media".to_string(), BTreeMap::new());
        assert_eq!(spec.kind(), "memory");
        assert_eq!(spec.value_serde(), "json");
        assert_eq!(spec.topic_name(), "media");
        assert_eq!(spec.table_name(), "media");
        assert_eq!(spec.batch_size(), 500);
    }

    #[test]
    fn spec_overrides() {
        let mut options = BTreeMap::new();
        options.insert(
            "topic.name".to_string(),
            serde_yaml::Value::String("dbserver.public.media".to_string()),
        );
        options.insert(
            "batch.size".to_string(),
            serde_yaml::Value::Number(serde_yaml::Number::from(5u64)),
        );
        let spec = TopicSpec::new("media".to_string(), options);
        assert_eq!(spec.topic_name(), "dbserver.public.media");
        assert_eq!(spec.table_name(), "media");
        assert_eq!(spec.batch_size(), 5);
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = TopicRegistry::with_defaults();
        let spec = TopicSpec::new("media".to_string(), BTreeMap::new());
        assert!(registry.input(&spec).is_ok());
        assert!(registry.output(&spec).is_ok());
        assert!(registry.serde("json").is_ok());
        assert!(registry.serde("protobuf").is_err());

        let mut options = BTreeMap::new();
        options.insert(
            "topic.kind".to_string(),
            serde_yaml::Value::String("kafka".to_string()),
        );
        let spec = TopicSpec::new("media".to_string(), options);
        assert!(registry.input(&spec).is_err());
    }
}
