use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;

use failure::Error;
use fnv::FnvHashMap;

use crate::bytes::ByteKey;
use crate::record::{ConsumerRecord, DenormalizedRecord, Record};
use crate::topic::{InputTopic, OutputTopic, RecordSerde, TopicRegistry, TopicSpec};

struct LogEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    timestamp: i64,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    committed: usize,
}

/// The shared backing log of a `MemoryTopic`.
///
/// Handles are cheap clones over the same log, so a test can keep pushing
/// records while the engine consumes, and a topic re-attached to the log
/// resumes from the committed position like a restarted consumer would.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Rc<RefCell<LogInner>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }

    pub fn push(&self, key: impl Into<Vec<u8>>, value: Option<Vec<u8>>, timestamp: i64) {
        self.inner.borrow_mut().entries.push(LogEntry {
            key: key.into(),
            value,
            timestamp,
        });
    }

    pub fn push_json(&self, key: &str, value: Option<serde_json::Value>, timestamp: i64) {
        let value = value.map(|v| serde_json::to_vec(&v).unwrap());
        self.push(key.as_bytes().to_vec(), value, timestamp);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed(&self) -> usize {
        self.inner.borrow().committed
    }
}

/// In-memory `InputTopic` over a shared `MemoryLog`. Values are raw bytes
/// decoded through the configured record serde as they are yielded.
pub struct MemoryTopic {
    short_name: String,
    topic_name: String,
    table_name: String,
    log: MemoryLog,
    serde: Box<dyn RecordSerde>,
    position: usize,
    by_pk: FnvHashMap<ByteKey, Option<Record>>,
    batch_size: usize,
}

impl MemoryTopic {
    /// A topic over `log` with default naming and the JSON serde; the
    /// common shape in tests.
    pub fn new(short_name: &str, log: MemoryLog) -> Result<Self, Error> {
        Self::attach(
            short_name.to_string(),
            short_name.to_string(),
            short_name.to_string(),
            log,
            Box::new(crate::topic::JsonSerde),
            500,
        )
    }

    /// Attaches to a log at its committed position, rebuilding the
    /// PK-lookup view over the already-consumed prefix.
    pub fn attach(
        short_name: String,
        topic_name: String,
        table_name: String,
        log: MemoryLog,
        serde: Box<dyn RecordSerde>,
        batch_size: usize,
    ) -> Result<Self, Error> {
        let position = log.committed();
        let mut topic = MemoryTopic {
            short_name,
            topic_name,
            table_name,
            log,
            serde,
            position: 0,
            by_pk: FnvHashMap::default(),
            batch_size: cmp::max(1, batch_size),
        };
        // replay the committed prefix into the PK view
        while topic.position < position {
            topic.read_batch(position)?;
        }
        Ok(topic)
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    fn read_batch(&mut self, limit: usize) -> Result<Vec<ConsumerRecord>, Error> {
        let shared = self.log.inner.borrow();
        let end = cmp::min(
            cmp::min(limit, shared.entries.len()),
            self.position + self.batch_size,
        );
        let mut out = Vec::with_capacity(end.saturating_sub(self.position));
        for entry in &shared.entries[self.position..end] {
            let key = ByteKey::from(&entry.key[..]);
            let value = match entry.value {
                Some(ref bytes) => Some(self.serde.decode(bytes)?),
                None => None,
            };
            let txn = value.as_ref().and_then(|r| r.transaction());
            self.by_pk.insert(key.clone(), value.clone());
            out.push(ConsumerRecord {
                key,
                value,
                timestamp: entry.timestamp,
                txn,
            });
        }
        self.position = end;
        Ok(out)
    }
}

impl InputTopic for MemoryTopic {
    fn read_next(&mut self) -> Result<Vec<ConsumerRecord>, Error> {
        let limit = self.log.len();
        self.read_batch(limit)
    }

    fn read_by_pk(&mut self, key: &ByteKey) -> Result<Option<Record>, Error> {
        Ok(self.by_pk.get(key).cloned().unwrap_or(None))
    }

    fn lag(&self) -> u64 {
        (self.log.len() - self.position) as u64
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.log.inner.borrow_mut().committed = self.position;
        Ok(())
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn topic_name(&self) -> &str {
        &self.topic_name
    }
}

#[derive(Default)]
struct OutInner {
    written: Vec<(Vec<u8>, Vec<u8>)>,
    writes: u64,
    flushes: u64,
}

/// The observable side of a `MemoryOutputTopic`: everything flushed, in
/// write order, plus write/flush counts for assertions.
#[derive(Clone, Default)]
pub struct MemoryOutputLog {
    inner: Rc<RefCell<OutInner>>,
}

impl MemoryOutputLog {
    pub fn new() -> Self {
        MemoryOutputLog::default()
    }

    /// Total writes issued, flushed or not.
    pub fn writes(&self) -> u64 {
        self.inner.borrow().writes
    }

    pub fn flushes(&self) -> u64 {
        self.inner.borrow().flushes
    }

    /// All flushed records in write order.
    pub fn records(&self) -> Vec<(ByteKey, DenormalizedRecord)> {
        self.inner
            .borrow()
            .written
            .iter()
            .map(|(key, value)| {
                (
                    ByteKey::from(&key[..]),
                    serde_json::from_slice(value).expect("stored output was not valid json"),
                )
            })
            .collect()
    }

    /// The last flushed record for a key; the compacted view a downstream
    /// consumer of the keyed stream would observe.
    pub fn latest(&self, key: &ByteKey) -> Option<DenormalizedRecord> {
        self.records()
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, record)| record)
    }
}

/// In-memory `OutputTopic`; writes buffer until `flush`.
pub struct MemoryOutputTopic {
    short_name: String,
    log: MemoryOutputLog,
    buffer: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemoryOutputTopic {
    pub fn new(short_name: &str, log: MemoryOutputLog) -> Self {
        MemoryOutputTopic {
            short_name: short_name.to_string(),
            log,
            buffer: Vec::new(),
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }
}

impl OutputTopic for MemoryOutputTopic {
    fn write(&mut self, key: &ByteKey, record: &DenormalizedRecord) -> Result<(), Error> {
        let encoded = serde_json::to_vec(record)?;
        self.buffer.push((key.as_bytes().to_vec(), encoded));
        self.log.inner.borrow_mut().writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let mut inner = self.log.inner.borrow_mut();
        inner.written.append(&mut self.buffer);
        inner.flushes += 1;
        Ok(())
    }
}

pub(super) fn input_from_spec(
    spec: &TopicSpec,
    registry: &TopicRegistry,
) -> Result<Box<dyn InputTopic>, Error> {
    let serde = registry.serde(spec.value_serde())?;
    Ok(Box::new(MemoryTopic::attach(
        spec.short_name().to_string(),
        spec.topic_name(),
        spec.table_name(),
        MemoryLog::new(),
        serde,
        spec.batch_size(),
    )?))
}

pub(super) fn output_from_spec(
    spec: &TopicSpec,
    _registry: &TopicRegistry,
) -> Result<Box<dyn OutputTopic>, Error> {
    Ok(Box::new(MemoryOutputTopic::new(
        spec.short_name(),
        MemoryOutputLog::new(),
    )))
}
