//! The merge-by-time scheduler: a globally ordered interleaving of pending
//! records across all input streams, honoring upstream transaction
//! grouping.
//!
//! One holder per stream keeps the head of that stream's last batch in a
//! min-heap ordered by `(timestamp, txn-rank, total_order)`; the rest of
//! the batch waits in a per-stream buffer. Streams with nothing buffered
//! sit in a probe set and are re-read on every poll. The synthetic
//! `transactions` stream injects BEGIN/END markers that open and close the
//! current transaction; while one is open, records tagged with it win ties
//! against everything else, which is why BEGIN re-heaps the queue.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use failure::{bail, format_err, Error};
use fnv::FnvHashMap;

use crate::record::{ConsumerRecord, MarkerStatus, TransactionMarker};
use crate::topic::Inputs;

/// Name of the stream carrying transaction envelopes.
pub const TRANSACTIONS_STREAM: &str = "transactions";

/// What a poll of the scheduler produced.
#[derive(Debug)]
pub enum Poll {
    /// The next record in global order.
    Record {
        entity: String,
        record: ConsumerRecord,
    },
    /// A transaction opened; ties now break toward its records.
    TxnBegin { id: String },
    /// A transaction closed; flushing is allowed again.
    TxnEnd { id: String },
    /// Nothing ready on any stream.
    Idle,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    timestamp: i64,
    txn_rank: u8,
    total_order: i64,
}

struct Entry {
    key: SortKey,
    entity: String,
    record: ConsumerRecord,
    marker: Option<TransactionMarker>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.entity == other.entity
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<::std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> ::std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.entity.cmp(&other.entity))
    }
}

pub struct Scheduler {
    heap: BinaryHeap<Reverse<Entry>>,
    buffered: FnvHashMap<String, VecDeque<ConsumerRecord>>,
    probe: BTreeSet<String>,
    current_txn: Option<String>,
    // events observed per entity within the current transaction
    txn_counts: FnvHashMap<String, u64>,
    prefixed: bool,
    // data_collection alias → entity, per the prefixed and raw rules
    tables: FnvHashMap<String, String>,
    topics: FnvHashMap<String, String>,
}

impl Scheduler {
    pub fn new(inputs: &Inputs, prefixed: bool) -> Scheduler {
        let mut tables = FnvHashMap::default();
        let mut topics = FnvHashMap::default();
        let mut probe = BTreeSet::new();
        for (entity, topic) in inputs {
            probe.insert(entity.clone());
            let name = topic.topic_name().to_string();
            let stripped = match name.find('.') {
                Some(at) => name[at + 1..].to_string(),
                None => topic.table_name().to_string(),
            };
            tables.insert(stripped, entity.clone());
            topics.insert(name, entity.clone());
        }
        Scheduler {
            heap: BinaryHeap::new(),
            buffered: FnvHashMap::default(),
            probe,
            current_txn: None,
            txn_counts: FnvHashMap::default(),
            prefixed,
            tables,
            topics,
        }
    }

    /// Flushing pending emits is only allowed outside a transaction.
    pub fn flush_allowed(&self) -> bool {
        self.current_txn.is_none()
    }

    pub fn current_txn(&self) -> Option<&str> {
        self.current_txn.as_deref()
    }

    /// Whether every yielded record has been handed to the caller. Commits
    /// are gated on this so committed positions never run ahead of
    /// processed work.
    pub fn is_drained(&self) -> bool {
        self.heap.is_empty() && self.buffered.values().all(|queue| queue.is_empty())
    }

    /// Produces the next element in global order, probing drained streams
    /// first. `Idle` means no stream had anything ready (or everything
    /// ready is deferred waiting on transaction markers or counts).
    pub fn poll(&mut self, inputs: &mut Inputs) -> Result<Poll, Error> {
        loop {
            let fetched = self.probe_streams(inputs)?;
            match self.try_pop(inputs)? {
                Some(poll) => return Ok(poll),
                None => {
                    if fetched == 0 {
                        return Ok(Poll::Idle);
                    }
                }
            }
        }
    }

    fn probe_streams(&mut self, inputs: &mut Inputs) -> Result<usize, Error> {
        let entities: Vec<String> = self.probe.iter().cloned().collect();
        let mut fetched = 0;
        for entity in entities {
            let topic = inputs
                .get_mut(&entity)
                .ok_or_else(|| format_err!("no input topic for entity '{}'", entity))?;
            let batch = topic.read_next()?;
            if batch.is_empty() {
                continue;
            }
            fetched += batch.len();
            self.probe.remove(&entity);
            let mut queue: VecDeque<ConsumerRecord> = batch.into();
            let head = queue.pop_front().unwrap();
            self.buffered.insert(entity.clone(), queue);
            self.enqueue(entity, head)?;
        }
        Ok(fetched)
    }

    fn try_pop(&mut self, inputs: &Inputs) -> Result<Option<Poll>, Error> {
        let (entity, marker) = match self.heap.peek() {
            None => return Ok(None),
            Some(Reverse(entry)) => (entry.entity.clone(), entry.marker.clone()),
        };

        if let Some(marker) = marker {
            return self.pop_marker(marker);
        }

        // a record tagged with a transaction we have not seen BEGIN for is
        // deferred while markers can still arrive, and fatal otherwise
        let unknown_txn = {
            let Reverse(head) = self.heap.peek().unwrap();
            match head.record.txn {
                Some(ref txn) => match self.current_txn {
                    Some(ref current) if txn.id == *current => None,
                    _ => Some(txn.id.clone()),
                },
                None => None,
            }
        };
        if let Some(txn_id) = unknown_txn {
            let markers_pending = self.probe.contains(TRANSACTIONS_STREAM)
                && inputs
                    .get(TRANSACTIONS_STREAM)
                    .map(|topic| topic.lag() > 0)
                    .unwrap_or(false);
            if markers_pending {
                return Ok(None);
            }
            bail!(
                "record in stream '{}' tagged with unknown transaction '{}'",
                entity,
                txn_id
            );
        }

        let entry = self.pop_and_advance()?;
        if let (Some(current), Some(txn)) = (self.current_txn.as_ref(), entry.record.txn.as_ref())
        {
            if txn.id == *current {
                *self.txn_counts.entry(entry.entity.clone()).or_insert(0) += 1;
            }
        }
        Ok(Some(Poll::Record {
            entity: entry.entity,
            record: entry.record,
        }))
    }

    fn pop_marker(&mut self, marker: TransactionMarker) -> Result<Option<Poll>, Error> {
        match marker.status {
            MarkerStatus::Begin => {
                if let Some(ref open) = self.current_txn {
                    bail!(
                        "transaction '{}' began while '{}' is still open",
                        marker.id,
                        open
                    );
                }
                self.pop_and_advance()?;
                self.current_txn = Some(marker.id.clone());
                self.txn_counts.clear();
                // relative order among queued records may flip now that
                // ties break toward the open transaction
                self.reheap();
                Ok(Some(Poll::TxnBegin { id: marker.id }))
            }
            MarkerStatus::End => {
                match self.current_txn {
                    None => bail!("transaction '{}' ended while none is open", marker.id),
                    Some(ref open) if *open != marker.id => bail!(
                        "transaction '{}' ended while '{}' is open",
                        marker.id,
                        open
                    ),
                    Some(_) => {}
                }
                if let Some(ref collections) = marker.data_collections {
                    for dc in collections {
                        let entity = match self.resolve_alias(&dc.data_collection) {
                            Some(entity) => entity,
                            // not part of this deployment
                            None => continue,
                        };
                        let seen = self.txn_counts.get(&entity).cloned().unwrap_or(0);
                        if seen < dc.event_count && self.probe.contains(&entity) {
                            // declared events have not all arrived; keep probing
                            return Ok(None);
                        }
                    }
                }
                self.pop_and_advance()?;
                self.current_txn = None;
                self.txn_counts.clear();
                self.reheap();
                Ok(Some(Poll::TxnEnd { id: marker.id }))
            }
        }
    }

    fn pop_and_advance(&mut self) -> Result<Entry, Error> {
        let Reverse(entry) = self.heap.pop().expect("pop from an empty scheduler heap");
        let next = self
            .buffered
            .get_mut(&entry.entity)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(record) => self.enqueue(entry.entity.clone(), record)?,
            None => {
                self.probe.insert(entry.entity.clone());
            }
        }
        Ok(entry)
    }

    fn enqueue(&mut self, entity: String, record: ConsumerRecord) -> Result<(), Error> {
        let marker = if entity == TRANSACTIONS_STREAM {
            match record.value {
                Some(ref value) => Some(TransactionMarker::from_record(value)?),
                None => bail!("tombstone on the '{}' stream", TRANSACTIONS_STREAM),
            }
        } else {
            None
        };
        let key = self.sort_key(&record, marker.as_ref());
        self.heap.push(Reverse(Entry {
            key,
            entity,
            record,
            marker,
        }));
        Ok(())
    }

    fn sort_key(&self, record: &ConsumerRecord, marker: Option<&TransactionMarker>) -> SortKey {
        let total_order = match marker {
            // BEGIN sorts before, and END after, any event of the
            // transaction at the same timestamp
            Some(marker) => match marker.status {
                MarkerStatus::Begin => -1,
                MarkerStatus::End => i64::MAX,
            },
            None => record.txn.as_ref().map(|txn| txn.total_order).unwrap_or(0),
        };
        SortKey {
            timestamp: record.timestamp,
            txn_rank: self.rank(record, marker),
            total_order,
        }
    }

    fn rank(&self, record: &ConsumerRecord, marker: Option<&TransactionMarker>) -> u8 {
        let current = match self.current_txn {
            Some(ref id) => id,
            None => return 0,
        };
        let id = marker
            .map(|marker| marker.id.as_str())
            .or_else(|| record.txn.as_ref().map(|txn| txn.id.as_str()));
        match id {
            Some(id) if id == current => 0,
            _ => 1,
        }
    }

    fn reheap(&mut self) {
        let entries: Vec<Entry> = self.heap.drain().map(|Reverse(entry)| entry).collect();
        let rebuilt: BinaryHeap<Reverse<Entry>> = entries
            .into_iter()
            .map(|mut entry| {
                entry.key.txn_rank = self.rank(&entry.record, entry.marker.as_ref());
                Reverse(entry)
            })
            .collect();
        self.heap = rebuilt;
    }

    fn resolve_alias(&self, data_collection: &str) -> Option<String> {
        if self.prefixed {
            self.tables.get(data_collection).cloned()
        } else {
            self.topics.get(data_collection).cloned()
        }
    }
}
