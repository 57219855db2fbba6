use std::collections::BTreeMap;

use failure::{bail, Error};

use crate::state::State;

type Space = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory `State`, used by tests and ephemeral runs.
///
/// Buffered writes and the flushed image are kept separate so tests can
/// exercise the same flush discipline the persistent store has; `snapshot`
/// stands in for an on-disk backup.
#[derive(Default)]
pub struct MemoryState {
    spaces: BTreeMap<String, Space>,
    pending: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    snapshot: Option<BTreeMap<String, Space>>,
    flushes: u64,
    backups: u64,
}

impl MemoryState {
    pub fn new() -> Self {
        MemoryState::default()
    }

    /// Number of flushes performed, for test assertions.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Number of backups taken, for test assertions.
    pub fn backups(&self) -> u64 {
        self.backups
    }

    /// Drops all buffered-but-unflushed writes, simulating a crash.
    pub fn drop_pending(&mut self) {
        self.pending.clear();
    }

    fn space(&self, keyspace: &str) -> Result<&Space, Error> {
        match self.spaces.get(keyspace) {
            Some(space) => Ok(space),
            None => bail!("unknown keyspace '{}'", keyspace),
        }
    }

    fn apply(space: &mut Space, writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>) {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    space.insert(key, value);
                }
                None => {
                    space.remove(&key);
                }
            }
        }
    }
}

impl State for MemoryState {
    fn create_key_space(&mut self, name: &str) -> Result<(), Error> {
        self.spaces.entry(name.to_string()).or_default();
        Ok(())
    }

    fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(writes) = self.pending.get(keyspace) {
            if let Some(value) = writes.get(key) {
                return Ok(value.clone());
            }
        }
        Ok(self.space(keyspace)?.get(key).cloned())
    }

    fn put(&mut self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.space(keyspace)?;
        self.pending
            .entry(keyspace.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, keyspace: &str, key: &[u8]) -> Result<(), Error> {
        self.space(keyspace)?;
        self.pending
            .entry(keyspace.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(&self, keyspace: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut merged = self.space(keyspace)?.clone();
        if let Some(writes) = self.pending.get(keyspace) {
            Self::apply(&mut merged, writes.clone());
        }
        Ok(merged.into_iter().collect())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let pending = ::std::mem::take(&mut self.pending);
        for (keyspace, writes) in pending {
            let space = self.spaces.entry(keyspace).or_default();
            Self::apply(space, writes);
        }
        self.flushes += 1;
        Ok(())
    }

    fn flush_key_space(&mut self, keyspace: &str) -> Result<(), Error> {
        if let Some(writes) = self.pending.remove(keyspace) {
            let space = self.spaces.entry(keyspace.to_string()).or_default();
            Self::apply(space, writes);
        }
        Ok(())
    }

    fn backup(&mut self) -> Result<(), Error> {
        self.snapshot = Some(self.spaces.clone());
        self.backups += 1;
        Ok(())
    }

    fn restore(&mut self) -> Result<(), Error> {
        match self.snapshot.clone() {
            Some(snapshot) => {
                self.spaces = snapshot;
                self.pending.clear();
                Ok(())
            }
            None => bail!("no backup to restore from"),
        }
    }

    fn delete_backups(&mut self) -> Result<(), Error> {
        self.snapshot = None;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.spaces.clear();
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.flush()
    }
}
