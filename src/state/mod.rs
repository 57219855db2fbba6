//! The durable keyspaced key→value store behind the indices, the pending
//! sets, and anything else the engine must recover after a restart.
//!
//! Writes are buffered in the store and made durable by `flush`, which is
//! the engine's single write barrier: everything buffered since the last
//! flush lands atomically, so a recovered store always holds a matched
//! snapshot of indices and pending sets.

mod memory;
mod rocks;

use failure::Error;

pub use self::memory::MemoryState;
pub use self::rocks::RocksState;

/// Reserved keyspace holding engine metadata (pending-set serializations).
pub const METADATA_KEYSPACE: &str = "__southpaw.metadata";

pub trait State {
    /// Ensures the named keyspace exists. Idempotent.
    fn create_key_space(&mut self, name: &str) -> Result<(), Error>;

    /// Reads a key, observing writes buffered since the last flush.
    fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Buffers a write; durable after the next `flush`.
    fn put(&mut self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Buffers a deletion; durable after the next `flush`.
    fn delete(&mut self, keyspace: &str, key: &[u8]) -> Result<(), Error>;

    /// All entries of a keyspace in ascending key order, buffered writes
    /// included.
    fn scan(&self, keyspace: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;

    /// Makes every buffered write durable, atomically across keyspaces.
    fn flush(&mut self) -> Result<(), Error>;

    /// Makes one keyspace's buffered writes durable.
    fn flush_key_space(&mut self, keyspace: &str) -> Result<(), Error>;

    /// Takes a snapshot backup of the flushed store.
    fn backup(&mut self) -> Result<(), Error>;

    /// Replaces the store's contents from the latest backup.
    fn restore(&mut self) -> Result<(), Error>;

    /// Deletes all backups.
    fn delete_backups(&mut self) -> Result<(), Error>;

    /// Deletes the store itself. The store is unusable afterwards.
    fn destroy(&mut self) -> Result<(), Error>;

    /// Flushes and releases the store.
    fn close(&mut self) -> Result<(), Error>;
}
