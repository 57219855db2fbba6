use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use failure::{format_err, Error};
use fnv::FnvHashMap;
use rocksdb::backup::{BackupEngine, BackupEngineOptions, RestoreOptions};
use rocksdb::{ColumnFamilyDescriptor, Env, IteratorMode, WriteBatch, WriteOptions, DB};
use tempfile::TempDir;

use crate::state::State;

const CLOSED: &str = "state store is closed";

/// RocksDB-backed `State`. Each keyspace is a column family; buffered
/// writes land through a single WAL-synced `WriteBatch` per flush, so a
/// flush is atomic across every keyspace touched since the last one.
pub struct RocksState {
    path: PathBuf,
    backup_path: PathBuf,
    backups_to_keep: usize,
    db_opts: rocksdb::Options,
    // An Option so restore/destroy can drop the handle and reopen in place.
    db: Option<DB>,
    pending: FnvHashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    // Ephemeral stores live in (and die with) a temporary directory.
    _directory: Option<TempDir>,
}

impl RocksState {
    pub fn open<P: AsRef<Path>>(
        path: P,
        backup_path: P,
        backups_to_keep: usize,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let db_opts = Self::build_options();
        let db = Self::open_db(&db_opts, &path)?;
        Ok(Self {
            path,
            backup_path: backup_path.as_ref().to_path_buf(),
            backups_to_keep,
            db_opts,
            db: Some(db),
            pending: FnvHashMap::default(),
            _directory: None,
        })
    }

    /// A store in a temporary directory, deleted on drop. Mainly for tests.
    pub fn ephemeral(prefix: &str) -> Result<Self, Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(format!("{}.db", prefix));
        let backup_path = dir.path().join(format!("{}.backup", prefix));
        let mut state = Self::open(path, backup_path, 2)?;
        state._directory = Some(dir);
        Ok(state)
    }

    fn build_options() -> rocksdb::Options {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Keep up to 4 parallel memtables:
        opts.set_max_write_buffer_number(4);
        opts
    }

    fn open_db(opts: &rocksdb::Options, path: &Path) -> Result<DB, Error> {
        // The exact same column families must be listed when reopening, so
        // discover the existing ones first.
        let cf_names = DB::list_cf(opts, path).unwrap_or_else(|_| vec!["default".to_string()]);
        let descriptors = cf_names
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::build_options()))
            .collect::<Vec<_>>();
        Ok(DB::open_cf_descriptors(opts, path, descriptors)?)
    }

    fn db(&self) -> &DB {
        self.db.as_ref().expect(CLOSED)
    }

    fn backup_engine(&self) -> Result<BackupEngine, Error> {
        let opts = BackupEngineOptions::new(&self.backup_path)?;
        Ok(BackupEngine::open(&opts, &Env::new()?)?)
    }

    fn write_batch<'a>(
        &self,
        entries: impl Iterator<Item = (&'a String, &'a BTreeMap<Vec<u8>, Option<Vec<u8>>>)>,
    ) -> Result<(), Error> {
        let db = self.db();
        let mut batch = WriteBatch::default();
        for (keyspace, writes) in entries {
            let cf = db
                .cf_handle(keyspace)
                .ok_or_else(|| format_err!("unknown keyspace '{}'", keyspace))?;
            for (key, value) in writes {
                match value {
                    Some(value) => batch.put_cf(cf, key, value),
                    None => batch.delete_cf(cf, key),
                }
            }
        }

        // Sync the batch to RocksDB's WAL so a flush is a durability point.
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        db.write_opt(batch, &opts)?;
        Ok(())
    }
}

impl State for RocksState {
    fn create_key_space(&mut self, name: &str) -> Result<(), Error> {
        if self.db().cf_handle(name).is_none() {
            self.db
                .as_mut()
                .expect(CLOSED)
                .create_cf(name, &self.db_opts)?;
        }
        Ok(())
    }

    fn get(&self, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(writes) = self.pending.get(keyspace) {
            if let Some(value) = writes.get(key) {
                return Ok(value.clone());
            }
        }
        let db = self.db();
        let cf = db
            .cf_handle(keyspace)
            .ok_or_else(|| format_err!("unknown keyspace '{}'", keyspace))?;
        Ok(db.get_cf(cf, key)?)
    }

    fn put(&mut self, keyspace: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.pending
            .entry(keyspace.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, keyspace: &str, key: &[u8]) -> Result<(), Error> {
        self.pending
            .entry(keyspace.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(&self, keyspace: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let db = self.db();
        let cf = db
            .cf_handle(keyspace)
            .ok_or_else(|| format_err!("unknown keyspace '{}'", keyspace))?;
        let mut merged = BTreeMap::new();
        for entry in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry?;
            merged.insert(key.into_vec(), value.into_vec());
        }
        if let Some(writes) = self.pending.get(keyspace) {
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.write_batch(self.pending.iter())?;
        self.pending.clear();
        Ok(())
    }

    fn flush_key_space(&mut self, keyspace: &str) -> Result<(), Error> {
        if let Some((name, writes)) = self.pending.get_key_value(keyspace) {
            self.write_batch(::std::iter::once((name, writes)))?;
        }
        self.pending.remove(keyspace);
        Ok(())
    }

    fn backup(&mut self) -> Result<(), Error> {
        let mut engine = self.backup_engine()?;
        engine.create_new_backup_flush(self.db(), true)?;
        if self.backups_to_keep > 0 {
            engine.purge_old_backups(self.backups_to_keep)?;
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<(), Error> {
        self.pending.clear();
        self.db = None;
        let mut engine = self.backup_engine()?;
        engine.restore_from_latest_backup(&self.path, &self.path, &RestoreOptions::default())?;
        self.db = Some(Self::open_db(&self.db_opts, &self.path)?);
        Ok(())
    }

    fn delete_backups(&mut self) -> Result<(), Error> {
        let mut engine = self.backup_engine()?;
        engine.purge_old_backups(0)?;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.pending.clear();
        self.db = None;
        DB::destroy(&self.db_opts, &self.path)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.flush()?;
        self.db = None;
        Ok(())
    }
}
