//! The driver: consumes the merged record order, translates each change
//! into the set of stale root PKs via the foreign-key indices, and drives
//! the emit and durability paths.

mod denorm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use failure::{bail, format_err, Error};
use fnv::FnvHashMap;
use slog::{debug, info, warn, Logger};

use crate::bytes::{ByteKey, KeySet};
use crate::config::Config;
use crate::index::{join_index_name, parent_index_name, FkIndex, SEP};
use crate::merge::{Poll, Scheduler, TRANSACTIONS_STREAM};
use crate::metrics::Metrics;
use crate::record::ConsumerRecord;
use crate::relation::{validate_roots, Relation};
use crate::state::{RocksState, State, METADATA_KEYSPACE};
use crate::topic::{Inputs, Outputs, TopicRegistry};

const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Metadata key holding the pending set of a root.
fn pending_set_key(denormalized_name: &str) -> String {
    format!("PK{}{}", SEP, denormalized_name)
}

/// How a record of some entity reaches one root's denormalized output.
enum Route {
    Root,
    Child {
        join_index: String,
        parent_index: String,
        join_key: String,
    },
}

pub struct Engine<S: State> {
    log: Logger,
    config: Config,
    relations: Vec<Relation>,
    output_names: Vec<String>,
    // per root: entity → route, first DFS match wins
    routes: Vec<FnvHashMap<String, Route>>,
    state: S,
    inputs: Inputs,
    outputs: Outputs,
    indices: FnvHashMap<String, FkIndex>,
    // per root: PKs owed an emit
    pending: Vec<KeySet>,
    scheduler: Scheduler,
    metrics: Metrics,
    process_records: Arc<AtomicBool>,
}

impl Engine<RocksState> {
    /// Builds an engine over a RocksDB store with topics resolved through
    /// the registry, per the configuration.
    pub fn from_config(
        log: Logger,
        config: Config,
        relations: Vec<Relation>,
        registry: &TopicRegistry,
    ) -> Result<Engine<RocksState>, Error> {
        validate_roots(&relations)?;
        let state = RocksState::open(
            config.db_path()?.to_string(),
            config.db_backup_path()?,
            config.backups_to_keep,
        )?;

        let mut inputs: Inputs = Inputs::new();
        for root in &relations {
            for entity in root.entities() {
                if !inputs.contains_key(entity) {
                    let topic = registry.input(&config.topic_spec(entity))?;
                    inputs.insert(entity.to_string(), topic);
                }
            }
        }
        // the transactions stream is part of the deployment iff configured
        if config.topics.contains_key(TRANSACTIONS_STREAM) {
            let topic = registry.input(&config.topic_spec(TRANSACTIONS_STREAM))?;
            inputs.insert(TRANSACTIONS_STREAM.to_string(), topic);
        }

        let mut outputs: Outputs = Outputs::new();
        for root in &relations {
            let name = root.denormalized_name();
            let topic = registry.output(&config.topic_spec(name))?;
            outputs.insert(name.to_string(), topic);
        }

        Engine::new(log, config, relations, state, inputs, outputs)
    }
}

impl<S: State> Engine<S> {
    pub fn new(
        log: Logger,
        config: Config,
        relations: Vec<Relation>,
        mut state: S,
        inputs: Inputs,
        outputs: Outputs,
    ) -> Result<Engine<S>, Error> {
        validate_roots(&relations)?;
        for root in &relations {
            for entity in root.entities() {
                if !inputs.contains_key(entity) {
                    bail!("no input topic for entity '{}'", entity);
                }
            }
            if !outputs.contains_key(root.denormalized_name()) {
                bail!("no output topic for '{}'", root.denormalized_name());
            }
        }

        state.create_key_space(METADATA_KEYSPACE)?;
        let mut indices: FnvHashMap<String, FkIndex> = FnvHashMap::default();
        for root in &relations {
            for_each_edge(root, &mut |parent, child| {
                // join indices are shared across roots by entity; parent
                // indices embed the root and stay independent
                for name in vec![
                    join_index_name(child),
                    parent_index_name(root, parent, child),
                ] {
                    indices
                        .entry(name.clone())
                        .or_insert_with(|| FkIndex::new(name));
                }
            });
        }
        for index in indices.values() {
            index.create_key_spaces(&mut state)?;
        }

        let output_names: Vec<String> = relations
            .iter()
            .map(|root| root.denormalized_name().to_string())
            .collect();
        let routes = relations.iter().map(build_routes).collect();

        // reload any pending emits a previous run still owed
        let mut pending = Vec::with_capacity(relations.len());
        for name in &output_names {
            let stored = state.get(METADATA_KEYSPACE, pending_set_key(name).as_bytes())?;
            pending.push(KeySet::deserialize(stored.as_deref())?);
        }

        let metrics = Metrics::new(
            inputs.keys().map(String::as_str),
            output_names.iter().map(String::as_str),
        );
        let scheduler = Scheduler::new(&inputs, config.topics_prefixed);

        Ok(Engine {
            log,
            config,
            relations,
            output_names,
            routes,
            state,
            inputs,
            outputs,
            indices,
            pending,
            scheduler,
            metrics,
            process_records: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// Clearing the returned flag stops the run loop after the record in
    /// flight.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.process_records.clone()
    }

    /// Reads batches from all input streams in merged time order and keeps
    /// the denormalized outputs current. Returns after `run_time` (if
    /// nonzero) with a final commit and backup, or when cancelled, with a
    /// final commit.
    pub fn run(&mut self, run_time: Duration) -> Result<(), Error> {
        info!(self.log, "building denormalized records");
        let run_watch = Instant::now();
        let mut commit_watch = Instant::now();
        let mut backup_watch = Instant::now();

        while self.process_records.load(Ordering::Relaxed) {
            match self.scheduler.poll(&mut self.inputs)? {
                Poll::Record { entity, record } => self.absorb(&entity, record)?,
                Poll::TxnBegin { id } => {
                    debug!(self.log, "transaction began"; "id" => id);
                }
                Poll::TxnEnd { id } => {
                    debug!(self.log, "transaction ended"; "id" => id);
                    self.flush_pending()?;
                    self.check_durability(&mut commit_watch, &mut backup_watch)?;
                    if self.run_budget_spent(run_watch, run_time)? {
                        return Ok(());
                    }
                }
                Poll::Idle => {
                    let total_lag = self.observe_lag();
                    if total_lag <= self.config.total_lag_trigger {
                        self.flush_pending()?;
                    }
                    self.check_durability(&mut commit_watch, &mut backup_watch)?;
                    if self.run_budget_spent(run_watch, run_time)? {
                        return Ok(());
                    }
                    thread::sleep(IDLE_SLEEP);
                }
            }
        }

        info!(self.log, "stopping");
        if self.safe_to_flush() {
            self.flush_pending()?;
            self.commit()?;
            if self.config.backup_on_shutdown {
                self.backup()?;
            }
        }
        Ok(())
    }

    /// Processes everything currently available, drains pending emits, and
    /// commits if it is safe to. The bounded, deterministic entry point
    /// used by tests.
    pub fn drain(&mut self) -> Result<(), Error> {
        loop {
            match self.scheduler.poll(&mut self.inputs)? {
                Poll::Record { entity, record } => self.absorb(&entity, record)?,
                Poll::TxnBegin { .. } => {}
                Poll::TxnEnd { .. } => self.flush_pending()?,
                Poll::Idle => break,
            }
        }
        self.observe_lag();
        if self.safe_to_flush() {
            self.flush_pending()?;
            self.commit()?;
        }
        Ok(())
    }

    /// Translates one record into stale root PKs and updated join indices.
    ///
    /// For roots whose tree uses this entity as a child, the old and new
    /// join-key values name the parent-index entries whose dependent roots
    /// go pending; the join index is then moved to the new value.
    fn absorb(&mut self, entity: &str, record: ConsumerRecord) -> Result<(), Error> {
        let pk = record.key.clone();

        for at in 0..self.relations.len() {
            match self.routes[at].get(entity) {
                Some(Route::Root) => {
                    self.pending[at].insert(pk.clone());
                }
                Some(Route::Child {
                    join_index,
                    parent_index,
                    join_key,
                }) => {
                    let new_parent_value = record
                        .value
                        .as_ref()
                        .and_then(|value| value.get(join_key))
                        .and_then(ByteKey::from_value);

                    let join = self
                        .indices
                        .get(join_index)
                        .expect("join index not registered");
                    let old_parent_values = join.foreign_keys_of(&self.state, &pk)?;

                    let parent = self
                        .indices
                        .get(parent_index)
                        .expect("parent index not registered");
                    for old in old_parent_values
                        .iter()
                        .filter(|old| Some(*old) != new_parent_value.as_ref())
                    {
                        let dependents = parent.get(&self.state, old)?;
                        self.pending[at].extend(dependents);
                    }
                    if let Some(ref new) = new_parent_value {
                        let dependents = parent.get(&self.state, new)?;
                        self.pending[at].extend(dependents);
                    }

                    let join_index = join_index.clone();
                    let join = self
                        .indices
                        .get_mut(&join_index)
                        .expect("join index not registered");
                    for old in old_parent_values
                        .iter()
                        .filter(|old| Some(*old) != new_parent_value.as_ref())
                    {
                        join.remove(&self.state, old, &pk)?;
                    }
                    if let Some(ref new) = new_parent_value {
                        join.add(&self.state, new, &pk)?;
                    }
                }
                // entity unused by this root
                None => continue,
            }

            self.metrics
                .update_pending(&self.output_names[at], self.pending[at].len() as u64);
            if self.scheduler.flush_allowed()
                && self.pending[at].len() > self.config.create_records_trigger
            {
                let set = ::std::mem::take(&mut self.pending[at]);
                self.create_denormalized_records(at, &set)?;
            }
        }

        self.metrics.record_consumed(entity);
        self.update_pending_gauges();
        Ok(())
    }

    /// Drains every root's pending set through the emit path, when allowed.
    fn flush_pending(&mut self) -> Result<(), Error> {
        if !self.scheduler.flush_allowed() {
            return Ok(());
        }
        for at in 0..self.relations.len() {
            if self.pending[at].is_empty() {
                continue;
            }
            let set = ::std::mem::take(&mut self.pending[at]);
            self.create_denormalized_records(at, &set)?;
        }
        self.update_pending_gauges();
        Ok(())
    }

    /// A commit may only happen outside transactions and with the merge
    /// buffers drained, so committed positions never cover unprocessed
    /// records.
    fn safe_to_flush(&self) -> bool {
        self.scheduler.flush_allowed() && self.scheduler.is_drained()
    }

    fn check_durability(
        &mut self,
        commit_watch: &mut Instant,
        backup_watch: &mut Instant,
    ) -> Result<(), Error> {
        if !self.safe_to_flush() {
            return Ok(());
        }
        let backup_due = self.config.backup_time_s > 0
            && backup_watch.elapsed().as_secs() >= self.config.backup_time_s;
        if backup_due {
            self.flush_pending()?;
            self.backup()?;
            *backup_watch = Instant::now();
            *commit_watch = Instant::now();
            return Ok(());
        }
        let commit_due = self.config.commit_time_s > 0
            && commit_watch.elapsed().as_secs() >= self.config.commit_time_s;
        if commit_due {
            self.commit()?;
            *commit_watch = Instant::now();
        }
        Ok(())
    }

    fn run_budget_spent(&mut self, run_watch: Instant, run_time: Duration) -> Result<bool, Error> {
        if run_time.as_millis() == 0 || run_watch.elapsed() < run_time {
            return Ok(false);
        }
        if !self.safe_to_flush() {
            return Ok(false);
        }
        self.flush_pending()?;
        self.backup()?;
        Ok(true)
    }

    /// Flushes outputs, indices, pending sets and consumed positions, then
    /// the state store: the single durability point everything recovers
    /// from.
    pub fn commit(&mut self) -> Result<(), Error> {
        let metrics = self.metrics.clone();
        let _timer = metrics.state_committed().time();
        for output in self.outputs.values_mut() {
            output.flush()?;
        }
        for index in self.indices.values_mut() {
            index.flush(&mut self.state)?;
        }
        for at in 0..self.relations.len() {
            self.state.put(
                METADATA_KEYSPACE,
                pending_set_key(&self.output_names[at]).as_bytes(),
                &self.pending[at].serialize(),
            )?;
        }
        for input in self.inputs.values_mut() {
            input.commit()?;
        }
        self.state.flush()?;
        debug!(self.log, "performed a full commit";
               "pending" => self.pending.iter().map(KeySet::len).sum::<usize>());
        Ok(())
    }

    /// A commit followed by a state snapshot.
    pub fn backup(&mut self) -> Result<(), Error> {
        info!(self.log, "performing a backup after a full commit");
        let metrics = self.metrics.clone();
        let _timer = metrics.backups_created().time();
        self.commit()?;
        self.state.backup()?;
        Ok(())
    }

    /// Replaces state from the latest backup and reloads the pending sets
    /// the backup recorded.
    pub fn restore(&mut self) -> Result<(), Error> {
        info!(self.log, "restoring state from backups");
        let metrics = self.metrics.clone();
        let _timer = metrics.backups_restored().time();
        self.state.restore()?;
        for at in 0..self.relations.len() {
            let stored = self.state.get(
                METADATA_KEYSPACE,
                pending_set_key(&self.output_names[at]).as_bytes(),
            )?;
            self.pending[at] = KeySet::deserialize(stored.as_deref())?;
        }
        Ok(())
    }

    /// Deletes the state store. The engine must be rebuilt to process
    /// further records.
    pub fn delete_state(&mut self) -> Result<(), Error> {
        warn!(self.log, "deleting state!!!");
        self.state.destroy()?;
        self.metrics.states_deleted().mark(1);
        Ok(())
    }

    /// Deletes all state backups.
    pub fn delete_backups(&mut self) -> Result<(), Error> {
        warn!(self.log, "deleting backups!!!");
        self.state.delete_backups()?;
        self.metrics.backups_deleted().mark(1);
        Ok(())
    }

    /// Checks the forward/reverse invariant of every index; returns the
    /// violating keys per index name.
    pub fn verify_state(&self) -> Result<Vec<(String, Vec<ByteKey>)>, Error> {
        let mut report = Vec::new();
        let mut names: Vec<&String> = self.indices.keys().collect();
        names.sort();
        for name in names {
            let violations = self.indices[name.as_str()].verify(&self.state)?;
            if !violations.is_empty() {
                report.push((name.clone(), violations));
            }
        }
        Ok(report)
    }

    /// Flushes and releases the state store.
    pub fn close(&mut self) -> Result<(), Error> {
        self.state.close()
    }

    fn observe_lag(&mut self) -> u64 {
        let mut total = 0;
        for (entity, topic) in &self.inputs {
            let lag = topic.lag();
            total += lag;
            self.metrics.update_lag(entity, lag);
        }
        self.metrics.update_total_lag(total);
        total
    }

    fn update_pending_gauges(&self) {
        let mut total = 0;
        for at in 0..self.relations.len() {
            let len = self.pending[at].len() as u64;
            total += len;
            self.metrics.update_pending(&self.output_names[at], len);
        }
        self.metrics.update_total_pending(total);
    }

    fn output(&mut self, name: &str) -> Result<&mut Box<dyn crate::topic::OutputTopic>, Error> {
        self.outputs
            .get_mut(name)
            .ok_or_else(|| format_err!("no output topic for '{}'", name))
    }
}

fn for_each_edge<'a>(
    parent: &'a Relation,
    visit: &mut impl FnMut(&'a Relation, &'a Relation),
) {
    for child in &parent.children {
        visit(parent, child);
        for_each_edge(child, visit);
    }
}

fn build_routes(root: &Relation) -> FnvHashMap<String, Route> {
    let mut routes = FnvHashMap::default();
    routes.insert(root.entity.clone(), Route::Root);
    for_each_edge(root, &mut |parent, child| {
        routes.entry(child.entity.clone()).or_insert_with(|| {
            Route::Child {
                join_index: join_index_name(child),
                parent_index: parent_index_name(root, parent, child),
                join_key: child
                    .join_key
                    .clone()
                    .expect("validated child without a join key"),
            }
        });
    });
    routes
}
