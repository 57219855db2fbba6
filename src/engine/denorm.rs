//! Building and emitting denormalized records.
//!
//! For each stale root PK the engine first scrubs every parent-index
//! filing of that PK, then rebuilds the tree from the current input
//! records, refiling the parent indices as it goes. The scrub is what
//! keeps a dead root dead: without it, stale filings would keep routing
//! child changes to a root that no longer exists.

use failure::Error;

use crate::bytes::{ByteKey, KeySet};
use crate::engine::Engine;
use crate::index::{join_index_name, parent_index_name};
use crate::record::DenormalizedRecord;
use crate::relation::Relation;
use crate::state::State;

impl<S: State> Engine<S> {
    /// Recomputes and emits the denormalized record for every PK in `pks`.
    pub(super) fn create_denormalized_records(
        &mut self,
        at: usize,
        pks: &KeySet,
    ) -> Result<(), Error> {
        let root = self.relations[at].clone();
        let name = self.output_names[at].clone();
        for pk in pks {
            self.scrub_parent_indices(&root, &root, pk)?;
            let record = self.build_record(&root, &root, pk, pk)?;
            if let Some(ref record) = record {
                self.output(&name)?.write(pk, record)?;
            }
            // a missing root emits nothing: the scrub above already severed
            // its filings, so later child changes cannot resurrect it
            self.metrics.record_created(&name);
        }
        Ok(())
    }

    /// Removes every parent-index filing of `root_pk` across the subtree.
    fn scrub_parent_indices(
        &mut self,
        root: &Relation,
        parent: &Relation,
        root_pk: &ByteKey,
    ) -> Result<(), Error> {
        for child in &parent.children {
            let name = parent_index_name(root, parent, child);
            let index = self
                .indices
                .get_mut(&name)
                .expect("parent index not registered");
            let filed_under = index.foreign_keys_of(&self.state, root_pk)?;
            for key in &filed_under {
                index.remove(&self.state, key, root_pk)?;
            }
            self.scrub_parent_indices(root, child, root_pk)?;
        }
        Ok(())
    }

    /// Recursively reads the record under `relation_pk` and its joined
    /// children. Missing or empty records produce a null subtree.
    fn build_record(
        &mut self,
        root: &Relation,
        relation: &Relation,
        root_pk: &ByteKey,
        relation_pk: &ByteKey,
    ) -> Result<Option<DenormalizedRecord>, Error> {
        let topic = self
            .inputs
            .get_mut(&relation.entity)
            .expect("input topic not registered");
        let record = match topic.read_by_pk(relation_pk)? {
            Some(record) => {
                if record.is_empty() {
                    return Ok(None);
                }
                record
            }
            None => return Ok(None),
        };

        let mut denormalized = DenormalizedRecord {
            record: record.clone(),
            children: Default::default(),
        };
        for child in &relation.children {
            let parent_key = child
                .parent_key
                .as_deref()
                .expect("validated child without a parent key");
            let new_parent_value = record.get(parent_key).and_then(ByteKey::from_value);
            let value = match new_parent_value {
                Some(value) => value,
                // a null parent key joins nothing; the child entity is
                // absent from the output
                None => continue,
            };

            // refile the parent index entry the scrub removed; this is the
            // authoritative rebuild of the filings for this root PK
            let parent_index = parent_index_name(root, relation, child);
            self.indices
                .get_mut(&parent_index)
                .expect("parent index not registered")
                .add(&self.state, &value, root_pk)?;

            let join_index = join_index_name(child);
            let child_pks = self
                .indices
                .get(&join_index)
                .expect("join index not registered")
                .get(&self.state, &value)?;

            // ascending PK order makes the emit deterministic
            let mut records = Vec::new();
            for child_pk in &child_pks {
                if let Some(child_record) = self.build_record(root, child, root_pk, child_pk)? {
                    records.push(child_record);
                }
            }
            denormalized.children.insert(child.entity.clone(), records);
        }
        Ok(Some(denormalized))
    }
}
