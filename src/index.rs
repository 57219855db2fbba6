use std::collections::BTreeMap;

use failure::Error;
use fnv::FnvHashMap;

use crate::bytes::{ByteKey, KeySet};
use crate::relation::Relation;
use crate::state::State;

/// Separator used in index names and metadata keys.
pub const SEP: &str = "|";

/// Name of the join index for a child relation: join-key value → child PKs.
/// The name embeds only the entity and field, so two roots sharing a child
/// entity share this index.
pub fn join_index_name(child: &Relation) -> String {
    format!(
        "JK{sep}{}{sep}{}",
        child.entity,
        child.join_key.as_deref().expect("child without a join key"),
        sep = SEP
    )
}

/// Name of the parent index for a (root, parent, child) edge: parent-key
/// value → root PKs depending on it. Embeds the root entity, so roots keep
/// independent parent indices even over shared children.
pub fn parent_index_name(root: &Relation, parent: &Relation, child: &Relation) -> String {
    format!(
        "PaK{sep}{}{sep}{}{sep}{}",
        root.entity,
        parent.entity,
        child
            .parent_key
            .as_deref()
            .expect("child without a parent key"),
        sep = SEP
    )
}

/// A reversible foreign-key index over the state store.
///
/// Forward half: index-key → set of PKs, in the keyspace named by the
/// index. Reverse half: PK → set of index-keys it is filed under, in
/// `<name>|reverse`. The invariant is `pk ∈ forward[k] ⇔ k ∈ reverse[pk]`,
/// and both halves go through the same write barrier at flush.
///
/// Mutations land in an in-memory overlay of dirty entries, so reads
/// through the index observe every add/remove of this session before any
/// flush. `flush` pushes the overlay into the store's buffered write path;
/// durability still requires the store's own flush.
pub struct FkIndex {
    name: String,
    reverse_name: String,
    forward: FnvHashMap<ByteKey, KeySet>,
    reverse: FnvHashMap<ByteKey, KeySet>,
}

impl FkIndex {
    pub fn new(name: String) -> FkIndex {
        let reverse_name = format!("{}{}reverse", name, SEP);
        FkIndex {
            name,
            reverse_name,
            forward: FnvHashMap::default(),
            reverse: FnvHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the forward and reverse keyspaces backing this index.
    pub fn create_key_spaces<S: State>(&self, state: &mut S) -> Result<(), Error> {
        state.create_key_space(&self.name)?;
        state.create_key_space(&self.reverse_name)?;
        Ok(())
    }

    /// Files `pk` under `index_key`. Idempotent.
    pub fn add<S: State>(
        &mut self,
        state: &S,
        index_key: &ByteKey,
        pk: &ByteKey,
    ) -> Result<(), Error> {
        let mut fwd = self.load(state, &self.name, &self.forward, index_key)?;
        fwd.insert(pk.clone());
        self.forward.insert(index_key.clone(), fwd);

        let mut rev = self.load(state, &self.reverse_name, &self.reverse, pk)?;
        rev.insert(index_key.clone());
        self.reverse.insert(pk.clone(), rev);
        Ok(())
    }

    /// Unfiles `pk` from `index_key`. Tolerant of missing members.
    pub fn remove<S: State>(
        &mut self,
        state: &S,
        index_key: &ByteKey,
        pk: &ByteKey,
    ) -> Result<(), Error> {
        let mut fwd = self.load(state, &self.name, &self.forward, index_key)?;
        fwd.remove(pk);
        self.forward.insert(index_key.clone(), fwd);

        let mut rev = self.load(state, &self.reverse_name, &self.reverse, pk)?;
        rev.remove(index_key);
        self.reverse.insert(pk.clone(), rev);
        Ok(())
    }

    /// The set of PKs filed under `index_key`; empty if none.
    pub fn get<S: State>(&self, state: &S, index_key: &ByteKey) -> Result<KeySet, Error> {
        self.load(state, &self.name, &self.forward, index_key)
    }

    /// The set of index-keys `pk` is currently filed under.
    pub fn foreign_keys_of<S: State>(&self, state: &S, pk: &ByteKey) -> Result<KeySet, Error> {
        self.load(state, &self.reverse_name, &self.reverse, pk)
    }

    /// Moves the dirty overlay into the store's buffered writes. Entries
    /// whose set became empty are deleted rather than stored empty.
    pub fn flush<S: State>(&mut self, state: &mut S) -> Result<(), Error> {
        for (key, set) in self.forward.drain() {
            if set.is_empty() {
                state.delete(&self.name, key.as_bytes())?;
            } else {
                state.put(&self.name, key.as_bytes(), &set.serialize())?;
            }
        }
        for (key, set) in self.reverse.drain() {
            if set.is_empty() {
                state.delete(&self.reverse_name, key.as_bytes())?;
            } else {
                state.put(&self.reverse_name, key.as_bytes(), &set.serialize())?;
            }
        }
        Ok(())
    }

    /// Checks the forward/reverse invariant over the whole index (overlay
    /// applied) and returns every key found on one side but not the other.
    pub fn verify<S: State>(&self, state: &S) -> Result<Vec<ByteKey>, Error> {
        let forward = self.effective(state, &self.name, &self.forward)?;
        let reverse = self.effective(state, &self.reverse_name, &self.reverse)?;

        let mut violations = Vec::new();
        for (key, pks) in &forward {
            for pk in pks {
                let filed = reverse.get(pk).map(|s| s.contains(key)).unwrap_or(false);
                if !filed {
                    violations.push(key.clone());
                    break;
                }
            }
        }
        for (pk, keys) in &reverse {
            for key in keys {
                let filed = forward.get(key).map(|s| s.contains(pk)).unwrap_or(false);
                if !filed {
                    violations.push(pk.clone());
                    break;
                }
            }
        }
        violations.sort();
        violations.dedup();
        Ok(violations)
    }

    fn load<S: State>(
        &self,
        state: &S,
        keyspace: &str,
        overlay: &FnvHashMap<ByteKey, KeySet>,
        key: &ByteKey,
    ) -> Result<KeySet, Error> {
        if let Some(set) = overlay.get(key) {
            return Ok(set.clone());
        }
        let stored = state.get(keyspace, key.as_bytes())?;
        KeySet::deserialize(stored.as_deref())
    }

    fn effective<S: State>(
        &self,
        state: &S,
        keyspace: &str,
        overlay: &FnvHashMap<ByteKey, KeySet>,
    ) -> Result<BTreeMap<ByteKey, KeySet>, Error> {
        let mut entries = BTreeMap::new();
        for (key, value) in state.scan(keyspace)? {
            entries.insert(ByteKey::new(key), KeySet::deserialize(Some(&value))?);
        }
        for (key, set) in overlay {
            if set.is_empty() {
                entries.remove(key);
            } else {
                entries.insert(key.clone(), set.clone());
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryState;

    fn index(state: &mut MemoryState) -> FkIndex {
        let index = FkIndex::new("JK|caption|media_id".to_string());
        index.create_key_spaces(state).unwrap();
        index
    }

    #[test]
    fn add_get_reverse() {
        let mut state = MemoryState::new();
        let mut idx = index(&mut state);

        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();
        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c2"))
            .unwrap();
        // idempotent
        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();

        let set = idx.get(&state, &ByteKey::from("m1")).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ByteKey::from("c1")));

        let fks = idx.foreign_keys_of(&state, &ByteKey::from("c1")).unwrap();
        assert_eq!(fks.len(), 1);
        assert!(fks.contains(&ByteKey::from("m1")));
    }

    #[test]
    fn remove_is_tolerant() {
        let mut state = MemoryState::new();
        let mut idx = index(&mut state);
        idx.remove(&state, &ByteKey::from("m9"), &ByteKey::from("c9"))
            .unwrap();
        assert!(idx.get(&state, &ByteKey::from("m9")).unwrap().is_empty());
    }

    #[test]
    fn flush_persists_and_scrubs_empty_sets() {
        let mut state = MemoryState::new();
        let mut idx = index(&mut state);

        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();
        idx.flush(&mut state).unwrap();
        state.flush().unwrap();

        // a fresh instance over the same state sees the filing
        let fresh = FkIndex::new("JK|caption|media_id".to_string());
        let set = fresh.get(&state, &ByteKey::from("m1")).unwrap();
        assert!(set.contains(&ByteKey::from("c1")));

        // removing the last member deletes the stored entry entirely
        idx.remove(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();
        idx.flush(&mut state).unwrap();
        state.flush().unwrap();
        assert_eq!(state.get("JK|caption|media_id", b"m1").unwrap(), None);
    }

    #[test]
    fn reads_observe_unflushed_writes() {
        let mut state = MemoryState::new();
        let mut idx = index(&mut state);
        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();
        // no flush anywhere, still visible
        assert!(!idx.get(&state, &ByteKey::from("m1")).unwrap().is_empty());
    }

    #[test]
    fn verify_reports_asymmetry() {
        let mut state = MemoryState::new();
        let mut idx = index(&mut state);

        idx.add(&state, &ByteKey::from("m1"), &ByteKey::from("c1"))
            .unwrap();
        idx.flush(&mut state).unwrap();
        assert!(idx.verify(&state).unwrap().is_empty());

        // plant a forward filing with no reverse side
        let mut orphan = KeySet::new();
        orphan.insert(ByteKey::from("c9"));
        state
            .put("JK|caption|media_id", b"m9", &orphan.serialize())
            .unwrap();
        let violations = idx.verify(&state).unwrap();
        assert_eq!(violations, vec![ByteKey::from("m9")]);
    }

    #[test]
    fn index_names() {
        let root: Relation = serde_json::from_str(
            r#"{"DenormalizedName": "feed", "Entity": "media",
                "Children": [{"Entity": "caption", "JoinKey": "media_id", "ParentKey": "id"}]}"#,
        )
        .unwrap();
        let child = &root.children[0];
        assert_eq!(join_index_name(child), "JK|caption|media_id");
        assert_eq!(parent_index_name(&root, &root, child), "PaK|media|media|id");
    }
}
