use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

use failure::{bail, Error};
use serde_json::Value;

/// A canonical byte-vector key.
///
/// This is the identity used everywhere joins happen: input record keys are
/// carried as-is, and join/parent field values are reduced to bytes with
/// [`ByteKey::from_value`]. Ordering is plain lexicographic byte order,
/// which is also the order children are emitted in.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteKey(Vec<u8>);

impl ByteKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        ByteKey(bytes)
    }

    /// Reduces a record field value to its canonical key bytes.
    ///
    /// Returns `None` for JSON null, which callers treat as "no key" (a
    /// tombstoned or absent join field). Strings map to their UTF-8 bytes,
    /// integers and floats to 8-byte big-endian forms, booleans to a single
    /// byte, and anything structured to its compact JSON rendering.
    pub fn from_value(value: &Value) -> Option<ByteKey> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(ByteKey(vec![*b as u8])),
            Value::Number(n) => {
                let bytes = if let Some(i) = n.as_i64() {
                    i.to_be_bytes()
                } else if let Some(u) = n.as_u64() {
                    u.to_be_bytes()
                } else {
                    // as_f64 is total for any serde_json number
                    n.as_f64().unwrap().to_bits().to_be_bytes()
                };
                Some(ByteKey(bytes.to_vec()))
            }
            Value::String(s) => Some(ByteKey(s.as_bytes().to_vec())),
            other => Some(ByteKey(serde_json::to_vec(other).unwrap())),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteKey {
    fn from(bytes: Vec<u8>) -> Self {
        ByteKey(bytes)
    }
}

impl From<&[u8]> for ByteKey {
    fn from(bytes: &[u8]) -> Self {
        ByteKey(bytes.to_vec())
    }
}

impl From<&str> for ByteKey {
    fn from(s: &str) -> Self {
        ByteKey(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for ByteKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // keys are usually printable; fall back to hex when they aren't
        match ::std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "k\"{}\"", s),
            _ => {
                write!(f, "k[")?;
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// An ordered set of [`ByteKey`]s with a compact wire form.
///
/// The wire form is a tightly packed sequence of u32-big-endian
/// length-prefixed byte strings with no count header; the empty set
/// serializes to zero bytes, and a missing stored value deserializes to the
/// empty set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet(BTreeSet<ByteKey>);

impl KeySet {
    pub fn new() -> Self {
        KeySet(BTreeSet::new())
    }

    pub fn insert(&mut self, key: ByteKey) -> bool {
        self.0.insert(key)
    }

    pub fn remove(&mut self, key: &ByteKey) -> bool {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &ByteKey) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    /// Ascending canonical byte order.
    pub fn iter(&self) -> btree_set::Iter<ByteKey> {
        self.0.iter()
    }

    pub fn extend<I: IntoIterator<Item = ByteKey>>(&mut self, keys: I) {
        self.0.extend(keys)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.iter().map(|k| 4 + k.len()).sum());
        for key in &self.0 {
            out.extend_from_slice(&(key.len() as u32).to_be_bytes());
            out.extend_from_slice(key.as_bytes());
        }
        out
    }

    pub fn deserialize(bytes: Option<&[u8]>) -> Result<KeySet, Error> {
        let mut set = BTreeSet::new();
        let bytes = match bytes {
            Some(b) => b,
            None => return Ok(KeySet(set)),
        };

        let mut at = 0;
        while at < bytes.len() {
            if at + 4 > bytes.len() {
                bail!("truncated key set: length prefix at byte {}", at);
            }
            let mut len = [0u8; 4];
            len.copy_from_slice(&bytes[at..at + 4]);
            let len = u32::from_be_bytes(len) as usize;
            at += 4;
            if at + len > bytes.len() {
                bail!("truncated key set: {} byte key at byte {}", len, at);
            }
            set.insert(ByteKey::from(&bytes[at..at + len]));
            at += len;
        }
        Ok(KeySet(set))
    }
}

impl IntoIterator for KeySet {
    type Item = ByteKey;
    type IntoIter = btree_set::IntoIter<ByteKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a KeySet {
    type Item = &'a ByteKey;
    type IntoIter = btree_set::Iter<'a, ByteKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl ::std::iter::FromIterator<ByteKey> for KeySet {
    fn from_iter<I: IntoIterator<Item = ByteKey>>(iter: I) -> Self {
        KeySet(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_from_value() {
        assert_eq!(ByteKey::from_value(&Value::Null), None);
        assert_eq!(
            ByteKey::from_value(&json!("m1")),
            Some(ByteKey::from("m1"))
        );
        assert_eq!(
            ByteKey::from_value(&json!(1)),
            Some(ByteKey::from(&1i64.to_be_bytes()[..]))
        );
        assert_eq!(ByteKey::from_value(&json!(true)), Some(ByteKey::from(&[1u8][..])));
    }

    #[test]
    fn key_ordering_is_byte_order() {
        let mut keys = vec![
            ByteKey::from("b"),
            ByteKey::from("aa"),
            ByteKey::from("a"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![ByteKey::from("a"), ByteKey::from("aa"), ByteKey::from("b")]
        );
    }

    #[test]
    fn set_round_trip() {
        let mut set = KeySet::new();
        set.insert(ByteKey::from("m2"));
        set.insert(ByteKey::from("m1"));
        set.insert(ByteKey::from(&[0u8, 1, 2][..]));

        let bytes = set.serialize();
        let back = KeySet::deserialize(Some(&bytes)).unwrap();
        assert_eq!(set, back);
    }

    #[test]
    fn set_wire_form() {
        let mut set = KeySet::new();
        set.insert(ByteKey::from("ab"));
        // u32 BE length prefix, then the raw bytes
        assert_eq!(set.serialize(), vec![0, 0, 0, 2, b'a', b'b']);
        assert!(KeySet::new().serialize().is_empty());
    }

    #[test]
    fn set_deserialize_missing_is_empty() {
        assert!(KeySet::deserialize(None).unwrap().is_empty());
        assert!(KeySet::deserialize(Some(&[])).unwrap().is_empty());
    }

    #[test]
    fn set_deserialize_truncated() {
        let mut set = KeySet::new();
        set.insert(ByteKey::from("abcdef"));
        let bytes = set.serialize();
        assert!(KeySet::deserialize(Some(&bytes[..bytes.len() - 1])).is_err());
        assert!(KeySet::deserialize(Some(&bytes[..2])).is_err());
    }

    #[test]
    fn set_iterates_ascending() {
        let mut set = KeySet::new();
        set.insert(ByteKey::from("c2"));
        set.insert(ByteKey::from("c10"));
        set.insert(ByteKey::from("c1"));
        let order: Vec<_> = set.iter().cloned().collect();
        assert_eq!(
            order,
            vec![ByteKey::from("c1"), ByteKey::from("c10"), ByteKey::from("c2")]
        );
    }
}
