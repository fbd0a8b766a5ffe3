//! String-keyed parameter map with a CBOR wire form.
//!
//! Device specs, driver parameters and announce payloads all travel as
//! string maps. Keys iterate in sorted order, which also makes the
//! serialized form canonical: two maps are equal iff every key present
//! in one is present in the other with a string-equal value.

use std::{
    collections::BTreeMap,
    fmt::Display,
};

use crate::{
    buffer::GrowBuf,
    cbor,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StrMap {
    entries: BTreeMap<String, String>,
}

impl StrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_owned(), value.into());
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn set_uint(&mut self, key: &str, value: u64) {
        self.set(key, value.to_string());
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.set(key, value.to_string());
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, if value { "yes" } else { "no" });
    }

    pub fn set_display(&mut self, key: &str, value: impl Display) {
        self.set(key, value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_map_start(buf, Some(self.entries.len() as u64))?;
        for (key, value) in &self.entries {
            cbor::pack_str(buf, key)?;
            cbor::pack_str(buf, value)?;
        }
        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;
        let mut entries = BTreeMap::new();

        match cbor::unpack_map_start(&mut work)? {
            Some(count) => {
                for _ in 0..count {
                    let key = cbor::unpack_str(&mut work)?;
                    let value = cbor::unpack_str(&mut work)?;
                    entries.insert(key, value);
                }
            }
            None => {
                while !cbor::unpack_break(&mut work)? {
                    let key = cbor::unpack_str(&mut work)?;
                    let value = cbor::unpack_str(&mut work)?;
                    entries.insert(key, value);
                }
            }
        }

        *cursor = work;
        Ok(Self { entries })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StrMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_round_trip_is_identity() {
        let map: StrMap = [
            ("driver", "airspy"),
            ("host", "192.168.1.4"),
            ("serial", "91d0"),
        ]
        .into_iter()
        .collect();

        let mut buf = GrowBuf::new();
        map.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];

        let back = StrMap::deserialize(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(back, map);
    }

    #[test]
    fn keys_iterate_sorted() {
        let mut map = StrMap::new();
        map.set("zz", "1");
        map.set("aa", "2");
        map.set_int("mm", -3);
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec!["aa", "mm", "zz"]);
        assert_eq!(map.get("mm"), Some("-3"));
    }

    #[test]
    fn malformed_map_leaves_cursor() {
        // map of length 1 with a uint key
        let data = vec![0xa1, 0x01, 0x02];
        let mut cursor = &data[..];
        assert!(StrMap::deserialize(&mut cursor).is_err());
        assert_eq!(cursor.len(), 3);
    }
}
