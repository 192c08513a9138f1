//! Records and record-level helpers.
//!
//! A record is one parsed JSON object from a line-delimited file. Key
//! extraction is shared by every component that groups or deduplicates, so
//! the read path and the write path always build identical tuples.

use crate::template::value_text;
use serde_json::{Map, Value};

/// One parsed line.
pub type Record = Map<String, Value>;

/// A group-key tuple of display texts.
pub type KeyTuple = Vec<String>;

/// Look up a possibly dotted field (`a.b.c`) in a record.
///
/// An exact top-level match wins over a nested walk, so flattened records
/// (`{"a.b": 1}`) and nested records (`{"a": {"b": 1}}`) both resolve.
#[must_use]
pub fn field<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    if let Some(v) = record.get(name) {
        return Some(v);
    }
    let mut parts = name.split('.');
    let mut cur = record.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Extract the configured group fields as a tuple. Missing fields become empty
/// strings.
#[must_use]
pub fn key_tuple(record: &Record, keys: &[String]) -> KeyTuple {
    keys.iter()
        .map(|k| field(record, k).map(value_text).unwrap_or_default())
        .collect()
}

/// A primary-key tuple: the JSON text of each key field, so `7`, `"7"` and
/// `null` stay distinct.
pub type PkTuple = Vec<String>;

/// Extract the configured key fields with their JSON types kept. `None` when
/// any key field is missing.
#[must_use]
pub fn pk_tuple(record: &Record, keys: &[String]) -> Option<PkTuple> {
    keys.iter().map(|k| field(record, k).map(Value::to_string)).collect()
}

/// True when every component of a key tuple is empty.
#[must_use]
pub fn is_blank_key(key: &[String]) -> bool {
    key.iter().all(String::is_empty)
}

/// Flatten nested objects into dot-delimited keys.
///
/// `{"a": {"b": 1}}` becomes `{"a.b": 1}`. Empty objects and non-object
/// values are kept as leaves. Keys are trimmed.
#[must_use]
pub fn flatten(record: &Record) -> Record {
    let mut out = Record::new();
    flatten_into(record, "", &mut out);
    out
}

fn flatten_into(obj: &Record, prefix: &str, out: &mut Record) {
    for (k, v) in obj {
        let k = k.trim();
        let key = if prefix.is_empty() {
            k.to_string()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, &key, out),
            other => {
                out.insert(key, other.clone());
            }
        }
    }
}

/// Rebuild nesting from dot-delimited keys; the inverse of [`flatten`] for
/// records whose original keys contain no dots.
#[must_use]
pub fn inflate(flat: &Record) -> Record {
    let mut out = Record::new();
    for (k, v) in flat {
        let mut parts: Vec<&str> = k.split('.').collect();
        let leaf = parts.pop().unwrap_or_default();
        let mut cur = &mut out;
        for part in parts {
            let slot = cur
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Record::new()));
            if !slot.is_object() {
                *slot = Value::Object(Record::new());
            }
            let Value::Object(next) = slot else {
                unreachable!("slot was just made an object")
            };
            cur = next;
        }
        cur.insert(leaf.to_string(), v.clone());
    }
    out
}
