//! Data views: named schemas used by the Format step.

use crate::config::DataViewConfig;
use crate::error::SpinError;
use crate::record::Record;
use crate::template::value_text;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Declared type of a data view field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Float,
    Boolean,
    Date,
}

impl FieldType {
    /// Parse a declared type name.
    ///
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Self::String,
            "int" | "integer" | "long" => Self::Int,
            "float" | "double" | "number" => Self::Float,
            "boolean" | "bool" => Self::Boolean,
            "date" | "datetime" | "timestamp" => Self::Date,
            other => {
                return Err(SpinError::Configuration(format!("unknown field type `{other}`")).into());
            }
        })
    }

    /// Coerce a value to this type; `None` when it cannot be represented.
    /// `null` passes through unchanged.
    #[must_use]
    pub fn coerce(self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            Self::String => match value {
                Value::String(_) => Some(value.clone()),
                other => Some(Value::String(value_text(other))),
            },
            Self::Int => to_int(value).map(Value::from),
            Self::Float => to_float(value).and_then(Number::from_f64).map(Value::Number),
            Self::Boolean => to_bool(value).map(Value::Bool),
            Self::Date => to_date(value)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        }
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "t" => Some(true),
            "false" | "0" | "no" | "n" | "f" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(naive.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

/// A named schema: field name → declared type.
#[derive(Clone, Debug)]
pub struct DataView {
    pub name: String,
    pub table_format: String,
    pub fields: BTreeMap<String, FieldType>,
}

impl DataView {
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] if a field type is unknown.
    pub fn from_config(conf: &DataViewConfig) -> Result<Self> {
        let fields = conf
            .fields
            .iter()
            .map(|f| Ok((f.name.clone(), FieldType::parse(&f.field_type)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            name: conf.name.clone(),
            table_format: conf.table_format.clone(),
            fields,
        })
    }

    /// Coerce every declared field present in `record`.
    ///
    /// Returns the name of the first field that cannot be coerced.
    pub fn apply(&self, record: &mut Record) -> Result<(), String> {
        for (name, ty) in &self.fields {
            if let Some(value) = record.get_mut(name) {
                *value = ty.coerce(value).ok_or_else(|| name.clone())?;
            }
        }
        Ok(())
    }
}
