//! Typed configuration objects.
//!
//! Inspector parameters and source parameters are carried as a [`Config`]:
//! a named list of typed fields. The boundary form (`key=value,…` strings,
//! the opaque object tree of the persistent store) is weakly typed and is
//! coerced to the declared field type at parse time; internally every
//! field keeps its declared type.

use std::{
    fmt,
    path::PathBuf,
};

use serde_json::{
    Map,
    Value,
};

use crate::{
    buffer::GrowBuf,
    cbor,
};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("no such field: {0}")]
    NoSuchField(String),
    #[error("field {field}: expected {expected:?}")]
    TypeMismatch { field: String, expected: FieldType },
    #[error("field {field}: cannot parse {value:?} as {expected:?}")]
    Coercion {
        field: String,
        value: String,
        expected: FieldType,
    },
    #[error("missing mandatory field: {0}")]
    MissingField(String),
    #[error("malformed parameter list near {0:?}")]
    MalformedParams(String),
    #[error("cbor: {0}")]
    Cbor(#[from] cbor::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    File,
}

impl FieldType {
    fn tag(self) -> u8 {
        match self {
            Self::Str => 0,
            Self::Int => 1,
            Self::Float => 2,
            Self::Bool => 3,
            Self::File => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Str),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::Bool),
            4 => Some(Self::File),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    File(PathBuf),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Str(_) => FieldType::Str,
            Self::Int(_) => FieldType::Int,
            Self::Float(_) => FieldType::Float,
            Self::Bool(_) => FieldType::Bool,
            Self::File(_) => FieldType::File,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{}", if *value { "yes" } else { "no" }),
            Self::File(value) => write!(f, "{}", value.display()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Field {
    name: String,
    ty: FieldType,
    optional: bool,
    value: Option<FieldValue>,
}

/// A typed field list. Lookup is a linear scan; these lists are small.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    name: String,
    fields: Vec<Field>,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_field(mut self, name: &str, ty: FieldType, optional: bool) -> Self {
        self.fields.push(Field {
            name: name.to_owned(),
            ty,
            optional,
            value: None,
        });
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|field| field.name == name)
    }

    fn set_checked(&mut self, name: &str, value: FieldValue) -> Result<(), Error> {
        let field = self
            .field_mut(name)
            .ok_or_else(|| Error::NoSuchField(name.to_owned()))?;
        if field.ty != value.field_type() {
            return Err(Error::TypeMismatch {
                field: name.to_owned(),
                expected: field.ty,
            });
        }
        field.value = Some(value);
        Ok(())
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) -> Result<(), Error> {
        self.set_checked(name, FieldValue::Str(value.into()))
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> Result<(), Error> {
        self.set_checked(name, FieldValue::Int(value))
    }

    pub fn set_float(&mut self, name: &str, value: f64) -> Result<(), Error> {
        self.set_checked(name, FieldValue::Float(value))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), Error> {
        self.set_checked(name, FieldValue::Bool(value))
    }

    pub fn set_file(&mut self, name: &str, value: impl Into<PathBuf>) -> Result<(), Error> {
        self.set_checked(name, FieldValue::File(value.into()))
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.field(name).and_then(|field| field.value.as_ref())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(FieldValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(FieldValue::Float(value)) => Some(*value),
            Some(FieldValue::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(FieldValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_file(&self, name: &str) -> Option<&PathBuf> {
        match self.get(name) {
            Some(FieldValue::File(value)) => Some(value),
            _ => None,
        }
    }

    /// Every non-optional field must carry a value.
    pub fn check_mandatory(&self) -> Result<(), Error> {
        for field in &self.fields {
            if !field.optional && field.value.is_none() {
                return Err(Error::MissingField(field.name.clone()));
            }
        }
        Ok(())
    }

    fn coerce(&self, name: &str, ty: FieldType, raw: &str) -> Result<FieldValue, Error> {
        let coercion = || {
            Error::Coercion {
                field: name.to_owned(),
                value: raw.to_owned(),
                expected: ty,
            }
        };

        Ok(match ty {
            FieldType::Str => FieldValue::Str(raw.to_owned()),
            FieldType::File => FieldValue::File(PathBuf::from(raw)),
            FieldType::Int => FieldValue::Int(raw.parse().map_err(|_| coercion())?),
            FieldType::Float => FieldValue::Float(raw.parse().map_err(|_| coercion())?),
            FieldType::Bool => {
                match raw {
                    "yes" | "true" | "1" => FieldValue::Bool(true),
                    "no" | "false" | "0" => FieldValue::Bool(false),
                    _ => return Err(coercion()),
                }
            }
        })
    }

    /// Parse a comma-separated `key=value,…` list, coercing each value to
    /// the declared field type.
    pub fn parse_params(&mut self, params: &str) -> Result<(), Error> {
        for part in params.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| Error::MalformedParams(part.to_owned()))?;
            let ty = self
                .field(key)
                .ok_or_else(|| Error::NoSuchField(key.to_owned()))?
                .ty;
            let value = self.coerce(key, ty, raw)?;
            self.set_checked(key, value)?;
        }
        Ok(())
    }

    /// Serialize to the opaque object tree consumed by the persistent
    /// config store.
    pub fn to_object(&self) -> Value {
        let mut map = Map::new();
        for field in &self.fields {
            let Some(value) = &field.value else {
                continue;
            };
            let json = match value {
                FieldValue::Str(value) => Value::from(value.clone()),
                FieldValue::Int(value) => Value::from(*value),
                FieldValue::Float(value) => Value::from(*value),
                FieldValue::Bool(value) => Value::from(*value),
                FieldValue::File(value) => Value::from(value.display().to_string()),
            };
            map.insert(field.name.clone(), json);
        }
        Value::Object(map)
    }

    /// Populate from an object tree, ignoring unknown keys with a warning.
    pub fn update_from_object(&mut self, object: &Value) -> Result<(), Error> {
        let Value::Object(map) = object else {
            return Ok(());
        };

        for (key, json) in map {
            let Some(field) = self.field(key) else {
                tracing::warn!(config = %self.name, key, "ignoring unknown config key");
                continue;
            };
            let ty = field.ty;

            let value = match (ty, json) {
                (FieldType::Int, Value::Number(n)) if n.is_i64() => {
                    FieldValue::Int(n.as_i64().unwrap_or_default())
                }
                (FieldType::Float, Value::Number(n)) => {
                    FieldValue::Float(n.as_f64().unwrap_or_default())
                }
                (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
                (_, Value::String(s)) => self.coerce(key, ty, s)?,
                _ => {
                    return Err(Error::TypeMismatch {
                        field: key.clone(),
                        expected: ty,
                    });
                }
            };
            self.set_checked(key, value)?;
        }

        Ok(())
    }

    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_str(buf, &self.name)?;
        cbor::pack_map_start(buf, Some(self.fields.len() as u64))?;
        for field in &self.fields {
            cbor::pack_str(buf, &field.name)?;
            cbor::pack_array_start(buf, Some(3))?;
            cbor::pack_uint(buf, field.ty.tag() as u64)?;
            cbor::pack_bool(buf, field.optional)?;
            match &field.value {
                None => cbor::pack_null(buf)?,
                Some(FieldValue::Str(value)) => cbor::pack_str(buf, value)?,
                Some(FieldValue::Int(value)) => cbor::pack_int(buf, *value)?,
                Some(FieldValue::Float(value)) => cbor::pack_double(buf, *value)?,
                Some(FieldValue::Bool(value)) => cbor::pack_bool(buf, *value)?,
                Some(FieldValue::File(value)) => {
                    cbor::pack_str(buf, &value.display().to_string())?
                }
            }
        }
        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let name = cbor::unpack_str(&mut work)?;
        let count = cbor::unpack_map_start(&mut work)?.unwrap_or(0);
        let mut fields = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let field_name = cbor::unpack_str(&mut work)?;
            cbor::unpack_array_start(&mut work)?;
            let tag = cbor::unpack_uint(&mut work)? as u8;
            let optional = cbor::unpack_bool(&mut work)?;
            let ty = FieldType::from_tag(tag).ok_or(cbor::Error::MalformedInfo { info: tag })?;

            let value = if cbor::unpack_null(&mut work).is_ok() {
                None
            }
            else {
                Some(match ty {
                    FieldType::Str => FieldValue::Str(cbor::unpack_str(&mut work)?),
                    FieldType::File => FieldValue::File(PathBuf::from(cbor::unpack_str(&mut work)?)),
                    FieldType::Int => FieldValue::Int(cbor::unpack_int(&mut work)?),
                    FieldType::Float => FieldValue::Float(cbor::unpack_double(&mut work)?),
                    FieldType::Bool => FieldValue::Bool(cbor::unpack_bool(&mut work)?),
                })
            };

            fields.push(Field {
                name: field_name,
                ty,
                optional,
                value,
            });
        }

        *cursor = work;
        Ok(Self { name, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_schema() -> Config {
        Config::new("audio")
            .with_field("demod", FieldType::Str, false)
            .with_field("cutoff", FieldType::Float, false)
            .with_field("samp-rate", FieldType::Int, false)
            .with_field("squelch", FieldType::Bool, true)
            .with_field("squelch-level", FieldType::Float, true)
    }

    #[test]
    fn parse_params_coerces_to_declared_type() {
        let mut config = audio_schema();
        config
            .parse_params("demod=FM,cutoff=15000.0,samp-rate=44100,squelch=yes")
            .unwrap();

        assert_eq!(config.get_str("demod"), Some("FM"));
        assert_eq!(config.get_float("cutoff"), Some(15000.0));
        assert_eq!(config.get_int("samp-rate"), Some(44100));
        assert_eq!(config.get_bool("squelch"), Some(true));
        config.check_mandatory().unwrap();
    }

    #[test]
    fn parse_params_rejects_bad_coercion() {
        let mut config = audio_schema();
        assert!(matches!(
            config.parse_params("samp-rate=fast"),
            Err(Error::Coercion { .. })
        ));
    }

    #[test]
    fn object_round_trip_ignores_unknown_keys() {
        let mut config = audio_schema();
        config.parse_params("demod=USB,cutoff=3000,samp-rate=8000").unwrap();

        let object = config.to_object();
        let mut back = audio_schema();
        back.update_from_object(&object).unwrap();
        assert_eq!(back.get_str("demod"), Some("USB"));

        let with_junk = serde_json::json!({"demod": "AM", "no-such-key": 3});
        back.update_from_object(&with_junk).unwrap();
        assert_eq!(back.get_str("demod"), Some("AM"));
    }

    #[test]
    fn cbor_round_trip_preserves_unset_fields() {
        let mut config = audio_schema();
        config.parse_params("demod=LSB,cutoff=2700,samp-rate=8000").unwrap();

        let mut buf = GrowBuf::new();
        config.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];
        let back = Config::deserialize(&mut cursor).unwrap();

        assert!(cursor.is_empty());
        assert_eq!(back, config);
        assert_eq!(back.get("squelch"), None);
    }
}
