//! Structured payloads.
//!
//! A [`StreamContainer`] is an ordered sequence of typed fields read back in
//! insertion order; a [`MapContainer`] holds typed fields under unique keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::utils::error::PayloadError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Field {
    Bool(bool),
    Int8(i8),
    Int32(i32),
    Double(f64),
    String(String),
}

impl Field {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int8(_) => "int8",
            Self::Int32(_) => "int32",
            Self::Double(_) => "double",
            Self::String(_) => "string",
        }
    }
}

macro_rules! field_accessor {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        fn $name(field: &Field) -> Result<$ty, PayloadError> {
            match field {
                Field::$variant(v) => Ok(v.clone()),
                other => Err(PayloadError::TypeMismatch {
                    expected: $label,
                    found: other.type_name(),
                }),
            }
        }
    };
}

field_accessor!(as_bool, Bool, bool, "bool");
field_accessor!(as_int8, Int8, i8, "int8");
field_accessor!(as_int32, Int32, i32, "int32");
field_accessor!(as_double, Double, f64, "double");
field_accessor!(as_string, String, String, "string");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "container", content = "fields", rename_all = "snake_case")]
pub enum Container {
    Stream(StreamContainer),
    Map(MapContainer),
}

impl Container {
    pub fn as_stream(&self) -> Option<&StreamContainer> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapContainer> {
        match self {
            Self::Map(m) => Some(m),
            Self::Stream(_) => None,
        }
    }
}

impl From<StreamContainer> for Container {
    fn from(stream: StreamContainer) -> Self {
        Self::Stream(stream)
    }
}

impl From<MapContainer> for Container {
    fn from(map: MapContainer) -> Self {
        Self::Map(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamContainer {
    fields: Vec<Field>,
}

impl StreamContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.add(Field::Bool(value))
    }

    pub fn add_int8(&mut self, value: i8) -> &mut Self {
        self.add(Field::Int8(value))
    }

    pub fn add_int32(&mut self, value: i32) -> &mut Self {
        self.add(Field::Int32(value))
    }

    pub fn add_double(&mut self, value: f64) -> &mut Self {
        self.add(Field::Double(value))
    }

    pub fn add_string(&mut self, value: impl Into<String>) -> &mut Self {
        self.add(Field::String(value.into()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Starts reading from the first field.
    pub fn reader(&self) -> StreamReader<'_> {
        StreamReader {
            fields: &self.fields,
            position: 0,
        }
    }
}

pub struct StreamReader<'a> {
    fields: &'a [Field],
    position: usize,
}

impl StreamReader<'_> {
    fn next_field(&mut self) -> Result<&Field, PayloadError> {
        let field = self
            .fields
            .get(self.position)
            .ok_or(PayloadError::EndOfStream)?;
        self.position += 1;
        Ok(field)
    }

    pub fn read_bool(&mut self) -> Result<bool, PayloadError> {
        self.next_field().and_then(as_bool)
    }

    pub fn read_int8(&mut self) -> Result<i8, PayloadError> {
        self.next_field().and_then(as_int8)
    }

    pub fn read_int32(&mut self) -> Result<i32, PayloadError> {
        self.next_field().and_then(as_int32)
    }

    pub fn read_double(&mut self) -> Result<f64, PayloadError> {
        self.next_field().and_then(as_double)
    }

    pub fn read_string(&mut self) -> Result<String, PayloadError> {
        self.next_field().and_then(as_string)
    }

    pub fn remaining(&self) -> usize {
        self.fields.len() - self.position
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapContainer {
    fields: BTreeMap<String, Field>,
}

impl MapContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, field: Field) -> Result<&mut Self, PayloadError> {
        let key = key.into();
        if self.fields.contains_key(&key) {
            return Err(PayloadError::DuplicateKey(key));
        }
        self.fields.insert(key, field);
        Ok(self)
    }

    pub fn add_bool(&mut self, key: impl Into<String>, value: bool) -> Result<&mut Self, PayloadError> {
        self.add(key, Field::Bool(value))
    }

    pub fn add_int8(&mut self, key: impl Into<String>, value: i8) -> Result<&mut Self, PayloadError> {
        self.add(key, Field::Int8(value))
    }

    pub fn add_int32(&mut self, key: impl Into<String>, value: i32) -> Result<&mut Self, PayloadError> {
        self.add(key, Field::Int32(value))
    }

    pub fn add_double(&mut self, key: impl Into<String>, value: f64) -> Result<&mut Self, PayloadError> {
        self.add(key, Field::Double(value))
    }

    pub fn add_string(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, PayloadError> {
        self.add(key, Field::String(value.into()))
    }

    fn get(&self, key: &str) -> Result<&Field, PayloadError> {
        self.fields
            .get(key)
            .ok_or_else(|| PayloadError::MissingKey(key.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, PayloadError> {
        self.get(key).and_then(as_bool)
    }

    pub fn get_int8(&self, key: &str) -> Result<i8, PayloadError> {
        self.get(key).and_then(as_int8)
    }

    pub fn get_int32(&self, key: &str) -> Result<i32, PayloadError> {
        self.get(key).and_then(as_int32)
    }

    pub fn get_double(&self, key: &str) -> Result<f64, PayloadError> {
        self.get(key).and_then(as_double)
    }

    pub fn get_string(&self, key: &str) -> Result<String, PayloadError> {
        self.get(key).and_then(as_string)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
