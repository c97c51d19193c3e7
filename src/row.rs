//! Property values and the schema-driven row codec.
//!
//! A row is the encoded value of one record: a field count followed by one
//! self-tagged value per schema field, written in schema declaration order.
//! Rows written under an older schema version may carry fewer fields than
//! the current schema; the reader falls back to the field's declared
//! default (or null) for the missing tail.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::schema::{PropType, Schema};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_TIMESTAMP: u8 = 6;

/// One property value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent value for a nullable field.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Microseconds since the epoch.
    Timestamp(i64),
}

impl Value {
    /// True when the value is assignable to a field of the given type.
    /// Null is assignable everywhere; nullability is checked by the writer.
    pub fn matches(&self, ty: PropType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), PropType::Bool)
                | (Value::Int(_), PropType::Int)
                | (Value::Float(_), PropType::Float)
                | (Value::Str(_), PropType::Str)
                | (Value::Bytes(_), PropType::Bytes)
                | (Value::Timestamp(_), PropType::Timestamp)
        )
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Value::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Value::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::Timestamp(v) => {
                out.push(TAG_TIMESTAMP);
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }

    pub(crate) fn decode_from(src: &[u8]) -> Result<(Value, usize)> {
        let tag = *src
            .first()
            .ok_or_else(|| StoreError::InvalidData("value truncated".into()))?;
        let body = &src[1..];
        match tag {
            TAG_NULL => Ok((Value::Null, 1)),
            TAG_BOOL => {
                let b = *body
                    .first()
                    .ok_or_else(|| StoreError::InvalidData("bool truncated".into()))?;
                Ok((Value::Bool(b != 0), 2))
            }
            TAG_INT => Ok((Value::Int(read_i64(body)?), 9)),
            TAG_FLOAT => Ok((Value::Float(f64::from_bits(read_i64(body)? as u64)), 9)),
            TAG_STR => {
                let (bytes, used) = read_blob(body)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| StoreError::InvalidData("string not utf-8".into()))?;
                Ok((Value::Str(s), 1 + used))
            }
            TAG_BYTES => {
                let (bytes, used) = read_blob(body)?;
                Ok((Value::Bytes(bytes), 1 + used))
            }
            TAG_TIMESTAMP => Ok((Value::Timestamp(read_i64(body)?), 9)),
            other => Err(StoreError::InvalidData(format!(
                "unknown value tag {other}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Timestamp(v) => write!(f, "ts({v})"),
        }
    }
}

fn read_i64(src: &[u8]) -> Result<i64> {
    if src.len() < 8 {
        return Err(StoreError::InvalidData("integer truncated".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    Ok(i64::from_be_bytes(buf))
}

fn read_blob(src: &[u8]) -> Result<(Vec<u8>, usize)> {
    if src.len() < 4 {
        return Err(StoreError::InvalidData("blob length truncated".into()));
    }
    let mut lbuf = [0u8; 4];
    lbuf.copy_from_slice(&src[..4]);
    let len = u32::from_be_bytes(lbuf) as usize;
    if src.len() < 4 + len {
        return Err(StoreError::InvalidData("blob payload truncated".into()));
    }
    Ok((src[4..4 + len].to_vec(), 4 + len))
}

/// Writes one row against a schema, checking field names and types.
pub struct RowWriter {
    schema: Arc<Schema>,
    values: Vec<Option<Value>>,
}

impl RowWriter {
    /// Starts a writer for the given schema with every field unset.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = vec![None; schema.num_fields()];
        Self { schema, values }
    }

    /// Sets one field by name. Rejects unknown fields, type mismatches, and
    /// null for non-nullable fields.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let (idx, field) = self
            .schema
            .field(name)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown field {name}")))?;
        if !value.matches(field.prop_type) {
            return Err(StoreError::InvalidData(format!(
                "type mismatch for field {name}"
            )));
        }
        if value.is_null() && !field.nullable {
            return Err(StoreError::InvalidData(format!(
                "null for non-nullable field {name}"
            )));
        }
        self.values[idx] = Some(value);
        Ok(())
    }

    /// Finalizes the row. Unset fields take their declared default, then
    /// null where nullable; a field with neither fails the whole row.
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16 + self.values.len() * 9);
        out.extend_from_slice(&(self.values.len() as u16).to_be_bytes());
        for (idx, slot) in self.values.into_iter().enumerate() {
            let field = self.schema.field_at(idx);
            let value = match slot {
                Some(v) => v,
                None => match (&field.default, field.nullable) {
                    (Some(d), _) => d.clone(),
                    (None, true) => Value::Null,
                    (None, false) => {
                        return Err(StoreError::NoDefaultValueAndNotNullable {
                            field: field.name.clone(),
                        })
                    }
                },
            };
            value.encode_into(&mut out);
        }
        Ok(out)
    }
}

/// Reads one row against a schema, falling back to declared defaults for
/// fields appended by later schema versions.
pub struct RowReader {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl RowReader {
    /// Decodes an encoded row. Fails with `InvalidData` on any malformed
    /// payload or on a row wider than the schema.
    pub fn decode(schema: Arc<Schema>, raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(StoreError::InvalidData("row header truncated".into()));
        }
        let count = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        if count > schema.num_fields() {
            return Err(StoreError::InvalidData(
                "row has more fields than schema".into(),
            ));
        }
        let mut values = Vec::with_capacity(count);
        let mut cursor = &raw[2..];
        for _ in 0..count {
            let (value, used) = Value::decode_from(cursor)?;
            values.push(value);
            cursor = &cursor[used..];
        }
        if !cursor.is_empty() {
            return Err(StoreError::InvalidData("trailing bytes after row".into()));
        }
        Ok(Self { schema, values })
    }

    /// Reads one field by name. Fields beyond the stored width resolve to
    /// the schema default or null; a field with neither is `InvalidData`.
    pub fn get(&self, name: &str) -> Result<Value> {
        let (idx, field) = self
            .schema
            .field(name)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown field {name}")))?;
        if let Some(value) = self.values.get(idx) {
            if !value.matches(field.prop_type) {
                return Err(StoreError::InvalidData(format!(
                    "stored type mismatch for field {name}"
                )));
            }
            return Ok(value.clone());
        }
        match (&field.default, field.nullable) {
            (Some(d), _) => Ok(d.clone()),
            (None, true) => Ok(Value::Null),
            (None, false) => Err(StoreError::InvalidData(format!(
                "field {name} missing with no default"
            ))),
        }
    }

    /// The schema this row was decoded against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}
