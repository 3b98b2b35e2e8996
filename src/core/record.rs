use std::fmt;
use std::fs;
use std::path::Path;

use super::error::{MsiError, Result};
use super::stream::Stream;

/// Integer returned for fields that hold no integer (MSI_NULL_INTEGER).
pub const NULL_INT: i32 = i32::MIN;

/// Records hold at most this many fields minus one.
pub const MAX_RECORD_FIELDS: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field {
    #[default]
    Null,
    Int(i32),
    Str(String),
    Stream(Stream),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Stream(s) => write!(f, "[{} bytes]", s.len()),
        }
    }
}

/// Fixed-arity tuple of fields, indexed `0..=count`.
///
/// Field 0 is a pseudo-slot some callers use for a table name; data
/// lives in fields `1..=count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<Field>,
}

/// Parses an optionally negative run of ASCII digits, nothing else.
fn parse_int(s: &str) -> Option<i32> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut value: i64 = 0;
    for b in digits.bytes() {
        value = value * 10 + i64::from(b - b'0');
        if value > i64::from(i32::MAX) + 1 {
            return None;
        }
    }
    let value = if neg { -value } else { value };
    i32::try_from(value).ok()
}

impl Record {
    pub fn new(count: usize) -> Result<Self> {
        if count >= MAX_RECORD_FIELDS {
            return Err(MsiError::InvalidParameter);
        }
        Ok(Self { fields: vec![Field::Null; count + 1] })
    }

    /// Builds a record whose fields `1..` are the given values.
    pub fn from_fields(values: Vec<Field>) -> Result<Self> {
        let mut rec = Self::new(values.len())?;
        for (i, v) in values.into_iter().enumerate() {
            rec.fields[i + 1] = v;
        }
        Ok(rec)
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len() - 1
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn set_field(&mut self, index: usize, value: Field) -> Result<()> {
        let slot = self.fields.get_mut(index).ok_or(MsiError::InvalidParameter)?;
        *slot = match value {
            Field::Int(NULL_INT) => Field::Null,
            Field::Str(s) if s.is_empty() => Field::Null,
            other => other,
        };
        Ok(())
    }

    /// Fields `1..=count` in order.
    pub fn values(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().skip(1)
    }

    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.fields.get(index), None | Some(Field::Null))
    }

    pub fn set_null(&mut self, index: usize) -> Result<()> {
        self.set_field(index, Field::Null)
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> Result<()> {
        self.set_field(index, Field::Int(value))
    }

    /// Integer view of a field. Numeric strings convert; anything else
    /// (non-numeric text, streams, nulls, out-of-range indexes) yields
    /// [`NULL_INT`].
    #[must_use]
    pub fn get_int(&self, index: usize) -> i32 {
        match self.fields.get(index) {
            Some(Field::Int(i)) => *i,
            Some(Field::Str(s)) => parse_int(s).unwrap_or(NULL_INT),
            _ => NULL_INT,
        }
    }

    /// Stores text; the empty string is stored as null.
    pub fn set_string(&mut self, index: usize, value: &str) -> Result<()> {
        self.set_field(index, Field::Str(value.to_string()))
    }

    /// Text view of a field. Integers are formatted in decimal; nulls and
    /// streams read as the empty string.
    #[must_use]
    pub fn get_string(&self, index: usize) -> String {
        match self.fields.get(index) {
            Some(Field::Int(i)) => i.to_string(),
            Some(Field::Str(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Borrowed text, only for string fields.
    #[must_use]
    pub fn string_ref(&self, index: usize) -> Option<&str> {
        match self.fields.get(index) {
            Some(Field::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_stream(&mut self, index: usize, stream: Stream) -> Result<()> {
        self.set_field(index, Field::Stream(stream))
    }

    pub fn load_stream_from_file(&mut self, index: usize, path: impl AsRef<Path>) -> Result<()> {
        if index == 0 || index > self.field_count() {
            return Err(MsiError::InvalidParameter);
        }
        let data = fs::read(path)?;
        self.set_stream(index, Stream::new(data))
    }

    /// An independent cursor over a stream field's bytes.
    pub fn get_stream(&self, index: usize) -> Result<Stream> {
        match self.fields.get(index) {
            None => Err(MsiError::InvalidParameter),
            Some(Field::Stream(s)) => Ok(s.duplicate()),
            Some(_) => Err(MsiError::InvalidDatatype),
        }
    }

    #[must_use]
    pub fn is_stream(&self, index: usize) -> bool {
        matches!(self.fields.get(index), Some(Field::Stream(_)))
    }

    /// Byte size of a field's value.
    #[must_use]
    pub fn data_size(&self, index: usize) -> usize {
        match self.fields.get(index) {
            Some(Field::Int(_)) => 4,
            Some(Field::Str(s)) => s.len(),
            Some(Field::Stream(s)) => s.len(),
            _ => 0,
        }
    }

    pub fn clear(&mut self) {
        for f in &mut self.fields {
            *f = Field::Null;
        }
    }

    /// Copies field `from` of `self` into field `to` of `dest`.
    pub fn copy_field(&self, from: usize, dest: &mut Self, to: usize) -> Result<()> {
        let value = self.fields.get(from).ok_or(MsiError::InvalidParameter)?.clone();
        dest.set_field(to, value)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.values().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}
