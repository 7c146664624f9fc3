// ── Delimited frame decoding ──
//
// Raw TCP devices send lines of delimited values. A frame ends at `\n`,
// `\r` or ETX; its fields are cast according to the configured value
// descriptions, which must account for every field.

use bytes::BytesMut;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// End-of-text control character.
pub const ETX: u8 = 0x03;

const TERMINATORS: [u8; 3] = [b'\n', b'\r', ETX];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CastAs {
    String,
    Float,
    Integer,
    Boolean,
}

impl CastAs {
    pub fn cast(self, raw: &str) -> Value {
        let raw = raw.trim();
        match self {
            Self::String => Value::String(raw.to_owned()),
            Self::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
            Self::Integer => raw.parse::<i64>().map_or(Value::Null, Value::from),
            Self::Boolean => Value::Bool(raw.parse::<i64>().is_ok_and(|n| n != 0)),
        }
    }
}

/// One named value in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDescription {
    pub name: String,
    pub cast_as: CastAs,
    /// Consecutive fields forming an array.
    #[serde(default)]
    pub length: Option<usize>,
    /// Row-major matrix dimensions; the first is the row width.
    #[serde(default)]
    pub matrix: Option<Vec<usize>>,
}

impl ValueDescription {
    /// Fields this value consumes.
    pub fn width(&self) -> usize {
        match (&self.matrix, self.length) {
            (Some(dims), _) => dims.iter().product(),
            (None, Some(length)) => length,
            (None, None) => 1,
        }
    }
}

/// Split off the next complete frame, if the buffer holds one. Empty
/// frames (e.g. the `\n` of a `\r\n`) are skipped.
pub fn next_frame(buffer: &mut BytesMut) -> Option<String> {
    loop {
        let end = buffer.iter().position(|b| TERMINATORS.contains(b))?;
        let frame = buffer.split_to(end + 1);
        let text = String::from_utf8_lossy(&frame[..end]).into_owned();
        if !text.is_empty() {
            return Some(text);
        }
    }
}

/// Split a frame into fields. A trailing delimiter does not add a field.
pub fn split_fields(frame: &str, delimiter: &str, strip: bool) -> Vec<String> {
    let cleaned: String = if strip {
        frame
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ';' | ' ' | ','))
            .collect()
    } else {
        frame.to_owned()
    };
    let mut fields: Vec<String> = if delimiter.is_empty() {
        vec![cleaned]
    } else {
        cleaned.split(delimiter).map(str::to_owned).collect()
    };
    if fields.last().is_some_and(String::is_empty) {
        fields.pop();
    }
    fields
}

/// Cast `fields` into named values. `None` when the field count does not
/// match the descriptions.
pub fn interpret(fields: &[String], values: &[ValueDescription]) -> Option<IndexMap<String, Value>> {
    let expected: usize = values.iter().map(ValueDescription::width).sum();
    if fields.len() != expected {
        return None;
    }

    let mut rest = fields;
    let mut out = IndexMap::with_capacity(values.len());
    for description in values {
        let (taken, remaining) = rest.split_at(description.width());
        rest = remaining;
        let cast: Vec<Value> = taken.iter().map(|f| description.cast_as.cast(f)).collect();
        let value = match (&description.matrix, description.length) {
            (Some(dims), _) => {
                let width = dims.first().copied().unwrap_or(1).max(1);
                Value::Array(cast.chunks(width).map(|row| Value::Array(row.to_vec())).collect())
            }
            (None, Some(_)) => Value::Array(cast),
            (None, None) => cast.into_iter().next().unwrap_or(Value::Null),
        };
        out.insert(description.name.clone(), value);
    }
    Some(out)
}
