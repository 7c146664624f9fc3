// ── BACnet/IP ──
//
// Object and property identifiers, application-tagged values, and the
// ReadPropertyMultiple request/response shapes shared by the codec and
// the UDP client.

pub mod client;
pub mod codec;

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

pub use client::{BacnetClient, BacnetClientConfig, ReadPropertyMultiple};

/// Per-property error code meaning "unknown object".
///
/// Reported against a property when the whole object is absent, as
/// opposed to the object existing without the queried property.
pub const UNKNOWN_OBJECT_ERROR_CODE: u32 = 31;

/// Largest instance number representable in an object identifier.
pub const MAX_INSTANCE: u32 = (1 << 22) - 1;

// ── ObjectType ──────────────────────────────────────────────────────

/// Standard BACnet object types read during discovery.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u16)]
pub enum ObjectType {
    AnalogInput = 0,
    AnalogOutput = 1,
    AnalogValue = 2,
    BinaryInput = 3,
    BinaryOutput = 4,
    BinaryValue = 5,
    Calendar = 6,
    Command = 7,
    Device = 8,
    EventEnrollment = 9,
    File = 10,
    Group = 11,
    Loop = 12,
    MultiStateInput = 13,
    MultiStateOutput = 14,
    NotificationClass = 15,
    Program = 16,
    Schedule = 17,
    Averaging = 18,
    MultiStateValue = 19,
    TrendLog = 20,
    LifeSafetyPoint = 21,
    LifeSafetyZone = 22,
    Accumulator = 23,
    PulseConverter = 24,
    EventLog = 25,
    GlobalGroup = 26,
    TrendLogMultiple = 27,
    LoadControl = 28,
    StructuredView = 29,
    AccessDoor = 30,
    AccessCredential = 32,
    AccessPoint = 33,
    AccessRights = 34,
    AccessUser = 35,
    AccessZone = 36,
    CredentialDataInput = 37,
    NetworkSecurity = 38,
    BitstringValue = 39,
    CharacterStringValue = 40,
    DatePatternValue = 41,
    DateValue = 42,
    DateTimePatternValue = 43,
    DateTimeValue = 44,
    IntegerValue = 45,
    LargeAnalogValue = 46,
    OctetStringValue = 47,
    PositiveIntegerValue = 48,
    TimePatternValue = 49,
    TimeValue = 50,
    NotificationForwarder = 51,
    AlertEnrollment = 52,
    Channel = 53,
    LightingOutput = 54,
}

impl ObjectType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

// ── PropertyId ──────────────────────────────────────────────────────

/// The small fixed set of properties the pipeline reads.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u32)]
pub enum PropertyId {
    Description = 28,
    DeviceType = 31,
    EventState = 36,
    Name = 77,
    ObjectType = 79,
    OutOfService = 81,
    PresentValue = 85,
    Resolution = 106,
    StatusFlags = 111,
    Units = 117,
    UpdateInterval = 118,
}

impl PropertyId {
    pub fn code(self) -> u32 {
        self as u32
    }
}

// ── ObjectId ────────────────────────────────────────────────────────

/// An object identifier: type plus 22-bit instance number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Packed wire form: `type << 22 | instance`.
    pub fn to_wire(self) -> u32 {
        (u32::from(self.object_type.code()) << 22) | (self.instance & MAX_INSTANCE)
    }

    /// Unpack the wire form. Returns `None` for object types outside
    /// the supported set.
    pub fn from_wire(raw: u32) -> Option<Self> {
        let code = u16::try_from(raw >> 22).ok()?;
        let object_type = ObjectType::from_repr(code)?;
        Some(Self::new(object_type, raw & MAX_INSTANCE))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

// ── ApplicationValue ────────────────────────────────────────────────

/// A decoded application-tagged value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationValue {
    Null,
    Boolean(bool),
    #[serde(rename = "UNSIGNED_INT")]
    Unsigned(u64),
    #[serde(rename = "SIGNED_INT")]
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString { unused_bits: u8, bytes: Vec<u8> },
    Enumerated(u32),
    Date { year: u16, month: u8, day: u8, weekday: u8 },
    Time { hour: u8, minute: u8, second: u8, hundredths: u8 },
    #[serde(rename = "OBJECTIDENTIFIER")]
    ObjectId { object_type: u16, instance: u32 },
}

impl ApplicationValue {
    /// The application tag number on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Unsigned(_) => 2,
            Self::Signed(_) => 3,
            Self::Real(_) => 4,
            Self::Double(_) => 5,
            Self::OctetString(_) => 6,
            Self::CharacterString(_) => 7,
            Self::BitString { .. } => 8,
            Self::Enumerated(_) => 9,
            Self::Date { .. } => 10,
            Self::Time { .. } => 11,
            Self::ObjectId { .. } => 12,
        }
    }

    /// The application tag name, e.g. `"REAL"` or `"CHARACTER_STRING"`.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Boolean(_) => "BOOLEAN",
            Self::Unsigned(_) => "UNSIGNED_INT",
            Self::Signed(_) => "SIGNED_INT",
            Self::Real(_) => "REAL",
            Self::Double(_) => "DOUBLE",
            Self::OctetString(_) => "OCTET_STRING",
            Self::CharacterString(_) => "CHARACTER_STRING",
            Self::BitString { .. } => "BIT_STRING",
            Self::Enumerated(_) => "ENUMERATED",
            Self::Date { .. } => "DATE",
            Self::Time { .. } => "TIME",
            Self::ObjectId { .. } => "OBJECTIDENTIFIER",
        }
    }

    /// Numeric view, where one exists.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Unsigned(u) => Some(*u as f64),
            Self::Signed(i) => Some(*i as f64),
            Self::Real(r) => Some(f64::from(*r)),
            Self::Double(d) => Some(*d),
            Self::Enumerated(e) => Some(f64::from(*e)),
            _ => None,
        }
    }

    /// Plain JSON rendering used in emitted events.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Unsigned(u) => Value::from(*u),
            Self::Signed(i) => Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(f64::from(*r)).map_or(Value::Null, Value::Number),
            Self::Double(d) => serde_json::Number::from_f64(*d).map_or(Value::Null, Value::Number),
            Self::OctetString(b) => Value::from(b.clone()),
            Self::CharacterString(s) => Value::String(s.clone()),
            Self::BitString { bytes, .. } => Value::from(bytes.clone()),
            Self::Enumerated(e) => Value::from(*e),
            Self::Date {
                year, month, day, ..
            } => Value::String(format!("{year:04}-{month:02}-{day:02}")),
            Self::Time {
                hour,
                minute,
                second,
                hundredths,
            } => Value::String(format!("{hour:02}:{minute:02}:{second:02}.{hundredths:02}")),
            Self::ObjectId {
                object_type,
                instance,
            } => serde_json::json!({ "type": object_type, "instance": instance }),
        }
    }

    /// Text view for name/description style properties.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::CharacterString(s) => Some(s.clone()),
            Self::Null => None,
            other => match other.to_json() {
                serde_json::Value::String(s) => Some(s),
                v => Some(v.to_string()),
            },
        }
    }
}

// ── ReadPropertyMultiple shapes ─────────────────────────────────────

/// One object's worth of a ReadPropertyMultiple request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpec {
    pub object: ObjectId,
    pub properties: Vec<PropertyId>,
}

impl ReadAccessSpec {
    pub fn new(object: ObjectId, properties: impl Into<Vec<PropertyId>>) -> Self {
        Self {
            object,
            properties: properties.into(),
        }
    }
}

/// Error reported by the device against a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyError {
    pub class: u32,
    pub code: u32,
}

/// A single property's outcome within a read-access result.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyResult {
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub value: Result<Vec<ApplicationValue>, PropertyError>,
}

/// One object's worth of a ReadPropertyMultiple acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
    pub object: ObjectId,
    pub results: Vec<PropertyResult>,
}
