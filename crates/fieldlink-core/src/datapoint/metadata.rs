// ── Entry metadata ──
//
// Per-protocol source descriptions and the configured templates that
// turn them into the identity fields of a normalized event.
//
// Templates substitute `{key}` placeholders from the descriptor, or
// `{/json/pointer}` placeholders against the descriptor's JSON view.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Meta;

// ── SourceDescriptor ────────────────────────────────────────────────

/// Protocol-specific facts about a datapoint, available to templates.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDescriptor {
    Bacnet {
        name: String,
        description: String,
        units: String,
        /// Application tag name of the present value, e.g. `REAL`.
        tag: String,
        object_type: String,
        instance: u32,
    },
    Api {
        key: String,
        /// Static data from discovery merged with the latest reading.
        data: Value,
    },
    Socket {
        name: String,
        cast_as: String,
    },
}

impl SourceDescriptor {
    /// Resolve a placeholder body: a JSON pointer when it starts with
    /// `/`, otherwise a named field.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if key.starts_with('/') {
            return match self {
                Self::Api { data, .. } => data.pointer(key).and_then(scalar_text),
                other => other.to_json().pointer(key).and_then(scalar_text),
            };
        }
        match self {
            Self::Bacnet {
                name,
                description,
                units,
                tag,
                object_type,
                instance,
            } => match key {
                "name" => Some(name.clone()),
                "description" => Some(description.clone()),
                "units" => Some(units.clone()),
                "tag" => Some(tag.clone()),
                "type" => Some(object_type.clone()),
                "instance" => Some(instance.to_string()),
                _ => None,
            },
            Self::Api { key: k, data } => match key {
                "key" => Some(k.clone()),
                other => data.get(other).and_then(scalar_text),
            },
            Self::Socket { name, cast_as } => match key {
                "name" => Some(name.clone()),
                "cast_as" => Some(cast_as.clone()),
                _ => None,
            },
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Bacnet {
                name,
                description,
                units,
                tag,
                object_type,
                instance,
            } => serde_json::json!({
                "name": name,
                "description": description,
                "units": units,
                "tag": tag,
                "type": object_type,
                "instance": instance,
            }),
            Self::Api { data, .. } => data.clone(),
            Self::Socket { name, cast_as } => serde_json::json!({ "name": name, "cast_as": cast_as }),
        }
    }

    /// Storage class used when a template does not name one.
    pub fn default_target_type(&self) -> &'static str {
        match self {
            Self::Bacnet { tag, .. } => match tag.as_str() {
                "BOOLEAN" => "Boolean",
                "UNSIGNED_INT" | "SIGNED_INT" | "ENUMERATED" => "Integer",
                "CHARACTER_STRING" => "String",
                "REAL" | "DOUBLE" => "Real",
                _ => "JSON",
            },
            Self::Api { .. } => "Real",
            Self::Socket { cast_as, .. } => match cast_as.as_str() {
                "boolean" => "Boolean",
                "integer" => "Integer",
                "string" => "String",
                _ => "Real",
            },
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

// ── EntryMetadata ───────────────────────────────────────────────────

/// Identity fields of an outgoing event, rendered from a template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntryMetadata {
    pub platform_name: String,
    pub platform_meta: Meta,
    pub observed_property: String,
    pub sensor_meta: Meta,
    pub unit: Option<String>,
    pub target_type: String,
    pub broker_meta: Meta,
    pub brokerage_meta: Meta,
}

// ── MetadataTemplate ────────────────────────────────────────────────

/// Configured mapping from a [`SourceDescriptor`] to [`EntryMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataTemplate {
    pub platform: String,
    pub observed_property: String,
    pub unit: Option<String>,
    pub target_type: Option<String>,
    /// Placeholders that must resolve to non-empty text; otherwise the
    /// datapoint produces no event.
    pub require: Vec<String>,
    pub platform_meta: Meta,
    pub sensor_meta: Meta,
    pub broker_meta: Meta,
    pub brokerage_meta: Meta,
}

impl Default for MetadataTemplate {
    fn default() -> Self {
        Self {
            platform: "{name}".into(),
            observed_property: "{description}".into(),
            unit: Some("{units}".into()),
            target_type: None,
            require: Vec::new(),
            platform_meta: Meta::new(),
            sensor_meta: Meta::new(),
            broker_meta: Meta::new(),
            brokerage_meta: Meta::new(),
        }
    }
}

impl MetadataTemplate {
    /// Render for one datapoint. Returns `None` when a required
    /// placeholder does not resolve.
    pub fn render(&self, source: &SourceDescriptor) -> Option<EntryMetadata> {
        let resolved = |key: &String| source.lookup(key).is_some_and(|v| !v.is_empty());
        if !self.require.iter().all(resolved) {
            return None;
        }

        let unit = self
            .unit
            .as_deref()
            .map(|t| fill(t, source))
            .filter(|u| !u.is_empty());
        let target_type = self
            .target_type
            .as_deref()
            .map(|t| fill(t, source))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| source.default_target_type().to_owned());

        Some(EntryMetadata {
            platform_name: fill(&self.platform, source),
            platform_meta: fill_meta(&self.platform_meta, source),
            observed_property: fill(&self.observed_property, source),
            sensor_meta: fill_meta(&self.sensor_meta, source),
            unit,
            target_type,
            broker_meta: fill_meta(&self.broker_meta, source),
            brokerage_meta: fill_meta(&self.brokerage_meta, source),
        })
    }
}

/// Substitute every `{...}` placeholder. Unresolved placeholders render
/// as empty text; an unterminated brace is kept literally.
pub fn fill(template: &str, source: &SourceDescriptor) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        if let Some(value) = source.lookup(&after[..close]) {
            out.push_str(&value);
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn fill_meta(meta: &Meta, source: &SourceDescriptor) -> Meta {
    meta.iter()
        .map(|(k, v)| (k.clone(), fill_value(v, source)))
        .collect()
}

fn fill_value(value: &Value, source: &SourceDescriptor) -> Value {
    match value {
        Value::String(s) => Value::String(fill(s, source)),
        Value::Array(items) => Value::Array(items.iter().map(|v| fill_value(v, source)).collect()),
        Value::Object(map) => Value::Object(fill_meta(map, source)),
        other => other.clone(),
    }
}
