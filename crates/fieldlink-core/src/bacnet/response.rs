// ── ReadPropertyMultiple response mapping ──
//
// Normalizes the three possible outcomes of a batched read (total
// failure, object missing, object present) into one shape per requested
// object so callers never branch on transport details.

use std::collections::BTreeMap;

use fieldlink_api::{
    ObjectId, PropertyId, ReadAccessResult, ReadAccessSpec, UNKNOWN_OBJECT_ERROR_CODE,
};
use serde::{Deserialize, Serialize};

/// One property as last read from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyData {
    pub identifier: PropertyId,
    /// Application tag name of the value, e.g. `REAL`.
    pub tag: Option<String>,
    pub value: Option<serde_json::Value>,
    pub exists: bool,
}

impl PropertyData {
    fn absent(identifier: PropertyId) -> Self {
        Self {
            identifier,
            tag: None,
            value: None,
            exists: false,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

pub type PropertyMap = BTreeMap<PropertyId, PropertyData>;

/// Per-object outcome of a batched read.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResponse {
    pub object: ObjectId,
    pub exists: bool,
    pub properties: PropertyMap,
}

impl ObjectResponse {
    fn missing(object: ObjectId) -> Self {
        Self {
            object,
            exists: false,
            properties: PropertyMap::new(),
        }
    }
}

/// Map a response (or `None` for total failure) onto the request.
///
/// An object counts as present when the response carries it and at
/// least one of its results is not the unknown-object error. Properties
/// reported with an error, or missing from the response, are present
/// in the map with `exists: false`.
pub fn map_response(
    requested: &[ReadAccessSpec],
    response: Option<&[ReadAccessResult]>,
) -> Vec<ObjectResponse> {
    let Some(response) = response else {
        return requested.iter().map(|r| ObjectResponse::missing(r.object)).collect();
    };

    requested
        .iter()
        .map(|spec| {
            let Some(found) = response.iter().find(|r| r.object == spec.object) else {
                return ObjectResponse::missing(spec.object);
            };
            let exists = found.results.iter().any(|r| match &r.value {
                Ok(_) => true,
                Err(e) => e.code != UNKNOWN_OBJECT_ERROR_CODE,
            });
            if !exists {
                return ObjectResponse::missing(spec.object);
            }

            let properties = spec
                .properties
                .iter()
                .map(|&property| {
                    let data = found
                        .results
                        .iter()
                        .find(|r| r.property == property)
                        .and_then(|r| r.value.as_ref().ok())
                        .and_then(|values| values.last())
                        .map_or_else(
                            || PropertyData::absent(property),
                            |value| PropertyData {
                                identifier: property,
                                tag: Some(value.tag_name().to_owned()),
                                value: Some(value.to_json()),
                                exists: true,
                            },
                        );
                    (property, data)
                })
                .collect();

            ObjectResponse {
                object: spec.object,
                exists: true,
                properties,
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use fieldlink_api::{ApplicationValue, ObjectType, PropertyError, PropertyResult};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn a() -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, 1)
    }

    fn b() -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, 2)
    }

    fn request() -> Vec<ReadAccessSpec> {
        vec![
            ReadAccessSpec::new(a(), [PropertyId::PresentValue]),
            ReadAccessSpec::new(b(), [PropertyId::PresentValue]),
        ]
    }

    fn ok(property: PropertyId, value: ApplicationValue) -> PropertyResult {
        PropertyResult {
            property,
            array_index: None,
            value: Ok(vec![value]),
        }
    }

    fn err(property: PropertyId, code: u32) -> PropertyResult {
        PropertyResult {
            property,
            array_index: None,
            value: Err(PropertyError { class: 2, code }),
        }
    }

    #[test]
    fn partial_response_marks_missing_object_absent() {
        let response = vec![ReadAccessResult {
            object: a(),
            results: vec![ok(PropertyId::PresentValue, ApplicationValue::Real(21.5))],
        }];
        let mapped = map_response(&request(), Some(response.as_slice()));

        assert!(mapped[0].exists);
        let pv = &mapped[0].properties[&PropertyId::PresentValue];
        assert_eq!(pv.value, Some(json!(21.5)));
        assert_eq!(pv.tag.as_deref(), Some("REAL"));
        assert!(!mapped[1].exists);
        assert!(mapped[1].properties.is_empty());
    }

    #[test]
    fn total_failure_marks_everything_absent() {
        let mapped = map_response(&request(), None);
        assert!(mapped.iter().all(|o| !o.exists && o.properties.is_empty()));
    }

    #[test]
    fn unknown_object_errors_mean_absent_object() {
        let response = vec![ReadAccessResult {
            object: a(),
            results: vec![err(PropertyId::PresentValue, UNKNOWN_OBJECT_ERROR_CODE)],
        }];
        let mapped = map_response(&request()[..1], Some(response.as_slice()));
        assert!(!mapped[0].exists);
    }

    #[test]
    fn missing_property_keeps_object_present() {
        let spec = vec![ReadAccessSpec::new(
            a(),
            [PropertyId::Name, PropertyId::Units, PropertyId::Description],
        )];
        let response = vec![ReadAccessResult {
            object: a(),
            results: vec![
                ok(PropertyId::Name, ApplicationValue::CharacterString("AHU1".into())),
                err(PropertyId::Units, 32),
            ],
        }];
        let mapped = map_response(&spec, Some(response.as_slice()));

        assert!(mapped[0].exists);
        let props = &mapped[0].properties;
        assert_eq!(props[&PropertyId::Name].text().as_deref(), Some("AHU1"));
        assert!(!props[&PropertyId::Units].exists);
        assert_eq!(props[&PropertyId::Units].value, None);
        assert!(!props[&PropertyId::Description].exists);
    }

    #[test]
    fn array_values_use_last_element() {
        let spec = vec![ReadAccessSpec::new(a(), [PropertyId::PresentValue])];
        let response = vec![ReadAccessResult {
            object: a(),
            results: vec![PropertyResult {
                property: PropertyId::PresentValue,
                array_index: None,
                value: Ok(vec![ApplicationValue::Unsigned(1), ApplicationValue::Unsigned(7)]),
            }],
        }];
        let mapped = map_response(&spec, Some(response.as_slice()));
        assert_eq!(mapped[0].properties[&PropertyId::PresentValue].value, Some(json!(7)));
    }
}
