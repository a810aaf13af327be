//! Entity payloads and value equality
//!
//! Entities travel through the sync core as flat JSON objects. Equality is by
//! value: nested objects and arrays compare element-wise and numbers compare
//! by numeric value regardless of their integer/float encoding.

use serde_json::{Map, Number, Value};

/// Field values of an entity, keyed by field name
pub type Payload = Map<String, Value>;

/// Deep value equality used for every field comparison.
///
/// `1` and `1.0` are equal; `null` is a value and differs from any other.
#[must_use]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => numbers_equal(left, right),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right.iter())
                    .all(|(left, right)| values_equal(left, right))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, value)| {
                    right
                        .get(key)
                        .is_some_and(|other| values_equal(value, other))
                })
        }
        _ => left == right,
    }
}

/// Compare two optional field values; an absent field only equals another
/// absent field.
#[must_use]
pub fn field_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => values_equal(left, right),
        _ => false,
    }
}

#[allow(clippy::float_cmp)] // storage precision is exact
fn numbers_equal(left: &Number, right: &Number) -> bool {
    if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
        return left == right;
    }
    if let (Some(left), Some(right)) = (left.as_u64(), right.as_u64()) {
        return left == right;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

/// Apply `changes` on top of `base`, returning the combined field set.
#[must_use]
pub fn overlay(base: &Payload, changes: &Payload) -> Payload {
    let mut merged = base.clone();
    for (field, value) in changes {
        merged.insert(field.clone(), value.clone());
    }
    merged
}

/// Union of field names from both payloads, sorted.
#[must_use]
pub fn field_union(left: &Payload, right: &Payload) -> Vec<String> {
    let mut fields = left
        .keys()
        .chain(right.keys())
        .cloned()
        .collect::<Vec<_>>();
    fields.sort();
    fields.dedup();
    fields
}

/// Parse a JSON object into a payload.
pub fn payload_from_value(value: Value) -> crate::Result<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(crate::Error::Validation(format!(
            "entity payload must be a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_and_float_encodings_are_equal() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!(1.000_001)));
    }

    #[test]
    fn nested_values_compare_deeply() {
        assert!(values_equal(
            &json!({"tags": ["a", "b"], "meta": {"n": 2}}),
            &json!({"meta": {"n": 2.0}, "tags": ["a", "b"]})
        ));
        assert!(!values_equal(&json!(["a", "b"]), &json!(["b", "a"])));
    }

    #[test]
    fn absent_differs_from_null() {
        let null = json!(null);
        assert!(!field_equal(None, Some(&null)));
        assert!(field_equal(None, None));
    }

    #[test]
    fn overlay_replaces_changed_fields_only() {
        let base = payload_from_value(json!({"title": "old", "done": false})).unwrap();
        let changes = payload_from_value(json!({"title": "new"})).unwrap();
        let merged = overlay(&base, &changes);
        assert_eq!(Value::Object(merged), json!({"title": "new", "done": false}));
    }

    #[test]
    fn payload_must_be_object() {
        assert!(payload_from_value(json!([1, 2])).is_err());
    }
}
