use serde_json::{Map, Value};

/// Merge `patch` into every JSON object in `value` whose `"id"` equals
/// `entity_id`, at any depth. Returns whether anything changed.
pub fn patch_entity(value: &mut Value, entity_id: &str, patch: &Map<String, Value>) -> bool {
    match value {
        Value::Object(map) => {
            let mut changed = false;
            if id_matches(map.get("id"), entity_id) {
                for (field, new_value) in patch {
                    if map.get(field) != Some(new_value) {
                        map.insert(field.clone(), new_value.clone());
                        changed = true;
                    }
                }
            }
            for (field, child) in map.iter_mut() {
                if field != "id" {
                    changed |= patch_entity(child, entity_id, patch);
                }
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| patch_entity(item, entity_id, patch) | changed),
        _ => false,
    }
}

fn id_matches(id: Option<&Value>, entity_id: &str) -> bool {
    match id {
        Some(Value::String(id)) => id == entity_id,
        Some(Value::Number(id)) => id.to_string() == entity_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_patch(status: &str) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!(status));
        patch
    }

    #[test]
    fn test_patches_every_copy() {
        let mut value = json!({
            "items": [
                {"id": "o1", "status": "pending_payment"},
                {"id": "o2", "status": "pending_payment"}
            ],
            "featured": {"id": "o1", "status": "pending_payment"}
        });

        assert!(patch_entity(&mut value, "o1", &status_patch("paid")));
        assert_eq!(value["items"][0]["status"], json!("paid"));
        assert_eq!(value["items"][1]["status"], json!("pending_payment"));
        assert_eq!(value["featured"]["status"], json!("paid"));
    }

    #[test]
    fn test_reports_no_change() {
        let mut value = json!([{"id": "o1", "status": "paid"}]);

        assert!(!patch_entity(&mut value, "o1", &status_patch("paid")));
        assert!(!patch_entity(&mut value, "missing", &status_patch("failed")));
    }
}
