//! Layer merge
//!
//! - Objects merge by key, recursively
//! - Arrays and scalars from the overlay replace the base
//! - A null overlay leaves the base untouched, so unset optional layers
//!   never erase a default

use serde_json::Value;

/// Merge `overlay` into `base` in place.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        if !value.is_null() {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// Merge layers in precedence order (first is the base).
pub fn merge_layers(layers: Vec<Value>) -> Value {
    let mut merged = Value::Object(serde_json::Map::new());
    for layer in layers {
        deep_merge(&mut merged, layer);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_merge_keeps_siblings() {
        let mut base = json!({"api": {"base_url": "https://a", "http_timeout_seconds": 10}});
        deep_merge(&mut base, json!({"api": {"http_timeout_seconds": 3}}));

        assert_eq!(base["api"]["base_url"], "https://a");
        assert_eq!(base["api"]["http_timeout_seconds"], 3);
    }

    #[test]
    fn test_null_does_not_erase() {
        let mut base = json!({"api": {"entity": "team"}});
        deep_merge(&mut base, json!({"api": {"entity": null, "project": null}}));

        assert_eq!(base["api"]["entity"], "team");
        assert!(base["api"].get("project").is_none());
    }

    #[test]
    fn test_later_layer_wins() {
        let merged = merge_layers(vec![
            json!({"server": {"port": 0}}),
            json!({"server": {"port": 7000}}),
            json!({"server": {"port": 7001}}),
        ]);
        assert_eq!(merged["server"]["port"], 7001);
    }
}
