//! Flattening of gNMI notifications into [`TelemetryEvent`]s.
//!
//! Every update becomes one event. List keys on the prefix and update path
//! become tags named `<element>_<key>`. Scalar values are stored under the
//! element-name path; JSON values are walked and each leaf is stored under
//! `<path>/<child>/...`, with YANG module prefixes (`module:`) removed.

use serde_json::Value as Json;
use srl_exporter_common::{ScalarValue, TelemetryEvent};
use tracing::trace;

use crate::path::path_to_xpath;
use crate::proto::{Notification, PathElem, TypedValue, typed_value};

/// Convert one notification into events, one per update.
pub fn notification_to_events(notification: &Notification) -> Vec<TelemetryEvent> {
    let timestamp = notification.timestamp / 1_000_000;
    let prefix: &[PathElem] = notification
        .prefix
        .as_ref()
        .map(|p| p.elem.as_slice())
        .unwrap_or_default();

    let mut events = Vec::with_capacity(notification.update.len());

    for update in &notification.update {
        let mut elems: Vec<PathElem> = prefix.to_vec();
        if let Some(path) = &update.path {
            elems.extend(path.elem.iter().cloned());
        }

        let mut event = TelemetryEvent::new(timestamp);
        for elem in &elems {
            for (key, value) in &elem.key {
                event
                    .tags
                    .entry(format!("{}_{}", elem.name, key))
                    .or_insert_with(|| value.clone());
            }
        }

        let name = path_to_xpath(&elems);
        if let Some(val) = &update.val {
            insert_typed_value(&mut event, &name, val);
        }

        if event.values.is_empty() {
            trace!(path = %name, "Update carried no usable values");
            continue;
        }
        events.push(event);
    }

    events
}

fn insert_typed_value(event: &mut TelemetryEvent, name: &str, val: &TypedValue) {
    use typed_value::Value;

    let scalar = match &val.value {
        Some(Value::StringVal(s)) => ScalarValue::Text(s.clone()),
        Some(Value::AsciiVal(s)) => ScalarValue::Text(s.clone()),
        Some(Value::IntVal(i)) => ScalarValue::Int(*i),
        Some(Value::UintVal(u)) => ScalarValue::Uint(*u),
        Some(Value::BoolVal(b)) => ScalarValue::Bool(*b),
        Some(Value::FloatVal(f)) => ScalarValue::Float(*f as f64),
        Some(Value::DoubleVal(d)) => ScalarValue::Float(*d),
        Some(Value::DecimalVal(d)) => {
            ScalarValue::Float(d.digits as f64 * 10f64.powi(-(d.precision as i32)))
        }
        Some(Value::JsonVal(bytes)) | Some(Value::JsonIetfVal(bytes)) => {
            match serde_json::from_slice::<Json>(bytes) {
                Ok(json) => flatten_json(event, name, &json),
                Err(e) => trace!(path = %name, error = %e, "Skipping undecodable JSON value"),
            }
            return;
        }
        Some(Value::LeaflistVal(_)) | Some(Value::BytesVal(_)) | None => return,
    };

    event.values.insert(name.to_string(), scalar);
}

fn flatten_json(event: &mut TelemetryEvent, name: &str, json: &Json) {
    match json {
        Json::Object(map) => {
            for (key, child) in map {
                let key = strip_module(key);
                flatten_json(event, &format!("{}/{}", name, key), child);
            }
        }
        Json::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten_json(event, &format!("{}/{}", name, idx), child);
            }
        }
        Json::Number(n) => {
            let scalar = if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::Float(n.as_f64().unwrap_or(f64::NAN))
            };
            event.values.insert(name.to_string(), scalar);
        }
        Json::String(s) => {
            event
                .values
                .insert(name.to_string(), ScalarValue::Text(s.clone()));
        }
        Json::Bool(b) => {
            event.values.insert(name.to_string(), ScalarValue::Bool(*b));
        }
        Json::Null => {}
    }
}

/// Render a scalar typed value as text.
///
/// JSON-encoded strings are unquoted; other JSON values are returned as
/// compact JSON. Leaf-lists and raw bytes give `None`.
pub fn typed_value_to_string(val: &TypedValue) -> Option<String> {
    use typed_value::Value;

    match val.value.as_ref()? {
        Value::StringVal(s) | Value::AsciiVal(s) => Some(s.clone()),
        Value::IntVal(i) => Some(i.to_string()),
        Value::UintVal(u) => Some(u.to_string()),
        Value::BoolVal(b) => Some(b.to_string()),
        Value::FloatVal(f) => Some(f.to_string()),
        Value::DoubleVal(d) => Some(d.to_string()),
        Value::DecimalVal(d) => {
            Some((d.digits as f64 * 10f64.powi(-(d.precision as i32))).to_string())
        }
        Value::JsonVal(bytes) | Value::JsonIetfVal(bytes) => {
            match serde_json::from_slice::<Json>(bytes).ok()? {
                Json::String(s) => Some(s),
                other => Some(other.to_string()),
            }
        }
        Value::LeaflistVal(_) | Value::BytesVal(_) => None,
    }
}

fn strip_module(key: &str) -> &str {
    key.rsplit_once(':').map(|(_, k)| k).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::parse_path;
    use crate::proto::Update;

    fn json_update(path: &str, json: &str) -> Update {
        Update {
            path: Some(parse_path(path)),
            val: Some(TypedValue {
                value: Some(typed_value::Value::JsonIetfVal(json.as_bytes().to_vec())),
            }),
            duplicates: 0,
        }
    }

    #[test]
    fn test_json_update_flattened_with_tags() {
        let notification = Notification {
            timestamp: 1_700_000_000_123_456_789,
            prefix: None,
            update: vec![json_update(
                "/interface[name=ethernet-1/1]/statistics",
                r#"{"in-octets":"1024","srl_nokia-if:out-octets":"2048","carrier-transitions":3}"#,
            )],
            ..Default::default()
        };

        let events = notification_to_events(&notification);
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.timestamp, 1_700_000_000_123);
        assert_eq!(
            event.tags.get("interface_name"),
            Some(&"ethernet-1/1".to_string())
        );
        assert_eq!(
            event.values.get("/interface/statistics/in-octets"),
            Some(&ScalarValue::Text("1024".to_string()))
        );
        assert_eq!(
            event.values.get("/interface/statistics/out-octets"),
            Some(&ScalarValue::Text("2048".to_string()))
        );
        assert_eq!(
            event.values.get("/interface/statistics/carrier-transitions"),
            Some(&ScalarValue::Int(3))
        );
    }

    #[test]
    fn test_prefix_keys_become_tags() {
        let notification = Notification {
            prefix: Some(parse_path("/network-instance[name=default]")),
            update: vec![Update {
                path: Some(parse_path("/protocols/bgp/group[group-name=spine]/statistics/total-peers")),
                val: Some(TypedValue {
                    value: Some(typed_value::Value::UintVal(4)),
                }),
                duplicates: 0,
            }],
            ..Default::default()
        };

        let events = notification_to_events(&notification);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].tags.get("network-instance_name"),
            Some(&"default".to_string())
        );
        assert_eq!(
            events[0].tags.get("group_group-name"),
            Some(&"spine".to_string())
        );
        assert_eq!(
            events[0]
                .values
                .get("/network-instance/protocols/bgp/group/statistics/total-peers"),
            Some(&ScalarValue::Uint(4))
        );
    }

    #[test]
    fn test_decimal_value() {
        let notification = Notification {
            update: vec![Update {
                path: Some(parse_path("/platform/control/cpu/total/average-1")),
                val: Some(TypedValue {
                    value: Some(typed_value::Value::DecimalVal(crate::proto::Decimal64 {
                        digits: 1234,
                        precision: 2,
                    })),
                }),
                duplicates: 0,
            }],
            ..Default::default()
        };

        let events = notification_to_events(&notification);
        let value = events[0].values["/platform/control/cpu/total/average-1"]
            .as_f64()
            .unwrap();
        assert!((value - 12.34).abs() < 1e-9);
    }

    #[test]
    fn test_typed_value_to_string() {
        let text = |value| typed_value_to_string(&TypedValue { value: Some(value) });

        assert_eq!(
            text(typed_value::Value::AsciiVal("leaf1".to_string())),
            Some("leaf1".to_string())
        );
        assert_eq!(
            text(typed_value::Value::JsonIetfVal(br#""v24.3.1""#.to_vec())),
            Some("v24.3.1".to_string())
        );
        assert_eq!(
            text(typed_value::Value::JsonVal(br#"{"a":1}"#.to_vec())),
            Some(r#"{"a":1}"#.to_string())
        );
        assert_eq!(text(typed_value::Value::UintVal(7)), Some("7".to_string()));
        assert_eq!(text(typed_value::Value::BytesVal(vec![1, 2])), None);
        assert_eq!(typed_value_to_string(&TypedValue { value: None }), None);
    }

    #[test]
    fn test_invalid_json_and_empty_updates_are_dropped() {
        let notification = Notification {
            update: vec![
                json_update("/system/lldp/interface/statistics", "{not json"),
                Update {
                    path: Some(parse_path("/system/name")),
                    val: None,
                    duplicates: 0,
                },
            ],
            ..Default::default()
        };

        assert!(notification_to_events(&notification).is_empty());
    }
}
