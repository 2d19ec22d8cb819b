use log::debug;
use serde_json::{json, Map, Value};

use crate::constants::MAX_REGISTRY_VALUES;
use crate::security::{wildcard_matches, ApprovedTarget};
use crate::windows::ConfigStore;

fn values_map(store: &dyn ConfigStore, key: &str) -> anyhow::Result<Map<String, Value>> {
    Ok(store
        .values(key, MAX_REGISTRY_VALUES)?
        .into_iter()
        .map(|(name, value)| {
            let name = if name.is_empty() { "(default)".to_string() } else { name };
            (name, value.to_json())
        })
        .collect())
}

/// Read a key, one named value, or the subkeys matching a wildcard.
///
/// When the approved path is not a key, its last segment is tried as a value
/// name under the parent key. Failures land in an `error` field.
pub fn collect_registry(
    store: &dyn ConfigStore,
    approved: &ApprovedTarget,
    value_name: Option<&str>,
) -> Map<String, Value> {
    let key = approved.target();
    let mut data = Map::new();
    data.insert("path".to_string(), json!(key));

    let result = match (approved.wildcard(), value_name) {
        (Some(pattern), _) => collect_matching_subkeys(store, key, pattern, &mut data),
        (None, Some(name)) => read_named_value(store, key, name, &mut data),
        (None, None) => read_key_or_leaf(store, key, &mut data),
    };

    if let Err(e) = result {
        debug!("Failed to read registry target {}: {:#}", key, e);
        data.insert("error".to_string(), json!(format!("{:#}", e)));
    }
    data
}

fn read_named_value(
    store: &dyn ConfigStore,
    key: &str,
    name: &str,
    data: &mut Map<String, Value>,
) -> anyhow::Result<()> {
    data.insert("value_name".to_string(), json!(name));
    match store.read_value(key, name)? {
        Some(value) => {
            data.insert("exists".to_string(), json!(true));
            data.insert("value".to_string(), value.to_json());
        }
        None => {
            data.insert("exists".to_string(), json!(false));
        }
    }
    Ok(())
}

fn read_key_or_leaf(store: &dyn ConfigStore, key: &str, data: &mut Map<String, Value>) -> anyhow::Result<()> {
    if store.key_exists(key)? {
        let values = values_map(store, key)?;
        data.insert("exists".to_string(), json!(true));
        data.insert("value_count".to_string(), json!(values.len()));
        data.insert("values".to_string(), Value::Object(values));
        return Ok(());
    }

    // The leaf may be a value name rather than a subkey
    if let Some((parent, leaf)) = key.rsplit_once('\\') {
        if let Some(value) = store.read_value(parent, leaf)? {
            data.insert("exists".to_string(), json!(true));
            data.insert("value_name".to_string(), json!(leaf));
            data.insert("value".to_string(), value.to_json());
            return Ok(());
        }
    }

    data.insert("exists".to_string(), json!(false));
    Ok(())
}

fn collect_matching_subkeys(
    store: &dyn ConfigStore,
    key: &str,
    pattern: &str,
    data: &mut Map<String, Value>,
) -> anyhow::Result<()> {
    data.insert("pattern".to_string(), json!(pattern));

    let mut subkeys = Map::new();
    let mut matched = 0usize;
    for name in store.subkeys(key)? {
        if !wildcard_matches(pattern, &name) {
            continue;
        }
        matched += 1;
        if subkeys.len() >= MAX_REGISTRY_VALUES {
            continue;
        }
        let child = format!("{}\\{}", key, name);
        let entry = match values_map(store, &child) {
            Ok(values) => Value::Object(values),
            Err(e) => json!({ "error": format!("{:#}", e) }),
        };
        subkeys.insert(name, entry);
    }

    data.insert("exists".to_string(), json!(matched > 0));
    data.insert("subkey_count".to_string(), json!(matched));
    data.insert("subkeys".to_string(), Value::Object(subkeys));
    Ok(())
}
