use log::debug;
use serde_json::{json, Map, Value};

use crate::constants::MAX_WMI_RESULTS;
use crate::security::{ApprovedTarget, DEFAULT_WMI_NAMESPACE};
use crate::windows::ManagementQuery;

/// Run an approved WMI query.
///
/// The first instance's properties are flattened into the result; later
/// instances go under `result_1`, `result_2`, ... Returns `None` when the
/// query succeeded with no instances.
pub fn collect_wmi(wmi: &dyn ManagementQuery, approved: &ApprovedTarget) -> Option<Map<String, Value>> {
    let namespace = approved.namespace().unwrap_or(DEFAULT_WMI_NAMESPACE);
    let query = approved.target();

    let mut data = Map::new();
    data.insert("namespace".to_string(), json!(namespace));
    data.insert("query".to_string(), json!(query));

    match wmi.query(namespace, query, MAX_WMI_RESULTS) {
        Ok(instances) if instances.is_empty() => {
            debug!("WMI query returned no instances: {}", query);
            None
        }
        Ok(instances) => {
            let count = instances.len().min(MAX_WMI_RESULTS);
            for (idx, instance) in instances.into_iter().take(MAX_WMI_RESULTS).enumerate() {
                if idx == 0 {
                    for (key, value) in instance {
                        data.entry(key).or_insert(value);
                    }
                } else {
                    data.insert(format!("result_{}", idx), Value::Object(instance));
                }
            }
            data.insert("result_count".to_string(), json!(count));
            Some(data)
        }
        Err(e) => {
            debug!("WMI query failed: {}: {:#}", query, e);
            data.insert("error".to_string(), json!(format!("{:#}", e)));
            Some(data)
        }
    }
}
