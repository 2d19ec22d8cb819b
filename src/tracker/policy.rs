use anyhow::{Context, Result};
use log::debug;

use crate::windows::ConfigStore;

/// Group Policy location of the Hello for Business switch
pub const GPO_POLICY_KEY: &str = "HKLM\\SOFTWARE\\Policies\\Microsoft\\PassportForWork";
const GPO_POLICY_VALUE: &str = "Enabled";

/// MDM location; one subkey per tenant
pub const MDM_POLICY_ROOT: &str = "HKLM\\SOFTWARE\\Microsoft\\Policies\\PassportForWork";
const MDM_POLICY_SUBPATH: &str = "Device\\Policies";
const MDM_POLICY_VALUE: &str = "UsePassportForWork";

/// A configured Hello for Business policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPolicy {
    pub enabled: bool,
    /// `gpo` or `mdm:<tenant>`
    pub source: String,
}

/// Look for a Hello policy. `None` means nothing is configured (yet).
pub fn check_hello_policy(store: &dyn ConfigStore) -> Result<Option<HelloPolicy>> {
    if let Some(value) = store
        .read_value(GPO_POLICY_KEY, GPO_POLICY_VALUE)
        .context("Failed to read Hello group policy")?
    {
        if let Some(flag) = value.as_u64() {
            return Ok(Some(HelloPolicy { enabled: flag != 0, source: "gpo".to_string() }));
        }
    }

    if !store.key_exists(MDM_POLICY_ROOT).context("Failed to open Hello MDM policy root")? {
        return Ok(None);
    }

    for tenant in store.subkeys(MDM_POLICY_ROOT)? {
        let key = format!("{}\\{}\\{}", MDM_POLICY_ROOT, tenant, MDM_POLICY_SUBPATH);
        match store.read_value(&key, MDM_POLICY_VALUE) {
            Ok(Some(value)) => {
                if let Some(flag) = value.as_u64() {
                    return Ok(Some(HelloPolicy { enabled: flag != 0, source: format!("mdm:{}", tenant) }));
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Failed to read Hello policy for tenant {}: {:#}", tenant, e),
        }
    }

    Ok(None)
}
