use std::io;

use anyhow::{anyhow, Context, Result};
use log::debug;
use winreg::enums::{
    RegType, HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
    HKEY_USERS, KEY_READ,
};
use winreg::types::FromRegValue;
use winreg::RegKey;

use crate::windows::{ConfigStore, RegValue};

/// Registry access through `winreg`, read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinRegistry;

/// Open `HIVE\Sub\Key` for reading. `Ok(None)` when the key does not exist.
fn open_key(path: &str) -> Result<Option<RegKey>> {
    let (hive, sub) = match path.split_once('\\') {
        Some((hive, sub)) => (hive, sub),
        None => (path, ""),
    };

    let root = match hive {
        "HKLM" => RegKey::predef(HKEY_LOCAL_MACHINE),
        "HKCU" => RegKey::predef(HKEY_CURRENT_USER),
        "HKCR" => RegKey::predef(HKEY_CLASSES_ROOT),
        "HKU" => RegKey::predef(HKEY_USERS),
        "HKCC" => RegKey::predef(HKEY_CURRENT_CONFIG),
        other => return Err(anyhow!("Unsupported registry hive: {}", other)),
    };

    if sub.is_empty() {
        return Ok(Some(root));
    }

    match root.open_subkey_with_flags(sub, KEY_READ) {
        Ok(key) => Ok(Some(key)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(format!("Failed to open registry key {}", path)),
    }
}

fn convert(raw: &winreg::RegValue) -> RegValue {
    let converted = match raw.vtype {
        RegType::REG_SZ | RegType::REG_EXPAND_SZ => String::from_reg_value(raw).ok().map(RegValue::String),
        RegType::REG_MULTI_SZ => Vec::<String>::from_reg_value(raw).ok().map(RegValue::MultiString),
        RegType::REG_DWORD => u32::from_reg_value(raw).ok().map(RegValue::Dword),
        RegType::REG_QWORD => u64::from_reg_value(raw).ok().map(RegValue::Qword),
        _ => None,
    };
    converted.unwrap_or_else(|| RegValue::Binary(raw.bytes.clone()))
}

impl ConfigStore for WinRegistry {
    fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(open_key(key)?.is_some())
    }

    fn read_value(&self, key: &str, name: &str) -> Result<Option<RegValue>> {
        let Some(handle) = open_key(key)? else {
            return Ok(None);
        };

        match handle.get_raw_value(name) {
            Ok(raw) => Ok(Some(convert(&raw))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read {}\\{}", key, name)),
        }
    }

    fn values(&self, key: &str, limit: usize) -> Result<Vec<(String, RegValue)>> {
        let Some(handle) = open_key(key)? else {
            return Ok(Vec::new());
        };

        let mut values = Vec::new();
        for entry in handle.enum_values().take(limit) {
            match entry {
                Ok((name, raw)) => values.push((name, convert(&raw))),
                Err(e) => debug!("Skipping unreadable value under {}: {}", key, e),
            }
        }
        Ok(values)
    }

    fn subkeys(&self, key: &str) -> Result<Vec<String>> {
        let Some(handle) = open_key(key)? else {
            return Ok(Vec::new());
        };

        Ok(handle.enum_keys().filter_map(|k| k.ok()).collect())
    }
}
