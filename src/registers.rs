//! Register map: the JSON description of named Modbus holding registers.

use crate::error::{EdgeError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Primitive wire type of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Int16,
    Uint16,
    Int32,
    Uint32,
}

impl RegisterType {
    /// Whether this type can be the target of a single-register write.
    pub fn is_writable_word(self) -> bool {
        matches!(self, RegisterType::Int16 | RegisterType::Uint16)
    }
}

/// A single named register entry as it appears in the register map file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDef {
    pub name: String,
    pub address: u16,
    #[serde(rename = "type")]
    pub reg_type: RegisterType,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterMapFile {
    read_registers: Vec<RegisterDef>,
    write_registers: Vec<RegisterDef>,
}

/// Flattened, name-indexed register map used by the field-bus adapter.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    pub read_registers: Vec<RegisterDef>,
    pub write_registers: Vec<RegisterDef>,
    by_name: HashMap<String, RegisterDef>,
}

impl RegisterMap {
    /// Load a register map from a JSON file on disk.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EdgeError::config(format!("failed to read register map {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json(&contents)
    }

    /// Parse a register map from a JSON string.
    pub fn from_json(contents: &str) -> Result<Self> {
        let file: RegisterMapFile = serde_json::from_str(contents)
            .map_err(|e| EdgeError::config(format!("invalid register map JSON: {e}")))?;
        Ok(Self::from_parts(file.read_registers, file.write_registers))
    }

    fn from_parts(read_registers: Vec<RegisterDef>, write_registers: Vec<RegisterDef>) -> Self {
        let mut by_name = HashMap::new();
        for reg in read_registers.iter().chain(write_registers.iter()) {
            by_name.insert(reg.name.clone(), reg.clone());
        }
        Self {
            read_registers,
            write_registers,
            by_name,
        }
    }

    /// Look up a register definition by name.
    pub fn get(&self, name: &str) -> Option<&RegisterDef> {
        self.by_name.get(name)
    }

    /// Heuristic identifying PV-related registers by name, so they can be
    /// skipped from bulk reads when PV is disabled for a unit.
    pub fn is_pv_register(name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        name.starts_with("pv") || name.starts_with("mppt_power_") || name == "ct2_active_power"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "read_registers": [
                {"name": "battery_soc", "address": 100, "type": "uint16", "signed": false},
                {"name": "pv1_power", "address": 101, "type": "int16", "signed": true},
                {"name": "ct2_active_power", "address": 102, "type": "int16", "signed": true}
            ],
            "write_registers": [
                {"name": "ems_power_set", "address": 200, "type": "int16", "signed": true},
                {"name": "ems_power_mode", "address": 201, "type": "uint16", "signed": false}
            ]
        }"#
    }

    #[test]
    fn test_parse_register_map() {
        let map = RegisterMap::from_json(sample_json()).unwrap();
        assert_eq!(map.read_registers.len(), 3);
        assert_eq!(map.write_registers.len(), 2);
        assert_eq!(map.get("battery_soc").unwrap().address, 100);
    }

    #[test]
    fn test_pv_register_heuristic() {
        assert!(RegisterMap::is_pv_register("pv1_power"));
        assert!(RegisterMap::is_pv_register("mppt_power_3"));
        assert!(RegisterMap::is_pv_register("ct2_active_power"));
        assert!(!RegisterMap::is_pv_register("battery_soc"));
        assert!(!RegisterMap::is_pv_register(""));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = RegisterMap::from_json("not json").unwrap_err();
        assert!(matches!(err, EdgeError::Config { .. }));
    }
}
