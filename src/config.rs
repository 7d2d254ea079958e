//! Server configuration document.
//!
//! The simulator optionally consumes a JSON document seeding the datastore
//! and configuring per-address response delays. Two formats coexist: legacy
//! `address -> value` maps and named `address -> {name, value}` maps; the
//! named form may overwrite a legacy entry for the same address. JSON object
//! keys are strings, so addresses are parsed out of string keys.
//!
//! Delay duration strings follow a `N(ns|us|ms|s|m)` shape; an invalid
//! string means "no delay" and never fails configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Identifies one of the four Modbus register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterType {
    #[serde(rename = "coils")]
    Coils,
    #[serde(rename = "discreteInputs")]
    DiscreteInputs,
    #[serde(rename = "holdingRegs")]
    HoldingRegs,
    #[serde(rename = "inputRegs")]
    InputRegs,
}

/// A named register with an initial value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: u16,
}

/// A named coil with an initial value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoilConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: bool,
}

/// Delay and timeout behavior for register access.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelayConfig {
    /// Base delay to apply before responding (e.g. "100ms", "1s").
    #[serde(default)]
    pub delay: String,
    /// Jitter percentage (0-100) adding random variance to the delay.
    #[serde(default)]
    pub jitter: u32,
    /// Probability (0.0-1.0) of not responding at all. Honored only on TCP;
    /// pseudo-terminals cannot express true drops.
    #[serde(default, rename = "timeoutProbability")]
    pub timeout_probability: f64,
}

/// Global defaults plus per-address delay overrides.
///
/// Lookup rule: a per-address override wins over the global entry for the
/// register type; absence means no delay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelayConfigSet {
    #[serde(default)]
    pub global: HashMap<RegisterType, DelayConfig>,
    #[serde(default, deserialize_with = "address_map")]
    pub coils: HashMap<u16, DelayConfig>,
    #[serde(default, rename = "discreteInputs", deserialize_with = "address_map")]
    pub discrete_inputs: HashMap<u16, DelayConfig>,
    #[serde(default, rename = "holdingRegs", deserialize_with = "address_map")]
    pub holding_regs: HashMap<u16, DelayConfig>,
    #[serde(default, rename = "inputRegs", deserialize_with = "address_map")]
    pub input_regs: HashMap<u16, DelayConfig>,
}

/// Initial values and delay policy for the datastore.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataStoreConfig {
    // Legacy format: address -> value
    #[serde(default, rename = "Coils", deserialize_with = "address_map")]
    pub coils: HashMap<u16, bool>,
    #[serde(default, rename = "DiscreteInputs", deserialize_with = "address_map")]
    pub discrete_inputs: HashMap<u16, bool>,
    #[serde(default, rename = "HoldingRegs", deserialize_with = "address_map")]
    pub holding_regs: HashMap<u16, u16>,
    #[serde(default, rename = "InputRegs", deserialize_with = "address_map")]
    pub input_regs: HashMap<u16, u16>,

    // Named format: address -> {name, value}
    #[serde(default, rename = "NamedCoils", deserialize_with = "address_map")]
    pub named_coils: HashMap<u16, CoilConfig>,
    #[serde(default, rename = "NamedDiscreteInputs", deserialize_with = "address_map")]
    pub named_discrete_inputs: HashMap<u16, CoilConfig>,
    #[serde(default, rename = "NamedHoldingRegs", deserialize_with = "address_map")]
    pub named_holding_regs: HashMap<u16, RegisterConfig>,
    #[serde(default, rename = "NamedInputRegs", deserialize_with = "address_map")]
    pub named_input_regs: HashMap<u16, RegisterConfig>,

    #[serde(default, rename = "delays")]
    pub delays: Option<DelayConfigSet>,
}

/// Deserialize a JSON object with stringified u16 keys.
fn address_map<'de, D, V>(deserializer: D) -> Result<HashMap<u16, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    let raw = HashMap::<String, V>::deserialize(deserializer)?;
    let mut map = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let address = key.parse::<u16>().map_err(|_| {
            serde::de::Error::custom(format!("invalid register address key: {key:?}"))
        })?;
        map.insert(address, value);
    }
    Ok(map)
}

/// Parse a `N(ns|us|ms|s|m)` duration string. Returns `None` for anything
/// unparseable, which callers treat as "no delay".
pub fn parse_delay_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // Longest suffix first so "ms" is not read as "s".
    let (number, scale_ns) = if let Some(n) = value.strip_suffix("ns") {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix("us") {
        (n, 1_000.0)
    } else if let Some(n) = value.strip_suffix("ms") {
        (n, 1_000_000.0)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000_000_000.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60.0 * 1_000_000_000.0)
    } else {
        return None;
    };

    let amount: f64 = number.trim().parse().ok()?;
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some(Duration::from_nanos((amount * scale_ns) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delay_duration() {
        assert_eq!(
            parse_delay_duration("100ms"),
            Some(Duration::from_millis(100))
        );
        assert_eq!(parse_delay_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(
            parse_delay_duration("500us"),
            Some(Duration::from_micros(500))
        );
        assert_eq!(parse_delay_duration("250ns"), Some(Duration::from_nanos(250)));
        assert_eq!(parse_delay_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(
            parse_delay_duration("1.5s"),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_parse_delay_duration_invalid_means_none() {
        assert_eq!(parse_delay_duration(""), None);
        assert_eq!(parse_delay_duration("fast"), None);
        assert_eq!(parse_delay_duration("10h"), None);
        assert_eq!(parse_delay_duration("-5ms"), None);
        assert_eq!(parse_delay_duration("ms"), None);
    }

    #[test]
    fn test_full_config_document() {
        let doc = r#"{
            "HoldingRegs": {"0": 4660, "1": 22136},
            "Coils": {"100": true},
            "NamedHoldingRegs": {
                "100": {"name": "SLOW_REG", "value": 1234}
            },
            "NamedCoils": {
                "5": {"name": "PUMP_RUNNING", "value": true}
            },
            "delays": {
                "global": {
                    "holdingRegs": {"delay": "50ms", "jitter": 20}
                },
                "holdingRegs": {
                    "200": {"timeoutProbability": 1.0}
                }
            }
        }"#;

        let config: DataStoreConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(config.holding_regs[&0], 0x1234);
        assert_eq!(config.holding_regs[&1], 0x5678);
        assert!(config.coils[&100]);
        assert_eq!(config.named_holding_regs[&100].name, "SLOW_REG");
        assert_eq!(config.named_holding_regs[&100].value, 1234);
        assert!(config.named_coils[&5].value);

        let delays = config.delays.unwrap();
        assert_eq!(delays.global[&RegisterType::HoldingRegs].delay, "50ms");
        assert_eq!(delays.global[&RegisterType::HoldingRegs].jitter, 20);
        assert_eq!(delays.holding_regs[&200].timeout_probability, 1.0);
    }

    #[test]
    fn test_bad_address_key_rejected() {
        let doc = r#"{"HoldingRegs": {"not-a-number": 1}}"#;
        assert!(serde_json::from_str::<DataStoreConfig>(doc).is_err());

        let doc = r#"{"HoldingRegs": {"70000": 1}}"#;
        assert!(serde_json::from_str::<DataStoreConfig>(doc).is_err());
    }

    #[test]
    fn test_empty_document() {
        let config: DataStoreConfig = serde_json::from_str("{}").unwrap();
        assert!(config.holding_regs.is_empty());
        assert!(config.delays.is_none());
    }
}
