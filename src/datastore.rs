//! In-memory datastore backing the server.
//!
//! Four parallel address spaces of 65 536 entries each, addressed by `u16`:
//! coils and holding registers are writable through the protocol, discrete
//! inputs and input registers only through the initial configuration. The
//! banks sit behind a single readers-writer lock; read function codes take
//! shared access, writes (including the read-modify-write of mask write)
//! take exclusive access. Register names and the delay policy are populated
//! at construction and immutable afterwards.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;
use tracing::debug;

use crate::config::{DataStoreConfig, DelayConfig, DelayConfigSet, RegisterType, parse_delay_duration};
use crate::constants::MAX_ADDRESS_SPACE;
use crate::error::{ModbusError, ModbusResult};

struct Banks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_regs: Vec<u16>,
    input_regs: Vec<u16>,
}

/// Server-side storage with name metadata and fault-injection policy.
pub struct DataStore {
    banks: RwLock<Banks>,

    // Register names for logging/debugging; construction-time only.
    coil_names: HashMap<u16, String>,
    discrete_input_names: HashMap<u16, String>,
    holding_reg_names: HashMap<u16, String>,
    input_reg_names: HashMap<u16, String>,

    delays: Option<DelayConfigSet>,
}

impl DataStore {
    /// Datastore seeded from an optional configuration document.
    pub fn new(config: Option<DataStoreConfig>) -> Self {
        let mut banks = Banks {
            coils: vec![false; MAX_ADDRESS_SPACE],
            discrete_inputs: vec![false; MAX_ADDRESS_SPACE],
            holding_regs: vec![0; MAX_ADDRESS_SPACE],
            input_regs: vec![0; MAX_ADDRESS_SPACE],
        };
        let mut coil_names = HashMap::new();
        let mut discrete_input_names = HashMap::new();
        let mut holding_reg_names = HashMap::new();
        let mut input_reg_names = HashMap::new();
        let mut delays = None;

        if let Some(config) = config {
            // Legacy format first, named entries may overwrite it.
            for (&addr, &value) in &config.coils {
                banks.coils[addr as usize] = value;
            }
            for (&addr, &value) in &config.discrete_inputs {
                banks.discrete_inputs[addr as usize] = value;
            }
            for (&addr, &value) in &config.holding_regs {
                banks.holding_regs[addr as usize] = value;
            }
            for (&addr, &value) in &config.input_regs {
                banks.input_regs[addr as usize] = value;
            }

            for (&addr, cfg) in &config.named_coils {
                banks.coils[addr as usize] = cfg.value;
                if !cfg.name.is_empty() {
                    coil_names.insert(addr, cfg.name.clone());
                }
            }
            for (&addr, cfg) in &config.named_discrete_inputs {
                banks.discrete_inputs[addr as usize] = cfg.value;
                if !cfg.name.is_empty() {
                    discrete_input_names.insert(addr, cfg.name.clone());
                }
            }
            for (&addr, cfg) in &config.named_holding_regs {
                banks.holding_regs[addr as usize] = cfg.value;
                if !cfg.name.is_empty() {
                    holding_reg_names.insert(addr, cfg.name.clone());
                }
            }
            for (&addr, cfg) in &config.named_input_regs {
                banks.input_regs[addr as usize] = cfg.value;
                if !cfg.name.is_empty() {
                    input_reg_names.insert(addr, cfg.name.clone());
                }
            }

            delays = config.delays;
        }

        Self {
            banks: RwLock::new(banks),
            coil_names,
            discrete_input_names,
            holding_reg_names,
            input_reg_names,
            delays,
        }
    }

    /// Read `quantity` coils starting at `address`.
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validate_range(address, quantity)?;
        let banks = self.banks.read().unwrap();
        let start = address as usize;
        Ok(banks.coils[start..start + quantity as usize].to_vec())
    }

    /// Read `quantity` discrete inputs starting at `address`.
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validate_range(address, quantity)?;
        let banks = self.banks.read().unwrap();
        let start = address as usize;
        Ok(banks.discrete_inputs[start..start + quantity as usize].to_vec())
    }

    /// Read `quantity` holding registers starting at `address`.
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        validate_range(address, quantity)?;
        let banks = self.banks.read().unwrap();
        let start = address as usize;
        Ok(banks.holding_regs[start..start + quantity as usize].to_vec())
    }

    /// Read `quantity` input registers starting at `address`.
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        validate_range(address, quantity)?;
        let banks = self.banks.read().unwrap();
        let start = address as usize;
        Ok(banks.input_regs[start..start + quantity as usize].to_vec())
    }

    /// Write a single coil. A single u16 address always falls inside the
    /// bank, so this cannot fail.
    pub fn write_single_coil(&self, address: u16, value: bool) {
        let mut banks = self.banks.write().unwrap();
        banks.coils[address as usize] = value;
    }

    /// Write multiple coils starting at `address`.
    pub fn write_multiple_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        validate_range(address, values.len() as u16)?;
        let mut banks = self.banks.write().unwrap();
        let start = address as usize;
        banks.coils[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Write a single holding register.
    pub fn write_single_register(&self, address: u16, value: u16) {
        let mut banks = self.banks.write().unwrap();
        banks.holding_regs[address as usize] = value;
    }

    /// Write multiple holding registers starting at `address`.
    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        validate_range(address, values.len() as u16)?;
        let mut banks = self.banks.write().unwrap();
        let start = address as usize;
        banks.holding_regs[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// AND/OR mask write on a holding register:
    /// `result = (current AND and_mask) OR (or_mask AND (NOT and_mask))`.
    ///
    /// Read-modify-write under the exclusive lock.
    pub fn mask_write_register(&self, address: u16, and_mask: u16, or_mask: u16) {
        let mut banks = self.banks.write().unwrap();
        let current = banks.holding_regs[address as usize];
        banks.holding_regs[address as usize] = (current & and_mask) | (or_mask & !and_mask);
    }

    /// Configured name of a coil, if any.
    pub fn coil_name(&self, address: u16) -> Option<&str> {
        self.coil_names.get(&address).map(String::as_str)
    }

    /// Configured name of a discrete input, if any.
    pub fn discrete_input_name(&self, address: u16) -> Option<&str> {
        self.discrete_input_names.get(&address).map(String::as_str)
    }

    /// Configured name of a holding register, if any.
    pub fn holding_reg_name(&self, address: u16) -> Option<&str> {
        self.holding_reg_names.get(&address).map(String::as_str)
    }

    /// Configured name of an input register, if any.
    pub fn input_reg_name(&self, address: u16) -> Option<&str> {
        self.input_reg_names.get(&address).map(String::as_str)
    }

    /// Applicable delay policy for a register type and address: the
    /// per-address override wins, then the global entry, then none.
    pub fn delay_config(&self, reg_type: RegisterType, address: u16) -> Option<&DelayConfig> {
        let delays = self.delays.as_ref()?;

        let per_address = match reg_type {
            RegisterType::Coils => delays.coils.get(&address),
            RegisterType::DiscreteInputs => delays.discrete_inputs.get(&address),
            RegisterType::HoldingRegs => delays.holding_regs.get(&address),
            RegisterType::InputRegs => delays.input_regs.get(&address),
        };
        per_address.or_else(|| delays.global.get(&reg_type))
    }

    /// Apply the configured delay and timeout policy before responding.
    ///
    /// Returns `false` when the request should be dropped without a response
    /// (timeout injection). With `allow_timeout` false the probability is
    /// ignored, which is how the serial servers run: pseudo-terminals cannot
    /// express true drops.
    pub async fn apply_delay(
        &self,
        reg_type: RegisterType,
        address: u16,
        allow_timeout: bool,
    ) -> bool {
        let Some(cfg) = self.delay_config(reg_type, address) else {
            return true;
        };

        if allow_timeout && cfg.timeout_probability > 0.0 {
            if rand::thread_rng().gen::<f64>() < cfg.timeout_probability {
                debug!("timeout injection triggered for {reg_type:?} address {address}");
                return false;
            }
        }

        if let Some(base) = parse_delay_duration(&cfg.delay) {
            let mut delay = base;
            if cfg.jitter > 0 && cfg.jitter <= 100 {
                let jitter_range = base.as_secs_f64() * (cfg.jitter as f64 / 100.0);
                let jitter = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter_range;
                let total = base.as_secs_f64() + jitter;
                // Clamp so jitter never produces a negative delay.
                delay = std::time::Duration::from_secs_f64(total.max(0.0));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        true
    }
}

/// Check that `address + quantity` stays within the 65 536-entry bank and
/// that the range is non-empty.
fn validate_range(address: u16, quantity: u16) -> ModbusResult<()> {
    if quantity == 0 {
        return Err(ModbusError::invalid_data("quantity must be greater than 0"));
    }
    if u32::from(address) + u32::from(quantity) > MAX_ADDRESS_SPACE as u32 {
        return Err(ModbusError::invalid_data(format!(
            "address range {}-{} exceeds maximum",
            address,
            u32::from(address) + u32::from(quantity) - 1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config_from_json(doc: &str) -> DataStoreConfig {
        serde_json::from_str(doc).unwrap()
    }

    #[test]
    fn test_read_write_roundtrip() {
        let ds = DataStore::new(None);

        ds.write_single_coil(10, true);
        assert_eq!(ds.read_coils(10, 1).unwrap(), vec![true]);

        ds.write_multiple_coils(20, &[true, false, true]).unwrap();
        assert_eq!(ds.read_coils(20, 3).unwrap(), vec![true, false, true]);

        ds.write_single_register(5, 0xABCD);
        assert_eq!(ds.read_holding_registers(5, 1).unwrap(), vec![0xABCD]);

        ds.write_multiple_registers(100, &[0x1111, 0x2222, 0x3333])
            .unwrap();
        assert_eq!(
            ds.read_holding_registers(100, 3).unwrap(),
            vec![0x1111, 0x2222, 0x3333]
        );
    }

    #[test]
    fn test_range_validation() {
        let ds = DataStore::new(None);

        assert!(matches!(
            ds.read_coils(0, 0),
            Err(ModbusError::InvalidData { .. })
        ));
        // 65535 + 2 > 65536
        assert!(ds.read_holding_registers(65_535, 2).is_err());
        // The last address is still readable.
        assert!(ds.read_holding_registers(65_535, 1).is_ok());
        assert!(ds.write_multiple_registers(65_535, &[1, 2]).is_err());
    }

    #[test]
    fn test_mask_write_register() {
        let ds = DataStore::new(None);
        ds.write_single_register(4, 0x0012);
        // (0x12 AND 0xF2) OR (0x25 AND NOT 0xF2) = 0x12 | 0x05 = 0x17
        ds.mask_write_register(4, 0x00F2, 0x0025);
        assert_eq!(ds.read_holding_registers(4, 1).unwrap(), vec![0x0017]);
    }

    #[test]
    fn test_config_seeding_and_names() {
        let config = config_from_json(
            r#"{
                "HoldingRegs": {"0": 4660},
                "NamedHoldingRegs": {"0": {"name": "OVERRIDDEN", "value": 100}},
                "NamedCoils": {"7": {"name": "PUMP", "value": true}},
                "NamedInputRegs": {"3": {"name": "TEMP", "value": 77}}
            }"#,
        );
        let ds = DataStore::new(Some(config));

        // Named entry overwrites the legacy value for the same address.
        assert_eq!(ds.read_holding_registers(0, 1).unwrap(), vec![100]);
        assert_eq!(ds.holding_reg_name(0), Some("OVERRIDDEN"));
        assert_eq!(ds.read_coils(7, 1).unwrap(), vec![true]);
        assert_eq!(ds.coil_name(7), Some("PUMP"));
        assert_eq!(ds.read_input_registers(3, 1).unwrap(), vec![77]);
        assert_eq!(ds.input_reg_name(3), Some("TEMP"));
        assert_eq!(ds.holding_reg_name(42), None);
    }

    #[test]
    fn test_delay_lookup_precedence() {
        let config = config_from_json(
            r#"{
                "delays": {
                    "global": {"holdingRegs": {"delay": "10ms"}},
                    "holdingRegs": {"100": {"delay": "50ms"}}
                }
            }"#,
        );
        let ds = DataStore::new(Some(config));

        // Per-address override wins.
        assert_eq!(
            ds.delay_config(RegisterType::HoldingRegs, 100).unwrap().delay,
            "50ms"
        );
        // Other addresses fall back to the global entry.
        assert_eq!(
            ds.delay_config(RegisterType::HoldingRegs, 0).unwrap().delay,
            "10ms"
        );
        // Other register types have no policy.
        assert!(ds.delay_config(RegisterType::Coils, 100).is_none());
    }

    #[tokio::test]
    async fn test_apply_delay_no_config_proceeds() {
        let ds = DataStore::new(None);
        assert!(ds.apply_delay(RegisterType::HoldingRegs, 100, true).await);
    }

    #[tokio::test]
    async fn test_apply_delay_fixed_delay() {
        let config = config_from_json(
            r#"{"delays": {"holdingRegs": {"100": {"delay": "50ms"}}}}"#,
        );
        let ds = DataStore::new(Some(config));

        let start = Instant::now();
        assert!(ds.apply_delay(RegisterType::HoldingRegs, 100, true).await);
        assert!(start.elapsed() >= std::time::Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_apply_delay_invalid_duration_means_no_delay() {
        let config = config_from_json(
            r#"{"delays": {"holdingRegs": {"100": {"delay": "not-a-duration"}}}}"#,
        );
        let ds = DataStore::new(Some(config));

        let start = Instant::now();
        assert!(ds.apply_delay(RegisterType::HoldingRegs, 100, true).await);
        assert!(start.elapsed() < std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_apply_delay_certain_timeout() {
        let config = config_from_json(
            r#"{"delays": {"holdingRegs": {"200": {"timeoutProbability": 1.0}}}}"#,
        );
        let ds = DataStore::new(Some(config));

        for _ in 0..10 {
            assert!(!ds.apply_delay(RegisterType::HoldingRegs, 200, true).await);
        }
        // Timeout injection suppressed on serial paths.
        assert!(ds.apply_delay(RegisterType::HoldingRegs, 200, false).await);
    }

    #[tokio::test]
    async fn test_apply_delay_zero_probability_never_times_out() {
        let config = config_from_json(
            r#"{"delays": {"holdingRegs": {"200": {"timeoutProbability": 0.0}}}}"#,
        );
        let ds = DataStore::new(Some(config));

        for _ in 0..10 {
            assert!(ds.apply_delay(RegisterType::HoldingRegs, 200, true).await);
        }
    }

    #[tokio::test]
    async fn test_apply_delay_jitter_stays_positive() {
        let config = config_from_json(
            r#"{"delays": {"holdingRegs": {"100": {"delay": "10ms", "jitter": 100}}}}"#,
        );
        let ds = DataStore::new(Some(config));

        for _ in 0..5 {
            let start = Instant::now();
            assert!(ds.apply_delay(RegisterType::HoldingRegs, 100, true).await);
            // Jitter of ±100% keeps the delay within [0, 20ms] plus
            // scheduling slack.
            assert!(start.elapsed() < std::time::Duration::from_millis(100));
        }
    }
}
