//! Runtime configuration from `STOKER_*` environment variables.

use anyhow::{bail, Context};
use std::env;

use crate::asic::ChipFamily;

/// Default ticket-mask difficulty until the pool says otherwise.
const DEFAULT_DIFFICULTY: u64 = 512;
/// Standard version-rolling mask (BIP 320 bits).
const DEFAULT_VERSION_MASK: u32 = 0x1fff_e000;

#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Chip family on the chain (`STOKER_CHIP`, required).
    pub family: ChipFamily,
    /// Target hash clock after the ramp (`STOKER_FREQUENCY`, MHz).
    pub frequency_mhz: f32,
    /// Chips expected on the chain (`STOKER_CHIP_COUNT`).
    pub chip_count: u8,
    /// Hash domains per chip (`STOKER_DOMAINS`).
    pub domains: u8,
    /// Serial device of the chain (`STOKER_SERIAL`).
    pub serial_device: String,
    /// Pool endpoint, `host:port` (`STOKER_POOL`).
    pub pool_addr: String,
    /// Worker name sent with every share (`STOKER_POOL_USER`).
    pub pool_user: String,
    /// Session extranonce1 from the pool handshake (`STOKER_EXTRANONCE1`, hex).
    pub extranonce1: Vec<u8>,
    /// Extranonce2 width in bytes (`STOKER_EXTRANONCE2_LEN`).
    pub extranonce2_len: usize,
    /// Initial pool difficulty (`STOKER_DIFFICULTY`).
    pub difficulty: u64,
    /// Version-rolling mask (`STOKER_VERSION_MASK`, hex).
    pub version_mask: u32,
}

impl MinerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let family: ChipFamily = var("STOKER_CHIP")
            .context("STOKER_CHIP must name the chip family (bm1368 or bm1370)")?
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let frequency_mhz = parse_or(&var, "STOKER_FREQUENCY", 525.0)?;
        let chip_count: u8 = parse_or(&var, "STOKER_CHIP_COUNT", 1)?;
        if chip_count == 0 {
            bail!("STOKER_CHIP_COUNT must be at least 1");
        }
        let domains: u8 = parse_or(&var, "STOKER_DOMAINS", 1)?;

        let extranonce1 = match var("STOKER_EXTRANONCE1") {
            Some(s) => hex::decode(&s).context("STOKER_EXTRANONCE1 is not valid hex")?,
            None => Vec::new(),
        };
        let version_mask = match var("STOKER_VERSION_MASK") {
            Some(s) => u32::from_str_radix(s.trim_start_matches("0x"), 16)
                .context("STOKER_VERSION_MASK is not valid hex")?,
            None => DEFAULT_VERSION_MASK,
        };

        Ok(Self {
            family,
            frequency_mhz,
            chip_count,
            domains,
            serial_device: var("STOKER_SERIAL").unwrap_or_else(|| "/dev/ttyS1".into()),
            pool_addr: var("STOKER_POOL").unwrap_or_else(|| "127.0.0.1:3333".into()),
            pool_user: var("STOKER_POOL_USER").unwrap_or_else(|| "stoker.worker".into()),
            extranonce1,
            extranonce2_len: parse_or(&var, "STOKER_EXTRANONCE2_LEN", 4)?,
            difficulty: parse_or(&var, "STOKER_DIFFICULTY", DEFAULT_DIFFICULTY)?,
            version_mask,
        })
    }
}

fn parse_or<T>(
    var: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(s) => s.parse().with_context(|| format!("{name}={s} is invalid")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn chip_family_is_required() {
        assert!(MinerConfig::from_vars(vars(&[])).is_err());
    }

    #[test]
    fn defaults_apply() {
        let config = MinerConfig::from_vars(vars(&[("STOKER_CHIP", "bm1370")])).unwrap();
        assert_eq!(config.family, ChipFamily::Bm1370);
        assert_eq!(config.chip_count, 1);
        assert_eq!(config.extranonce2_len, 4);
        assert_eq!(config.difficulty, 512);
        assert_eq!(config.version_mask, 0x1fff_e000);
        assert!(config.extranonce1.is_empty());
    }

    #[test]
    fn explicit_values_parse() {
        let config = MinerConfig::from_vars(vars(&[
            ("STOKER_CHIP", "bm1368"),
            ("STOKER_FREQUENCY", "490"),
            ("STOKER_CHIP_COUNT", "11"),
            ("STOKER_DOMAINS", "4"),
            ("STOKER_EXTRANONCE1", "deadbeef"),
            ("STOKER_VERSION_MASK", "0x1fffe000"),
            ("STOKER_DIFFICULTY", "2048"),
        ]))
        .unwrap();
        assert_eq!(config.family, ChipFamily::Bm1368);
        assert_eq!(config.frequency_mhz, 490.0);
        assert_eq!(config.chip_count, 11);
        assert_eq!(config.domains, 4);
        assert_eq!(config.extranonce1, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(config.difficulty, 2048);
    }

    #[test]
    fn unknown_family_is_rejected() {
        assert!(MinerConfig::from_vars(vars(&[("STOKER_CHIP", "bm1399")])).is_err());
    }

    #[test]
    fn zero_chip_count_is_rejected() {
        assert!(MinerConfig::from_vars(vars(&[
            ("STOKER_CHIP", "bm1370"),
            ("STOKER_CHIP_COUNT", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn bad_hex_extranonce1_is_rejected() {
        assert!(MinerConfig::from_vars(vars(&[
            ("STOKER_CHIP", "bm1370"),
            ("STOKER_EXTRANONCE1", "zz"),
        ]))
        .is_err());
    }
}
