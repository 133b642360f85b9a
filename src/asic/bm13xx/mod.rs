//! Chain driver for BM1368/BM1370 chips.
//!
//! Owns both directions of the serial link during bring-up (enumeration
//! needs to read chip-id replies), then hands the read half off so mining
//! runs with one writer and one reader.

use async_trait::async_trait;
use futures::SinkExt;
use std::time::Duration;
use tokio_util::codec::FramedWrite;

use super::frame::{Command, CommandCodec, JobFrame, TaskResult};
use super::{frame, mask, ChainLink, ChipFamily, ChipOps, DriverError, ResultReader};
use crate::tracing::prelude::*;
use crate::work::Job;

/// Chip identity register, read broadcast during enumeration.
const REG_CHIP_ID: u8 = 0x00;
/// Hash clock PLL divider register.
const REG_PLL0: u8 = 0x08;
/// UART baud divider register.
const REG_UART_BAUD: u8 = 0x28;
/// Version-rolling mask register.
const REG_VERSION_MASK: u8 = 0xa4;

/// Power-on baud divider and the line rate it corresponds to.
const BAUD_DEFAULT: u32 = 0x0000_0271;
const BAUD_DEFAULT_RATE: u32 = 115_200;
/// Maximum baud divider, observed on production chains, and its line rate.
const BAUD_MAX: u32 = 0x0000_3001;
const BAUD_MAX_RATE: u32 = 1_000_000;

/// Control half of the version-mask register value; enables rolling.
const VERSION_ROLL_ENABLE: u16 = 0x0090;

/// Quiet period that ends chip-id reply collection.
const ENUM_REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause after chain-wide commands during bring-up.
const ENUM_SETTLE: Duration = Duration::from_millis(50);

impl ChipFamily {
    fn chip_id(self) -> [u8; 2] {
        match self {
            Self::Bm1368 => [0x13, 0x68],
            Self::Bm1370 => [0x13, 0x70],
            Self::Bm1397 => [0x13, 0x97],
        }
    }
}

/// PLL divider configuration for one hash clock frequency.
///
/// Actual frequency is `25 MHz * fb_div / (ref_div * post_div1 * post_div2)`
/// with the post dividers packed as nibbles in `post_div`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllConfig {
    pub fb_div: u16,
    pub ref_div: u8,
    pub post_div: u8,
}

impl PllConfig {
    const CRYSTAL_MHZ: f32 = 25.0;
    pub const MIN_MHZ: f32 = 50.0;
    pub const MAX_MHZ: f32 = 800.0;

    /// Search the divider space for the closest achievable frequency.
    ///
    /// Feedback divider is constrained to 160..=239, reference divider to
    /// 1 or 2, post dividers to 1..=7 with the first no smaller than the
    /// second. Returns `None` when no combination lands within 1 MHz.
    pub fn for_frequency(mhz: f32) -> Option<Self> {
        if !(Self::MIN_MHZ..=Self::MAX_MHZ).contains(&mhz) {
            return None;
        }

        let mut best: Option<(f32, Self)> = None;
        for ref_div in [2u8, 1] {
            for post_div1 in (1u8..=7).rev() {
                for post_div2 in (1u8..=post_div1).rev() {
                    let denom = (ref_div as f32) * (post_div1 as f32) * (post_div2 as f32);
                    let fb_div = (mhz * denom / Self::CRYSTAL_MHZ).round();
                    if !(160.0..=239.0).contains(&fb_div) {
                        continue;
                    }
                    let actual = Self::CRYSTAL_MHZ * fb_div / denom;
                    let error = (mhz - actual).abs();
                    if error < 1.0 && best.map_or(true, |(e, _)| error < e) {
                        best = Some((
                            error,
                            Self {
                                fb_div: fb_div as u16,
                                ref_div,
                                post_div: ((post_div1 - 1) << 4) | (post_div2 - 1),
                            },
                        ));
                    }
                }
            }
        }
        best.map(|(_, config)| config)
    }

    pub fn actual_mhz(self) -> f32 {
        let post_div1 = ((self.post_div >> 4) + 1) as f32;
        let post_div2 = ((self.post_div & 0x0f) + 1) as f32;
        Self::CRYSTAL_MHZ * self.fb_div as f32 / (self.ref_div as f32 * post_div1 * post_div2)
    }

    fn to_register(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.fb_div.to_le_bytes());
        bytes[2] = self.ref_div;
        bytes[3] = self.post_div;
        bytes
    }
}

/// A bound chain, command side plus (until detached) result side.
pub struct Bm13xxChain {
    family: ChipFamily,
    tx: FramedWrite<Box<dyn tokio::io::AsyncWrite + Send + Unpin>, CommandCodec>,
    rx: Option<ResultReader>,
}

impl Bm13xxChain {
    pub(crate) fn new(family: ChipFamily, link: ChainLink) -> Self {
        Self {
            family,
            tx: FramedWrite::new(link.tx, CommandCodec),
            rx: Some(ResultReader::new(link.rx)),
        }
    }

    /// Move the result reader out for the result pipeline. Yields `None`
    /// the second time.
    pub fn take_results(&mut self) -> Option<ResultReader> {
        self.rx.take()
    }

    async fn send(&mut self, command: Command) -> Result<(), DriverError> {
        self.tx.send(command).await?;
        Ok(())
    }

    async fn write_all_chips(&mut self, register: u8, data: [u8; 4]) -> Result<(), DriverError> {
        self.send(Command::WriteRegister {
            all: true,
            chip: 0,
            register,
            data,
        })
        .await
    }

    /// Count chips answering a broadcast chip-id read. Collection ends at
    /// the first quiet period.
    async fn enumerate(&mut self) -> Result<u8, DriverError> {
        self.send(Command::ReadRegister {
            all: true,
            chip: 0,
            register: REG_CHIP_ID,
        })
        .await?;

        let expected_id = self.family.chip_id();
        let rx = self.rx.as_mut().ok_or_else(already_split)?;
        let mut count: u8 = 0;
        loop {
            match tokio::time::timeout(ENUM_REPLY_TIMEOUT, rx.receive()).await {
                Ok(Some(TaskResult::RegisterReply { value, .. })) => {
                    let id = value.to_le_bytes();
                    if id[0..2] != expected_id {
                        warn!(
                            reply = format!("{:02x}{:02x}", id[0], id[1]),
                            "chip id does not match configured family"
                        );
                    }
                    count = count.saturating_add(1);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(count)
    }
}

fn already_split() -> DriverError {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "result reader already detached",
    )
    .into()
}

#[async_trait]
impl ChipOps for Bm13xxChain {
    async fn init(&mut self, frequency_mhz: f32, expected_chips: u8) -> Result<u8, DriverError> {
        let detected = self.enumerate().await?;
        if detected == 0 {
            return Err(DriverError::NoChipsDetected);
        }
        if detected != expected_chips {
            warn!(detected, expected_chips, "chain length mismatch");
        }
        info!(detected, family = ?self.family, "chain enumerated");

        // Spread addresses evenly over the nonce space so the top nonce
        // byte identifies the originating chip.
        self.send(Command::ChainInactive).await?;
        tokio::time::sleep(ENUM_SETTLE).await;
        let interval = (256 / detected as u16) as u8;
        for chip in 0..detected {
            self.send(Command::SetChipAddress {
                address: chip.wrapping_mul(interval),
            })
            .await?;
        }
        tokio::time::sleep(ENUM_SETTLE).await;

        self.set_frequency(frequency_mhz).await?;

        if let Some(rx) = self.rx.as_mut() {
            rx.set_chip_count(detected);
        }
        Ok(detected)
    }

    async fn set_frequency(&mut self, mhz: f32) -> Result<(), DriverError> {
        let pll = PllConfig::for_frequency(mhz).ok_or(DriverError::InvalidFrequency { mhz })?;
        debug!(
            mhz,
            actual = pll.actual_mhz(),
            fb = pll.fb_div,
            "programming hash clock"
        );
        self.write_all_chips(REG_PLL0, pll.to_register()).await
    }

    async fn set_version_mask(&mut self, mask: u32) -> Result<(), DriverError> {
        // Register takes the rollable header bits 16..32 plus an enable
        // control half, both little-endian.
        let rolled_bits = (mask >> 16) as u16;
        let mut data = [0u8; 4];
        data[0..2].copy_from_slice(&VERSION_ROLL_ENABLE.to_le_bytes());
        data[2..4].copy_from_slice(&rolled_bits.to_le_bytes());
        self.write_all_chips(REG_VERSION_MASK, data).await
    }

    async fn set_job_difficulty_mask(&mut self, difficulty: u32) -> Result<(), DriverError> {
        let encoded = mask::difficulty_mask(difficulty);
        debug!(difficulty, "writing ticket mask");
        self.send(Command::WriteRegister {
            all: true,
            chip: encoded[0],
            register: encoded[1],
            data: [encoded[2], encoded[3], encoded[4], encoded[5]],
        })
        .await
    }

    async fn set_default_baud(&mut self) -> Result<u32, DriverError> {
        self.write_all_chips(REG_UART_BAUD, BAUD_DEFAULT.to_le_bytes())
            .await?;
        Ok(BAUD_DEFAULT_RATE)
    }

    async fn set_max_baud(&mut self) -> Result<u32, DriverError> {
        // The chips switch as soon as the divider lands; the caller must
        // follow with the returned rate on its side of the link.
        self.write_all_chips(REG_UART_BAUD, BAUD_MAX.to_le_bytes())
            .await?;
        Ok(BAUD_MAX_RATE)
    }

    async fn send_job(&mut self, job: &Job, job_id: u8) -> Result<(), DriverError> {
        trace!(job_id, pool_job = %job.pool_job_id, "sending job to chain");
        self.send(Command::Job(JobFrame::from_job(job, job_id))).await
    }

    async fn read_hash_registers(&mut self, domains: u8) -> Result<(), DriverError> {
        let mut registers = vec![frame::REG_HASHRATE, frame::REG_NONCE_TOTAL_CNT];
        for domain in 0..domains.min(frame::MAX_DOMAINS) {
            registers.push(frame::REG_DOMAIN_CNT_BASE + 4 * domain);
        }
        registers.push(frame::REG_NONCE_ERR_CNT);

        for register in registers {
            self.send(Command::ReadRegister {
                all: true,
                chip: 0,
                register,
            })
            .await?;
        }
        Ok(())
    }
}
