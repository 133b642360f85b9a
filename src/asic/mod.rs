//! Drivers for BM13xx hash chip chains.
//!
//! The chain hangs off one serial link: commands go down, nonce and
//! register-reply frames come back. A bound chain splits into a
//! [`ChipOps`] handle (the only writer) and a [`ResultReader`] (the only
//! reader), so job dispatch and result collection never contend.

pub mod bm13xx;
pub mod crc;
pub mod frame;
pub mod mask;

use async_trait::async_trait;
use futures::StreamExt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;

use crate::tracing::prelude::*;
use crate::work::Job;
use frame::{ResultCodec, TaskResult};

pub use bm13xx::Bm13xxChain;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unsupported chip family: {family}")]
    UnsupportedFamily { family: String },

    #[error("unrecognized chip family name: {name}")]
    UnknownFamily { name: String },

    #[error("no chips detected on the chain")]
    NoChipsDetected,

    #[error("frequency {mhz} MHz outside supported range")]
    InvalidFrequency { mhz: f32 },

    #[error("chain I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// The serial link a chain is bound over. The library never opens devices
/// itself; the caller hands in whatever read/write halves it has.
pub struct ChainLink {
    pub tx: Box<dyn AsyncWrite + Send + Unpin>,
    pub rx: Box<dyn AsyncRead + Send + Unpin>,
}

/// Supported BM13xx family members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    Bm1368,
    Bm1370,
    /// Recognized so config errors read well, but not driven by this crate.
    Bm1397,
}

impl FromStr for ChipFamily {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bm1368" => Ok(Self::Bm1368),
            "bm1370" => Ok(Self::Bm1370),
            "bm1397" => Ok(Self::Bm1397),
            _ => Err(DriverError::UnknownFamily { name: s.into() }),
        }
    }
}

impl ChipFamily {
    /// Bind a chain of this family over the given link.
    ///
    /// Binding an unsupported family is a hard error; there is no degraded
    /// mode for a chip we cannot drive.
    pub fn bind(self, link: ChainLink) -> Result<Bm13xxChain, DriverError> {
        match self {
            Self::Bm1368 | Self::Bm1370 => Ok(Bm13xxChain::new(self, link)),
            Self::Bm1397 => Err(DriverError::UnsupportedFamily {
                family: format!("{self:?}"),
            }),
        }
    }
}

/// Command-side operations on a bound chain.
///
/// All methods run on the single TX owner; the dispatch task is the only
/// caller once mining starts.
#[async_trait]
pub trait ChipOps: Send {
    /// Enumerate and address the chain, then apply baseline configuration
    /// at `frequency_mhz`. Returns the number of chips detected; zero chips
    /// is an error.
    async fn init(&mut self, frequency_mhz: f32, expected_chips: u8) -> Result<u8, DriverError>;

    /// Program the hash clock PLL on every chip.
    async fn set_frequency(&mut self, mhz: f32) -> Result<(), DriverError>;

    /// Configure the rolled version-bit window (header bits 16..32).
    async fn set_version_mask(&mut self, mask: u32) -> Result<(), DriverError>;

    /// Write the ticket mask so chips only report nonces at or above the
    /// pool difficulty (collapsed to a power of two).
    async fn set_job_difficulty_mask(&mut self, difficulty: u32) -> Result<(), DriverError>;

    /// Drop the chain back to its power-on baud rate. Returns the line
    /// rate the host side of the link must be reconfigured to.
    async fn set_default_baud(&mut self) -> Result<u32, DriverError>;

    /// Raise the chain to its maximum baud rate for mining. Returns the
    /// line rate the host side of the link must be reconfigured to.
    async fn set_max_baud(&mut self) -> Result<u32, DriverError>;

    /// Transmit a job under a chip-local id.
    async fn send_job(&mut self, job: &Job, job_id: u8) -> Result<(), DriverError>;

    /// Broadcast reads of the hashrate, nonce-counter and error-counter
    /// registers. Replies arrive asynchronously on the result side.
    async fn read_hash_registers(&mut self, domains: u8) -> Result<(), DriverError>;
}

/// Read side of a bound chain. Yields one [`TaskResult`] per well-formed
/// frame; malformed bytes are skipped and counted, never surfaced.
pub struct ResultReader {
    framed: FramedRead<Box<dyn AsyncRead + Send + Unpin>, ResultCodec>,
}

impl ResultReader {
    pub(crate) fn new(rx: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            framed: FramedRead::new(rx, ResultCodec::default()),
        }
    }

    /// Must be called once the chain length is known so nonce frames and
    /// register replies can be attributed to a chip index.
    pub fn set_chip_count(&mut self, chips: u8) {
        self.framed.decoder_mut().set_chip_count(chips);
    }

    /// Frames discarded so far for CRC or framing reasons.
    pub fn dropped_frames(&self) -> u64 {
        self.framed.decoder().dropped()
    }

    /// Wait for the next result frame. `None` means the link is gone and no
    /// further results will ever arrive.
    pub async fn receive(&mut self) -> Option<TaskResult> {
        match self.framed.next().await {
            Some(Ok(result)) => Some(result),
            Some(Err(e)) => {
                warn!("result channel read error: {e}");
                None
            }
            None => None,
        }
    }
}

/// Frequency every chain starts at after reset.
pub const RAMP_BASELINE_MHZ: f32 = 56.25;
/// Ramp step size. One PLL reprogram per step, with a settle pause between.
pub const RAMP_STEP_MHZ: f32 = 6.25;

const RAMP_SETTLE: Duration = Duration::from_millis(100);
const RAMP_EPSILON: f32 = 0.001;

/// Walk the hash clock from `current` to `target` in fixed steps.
///
/// Jumping the PLL straight to the target browns out the core supply, so
/// the clock moves at most [`RAMP_STEP_MHZ`] at a time with a settle pause
/// after each write. If `current` sits off the step grid it is first pulled
/// onto the nearest boundary toward the target. A residual smaller than a
/// full step becomes one last exact write. Any write failure aborts the
/// ramp at the frequency last applied.
pub async fn ramp_frequency(
    ops: &mut dyn ChipOps,
    current_mhz: f32,
    target_mhz: f32,
) -> Result<(), DriverError> {
    let mut current = current_mhz;
    let up = target_mhz > current;

    let remainder = current % RAMP_STEP_MHZ;
    if remainder.abs() > RAMP_EPSILON {
        let aligned = if up {
            (current / RAMP_STEP_MHZ).ceil() * RAMP_STEP_MHZ
        } else {
            (current / RAMP_STEP_MHZ).floor() * RAMP_STEP_MHZ
        };
        debug!(from = current, to = aligned, "aligning to ramp grid");
        ops.set_frequency(aligned).await?;
        tokio::time::sleep(RAMP_SETTLE).await;
        current = aligned;
    }

    while (target_mhz - current).abs() >= RAMP_STEP_MHZ - RAMP_EPSILON {
        current = if up {
            current + RAMP_STEP_MHZ
        } else {
            current - RAMP_STEP_MHZ
        };
        ops.set_frequency(current).await?;
        tokio::time::sleep(RAMP_SETTLE).await;
    }

    if (target_mhz - current).abs() > RAMP_EPSILON {
        ops.set_frequency(target_mhz).await?;
        tokio::time::sleep(RAMP_SETTLE).await;
    }

    info!(mhz = target_mhz, "frequency ramp complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every frequency write and can be told to fail at one.
    #[derive(Default)]
    struct RecordingOps {
        sets: Vec<f32>,
        fail_at: Option<f32>,
    }

    #[async_trait]
    impl ChipOps for RecordingOps {
        async fn init(&mut self, _: f32, _: u8) -> Result<u8, DriverError> {
            unimplemented!()
        }

        async fn set_frequency(&mut self, mhz: f32) -> Result<(), DriverError> {
            self.sets.push(mhz);
            if self.fail_at.is_some_and(|f| (f - mhz).abs() < 0.001) {
                return Err(DriverError::InvalidFrequency { mhz });
            }
            Ok(())
        }

        async fn set_version_mask(&mut self, _: u32) -> Result<(), DriverError> {
            unimplemented!()
        }

        async fn set_job_difficulty_mask(&mut self, _: u32) -> Result<(), DriverError> {
            unimplemented!()
        }

        async fn set_default_baud(&mut self) -> Result<u32, DriverError> {
            unimplemented!()
        }

        async fn set_max_baud(&mut self) -> Result<u32, DriverError> {
            unimplemented!()
        }

        async fn send_job(&mut self, _: &Job, _: u8) -> Result<(), DriverError> {
            unimplemented!()
        }

        async fn read_hash_registers(&mut self, _: u8) -> Result<(), DriverError> {
            unimplemented!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_steps_from_baseline() {
        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, RAMP_BASELINE_MHZ, 75.0).await.unwrap();
        assert_eq!(ops.sets, vec![62.5, 68.75, 75.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_handles_residual_with_final_exact_set() {
        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, RAMP_BASELINE_MHZ, 60.0).await.unwrap();
        // Less than a full step away, so one exact write.
        assert_eq!(ops.sets, vec![60.0]);

        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, RAMP_BASELINE_MHZ, 66.0).await.unwrap();
        assert_eq!(ops.sets, vec![62.5, 66.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_aligns_off_grid_start() {
        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, 58.0, 75.0).await.unwrap();
        assert_eq!(ops.sets, vec![62.5, 68.75, 75.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_can_step_downward() {
        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, 75.0, 56.25).await.unwrap();
        assert_eq!(ops.sets, vec![68.75, 62.5, 56.25]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_aborts_on_first_failure() {
        let mut ops = RecordingOps {
            fail_at: Some(68.75),
            ..Default::default()
        };
        let err = ramp_frequency(&mut ops, RAMP_BASELINE_MHZ, 100.0).await;
        assert!(err.is_err());
        // The failing write was attempted, nothing after it.
        assert_eq!(ops.sets, vec![62.5, 68.75]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_noop_when_already_at_target() {
        let mut ops = RecordingOps::default();
        ramp_frequency(&mut ops, 75.0, 75.0).await.unwrap();
        assert!(ops.sets.is_empty());
    }

    #[test]
    fn family_parsing() {
        assert_eq!("BM1368".parse::<ChipFamily>().unwrap(), ChipFamily::Bm1368);
        assert_eq!("bm1370".parse::<ChipFamily>().unwrap(), ChipFamily::Bm1370);
        assert!(matches!(
            "bm9000".parse::<ChipFamily>(),
            Err(DriverError::UnknownFamily { .. })
        ));
    }

    #[test]
    fn unsupported_family_refuses_to_bind() {
        let link = ChainLink {
            tx: Box::new(Vec::<u8>::new()),
            rx: Box::new(std::io::Cursor::new(Vec::<u8>::new())),
        };
        assert!(matches!(
            ChipFamily::Bm1397.bind(link),
            Err(DriverError::UnsupportedFamily { .. })
        ));
    }
}
