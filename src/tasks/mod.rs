//! The mining pipeline tasks and the messages that connect them.
//!
//! Ownership is partitioned so every channel has one writer: the builder
//! produces jobs, the dispatcher alone writes to the chain, the result
//! pipeline alone reads from it, and the monitor talks to the chain only
//! through dispatch commands.

pub mod builder;
pub mod dispatch;
pub mod results;

use crate::asic::frame::HashReg;
use crate::work::Job;

/// Requests the dispatcher executes on the TX channel on behalf of others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchCommand {
    /// Broadcast hashrate/counter register reads for the monitor.
    ReadHashRegisters { domains: u8 },
}

/// One register reply, forwarded from the result pipeline to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSample {
    pub chip: u8,
    pub register: HashReg,
    pub value: u32,
}

/// A job as transmitted to the chain, keyed by its chip-local id.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: u8,
    pub job: Job,
}

/// Statistics event for every nonce a chip reported against a live job.
#[derive(Debug, Clone)]
pub struct FoundNonce {
    pub pool_job_id: String,
    pub nonce: u32,
    pub chip: u8,
    pub achieved_diff: f64,
    pub pool_diff: u64,
    pub submitted: bool,
}
