//! Dispatcher: sole writer on the chain TX channel.
//!
//! Pulls jobs off the builder's queue, assigns cyclic 8-bit chip ids,
//! tells the result pipeline which job lives under which id, then frames
//! and transmits. Register reads requested by the monitor go through here
//! too, so nothing else ever touches the TX side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::asic::ChipOps;
use crate::tasks::{ActiveJob, DispatchCommand};
use crate::tracing::prelude::*;
use crate::work::Job;

pub struct Dispatcher {
    pub ops: Box<dyn ChipOps>,
    pub job_rx: mpsc::Receiver<Job>,
    pub command_rx: mpsc::Receiver<DispatchCommand>,
    pub active_tx: mpsc::Sender<ActiveJob>,
    /// Current template generation; jobs tagged older are dropped here
    /// instead of wasting chain bandwidth.
    pub generation: Arc<AtomicU64>,
}

impl Dispatcher {
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut next_id: u8 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                Some(command) = self.command_rx.recv() => {
                    match command {
                        DispatchCommand::ReadHashRegisters { domains } => {
                            if let Err(e) = self.ops.read_hash_registers(domains).await {
                                warn!("register read failed: {e}");
                            }
                        }
                    }
                }
                job = self.job_rx.recv() => {
                    let Some(job) = job else { return };
                    let current = self.generation.load(Ordering::SeqCst);
                    if job.generation < current {
                        trace!(
                            job = %job.pool_job_id,
                            job_generation = job.generation,
                            current,
                            "dropping stale job"
                        );
                        continue;
                    }

                    let id = next_id;
                    next_id = next_id.wrapping_add(1);

                    // Result side learns the mapping before the chain can
                    // possibly answer under this id.
                    if self.active_tx.send(ActiveJob { id, job: job.clone() }).await.is_err() {
                        return;
                    }
                    if let Err(e) = self.ops.send_job(&job, id).await {
                        error!("chain transmit failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}
