//! Result pipeline: nonces in, shares out.
//!
//! Sole reader of the chain's result channel. Keeps the id-to-job table
//! the dispatcher feeds it, scores every nonce against its job host-side,
//! submits the ones that clear the pool difficulty, and forwards register
//! replies to the hashrate monitor.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::asic::frame::TaskResult;
use crate::asic::ResultReader;
use crate::pool::{PoolClient, SubmitRequest};
use crate::tasks::{ActiveJob, FoundNonce, RegisterSample};
use crate::tracing::prelude::*;
use crate::work::{nonce_difficulty, roll_version, Job};

pub struct ResultPipeline<P: PoolClient> {
    reader: ResultReader,
    active_rx: mpsc::Receiver<ActiveJob>,
    sample_tx: mpsc::Sender<RegisterSample>,
    found_tx: mpsc::Sender<FoundNonce>,
    pool: P,
    /// Jobs live on the chain, indexed by chip-local id. A slot is `None`
    /// until its id has been used; old entries are overwritten as ids wrap.
    active: Vec<Option<Job>>,
}

impl<P: PoolClient> ResultPipeline<P> {
    pub fn new(
        reader: ResultReader,
        active_rx: mpsc::Receiver<ActiveJob>,
        sample_tx: mpsc::Sender<RegisterSample>,
        found_tx: mpsc::Sender<FoundNonce>,
        pool: P,
    ) -> Self {
        Self {
            reader,
            active_rx,
            sample_tx,
            found_tx,
            pool,
            active: vec![None; 256],
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                Some(active) = self.active_rx.recv() => {
                    self.active[active.id as usize] = Some(active.job);
                }
                result = self.reader.receive() => {
                    match result {
                        None => {
                            warn!("chain result channel closed");
                            return;
                        }
                        Some(TaskResult::RegisterReply { chip, register, value }) => {
                            let sample = RegisterSample { chip, register, value };
                            if self.sample_tx.send(sample).await.is_err() {
                                return;
                            }
                        }
                        Some(TaskResult::Nonce { job_id, nonce, version_bits, chip }) => {
                            self.handle_nonce(job_id, nonce, version_bits, chip).await;
                        }
                    }
                }
            }
        }
    }

    /// Score a nonce and submit it when it clears the pool difficulty.
    ///
    /// A nonce for an id with no live job is late work from before a
    /// template change; it is dropped without statistics.
    async fn handle_nonce(&mut self, job_id: u8, nonce: u32, version_bits: u16, chip: u8) {
        let Some(job) = self.active[job_id as usize].as_ref() else {
            warn!(job_id, nonce, "nonce for a job no longer tracked");
            return;
        };

        let rolled = roll_version(job.version, job.version_mask, version_bits);
        let achieved_diff = nonce_difficulty(job, nonce, rolled);
        let submitted = achieved_diff >= job.pool_diff as f64;

        if submitted {
            info!(
                job = %job.pool_job_id,
                nonce = format!("{nonce:08x}"),
                diff = format!("{achieved_diff:.1}"),
                pool_diff = job.pool_diff,
                "submitting share"
            );
            let request = SubmitRequest {
                pool_job_id: job.pool_job_id.clone(),
                extranonce2: job.extranonce2.clone(),
                ntime: job.ntime,
                nonce,
                // Pools take the version as a delta against the template.
                version: rolled ^ job.version,
            };
            if let Err(e) = self.pool.submit_share(request).await {
                error!("share submission failed: {e}");
                self.pool.close_connection().await;
            }
        } else {
            trace!(
                nonce = format!("{nonce:08x}"),
                diff = format!("{achieved_diff:.3}"),
                "nonce below pool difficulty"
            );
        }

        let found = FoundNonce {
            pool_job_id: job.pool_job_id.clone(),
            nonce,
            chip,
            achieved_diff,
            pool_diff: job.pool_diff,
            submitted,
        };
        let _ = self.found_tx.send(found).await;
    }
}
