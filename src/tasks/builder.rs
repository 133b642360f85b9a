//! Job builder: expands pool templates into a stream of chip jobs.
//!
//! One template yields one job per extranonce2 value, produced lazily
//! against the bounded job channel. A fresh template or a raised abandon
//! flag ends the current expansion; abandon also bumps the generation
//! counter so jobs already queued downstream die at dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;
use crate::work::{assemble_job, extranonce2_generate, Job, MiningNotify};

pub struct JobBuilder {
    pub notify_rx: mpsc::Receiver<MiningNotify>,
    pub job_tx: mpsc::Sender<Job>,
    /// Pool difficulty sampled per job, so a mid-template change applies
    /// to jobs built after it.
    pub pool_diff: Arc<AtomicU64>,
    /// Raised externally on `clean_jobs`; consumed here.
    pub abandon: Arc<AtomicBool>,
    /// Bumped on abandon; dispatch discards anything older.
    pub generation: Arc<AtomicU64>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_len: usize,
    pub version_mask: u32,
    /// First extranonce2 counter for each template, normally zero.
    pub initial_counter: u32,
}

impl JobBuilder {
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let mut notify = tokio::select! {
                _ = shutdown.cancelled() => return,
                n = self.notify_rx.recv() => match n {
                    Some(n) => n,
                    None => return,
                },
            };
            // Only the newest template matters.
            while let Ok(newer) = self.notify_rx.try_recv() {
                notify = newer;
            }
            if self.abandon.swap(false, Ordering::SeqCst) {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            debug!(job = %notify.job_id, "building jobs from new template");
            if !self.expand_template(&notify, &shutdown).await {
                return;
            }
        }
    }

    /// Produce jobs until the template is superseded. Returns false when
    /// the pipeline is shutting down.
    async fn expand_template(
        &mut self,
        notify: &MiningNotify,
        shutdown: &CancellationToken,
    ) -> bool {
        let mut counter = self.initial_counter;
        loop {
            if self.abandon.swap(false, Ordering::SeqCst) {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(generation, "abandoning current template");
                return true;
            }
            if !self.notify_rx.is_empty() {
                return true;
            }
            if counter == u32::MAX {
                // The extranonce2 space is exhausted; nothing to do until
                // the pool sends fresh work.
                warn!(job = %notify.job_id, "extranonce2 space exhausted");
                return true;
            }

            let job = assemble_job(
                notify,
                &self.extranonce1,
                extranonce2_generate(counter, self.extranonce2_len),
                self.version_mask,
                self.pool_diff.load(Ordering::SeqCst),
                self.generation.load(Ordering::SeqCst),
            );
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                sent = self.job_tx.send(job) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            counter += 1;
        }
    }
}
