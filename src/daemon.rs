//! Daemon lifecycle: bring the chain up, wire the pipeline, run until a
//! signal says stop.
//!
//! Task management follows one pattern throughout: every long-running task
//! is spawned on a `TaskTracker` and watches a shared `CancellationToken`.
//! Shutdown cancels the token and waits for the tracker to drain.

use anyhow::Context;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::asic::{ramp_frequency, ChainLink, ChipOps, RAMP_BASELINE_MHZ};
use crate::config::MinerConfig;
use crate::monitor::HashrateMonitor;
use crate::pool::{PoolFeed, PoolState, StratumSink};
use crate::tasks::builder::JobBuilder;
use crate::tasks::dispatch::Dispatcher;
use crate::tasks::results::ResultPipeline;
use crate::tasks::FoundNonce;
use crate::tracing::prelude::*;

/// Serial baud rate chips talk at after power-on.
const INITIAL_BAUD: u32 = 115_200;

pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self, config: MinerConfig) -> anyhow::Result<()> {
        // Bring the chain up before anything else; a miner without chips
        // has nothing to do.
        let serial = tokio_serial::new(&config.serial_device, INITIAL_BAUD)
            .open_native_async()
            .with_context(|| format!("opening {}", config.serial_device))?;
        // Second handle to the same port so the host rate can follow the
        // chips after the max-baud register write; the halves below are
        // type-erased and cannot be reconfigured.
        let mut baud_handle = serial
            .try_clone()
            .context("cloning serial port for baud control")?;
        let (serial_rx, serial_tx) = tokio::io::split(serial);
        let link = ChainLink {
            tx: Box::new(serial_tx),
            rx: Box::new(serial_rx),
        };

        let mut chain = config.family.bind(link)?;
        let detected = chain
            .init(RAMP_BASELINE_MHZ, config.chip_count)
            .await
            .context("chain bring-up failed")?;
        chain.set_version_mask(config.version_mask).await?;
        chain
            .set_job_difficulty_mask(config.difficulty as u32)
            .await?;
        let host_baud = chain.set_max_baud().await?;
        // Let the divider write drain at the old rate before switching.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        baud_handle
            .set_baud_rate(host_baud)
            .context("raising host serial baud")?;
        info!(baud = host_baud, "serial link raised to mining baud rate");
        ramp_frequency(&mut chain, RAMP_BASELINE_MHZ, config.frequency_mhz)
            .await
            .context("frequency ramp failed")?;

        let reader = chain
            .take_results()
            .context("chain result reader unavailable")?;

        // Pool connection. Subscribe/authorize happened out of band; this
        // socket carries notifications in and submissions out.
        let pool_stream = TcpStream::connect(&config.pool_addr)
            .await
            .with_context(|| format!("connecting to pool {}", config.pool_addr))?;
        let (pool_rx, pool_tx) = pool_stream.into_split();
        let sink = StratumSink::new(pool_tx, config.pool_user.clone());

        // Shared mining state.
        let pool_diff = Arc::new(AtomicU64::new(config.difficulty));
        let abandon = Arc::new(AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));

        // Channels between the pipeline stages. The job queue is shallow
        // on purpose: jobs should be built just in time, not stockpiled.
        let (notify_tx, notify_rx) = mpsc::channel(8);
        let (job_tx, job_rx) = mpsc::channel(2);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (active_tx, active_rx) = mpsc::channel(8);
        let (sample_tx, sample_rx) = mpsc::channel(64);
        let (found_tx, found_rx) = mpsc::channel(32);

        let feed = PoolFeed::new(
            pool_rx,
            notify_tx,
            PoolState {
                difficulty: pool_diff.clone(),
                abandon: abandon.clone(),
            },
        );
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                tokio::select! {
                    result = feed.run() => {
                        if let Err(e) = result {
                            error!("pool feed ended: {e}");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
            }
        });

        let builder = JobBuilder {
            notify_rx,
            job_tx,
            pool_diff,
            abandon,
            generation: generation.clone(),
            extranonce1: config.extranonce1.clone(),
            extranonce2_len: config.extranonce2_len,
            version_mask: config.version_mask,
            initial_counter: 0,
        };
        self.tracker.spawn(builder.run(self.shutdown.clone()));

        let dispatcher = Dispatcher {
            ops: Box::new(chain),
            job_rx,
            command_rx,
            active_tx,
            generation,
        };
        self.tracker.spawn(dispatcher.run(self.shutdown.clone()));

        let pipeline = ResultPipeline::new(reader, active_rx, sample_tx, found_tx, sink);
        self.tracker.spawn(pipeline.run(self.shutdown.clone()));

        let (monitor, snapshot_rx) =
            HashrateMonitor::new(detected, config.domains, sample_rx, command_tx);
        self.tracker.spawn(monitor.run(self.shutdown.clone()));

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            stats_task(found_rx, shutdown, snapshot_rx)
        });

        self.tracker.close();
        info!(
            chips = detected,
            mhz = config.frequency_mhz,
            pool = %config.pool_addr,
            "mining started"
        );

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT."),
            _ = sigterm.recv() => info!("Received SIGTERM."),
        }

        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");
        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every found nonce with achieved versus pool difficulty. Holding the
/// snapshot receiver here keeps the monitor's watch channel alive.
async fn stats_task(
    mut found_rx: mpsc::Receiver<FoundNonce>,
    shutdown: CancellationToken,
    _snapshot_rx: tokio::sync::watch::Receiver<crate::monitor::MonitorSnapshot>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            found = found_rx.recv() => {
                let Some(found) = found else { return };
                info!(
                    job = %found.pool_job_id,
                    chip = found.chip,
                    nonce = format!("{:08x}", found.nonce),
                    diff = format!("{:.1}", found.achieved_diff),
                    pool_diff = found.pool_diff,
                    submitted = found.submitted,
                    "nonce found"
                );
            }
        }
    }
}
