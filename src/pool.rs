//! Pool-facing seam: share submission out, work notifications in.
//!
//! Socket lifecycle, subscription and authorization live outside this
//! crate. What mining needs from the pool is narrow: a sink to push
//! `mining.submit` lines into and a feed of `mining.notify` /
//! `mining.set_difficulty` notifications, both speaking line-delimited
//! JSON-RPC over whatever transport the caller owns.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::tracing::prelude::*;
use crate::work::MiningNotify;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("pool connection closed")]
    Closed,
}

/// One share, ready to be formatted as a `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub pool_job_id: String,
    pub extranonce2: String,
    pub ntime: u32,
    pub nonce: u32,
    /// Version field to report. For rolled shares this is the XOR delta
    /// against the job's base version, as pools expect.
    pub version: u32,
}

/// Submission side of the pool connection.
#[async_trait]
pub trait PoolClient: Send {
    async fn submit_share(&mut self, request: SubmitRequest) -> Result<(), PoolError>;

    /// Tear the connection down after an unrecoverable transport failure.
    /// Reconnecting is the outer client's problem.
    async fn close_connection(&mut self);
}

/// Writes `mining.submit` JSON-RPC lines to any async byte sink.
pub struct StratumSink<W> {
    writer: W,
    user: String,
    request_id: u64,
}

impl<W: AsyncWrite + Send + Unpin> StratumSink<W> {
    pub fn new(writer: W, user: String) -> Self {
        Self {
            writer,
            user,
            request_id: 0,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> PoolClient for StratumSink<W> {
    async fn submit_share(&mut self, request: SubmitRequest) -> Result<(), PoolError> {
        self.request_id += 1;
        let line = json!({
            "id": self.request_id,
            "method": "mining.submit",
            "params": [
                self.user,
                request.pool_job_id,
                request.extranonce2,
                format!("{:08x}", request.ntime),
                format!("{:08x}", request.nonce),
                format!("{:08x}", request.version),
            ],
        });
        let mut buf = line.to_string();
        buf.push('\n');
        self.writer.write_all(buf.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close_connection(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("pool writer shutdown: {e}");
        }
    }
}

/// Shared knobs the notification feed updates while mining runs.
pub struct PoolState {
    /// Current pool difficulty, applied to jobs built after the change.
    pub difficulty: Arc<AtomicU64>,
    /// Raised by `clean_jobs`; the job builder observes and resets it.
    pub abandon: Arc<AtomicBool>,
}

/// Reads pool notifications off a line stream and routes them.
///
/// Only `mining.notify` and `mining.set_difficulty` matter here; anything
/// else on the wire (responses to the outer client's requests included) is
/// logged at trace and skipped.
pub struct PoolFeed<R> {
    reader: BufReader<R>,
    notify_tx: mpsc::Sender<MiningNotify>,
    state: PoolState,
}

impl<R: AsyncRead + Unpin> PoolFeed<R> {
    pub fn new(reader: R, notify_tx: mpsc::Sender<MiningNotify>, state: PoolState) -> Self {
        Self {
            reader: BufReader::new(reader),
            notify_tx,
            state,
        }
    }

    /// Pump until the stream ends or every notify receiver is gone.
    pub async fn run(mut self) -> Result<(), PoolError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(PoolError::Closed);
            }
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                trace!(line = line.trim(), "unparseable pool line");
                continue;
            };
            if self.dispatch(&msg).await.is_err() {
                // Notify channel closed, mining is shutting down.
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, msg: &Value) -> Result<(), ()> {
        let method = msg.get("method").and_then(Value::as_str);
        let params = msg.get("params").and_then(Value::as_array);
        match (method, params) {
            (Some("mining.notify"), Some(params)) => {
                match MiningNotify::from_stratum_params(params) {
                    Ok(notify) => {
                        if notify.clean_jobs {
                            info!(job = %notify.job_id, "pool requested clean jobs");
                            self.state.abandon.store(true, Ordering::SeqCst);
                        }
                        self.notify_tx.send(notify).await.map_err(|_| ())?;
                    }
                    Err(e) => warn!("dropping bad mining.notify: {e}"),
                }
            }
            (Some("mining.set_difficulty"), Some(params)) => {
                // Some pools send the difficulty as a float.
                let diff = params
                    .first()
                    .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)));
                match diff {
                    Some(diff) if diff > 0 => {
                        info!(diff, "pool difficulty changed");
                        self.state.difficulty.store(diff, Ordering::SeqCst);
                    }
                    _ => warn!("ignoring bad mining.set_difficulty"),
                }
            }
            _ => trace!("ignoring pool message"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_formats_stratum_line() {
        let mut sink = StratumSink::new(Vec::<u8>::new(), "worker.1".into());
        sink.submit_share(SubmitRequest {
            pool_job_id: "job123".into(),
            extranonce2: "deadbeef".into(),
            ntime: 0x6543_2100,
            nonce: 0x1234_5678,
            version: 0x0abc_0000,
        })
        .await
        .unwrap();

        let line = String::from_utf8(sink.writer.clone()).unwrap();
        assert!(line.ends_with('\n'));
        let msg: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(msg["method"], "mining.submit");
        assert_eq!(
            msg["params"],
            json!([
                "worker.1",
                "job123",
                "deadbeef",
                "65432100",
                "12345678",
                "0abc0000"
            ])
        );
    }

    #[tokio::test]
    async fn submit_ids_increment() {
        let mut sink = StratumSink::new(Vec::<u8>::new(), "w".into());
        for _ in 0..2 {
            sink.submit_share(SubmitRequest {
                pool_job_id: "j".into(),
                extranonce2: "00".into(),
                ntime: 0,
                nonce: 0,
                version: 0,
            })
            .await
            .unwrap();
        }
        let text = String::from_utf8(sink.writer.clone()).unwrap();
        let ids: Vec<u64> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    fn feed_fixture(
        input: &str,
    ) -> (
        PoolFeed<std::io::Cursor<Vec<u8>>>,
        mpsc::Receiver<MiningNotify>,
        Arc<AtomicU64>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let difficulty = Arc::new(AtomicU64::new(1));
        let abandon = Arc::new(AtomicBool::new(false));
        let feed = PoolFeed::new(
            std::io::Cursor::new(input.as_bytes().to_vec()),
            tx,
            PoolState {
                difficulty: difficulty.clone(),
                abandon: abandon.clone(),
            },
        );
        (feed, rx, difficulty, abandon)
    }

    fn notify_line(job_id: &str, clean: bool) -> String {
        json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                job_id,
                "00".repeat(32),
                "aa",
                "bb",
                [],
                "20000000",
                "1703d869",
                "65a1946b",
                clean,
            ],
        })
        .to_string()
            + "\n"
    }

    #[tokio::test]
    async fn feed_routes_notify_and_difficulty() {
        let input = format!(
            "{}{}{}",
            json!({"id": null, "method": "mining.set_difficulty", "params": [512]}),
            "\n",
            notify_line("jobA", false),
        );
        let (feed, mut rx, difficulty, abandon) = feed_fixture(&input);
        let result = feed.run().await;
        assert!(matches!(result, Err(PoolError::Closed)));

        assert_eq!(difficulty.load(Ordering::SeqCst), 512);
        assert!(!abandon.load(Ordering::SeqCst));
        let notify = rx.recv().await.unwrap();
        assert_eq!(notify.job_id, "jobA");
    }

    #[tokio::test]
    async fn clean_jobs_raises_abandon() {
        let (feed, mut rx, _, abandon) = feed_fixture(&notify_line("jobB", true));
        let _ = feed.run().await;
        assert!(abandon.load(Ordering::SeqCst));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let input = format!("not json at all\n{}", notify_line("jobC", false));
        let (feed, mut rx, _, _) = feed_fixture(&input);
        let _ = feed.run().await;
        assert_eq!(rx.recv().await.unwrap().job_id, "jobC");
    }
}
