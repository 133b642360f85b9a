//! Hashrate monitoring over the chips' continuously running counters.
//!
//! Every poll period the monitor asks the dispatch task to broadcast reads
//! of the rate, nonce-counter and error-counter registers, ingests whatever
//! replies drift back, and recomputes per-chip and process-wide rates.
//! Counters free-run and wrap; rates come from wrapping deltas over elapsed
//! time. A domain watchdog flags hash domains that stop contributing.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::asic::frame::HashReg;
use crate::tasks::{DispatchCommand, RegisterSample};
use crate::tracing::prelude::*;

/// One counter tick covers this many hash operations.
const HASHES_PER_TICK: f64 = 4096.0;
/// Rate register reports MH/s; `0xffff_ffff` means no new sample.
const RATE_SENTINEL: u32 = 0xffff_ffff;

const POLL_PERIOD: Duration = Duration::from_secs(5);
/// Replies need time to trickle up the chain after a broadcast read.
const REPLY_SETTLE: Duration = Duration::from_millis(200);

/// How long a domain may sit at zero before it is called lost.
const DOMAIN_ZERO_GRACE: Duration = Duration::from_secs(60);
/// Below this fraction of its equal share a domain is underperforming.
const DOMAIN_UNDER_FRACTION: f64 = 0.1;

const SHORT_SLOTS: usize = 12; // 12 x 5 s = 1 minute
const MEDIUM_SLOTS: usize = 10; // fed per short cycle = 10 minutes
const LONG_SLOTS: usize = 6; // fed per medium cycle = 1 hour

const SHORT_TO_MEDIUM_RATIO: f64 = 60.0 / 600.0;
const MEDIUM_TO_LONG_RATIO: f64 = 600.0 / 3600.0;

/// Published rates, GH/s. Window averages are `None` until at least one
/// slot of the window has data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSnapshot {
    pub current_ghs: f64,
    pub error_ghs: f64,
    pub avg_1m: Option<f64>,
    pub avg_10m: Option<f64>,
    pub avg_1h: Option<f64>,
}

/// Advisory watchdog finding. Logged, never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEvent {
    Lost { chip: u8, domain: u8 },
    Underperforming { chip: u8, domain: u8 },
}

/// Latest reading derived from one register.
#[derive(Debug, Clone, Copy)]
struct Measurement {
    ghs: f64,
    counter: u32,
    updated: Option<Instant>,
}

impl Measurement {
    fn new() -> Self {
        Self {
            ghs: 0.0,
            counter: 0,
            updated: None,
        }
    }

    /// Fold in a new counter value. The first reading only seeds the
    /// baseline; rates start with the second.
    fn ingest_counter(&mut self, value: u32, now: Instant) {
        if let Some(prev) = self.updated {
            let elapsed = now.duration_since(prev).as_secs_f64();
            if elapsed > 0.0 {
                let ticks = value.wrapping_sub(self.counter) as f64;
                self.ghs = ticks * HASHES_PER_TICK / elapsed / 1e9;
            }
        }
        self.counter = value;
        self.updated = Some(now);
    }

    fn ingest_rate(&mut self, value: u32, now: Instant) {
        if value == RATE_SENTINEL {
            return;
        }
        self.ghs = value as f64 / 1000.0;
        self.updated = Some(now);
    }

    fn fresh_within(&self, window: Duration, now: Instant) -> bool {
        self.updated
            .is_some_and(|t| now.duration_since(t) <= window)
    }
}

/// Ring of window slots; unfilled slots are excluded from the average.
#[derive(Debug)]
struct AvgWindow {
    slots: Vec<Option<f64>>,
    next: usize,
}

impl AvgWindow {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
            next: 0,
        }
    }

    /// Returns true when this push completed a full cycle.
    fn push(&mut self, value: f64) -> bool {
        self.slots[self.next] = Some(value);
        self.next = (self.next + 1) % self.slots.len();
        self.next == 0
    }

    fn average(&self) -> Option<f64> {
        let filled: Vec<f64> = self.slots.iter().flatten().copied().collect();
        if filled.is_empty() {
            return None;
        }
        Some(filled.iter().sum::<f64>() / filled.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainHealth {
    Healthy,
    ZeroSince(Instant),
    Lost,
    Underperforming,
}

/// Per-chip register state plus the cascaded windows. Pure bookkeeping so
/// cadence and thresholds are testable without a runtime.
pub struct MonitorState {
    chips: u8,
    domains: u8,
    totals: Vec<Measurement>,
    errors: Vec<Measurement>,
    rates: Vec<Measurement>,
    domain_counters: HashMap<(u8, u8), Measurement>,
    domain_health: HashMap<(u8, u8), DomainHealth>,
    short: AvgWindow,
    medium: AvgWindow,
    long: AvgWindow,
    medium_prev: Option<f64>,
    long_prev: Option<f64>,
    polls_completed: u32,
}

impl MonitorState {
    pub fn new(chips: u8, domains: u8) -> Self {
        Self {
            chips,
            domains,
            totals: vec![Measurement::new(); chips as usize],
            errors: vec![Measurement::new(); chips as usize],
            rates: vec![Measurement::new(); chips as usize],
            domain_counters: HashMap::new(),
            domain_health: HashMap::new(),
            short: AvgWindow::new(SHORT_SLOTS),
            medium: AvgWindow::new(MEDIUM_SLOTS),
            long: AvgWindow::new(LONG_SLOTS),
            medium_prev: None,
            long_prev: None,
            polls_completed: 0,
        }
    }

    pub fn ingest(&mut self, sample: RegisterSample, now: Instant) {
        let chip = sample.chip as usize;
        if chip >= self.chips as usize {
            trace!(chip, "register reply from unknown chip");
            return;
        }
        match sample.register {
            HashReg::RateGhs => self.rates[chip].ingest_rate(sample.value, now),
            HashReg::TotalCounter => self.totals[chip].ingest_counter(sample.value, now),
            HashReg::ErrorCounter => self.errors[chip].ingest_counter(sample.value, now),
            HashReg::DomainCounter(domain) if domain < self.domains => {
                self.domain_counters
                    .entry((sample.chip, domain))
                    .or_insert_with(Measurement::new)
                    .ingest_counter(sample.value, now);
            }
            HashReg::DomainCounter(_) | HashReg::Invalid => {}
        }
    }

    fn chip_current_ghs(&self, chip: usize, now: Instant) -> f64 {
        // Prefer the direct rate register when it produced a sample this
        // poll; counters cover chips whose register keeps the sentinel.
        if self.rates[chip].fresh_within(POLL_PERIOD, now) {
            self.rates[chip].ghs
        } else {
            self.totals[chip].ghs
        }
    }

    /// Close out one poll period: recompute rates, advance the window
    /// cascade, run the watchdog.
    pub fn poll(&mut self, now: Instant) -> (MonitorSnapshot, Vec<DomainEvent>) {
        self.polls_completed = self.polls_completed.saturating_add(1);

        let current_ghs = (0..self.chips as usize)
            .map(|c| self.chip_current_ghs(c, now))
            .sum();
        let error_ghs = self.errors.iter().map(|m| m.ghs).sum();

        if self.short.push(current_ghs) {
            let short_avg = self.short.average().unwrap_or(current_ghs);
            let fed = match self.medium_prev {
                None => short_avg,
                Some(prev) => prev + (short_avg - prev) * SHORT_TO_MEDIUM_RATIO,
            };
            self.medium_prev = Some(fed);
            if self.medium.push(fed) {
                let medium_avg = self.medium.average().unwrap_or(fed);
                let fed = match self.long_prev {
                    None => medium_avg,
                    Some(prev) => prev + (medium_avg - prev) * MEDIUM_TO_LONG_RATIO,
                };
                self.long_prev = Some(fed);
                self.long.push(fed);
            }
        }

        let snapshot = MonitorSnapshot {
            current_ghs,
            error_ghs,
            avg_1m: self.short.average(),
            avg_10m: self.medium.average(),
            avg_1h: self.long.average(),
        };
        let events = self.watchdog(now);
        (snapshot, events)
    }

    /// Flag domains that stopped hashing while their chip still does.
    /// Needs at least two poll cycles of counter history and more than one
    /// domain to say anything.
    fn watchdog(&mut self, now: Instant) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        if self.domains < 2 || self.polls_completed < 2 {
            return events;
        }

        for chip in 0..self.chips {
            let total_ghs = self.totals[chip as usize].ghs;
            if total_ghs <= 0.0 {
                continue;
            }
            let share = total_ghs / self.domains as f64;
            for domain in 0..self.domains {
                let Some(m) = self.domain_counters.get(&(chip, domain)) else {
                    continue;
                };
                let health = self
                    .domain_health
                    .entry((chip, domain))
                    .or_insert(DomainHealth::Healthy);
                if m.ghs <= 0.0 {
                    match *health {
                        DomainHealth::ZeroSince(since)
                            if now.duration_since(since) > DOMAIN_ZERO_GRACE =>
                        {
                            *health = DomainHealth::Lost;
                            events.push(DomainEvent::Lost { chip, domain });
                        }
                        DomainHealth::ZeroSince(_) | DomainHealth::Lost => {}
                        _ => *health = DomainHealth::ZeroSince(now),
                    }
                } else if m.ghs < share * DOMAIN_UNDER_FRACTION {
                    if *health != DomainHealth::Underperforming {
                        *health = DomainHealth::Underperforming;
                        events.push(DomainEvent::Underperforming { chip, domain });
                    }
                } else {
                    *health = DomainHealth::Healthy;
                }
            }
        }
        events
    }
}

/// The monitor actor. Owns its state; talks to the dispatch task for
/// register reads and publishes snapshots on a watch channel.
pub struct HashrateMonitor {
    state: MonitorState,
    domains: u8,
    sample_rx: mpsc::Receiver<RegisterSample>,
    dispatch_tx: mpsc::Sender<DispatchCommand>,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
}

impl HashrateMonitor {
    pub fn new(
        chips: u8,
        domains: u8,
        sample_rx: mpsc::Receiver<RegisterSample>,
        dispatch_tx: mpsc::Sender<DispatchCommand>,
    ) -> (Self, watch::Receiver<MonitorSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(MonitorSnapshot::default());
        (
            Self {
                state: MonitorState::new(chips, domains),
                domains,
                sample_rx,
                dispatch_tx,
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(POLL_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so counters have a
        // baseline before the first real poll.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("hashrate monitor stopping");
                    return;
                }
                Some(sample) = self.sample_rx.recv() => {
                    self.state.ingest(sample, Instant::now());
                }
                _ = tick.tick() => {
                    if self
                        .dispatch_tx
                        .send(DispatchCommand::ReadHashRegisters { domains: self.domains })
                        .await
                        .is_err()
                    {
                        debug!("dispatch gone, hashrate monitor stopping");
                        return;
                    }
                    tokio::time::sleep(REPLY_SETTLE).await;
                    while let Ok(sample) = self.sample_rx.try_recv() {
                        self.state.ingest(sample, Instant::now());
                    }

                    let (snapshot, events) = self.state.poll(Instant::now());
                    for event in &events {
                        match event {
                            DomainEvent::Lost { chip, domain } => {
                                warn!(chip, domain, "hash domain lost");
                            }
                            DomainEvent::Underperforming { chip, domain } => {
                                warn!(chip, domain, "hash domain underperforming");
                            }
                        }
                    }
                    info!(
                        ghs = format!("{:.1}", snapshot.current_ghs),
                        err_ghs = format!("{:.2}", snapshot.error_ghs),
                        avg_1m = snapshot.avg_1m.map(|v| format!("{v:.1}")),
                        "hashrate"
                    );
                    let _ = self.snapshot_tx.send(snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(chip: u8, register: HashReg, value: u32) -> RegisterSample {
        RegisterSample {
            chip,
            register,
            value,
        }
    }

    fn step(now: Instant, polls: u32) -> Instant {
        now + POLL_PERIOD * polls
    }

    #[test]
    fn counter_delta_becomes_rate() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        state.ingest(sample(0, HashReg::TotalCounter, 1000), t0);
        state.ingest(sample(0, HashReg::TotalCounter, 2000), step(t0, 1));

        let (snapshot, _) = state.poll(step(t0, 1));
        // 1000 ticks * 4096 hashes over 5 s.
        let expect = 1000.0 * 4096.0 / 5.0 / 1e9;
        assert!((snapshot.current_ghs - expect).abs() < 1e-12);
    }

    #[test]
    fn counter_wraparound_is_handled() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        state.ingest(sample(0, HashReg::TotalCounter, 0xffff_ff00), t0);
        state.ingest(sample(0, HashReg::TotalCounter, 0x0000_0100), step(t0, 1));

        let (snapshot, _) = state.poll(step(t0, 1));
        let expect = 512.0 * 4096.0 / 5.0 / 1e9;
        assert!((snapshot.current_ghs - expect).abs() < 1e-12);
    }

    #[test]
    fn rate_register_sentinel_keeps_previous_value() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        state.ingest(sample(0, HashReg::RateGhs, 500_000), t0);
        assert_eq!(state.rates[0].ghs, 500.0);

        state.ingest(sample(0, HashReg::RateGhs, RATE_SENTINEL), step(t0, 1));
        assert_eq!(state.rates[0].ghs, 500.0);
    }

    #[test]
    fn fresh_rate_register_preferred_over_counter() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        state.ingest(sample(0, HashReg::TotalCounter, 0), t0);
        state.ingest(sample(0, HashReg::TotalCounter, 10_000), step(t0, 1));
        state.ingest(sample(0, HashReg::RateGhs, 750_000), step(t0, 1));

        let (snapshot, _) = state.poll(step(t0, 1));
        assert_eq!(snapshot.current_ghs, 750.0);
    }

    #[test]
    fn window_average_excludes_unfilled_slots() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        // Three polls at a steady synthetic rate.
        for i in 1..=3u32 {
            state.ingest(
                sample(0, HashReg::RateGhs, 10_000),
                step(t0, i),
            );
            let (snapshot, _) = state.poll(step(t0, i));
            // Average over only the filled slots equals the steady value.
            assert_eq!(snapshot.avg_1m, Some(10.0));
            // Longer windows have no data yet.
            assert_eq!(snapshot.avg_10m, None);
            assert_eq!(snapshot.avg_1h, None);
        }
    }

    #[test]
    fn short_cycle_feeds_medium_window() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        for i in 1..=(SHORT_SLOTS as u32) {
            state.ingest(sample(0, HashReg::RateGhs, 20_000), step(t0, i));
            state.poll(step(t0, i));
        }
        // One full short cycle elapsed, the medium window has one slot.
        assert_eq!(state.medium.average(), Some(20.0));
    }

    #[test]
    fn watchdog_silent_with_single_domain() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 1);
        state.ingest(sample(0, HashReg::TotalCounter, 0), t0);
        state.ingest(sample(0, HashReg::DomainCounter(0), 0), t0);
        for i in 1..=30u32 {
            state.ingest(sample(0, HashReg::TotalCounter, i * 1000), step(t0, i));
            // Domain stuck at zero the whole time.
            state.ingest(sample(0, HashReg::DomainCounter(0), 0), step(t0, i));
            let (_, events) = state.poll(step(t0, i));
            assert!(events.is_empty());
        }
    }

    #[test]
    fn watchdog_flags_lost_domain_after_grace() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 2);
        state.ingest(sample(0, HashReg::TotalCounter, 0), t0);
        state.ingest(sample(0, HashReg::DomainCounter(0), 0), t0);
        state.ingest(sample(0, HashReg::DomainCounter(1), 0), t0);

        let mut lost = Vec::new();
        for i in 1..=20u32 {
            let now = step(t0, i);
            state.ingest(sample(0, HashReg::TotalCounter, i * 10_000), now);
            state.ingest(sample(0, HashReg::DomainCounter(0), i * 5_000), now);
            state.ingest(sample(0, HashReg::DomainCounter(1), 0), now);
            let (_, events) = state.poll(now);
            lost.extend(events);
        }

        // Grace is 60 s = 12 polls; the event fires once, not every poll.
        assert_eq!(lost, vec![DomainEvent::Lost { chip: 0, domain: 1 }]);
    }

    #[test]
    fn watchdog_flags_underperforming_domain() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 2);
        state.ingest(sample(0, HashReg::TotalCounter, 0), t0);
        state.ingest(sample(0, HashReg::DomainCounter(0), 0), t0);
        state.ingest(sample(0, HashReg::DomainCounter(1), 0), t0);

        let mut seen = Vec::new();
        for i in 1..=3u32 {
            let now = step(t0, i);
            state.ingest(sample(0, HashReg::TotalCounter, i * 100_000), now);
            state.ingest(sample(0, HashReg::DomainCounter(0), i * 99_000), now);
            // Around 1% of the equal share.
            state.ingest(sample(0, HashReg::DomainCounter(1), i * 1_000), now);
            let (_, events) = state.poll(now);
            seen.extend(events);
        }

        assert_eq!(
            seen,
            vec![DomainEvent::Underperforming { chip: 0, domain: 1 }]
        );
    }

    #[test]
    fn watchdog_skips_first_poll() {
        let t0 = Instant::now();
        let mut state = MonitorState::new(1, 2);
        let (_, events) = state.poll(t0);
        assert!(events.is_empty());
    }

    #[test]
    fn every_chip_on_the_chain_is_measured() {
        use crate::asic::frame::{test_support::register_frame, ResultCodec, TaskResult};
        use bytes::BytesMut;
        use tokio_util::codec::Decoder;

        // Three chips addressed 256/3 = 85 apart; each counter advances
        // 10 000 ticks per poll. The aggregate must see all of them, not
        // just the chip at bus address 0.
        let mut codec = ResultCodec::default();
        codec.set_chip_count(3);
        let t0 = Instant::now();
        let mut state = MonitorState::new(3, 1);

        for poll in 0..2u32 {
            for address in [0u8, 85, 170] {
                let frame =
                    register_frame(address, crate::asic::frame::REG_NONCE_TOTAL_CNT, poll * 10_000);
                let mut buf = BytesMut::from(&frame[..]);
                let Some(TaskResult::RegisterReply {
                    chip,
                    register,
                    value,
                }) = codec.decode(&mut buf).unwrap()
                else {
                    panic!("expected a register reply");
                };
                state.ingest(
                    RegisterSample {
                        chip,
                        register,
                        value,
                    },
                    step(t0, poll),
                );
            }
        }

        let (snapshot, _) = state.poll(step(t0, 1));
        let expect = 3.0 * 10_000.0 * 4096.0 / 5.0 / 1e9;
        assert!((snapshot.current_ghs - expect).abs() < 1e-12);
    }
}
