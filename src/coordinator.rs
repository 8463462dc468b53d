//! Scan coordinator
//!
//! Owns one scan's lifecycle:
//!
//! ```text
//! Idle --start--> Running <--pause/resume--> Paused
//!                    |                          |
//!                    +----------stop------------+--> Stopped
//! ```
//!
//! `Stopped` is terminal; build a new `Coordinator` to scan again. Start
//! performs every check that can fail (config, network, chain id, range)
//! before leaving `Idle`. Once running, per-item failures are logged and
//! counted but never end the scan loop.
//!
//! Progress is reported through a broadcast channel of `ScanEvent`s and
//! through `stats()` snapshots.

use crate::config::{ScanConfig, ScanMode};
use crate::detector::ContractDetector;
use crate::error::{RpcError, ScanError};
use crate::records::ContractRecord;
use crate::rpc::{verify_chain_id, ChainClient};
use crate::store::{CheckpointStore, RecordSink};
use crate::types::BlockView;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel. Slow subscribers lag rather than block the scan.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Stopped => "stopped",
        })
    }
}

/// Point-in-time copy of the scan counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub status: ScanStatus,
    pub network: String,
    pub mode: Option<ScanMode>,
    pub blocks_processed: u64,
    pub contracts_found: u64,
    pub error_count: u64,
    /// Malformed transactions skipped by the detector
    pub skipped_transactions: u64,
    pub batches_completed: u64,
    /// Highest block processed so far
    pub current_block: Option<u64>,
    /// Last checkpoint written by this scan
    pub checkpoint: Option<u64>,
    pub elapsed_ms: u64,
}

/// Pushed to every `subscribe()` receiver.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    ContractDetected(ContractRecord),
    StatsUpdated(ScanStats),
    StatusChanged { from: ScanStatus, to: ScanStatus },
}

struct ScanState {
    status: ScanStatus,
    mode: Option<ScanMode>,
    blocks_processed: u64,
    contracts_found: u64,
    error_count: u64,
    skipped_transactions: u64,
    batches_completed: u64,
    current_block: Option<u64>,
    checkpoint: Option<u64>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl ScanState {
    fn new() -> Self {
        Self {
            status: ScanStatus::Idle,
            mode: None,
            blocks_processed: 0,
            contracts_found: 0,
            error_count: 0,
            skipped_transactions: 0,
            batches_completed: 0,
            current_block: None,
            checkpoint: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Historical range after `latest` and checkpoint resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    start: u64,
    end: u64,
}

/// Outcome of running one block through detect and persist.
struct BlockOutcome {
    /// Every transaction was examined and every record written
    complete: bool,
}

/// State shared between the control handle and the scan task.
struct Inner {
    client: Arc<dyn ChainClient>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Mutex<ScanState>,
    status_tx: watch::Sender<ScanStatus>,
    pause_tx: watch::Sender<bool>,
    events: broadcast::Sender<ScanEvent>,
    cancel: CancellationToken,
}

/// Drives one scan over one chain client.
pub struct Coordinator {
    inner: Arc<Inner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                client,
                sink,
                checkpoints,
                state: Mutex::new(ScanState::new()),
                status_tx: watch::channel(ScanStatus::Idle).0,
                pause_tx: watch::channel(false).0,
                events,
                cancel: CancellationToken::new(),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Receive events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.state().status
    }

    pub fn stats(&self) -> ScanStats {
        self.inner.snapshot()
    }

    /// Validate `config`, connect and begin scanning.
    ///
    /// Every failure leaves the coordinator `Idle`.
    pub async fn start(&self, config: ScanConfig) -> Result<(), ScanError> {
        let mut task = self.task.lock().await;
        let status = self.status();
        if status != ScanStatus::Idle {
            return Err(ScanError::InvalidTransition {
                action: "start",
                status,
            });
        }

        let range = self.inner.prepare(&config).await?;

        {
            let mut state = self.inner.state();
            state.mode = Some(config.mode);
            state.started_at = Some(Instant::now());
        }
        self.inner.transition(ScanStatus::Running);
        match range {
            Some(range) => info!(
                "Starting {} scan on {} over blocks {}..={}",
                config.mode, config.network, range.start, range.end
            ),
            None => info!("Starting {} scan on {}", config.mode, config.network),
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(inner.run(config, range)));
        Ok(())
    }

    /// Stop starting new blocks or batches. In-flight work completes.
    pub fn pause(&self) -> Result<(), ScanError> {
        self.inner
            .transition_from(ScanStatus::Running, ScanStatus::Paused, "pause")?;
        self.inner.pause_tx.send_replace(true);
        info!("Scan paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ScanError> {
        self.inner
            .transition_from(ScanStatus::Paused, ScanStatus::Running, "resume")?;
        self.inner.pause_tx.send_replace(false);
        info!("Scan resumed");
        Ok(())
    }

    /// End the scan: interrupt waits, let in-flight work finish, release the
    /// chain client and publish final statistics.
    ///
    /// Stopping an already stopped scan is a no-op.
    pub async fn stop(&self) -> Result<(), ScanError> {
        let mut task = self.task.lock().await;
        match self.status() {
            ScanStatus::Stopped => return Ok(()),
            ScanStatus::Idle => {
                return Err(ScanError::InvalidTransition {
                    action: "stop",
                    status: ScanStatus::Idle,
                })
            }
            ScanStatus::Running | ScanStatus::Paused => {}
        }

        // The scan task may have reached the end of its range concurrently
        let previous = self.inner.set_status(ScanStatus::Stopped);
        self.inner.cancel.cancel();
        // Closing the client ends pending retry backoffs inside the scan task
        self.inner.client.close();
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!("Scan task failed: {}", e);
            }
        }
        if let Some(from) = previous {
            info!("Scan on {} stopped", self.inner.client.network().name);
            self.inner.finish();
            self.inner.announce(from, ScanStatus::Stopped);
        }
        Ok(())
    }

    /// Resolve once the scan reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.status_tx.subscribe();
        // The sender lives in `inner`, so this only errors if it is dropped
        let _ = rx.wait_for(|s| *s == ScanStatus::Stopped).await;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ScanStats {
        let state = self.state();
        let elapsed = match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Default::default(),
        };
        ScanStats {
            status: state.status,
            network: self.client.network().name.clone(),
            mode: state.mode,
            blocks_processed: state.blocks_processed,
            contracts_found: state.contracts_found,
            error_count: state.error_count,
            skipped_transactions: state.skipped_transactions,
            batches_completed: state.batches_completed,
            current_block: state.current_block,
            checkpoint: state.checkpoint,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn emit(&self, event: ScanEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_stats(&self) {
        self.emit(ScanEvent::StatsUpdated(self.snapshot()));
    }

    /// Record a new status without announcing it. Returns the previous
    /// status, or `None` when already in `to`.
    fn set_status(&self, to: ScanStatus) -> Option<ScanStatus> {
        let mut state = self.state();
        let from = state.status;
        if from == to {
            return None;
        }
        state.status = to;
        if to == ScanStatus::Stopped {
            state.finished_at = Some(Instant::now());
        }
        Some(from)
    }

    /// Publish a status change to event subscribers and `wait_stopped` callers.
    fn announce(&self, from: ScanStatus, to: ScanStatus) {
        debug!("Scan status {} -> {}", from, to);
        self.emit(ScanEvent::StatusChanged { from, to });
        self.status_tx.send_replace(to);
    }

    fn transition(&self, to: ScanStatus) {
        if let Some(from) = self.set_status(to) {
            self.announce(from, to);
        }
    }

    fn transition_from(
        &self,
        expected: ScanStatus,
        to: ScanStatus,
        action: &'static str,
    ) -> Result<(), ScanError> {
        {
            let mut state = self.state();
            if state.status != expected {
                return Err(ScanError::InvalidTransition {
                    action,
                    status: state.status,
                });
            }
            state.status = to;
        }
        self.announce(expected, to);
        Ok(())
    }

    fn record_errors(&self, count: u64) {
        if count > 0 {
            self.state().error_count += count;
        }
    }

    /// Every check that must pass before the scan leaves `Idle`.
    async fn prepare(&self, config: &ScanConfig) -> Result<Option<BlockRange>, ScanError> {
        config.validate()?;

        let network = self.client.network();
        if config.network != network.name {
            return Err(ScanError::NetworkMismatch {
                requested: config.network.clone(),
                bound: network.name.clone(),
            });
        }

        self.client.set_max_retries(config.max_retries);
        verify_chain_id(self.client.as_ref()).await?;

        if !config.mode.has_range() {
            return Ok(None);
        }

        let latest = self
            .client
            .latest_block_number()
            .await
            .map_err(|source| ScanError::Connect {
                network: network.name.clone(),
                source,
            })?;
        let (start, end) = config.resolve_range(latest);
        if start > end {
            return Err(ScanError::InvalidRange { start, end });
        }

        let checkpoint = self
            .checkpoints
            .get_checkpoint(&network.name, config.mode)
            .map_err(|source| ScanError::Checkpoint {
                network: network.name.clone(),
                mode: config.mode,
                source,
            })?;
        let effective_start = checkpoint.map_or(start, |cp| start.max(cp.saturating_add(1)));

        let caught_up = effective_start > end;
        if caught_up && config.mode != ScanMode::Both {
            return Err(ScanError::InvalidRange {
                start: effective_start,
                end,
            });
        }
        self.state().checkpoint = checkpoint;
        if caught_up {
            // Go straight to realtime
            info!(
                "Checkpoint {} already covers {}..={}, skipping catch-up",
                effective_start - 1,
                start,
                end
            );
            return Ok(None);
        }
        if effective_start != start {
            info!("Resuming from checkpoint at block {}", effective_start);
        }

        Ok(Some(BlockRange {
            start: effective_start,
            end,
        }))
    }

    async fn run(self: Arc<Self>, config: ScanConfig, range: Option<BlockRange>) {
        let detector = Arc::new(
            ContractDetector::new(self.client.clone()).with_analysis(config.analyze_bytecode),
        );

        let mut gap_free = true;
        if let Some(range) = range {
            gap_free = self.run_historical(&detector, &config, range).await;
        }
        if config.mode != ScanMode::Historical && !self.cancel.is_cancelled() {
            if !gap_free {
                warn!(
                    "Catch-up left a gap; realtime blocks will not advance the {} checkpoint",
                    config.mode
                );
            }
            self.run_realtime(detector, config.mode, gap_free).await;
        }

        if let Some(from) = self.set_status(ScanStatus::Stopped) {
            info!("Scan on {} finished", self.client.network().name);
            self.finish();
            self.announce(from, ScanStatus::Stopped);
        }
    }

    /// Release the client and publish final stats.
    fn finish(&self) {
        self.client.close();
        let stats = self.snapshot();
        info!(
            "Final stats: {} blocks, {} contracts, {} errors in {} ms",
            stats.blocks_processed, stats.contracts_found, stats.error_count, stats.elapsed_ms
        );
        self.emit(ScanEvent::StatsUpdated(stats));
    }

    /// Block while paused. Returns false once the scan is cancelled.
    async fn wait_while_paused(&self, pause_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*pause_rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Scan `range` in batches. Returns false when some block was left
    /// incomplete, in which case the checkpoint stops at the first gap.
    async fn run_historical(
        &self,
        detector: &ContractDetector,
        config: &ScanConfig,
        range: BlockRange,
    ) -> bool {
        let network = self.client.network().name.clone();
        let mut pause_rx = self.pause_tx.subscribe();
        // Cleared at the first incomplete block; the checkpoint then holds for this pass
        let mut contiguous = true;
        let mut batch_start = range.start;

        while batch_start <= range.end {
            if !self.wait_while_paused(&mut pause_rx).await {
                return contiguous;
            }

            let batch_end = batch_start
                .saturating_add(config.batch_size - 1)
                .min(range.end);
            debug!("Fetching batch {}..={}", batch_start, batch_end);

            let blocks = self.client.blocks(batch_start, batch_end).await;
            let expected = batch_end - batch_start + 1;
            let missing = expected - blocks.len() as u64;
            if missing > 0 {
                warn!(
                    "{} of {} blocks in {}..={} could not be fetched",
                    missing, expected, batch_start, batch_end
                );
                self.record_errors(missing);
            }

            let outcomes = join_all(blocks.iter().map(|b| self.process_block(detector, b))).await;

            if contiguous {
                let mut next = batch_start;
                for (block, outcome) in blocks.iter().zip(&outcomes) {
                    if block.number != next || !outcome.complete {
                        break;
                    }
                    next += 1;
                }
                if next > batch_start {
                    self.advance_checkpoint(&network, config.mode, next - 1);
                }
                if next <= batch_end {
                    contiguous = false;
                    warn!(
                        "Block {} incomplete, holding checkpoint for the rest of this pass",
                        next
                    );
                }
            }

            self.state().batches_completed += 1;
            self.emit_stats();

            if batch_end >= range.end {
                break;
            }
            batch_start = batch_end + 1;

            let delay = config.batch_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return contiguous,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!("Historical range {}..={} exhausted", range.start, range.end);
        contiguous
    }

    /// Follow new heads. With `advance` unset, blocks are recorded but the
    /// checkpoint is left where the catch-up pass held it.
    async fn run_realtime(
        self: &Arc<Self>,
        detector: Arc<ContractDetector>,
        mode: ScanMode,
        advance: bool,
    ) {
        let network = self.client.network().name.clone();
        let mut subscription = match self.client.subscribe().await {
            Ok(subscription) => subscription,
            Err(RpcError::Cancelled) => return,
            Err(e) => {
                error!("Failed to subscribe to new blocks on {}: {}", network, e);
                self.record_errors(1);
                return;
            }
        };
        info!("Listening for new blocks on {}", network);

        let mut pause_rx = self.pause_tx.subscribe();
        let mut in_flight = JoinSet::new();
        loop {
            if !self.wait_while_paused(&mut pause_rx).await {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = pause_rx.changed() => continue,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Block task failed: {}", e);
                        self.record_errors(1);
                    }
                }
                block = subscription.next() => {
                    let Some(block) = block else {
                        warn!("Block subscription on {} ended", network);
                        break;
                    };
                    let inner = self.clone();
                    let detector = detector.clone();
                    let network = network.clone();
                    // Blocks may complete out of order; the checkpoint keeps the maximum
                    in_flight.spawn(async move {
                        let outcome = inner.process_block(&detector, &block).await;
                        if advance && outcome.complete {
                            inner.advance_checkpoint(&network, mode, block.number);
                        }
                        inner.emit_stats();
                    });
                }
            }
        }

        subscription.cancel();
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Block task failed: {}", e);
                self.record_errors(1);
            }
        }
    }

    /// Detect, persist and count one block.
    async fn process_block(&self, detector: &ContractDetector, block: &BlockView) -> BlockOutcome {
        let detection = detector.detect_contracts(block).await;

        let mut persisted = Vec::with_capacity(detection.records.len());
        let mut write_errors = 0u64;
        for record in detection.records {
            match self.sink.upsert_contract(&record) {
                Ok(()) => persisted.push(record),
                Err(e) => {
                    error!(
                        "Failed to persist contract {} from block {}: {:#}",
                        record.address_hex(),
                        block.number,
                        e
                    );
                    write_errors += 1;
                }
            }
        }
        for analysis in &detection.analyses {
            if let Err(e) = self.sink.upsert_analysis(analysis) {
                error!(
                    "Failed to persist analysis for 0x{:x}: {:#}",
                    analysis.address, e
                );
                write_errors += 1;
            }
        }

        {
            let mut state = self.state();
            state.blocks_processed += 1;
            state.contracts_found += persisted.len() as u64;
            state.error_count += detection.failures + write_errors;
            state.skipped_transactions += detection.skipped;
            state.current_block = Some(state.current_block.map_or(block.number, |c| c.max(block.number)));
        }

        for record in persisted {
            info!(
                "Contract {} deployed in block {} ({})",
                record.address_hex(),
                record.block_number,
                record.kind
            );
            self.emit(ScanEvent::ContractDetected(record));
        }

        BlockOutcome {
            complete: detection.failures == 0 && write_errors == 0,
        }
    }

    fn advance_checkpoint(&self, network: &str, mode: ScanMode, block: u64) {
        match self.checkpoints.set_checkpoint(network, mode, block) {
            Ok(true) => {
                let mut state = self.state();
                state.checkpoint = Some(state.checkpoint.map_or(block, |c| c.max(block)));
            }
            Ok(false) => {}
            Err(e) => {
                error!("Failed to write checkpoint {} for {}: {:#}", block, network, e);
                self.record_errors(1);
            }
        }
    }
}
