//! The crawl state machine — the single consumer of subscription events.
//!
//! # Crawl phases
//! `Subscribing → Streaming`, with `Reconnecting` entered on disconnects,
//! source errors, and forced resubscribes. `Stopped` is terminal.
//!
//! # Block phases
//! Each height with activity gets a [`BlockState`]:
//! `Open → AwaitingWriteBarrier → Finalized`. Transaction writes for a block
//! run on blocking worker tasks; `block-done(H)` drains them (the write
//! barrier) before the block's file is sealed. Every finalized block is
//! reported to ingestion on an unbounded notice channel, so a stalled store
//! never holds up the crawl.
//!
//! # Retries
//! Failures are charged to the height the stream was on. Below the
//! threshold the machine resubscribes at the last confirmed height after a
//! backoff; once the threshold is reached the stuck height is skipped and
//! the machine resubscribes at the height after it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{IndexerError, Rejection};
use crate::event::{Envelope, Event, EventSink, StatusKind};
use crate::indexer::IndexerConfig;
use crate::ingest::BlockNotice;
use crate::retry::BackoffPolicy;
use crate::subscription::{Subscription, SubscriptionSource};
use crate::transform::TransactionTransformer;
use crate::writer::{BlockWriter, FinalizeOutcome};

/// Upper bound on queued transaction writes for one block before the
/// consumer waits for some to finish.
const MAX_PENDING_WRITES: usize = 64;

// ─── Phases ───────────────────────────────────────────────────────────────────

/// Connection-level state of the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Subscribing,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Lifecycle of one block's output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPhase {
    Open,
    AwaitingWriteBarrier,
    Finalized,
}

/// In-memory bookkeeping for a height with activity.
pub struct BlockState {
    pub height: u32,
    pub phase: BlockPhase,
    /// Transactions received for this height.
    pub tx_count: u64,
    /// Consecutive subscription failures charged to this height.
    pub retries: u32,
    pending: JoinSet<TxOutcome>,
}

impl BlockState {
    fn new(height: u32) -> Self {
        Self {
            height,
            phase: BlockPhase::Open,
            tx_count: 0,
            retries: 0,
            pending: JoinSet::new(),
        }
    }
}

/// How a crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Shut down on request (or the event queue closed).
    Stopped,
    /// The source signalled a reset (`block-done` at height 0).
    Reset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub transactions: u64,
    pub written: u64,
    /// Dropped for lacking `type`/`app`.
    pub filtered: u64,
    /// Malformed or invalid text.
    pub rejected: u64,
    /// Re-delivered into an already sealed block.
    pub duplicates: u64,
    pub mempool: u64,
    pub blocks_finalized: u64,
    pub empty_blocks: u64,
    pub skipped_blocks: u64,
    pub source_errors: u64,
    pub subscriptions: u64,
    /// Events discarded because they came from a superseded subscription.
    pub stale_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    pub outcome: CrawlOutcome,
    pub stats: CrawlStats,
    /// Height a new run should subscribe from.
    pub resume_height: u32,
}

// ─── Handle ───────────────────────────────────────────────────────────────────

enum Command {
    CancelAt(u32),
    Shutdown,
}

/// Control handle for a running [`CrawlStateMachine`].
#[derive(Clone)]
pub struct CrawlHandle {
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<CrawlPhase>,
}

impl CrawlHandle {
    /// Drop the current subscription and resubscribe at `height`.
    pub async fn cancel_at(&self, height: u32) -> Result<(), IndexerError> {
        self.commands
            .send(Command::CancelAt(height))
            .await
            .map_err(|_| IndexerError::Other("crawler is not running".into()))
    }

    /// Ask the crawler to stop. Returns immediately if it already has.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn phase(&self) -> CrawlPhase {
        *self.phase.borrow()
    }
}

// ─── State machine ────────────────────────────────────────────────────────────

enum Step {
    Continue,
    Resubscribe { from: u32, delay: Duration },
    Stop(CrawlOutcome),
}

enum Input {
    Command(Option<Command>),
    Event(Option<Envelope>),
}

enum TxOutcome {
    Written,
    Filtered,
    Rejected,
    Duplicate,
    Failed(IndexerError),
}

pub struct CrawlStateMachine {
    subscription_id: String,
    source: Arc<dyn SubscriptionSource>,
    transformer: Arc<TransactionTransformer>,
    writer: Arc<BlockWriter>,
    notices: mpsc::UnboundedSender<BlockNotice>,
    max_retries: u32,
    backoff: BackoffPolicy,

    blocks: BTreeMap<u32, BlockState>,
    /// Last confirmed height; reconnects subscribe from here.
    resume_height: u32,
    /// Height of the most recent event.
    current_height: u32,
    generation: u64,
    subscription: Option<Box<dyn Subscription>>,

    events_tx: mpsc::Sender<Envelope>,
    events: mpsc::Receiver<Envelope>,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    phase: watch::Sender<CrawlPhase>,
    stats: CrawlStats,
}

impl CrawlStateMachine {
    pub fn new(
        config: &IndexerConfig,
        source: Arc<dyn SubscriptionSource>,
        transformer: Arc<TransactionTransformer>,
        writer: Arc<BlockWriter>,
        notices: mpsc::UnboundedSender<BlockNotice>,
        start_height: u32,
    ) -> (Self, CrawlHandle) {
        let (events_tx, events) = mpsc::channel(config.event_queue_capacity.max(1));
        let (commands_tx, commands) = mpsc::channel(8);
        let (phase, phase_rx) = watch::channel(CrawlPhase::Subscribing);

        let machine = Self {
            subscription_id: config.subscription_id.clone(),
            source,
            transformer,
            writer,
            notices,
            max_retries: config.max_block_retries,
            backoff: BackoffPolicy::new(config.backoff.clone()),
            blocks: BTreeMap::new(),
            resume_height: start_height,
            current_height: start_height,
            generation: 0,
            subscription: None,
            events_tx,
            events,
            commands,
            commands_closed: false,
            phase,
            stats: CrawlStats::default(),
        };
        let handle = CrawlHandle {
            commands: commands_tx,
            phase: phase_rx,
        };
        (machine, handle)
    }

    /// Heights currently tracked (open or awaiting their barrier).
    pub fn open_blocks(&self) -> impl Iterator<Item = &BlockState> {
        self.blocks.values()
    }

    /// Subscribe and consume events until shutdown, reset, or a fatal error.
    pub async fn run(mut self) -> Result<CrawlSummary, IndexerError> {
        info!(
            subscription = %self.subscription_id,
            from = self.resume_height,
            "Crawler starting"
        );
        let result = self.drive().await;
        self.teardown().await;

        match result {
            Ok(outcome) => {
                info!(
                    ?outcome,
                    resume = self.resume_height,
                    blocks = self.stats.blocks_finalized,
                    written = self.stats.written,
                    "Crawler stopped"
                );
                Ok(CrawlSummary {
                    outcome,
                    stats: self.stats,
                    resume_height: self.resume_height,
                })
            }
            Err(e) => {
                error!(error = %e, "Crawler failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<CrawlOutcome, IndexerError> {
        let mut step = Step::Resubscribe {
            from: self.resume_height,
            delay: Duration::ZERO,
        };
        loop {
            step = match step {
                Step::Stop(outcome) => return Ok(outcome),
                Step::Resubscribe { from, delay } => self.resubscribe(from, delay).await?,
                Step::Continue => {
                    let input = tokio::select! {
                        biased;
                        cmd = self.commands.recv(), if !self.commands_closed => Input::Command(cmd),
                        env = self.events.recv() => Input::Event(env),
                    };
                    match input {
                        Input::Command(cmd) => self.on_command(cmd),
                        Input::Event(Some(env)) => self.on_envelope(env).await?,
                        Input::Event(None) => Step::Stop(CrawlOutcome::Stopped),
                    }
                }
            };
        }
    }

    fn on_command(&mut self, cmd: Option<Command>) -> Step {
        match cmd {
            None => {
                self.commands_closed = true;
                Step::Continue
            }
            Some(Command::Shutdown) => {
                info!("Crawler shutdown requested");
                Step::Stop(CrawlOutcome::Stopped)
            }
            Some(Command::CancelAt(height)) => {
                info!(height, "Forced resubscribe");
                self.resume_height = height;
                Step::Resubscribe {
                    from: height,
                    delay: Duration::ZERO,
                }
            }
        }
    }

    async fn on_envelope(&mut self, env: Envelope) -> Result<Step, IndexerError> {
        if env.generation != self.generation {
            self.stats.stale_events += 1;
            debug!(generation = env.generation, "discarding event from old subscription");
            return Ok(Step::Continue);
        }

        let step = match env.event {
            Event::Transaction {
                height,
                time,
                id,
                raw,
            } => {
                self.on_transaction(height, time, id, raw).await?;
                Step::Continue
            }
            Event::Mempool { id, .. } => {
                self.stats.mempool += 1;
                debug!(id = %id, "mempool transaction");
                Step::Continue
            }
            Event::Status { kind, height, tx_count } => match kind {
                StatusKind::Connected => {
                    info!(height, "Subscription connected");
                    if height > 0 {
                        self.current_height = height;
                    }
                    self.set_phase(CrawlPhase::Streaming);
                    Step::Continue
                }
                StatusKind::Waiting => {
                    debug!(height, "waiting for blocks");
                    Step::Continue
                }
                StatusKind::BlockDone if height == 0 => {
                    warn!("Source reset the subscription");
                    Step::Stop(CrawlOutcome::Reset)
                }
                StatusKind::BlockDone => {
                    self.on_block_done(height, tx_count).await?;
                    Step::Continue
                }
                StatusKind::Disconnected | StatusKind::Error => {
                    self.on_failure(Some(height), kind.to_string()).await?
                }
            },
            Event::SourceError { message } => self.on_failure(None, message).await?,
        };
        Ok(step)
    }

    async fn on_transaction(
        &mut self,
        height: u32,
        time: u32,
        id: String,
        raw: Vec<u8>,
    ) -> Result<(), IndexerError> {
        self.current_height = height;
        self.stats.transactions += 1;

        let state = self
            .blocks
            .entry(height)
            .or_insert_with(|| BlockState::new(height));
        state.tx_count += 1;

        while state.pending.len() >= MAX_PENDING_WRITES {
            match state.pending.join_next().await {
                Some(joined) => tally(&mut self.stats, joined)?,
                None => break,
            }
        }

        let transformer = Arc::clone(&self.transformer);
        let writer = Arc::clone(&self.writer);
        state
            .pending
            .spawn_blocking(move || write_transaction(&transformer, &writer, height, time, &id, &raw));
        Ok(())
    }

    async fn on_block_done(&mut self, height: u32, reported: Option<u64>) -> Result<(), IndexerError> {
        let mut state = self
            .blocks
            .remove(&height)
            .unwrap_or_else(|| BlockState::new(height));

        state.phase = BlockPhase::AwaitingWriteBarrier;
        drain(&mut state.pending, &mut self.stats).await?;

        self.notify(BlockNotice::Finalizing(height));
        match self.writer.finalize(height)? {
            FinalizeOutcome::Sealed(path) => {
                self.stats.blocks_finalized += 1;
                info!(
                    height,
                    txs = state.tx_count,
                    reported = ?reported,
                    path = %path.display(),
                    "Block finalized"
                );
            }
            FinalizeOutcome::Empty => {
                self.stats.empty_blocks += 1;
                debug!(height, txs = state.tx_count, "block produced no documents");
                self.notify(BlockNotice::Empty(height));
            }
        }
        state.phase = BlockPhase::Finalized;

        self.resume_height = self.resume_height.max(height);
        self.current_height = height;
        Ok(())
    }

    async fn on_failure(&mut self, height: Option<u32>, reason: String) -> Result<Step, IndexerError> {
        self.stats.source_errors += 1;
        let stuck = height
            .filter(|h| *h > 0)
            .unwrap_or_else(|| self.current_height.max(self.resume_height));

        let state = self
            .blocks
            .entry(stuck)
            .or_insert_with(|| BlockState::new(stuck));

        if state.retries < self.max_retries {
            state.retries += 1;
            let retries = state.retries;
            warn!(
                height = stuck,
                retries,
                max = self.max_retries,
                reason = %reason,
                resume = self.resume_height,
                "Subscription failed; resubscribing"
            );
            return Ok(Step::Resubscribe {
                from: self.resume_height,
                delay: self.backoff.next_delay(retries),
            });
        }

        warn!(
            height = stuck,
            retries = state.retries,
            reason = %reason,
            "Retries exhausted; skipping block"
        );
        if let Some(mut skipped) = self.blocks.remove(&stuck) {
            drain(&mut skipped.pending, &mut self.stats).await?;
        }
        if self.writer.discard(stuck)? {
            debug!(height = stuck, "partial block file removed");
        }
        self.stats.skipped_blocks += 1;
        self.resume_height = self.resume_height.max(stuck.saturating_add(1));
        Ok(Step::Resubscribe {
            from: self.resume_height,
            delay: self.backoff.next_delay(1),
        })
    }

    /// Tear down the current subscription and open a new one at `from`.
    async fn resubscribe(&mut self, from: u32, delay: Duration) -> Result<Step, IndexerError> {
        if self.subscription.is_some() {
            self.set_phase(CrawlPhase::Reconnecting);
            self.unsubscribe().await;
        }
        self.drain_all().await?;

        if let Some(step) = self.pause(delay).await {
            return Ok(step);
        }

        self.set_phase(CrawlPhase::Subscribing);
        let mut attempt = 0;
        loop {
            self.generation += 1;
            let sink = EventSink::new(self.generation, self.events_tx.clone());
            match self.source.subscribe(&self.subscription_id, from, sink).await {
                Ok(subscription) => {
                    self.subscription = Some(subscription);
                    self.stats.subscriptions += 1;
                    self.current_height = from;
                    info!(
                        from,
                        generation = self.generation,
                        "Subscribed"
                    );
                    return Ok(Step::Continue);
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff.next_delay(attempt);
                    warn!(from, attempt, error = %e, ?delay, "Subscribe failed");
                    if let Some(step) = self.pause(delay).await {
                        return Ok(step);
                    }
                }
            }
        }
    }

    /// Sleep for `delay` while still serving commands. Returns the step a
    /// command asked for, if any.
    async fn pause(&mut self, delay: Duration) -> Option<Step> {
        if delay.is_zero() {
            return None;
        }
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let cmd = tokio::select! {
                biased;
                cmd = self.commands.recv(), if !self.commands_closed => Some(cmd),
                _ = &mut sleep => None,
            };
            match cmd {
                None => return None,
                Some(cmd) => match self.on_command(cmd) {
                    Step::Continue => {}
                    step => return Some(step),
                },
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            if let Err(e) = subscription.unsubscribe().await {
                warn!(error = %e, "Unsubscribe failed");
            }
        }
    }

    async fn drain_all(&mut self) -> Result<(), IndexerError> {
        for state in self.blocks.values_mut() {
            drain(&mut state.pending, &mut self.stats).await?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.unsubscribe().await;
        if let Err(e) = self.drain_all().await {
            warn!(error = %e, "Pending writes failed during shutdown");
        }
        self.set_phase(CrawlPhase::Stopped);
    }

    fn set_phase(&self, phase: CrawlPhase) {
        self.phase.send_replace(phase);
    }

    fn notify(&self, notice: BlockNotice) {
        if self.notices.send(notice).is_err() {
            warn!(?notice, "ingestion is gone; progress not recorded");
        }
    }
}

/// Transform one transaction and append it to its block file.
fn write_transaction(
    transformer: &TransactionTransformer,
    writer: &BlockWriter,
    height: u32,
    time: u32,
    id: &str,
    raw: &[u8],
) -> TxOutcome {
    let doc = match transformer.transform(raw, height, time) {
        Ok(doc) => doc,
        Err(Rejection::MissingClassification(field)) => {
            debug!(height, id, field, "transaction not classified");
            return TxOutcome::Filtered;
        }
        Err(reason) => {
            warn!(height, id, reason = %reason, "Rejected transaction");
            return TxOutcome::Rejected;
        }
    };
    match writer.append(height, &doc) {
        Ok(()) => {
            debug!(height, id, collection = %doc.collection, "transaction written");
            TxOutcome::Written
        }
        Err(IndexerError::BlockFinalized { .. }) => {
            debug!(height, id, "block already sealed; duplicate delivery");
            TxOutcome::Duplicate
        }
        Err(e) => TxOutcome::Failed(e),
    }
}

async fn drain(pending: &mut JoinSet<TxOutcome>, stats: &mut CrawlStats) -> Result<(), IndexerError> {
    while let Some(joined) = pending.join_next().await {
        tally(stats, joined)?;
    }
    Ok(())
}

fn tally(
    stats: &mut CrawlStats,
    joined: Result<TxOutcome, tokio::task::JoinError>,
) -> Result<(), IndexerError> {
    match joined {
        Ok(TxOutcome::Written) => stats.written += 1,
        Ok(TxOutcome::Filtered) => stats.filtered += 1,
        Ok(TxOutcome::Rejected) => stats.rejected += 1,
        Ok(TxOutcome::Duplicate) => stats.duplicates += 1,
        Ok(TxOutcome::Failed(e)) if e.is_fatal() => return Err(e),
        Ok(TxOutcome::Failed(e)) => {
            stats.rejected += 1;
            warn!(error = %e, "Transaction write failed");
        }
        Err(e) => {
            stats.rejected += 1;
            warn!(error = %e, "Transaction write task failed");
        }
    }
    Ok(())
}
