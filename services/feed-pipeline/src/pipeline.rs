//! Pipeline assembly
//!
//! Wires the gateway, lane workers, recovery, dispatch, and sink into a
//! running service. Each lane worker exclusively owns the validation
//! and candle state for its hashed symbol subset, so the hot path takes
//! no per-symbol locks. Data flows one direction:
//!
//! ```text
//! Feed adapters
//!      │
//!  ┌───▼────┐   seq stream   ┌──────────┐
//!  │Gateway │ ─────────────► │ Recovery │──► sink range reads
//!  └───┬────┘                └─────┬────┘
//!      │ lanes                     │ replay batches
//!  ┌───▼──────────────────────────▼───┐
//!  │ Lane workers: validate → cache + │
//!  │ candles → dispatch → sink        │
//!  └───┬──────────────────────────────┘
//!      │ per-session queues
//!  ┌───▼────────┐
//!  │ WS clients │
//!  └────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::Symbol;

use crate::cache::{CacheLayer, SharedTier};
use crate::candles::{Candle, SymbolCandles};
use crate::config::{CandleConfig, PipelineConfig, ValidatorConfig};
use crate::dispatch::Dispatcher;
use crate::events::RawRecord;
use crate::ingestion::{IngestOutcome, IngestionGateway, LaneMessage, SeqObservation};
use crate::metrics::PipelineMetrics;
use crate::protocol::ServerMessage;
use crate::recovery::{fetch_backfill, RecoveryMonitor};
use crate::sink::{PersistenceSink, SinkWriter};
use crate::subscriptions::{MessageKind, SubscriptionRegistry};
use crate::validation::SymbolValidator;

/// Current wall clock in Unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A running pipeline instance and its task handles.
pub struct Pipeline {
    gateway: Arc<IngestionGateway>,
    cache: Arc<CacheLayer>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<PipelineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    sink_handle: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn all pipeline tasks. Must run inside a tokio runtime.
    pub fn start(
        config: PipelineConfig,
        sink: Arc<dyn PersistenceSink>,
        shared_tier: Option<Arc<dyn SharedTier>>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.dispatch.clone(),
            metrics.clone(),
        ));

        let mut cache = CacheLayer::new(config.cache.clone(), metrics.clone());
        if let Some(tier) = shared_tier {
            cache = cache.with_shared_tier(tier);
        }
        let cache = Arc::new(cache);

        let (sink_writer, sink_handle) =
            SinkWriter::spawn(sink.clone(), config.sink.clone(), metrics.clone());
        let sink_writer = Arc::new(sink_writer);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let context = Arc::new(LaneContext {
            validator_config: config.validator.clone(),
            candle_config: config.candles.clone(),
            cache: cache.clone(),
            dispatcher: dispatcher.clone(),
            metrics: metrics.clone(),
            sink_writer,
        });

        let mut lane_senders = Vec::with_capacity(config.gateway.lanes);
        let mut workers = Vec::with_capacity(config.gateway.lanes);
        for lane in 0..config.gateway.lanes {
            let (tx, rx) = mpsc::channel(config.gateway.lane_capacity);
            lane_senders.push(tx);
            workers.push(tokio::spawn(lane_worker(
                lane,
                rx,
                shutdown_rx.clone(),
                context.clone(),
            )));
        }

        let (seq_tx, seq_rx) = mpsc::channel(8_192);
        let gateway = Arc::new(IngestionGateway::new(
            lane_senders,
            seq_tx,
            config.gateway.clone(),
            metrics.clone(),
        ));

        let mut background = Vec::new();
        background.push(tokio::spawn(recovery_task(
            seq_rx,
            gateway.clone(),
            sink,
            config.recovery.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        )));
        background.push(tokio::spawn(housekeeping_task(
            gateway.clone(),
            dispatcher.clone(),
            shutdown_rx,
        )));

        info!(lanes = config.gateway.lanes, "Pipeline started");

        Self {
            gateway,
            cache,
            dispatcher,
            registry,
            metrics,
            shutdown_tx,
            workers,
            background,
            sink_handle,
        }
    }

    /// Offer one raw record from a feed source.
    pub fn ingest(&self, source: &str, record: RawRecord) -> IngestOutcome {
        self.gateway.ingest(source, record, now_nanos())
    }

    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Graceful shutdown: lane workers drain their queues, the sink
    /// writer flushes pending writes, background tasks stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            let _ = handle.await;
        }
        for handle in self.background {
            handle.abort();
        }
        drop(self.gateway);
        // With the workers gone the writer's senders are dropped; it
        // drains its queue and exits on its own.
        let _ = self.sink_handle.await;
        info!("Pipeline stopped");
    }

    /// Forced shutdown: abort everything, in-flight records included.
    pub fn shutdown_forced(self) {
        for handle in self
            .workers
            .iter()
            .chain(self.background.iter())
            .chain(std::iter::once(&self.sink_handle))
        {
            handle.abort();
        }
        info!("Pipeline aborted");
    }
}

/// Shared read-only context for lane workers.
struct LaneContext {
    validator_config: ValidatorConfig,
    candle_config: CandleConfig,
    cache: Arc<CacheLayer>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<PipelineMetrics>,
    sink_writer: Arc<SinkWriter>,
}

/// Per-symbol state owned by exactly one lane worker.
struct LaneState {
    validator: SymbolValidator,
    candles: SymbolCandles,
    reported_late: u64,
}

impl LaneState {
    fn new(symbol: &Symbol, context: &LaneContext) -> Self {
        Self {
            validator: SymbolValidator::new(),
            candles: SymbolCandles::new(
                symbol.clone(),
                &context.candle_config.intervals,
                context.candle_config.max_history,
            ),
            reported_late: 0,
        }
    }

    fn sync_late_counter(&mut self, metrics: &PipelineMetrics) {
        let late = self.candles.late_data();
        if late > self.reported_late {
            metrics
                .late_data
                .fetch_add(late - self.reported_late, Ordering::Relaxed);
            self.reported_late = late;
        }
    }
}

async fn lane_worker(
    lane: usize,
    mut rx: mpsc::Receiver<LaneMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    context: Arc<LaneContext>,
) {
    let mut states: HashMap<Symbol, LaneState> = HashMap::new();
    debug!(lane, "Lane worker started");

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(message) => handle_lane_message(message, &mut states, &context).await,
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    // Drain in-flight records before stopping.
                    while let Ok(message) = rx.try_recv() {
                        handle_lane_message(message, &mut states, &context).await;
                    }
                    break;
                }
            }
        }
    }

    debug!(lane, "Lane worker stopped");
}

async fn handle_lane_message(
    message: LaneMessage,
    states: &mut HashMap<Symbol, LaneState>,
    context: &LaneContext,
) {
    match message {
        LaneMessage::Live(symbol, record) => {
            process_live(symbol, record, states, context).await;
        }
        LaneMessage::Replay(symbol, records) => {
            process_replay(symbol, records, states, context);
        }
        LaneMessage::Flush(now) => {
            for (symbol, state) in states.iter_mut() {
                for candle in state.candles.flush_elapsed(now) {
                    emit_candle(symbol, candle, context, now);
                }
            }
        }
    }
}

async fn process_live(
    symbol: Symbol,
    record: crate::events::IngressRecord,
    states: &mut HashMap<Symbol, LaneState>,
    context: &LaneContext,
) {
    let started = Instant::now();
    let state = states
        .entry(symbol.clone())
        .or_insert_with(|| LaneState::new(&symbol, context));

    let tick = match state
        .validator
        .validate(&symbol, &record, &context.validator_config)
    {
        Ok(tick) => tick,
        Err(reason) => {
            context.metrics.record_rejection(&symbol, reason);
            return;
        }
    };

    let now = record.arrival_time;

    context.cache.insert(tick.clone());
    context.cache.write_through(&symbol, now).await;

    let emitted = state.candles.process_tick(&tick);
    state.sync_late_counter(&context.metrics);

    let payload = ServerMessage::Tick(tick.clone()).to_json();
    context
        .dispatcher
        .publish(&symbol, MessageKind::Tick, &payload, now);

    if let Some(depth) = tick.depth_snapshot() {
        let payload = ServerMessage::Depth(depth).to_json();
        context
            .dispatcher
            .publish(&symbol, MessageKind::Depth, &payload, now);
    }

    for candle in emitted {
        emit_candle(&symbol, candle, context, now);
    }

    context.sink_writer.store_tick(tick);
    context
        .metrics
        .record_accepted(started.elapsed().as_nanos() as u64);
}

/// Replay batches update aggregation via reconciliation: the affected
/// buckets are recomputed from the union of the cached window and the
/// replayed ticks, and corrected candles are re-emitted. Replayed ticks
/// enter the hot ring (they arrived now; later reconciles must see
/// them) but are not re-published on the live tick stream.
fn process_replay(
    symbol: Symbol,
    records: Vec<crate::events::IngressRecord>,
    states: &mut HashMap<Symbol, LaneState>,
    context: &LaneContext,
) {
    let state = states
        .entry(symbol.clone())
        .or_insert_with(|| LaneState::new(&symbol, context));

    let now = records.last().map(|r| r.arrival_time).unwrap_or_else(now_nanos);
    let mut accepted = Vec::new();
    for record in &records {
        match state
            .validator
            .validate(&symbol, record, &context.validator_config)
        {
            Ok(tick) => accepted.push(tick),
            Err(reason) => context.metrics.record_rejection(&symbol, reason),
        }
    }

    if accepted.is_empty() {
        return;
    }
    context
        .metrics
        .events_replayed
        .fetch_add(accepted.len() as u64, Ordering::Relaxed);

    for tick in &accepted {
        context.sink_writer.store_tick(tick.clone());
        context.cache.insert(tick.clone());
    }

    let union = context.cache.get_recent(&symbol, usize::MAX);
    let corrected = state.candles.reconcile(&union);
    debug!(
        symbol = %symbol,
        corrected = corrected.len(),
        "Replay reconciled"
    );
    for candle in corrected {
        emit_candle(&symbol, candle, context, now);
    }
}

fn emit_candle(symbol: &Symbol, candle: Candle, context: &LaneContext, now: i64) {
    context.metrics.candles_emitted.fetch_add(1, Ordering::Relaxed);
    let payload = ServerMessage::Kline(candle.clone()).to_json();
    context
        .dispatcher
        .publish(symbol, MessageKind::Kline, &payload, now);
    context.sink_writer.store_candle(candle);
}

/// Watches the sequence stream and source liveness; runs bounded
/// backfills through the sink and injects them as replay batches.
async fn recovery_task(
    mut seq_rx: mpsc::Receiver<SeqObservation>,
    gateway: Arc<IngestionGateway>,
    sink: Arc<dyn PersistenceSink>,
    config: crate::config::RecoveryConfig,
    metrics: Arc<PipelineMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut monitor = RecoveryMonitor::new();
    let mut liveness = tokio::time::interval(Duration::from_millis(500));
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = seq_rx.recv() => match maybe {
                Some(obs) => {
                    if let Some(request) = monitor.observe(&obs) {
                        metrics.gaps_detected.fetch_add(1, Ordering::Relaxed);
                        run_backfill(
                            &gateway,
                            &sink,
                            &request.symbol,
                            request.detected_at,
                            &config,
                            &metrics,
                        )
                        .await;
                    }
                }
                None => break,
            },
            _ = liveness.tick() => {
                let now = now_nanos();
                for source in gateway.take_stale_sources(now) {
                    metrics.gaps_detected.fetch_add(1, Ordering::Relaxed);
                    for symbol in monitor.symbols_for(&source) {
                        run_backfill(&gateway, &sink, &symbol, now, &config, &metrics).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_backfill(
    gateway: &Arc<IngestionGateway>,
    sink: &Arc<dyn PersistenceSink>,
    symbol: &Symbol,
    detected_at: i64,
    config: &crate::config::RecoveryConfig,
    metrics: &Arc<PipelineMetrics>,
) {
    match fetch_backfill(sink, symbol, detected_at, config).await {
        Ok(records) if records.is_empty() => {
            // Sink reachable but the window holds nothing; the gap
            // stands until the feed re-delivers.
            metrics.unresolved_gaps.fetch_add(1, Ordering::Relaxed);
        }
        Ok(records) => {
            if gateway.inject_replay(symbol.clone(), records).await {
                metrics.backfills_completed.fetch_add(1, Ordering::Relaxed);
            } else {
                metrics.unresolved_gaps.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            metrics.unresolved_gaps.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %symbol, error = %err, "Backfill unavailable — continuing live");
        }
    }
}

/// Periodic duties: candle flush on elapsed windows and heartbeat
/// sweeps for dead sessions.
async fn housekeeping_task(
    gateway: Arc<IngestionGateway>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = now_nanos();
                gateway.broadcast_flush(now).await;
                dispatcher.sweep_stale(now);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
