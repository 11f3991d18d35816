//! Per-flow processing pipeline.
//!
//! Every intercepted datagram goes through the same chain:
//! 1. Parse (a failure rejects the flow but lets the traffic through)
//! 2. Queries: evaluate the block policy and remember the verdict
//! 3. Responses: look up the query's verdict and update the correlation cache
//! 4. Identify the originating process, off the verdict path
//! 5. Emit a [`FlowRecord`]
//!
//! Transports only see the [`TrafficDecision`]; everything else is recorded.
//! Once [`MonitorContext::shutdown`] has run, flows still in flight are
//! forwarded untouched and leave no state or records behind.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CorrelationCache;
use crate::dns::DnsMessage;
use crate::error::ParseErrorKind;
use crate::filter::{BlockMode, BlockPolicy, PolicyVerdict};
use crate::process::{ProcessCorrelator, ProcessIdentity};
use crate::record::{Direction, FlowRecord, RecordSink};
use crate::stats::{Stats, StatsSnapshot};

pub type FlowId = u64;

/// Who a flow belongs to, as known when it was intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowContext {
    pub id: FlowId,
    /// Originating pid, when the interception layer knows it.
    pub pid: Option<u32>,
    /// Client socket, used to find the pid when it is not known.
    pub client: Option<SocketAddr>,
}

/// One captured datagram.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub bytes: Vec<u8>,
    pub direction: Direction,
    pub flow: FlowContext,
}

/// What the interception layer must do with the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficDecision {
    /// Let the datagram continue to its destination.
    Forward,
    /// Do not forward; answer the client with these bytes instead.
    Respond(Vec<u8>),
    /// Do not forward and do not answer.
    Drop,
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache_capacity: usize,
    /// Maximum number of queries awaiting their response.
    pub pending_capacity: usize,
    pub identify_timeout: Duration,
    /// Process lookups allowed to run at once; flows beyond this get the pid only.
    pub max_concurrent_lookups: usize,
    pub block_mode: BlockMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            pending_capacity: 4096,
            identify_timeout: Duration::from_millis(250),
            max_concurrent_lookups: 16,
            block_mode: BlockMode::Respond,
        }
    }
}

/// Result of the synchronous part of the pipeline.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: TrafficDecision,
    pub draft: RecordDraft,
}

/// A flow record still missing its process identity.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    timestamp: SystemTime,
    flow: FlowContext,
    direction: Direction,
    message: Option<DnsMessage>,
    verdict: Option<PolicyVerdict>,
    error: Option<ParseErrorKind>,
}

impl RecordDraft {
    /// Attribute the flow to the owner found for the other half of its
    /// exchange. No socket lookup is made for this draft afterwards.
    pub fn attribute(&mut self, pid: Option<u32>) {
        self.flow.pid = pid;
        self.flow.client = None;
    }
}

struct Pending {
    generation: u64,
    verdict: PolicyVerdict,
}

#[derive(Default)]
struct TrackerState {
    entries: FxHashMap<(FlowId, u16), Pending>,
    /// Insertion order, for evicting the oldest queries first.
    order: VecDeque<((FlowId, u16), u64)>,
}

/// Verdicts of queries still waiting for their response.
///
/// Keyed by flow and transaction id. A reused id within one flow gets a new
/// generation, so the response always pairs with the latest query.
struct TransactionTracker {
    state: Mutex<TrackerState>,
    capacity: usize,
    generation: AtomicU64,
}

impl TransactionTracker {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            capacity: capacity.max(1),
            generation: AtomicU64::new(0),
        }
    }

    fn begin(&self, key: (FlowId, u16), verdict: PolicyVerdict) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let Ok(mut state) = self.state.lock() else {
            return generation;
        };

        while state.entries.len() >= self.capacity {
            let Some((old_key, old_generation)) = state.order.pop_front() else {
                break;
            };
            if state
                .entries
                .get(&old_key)
                .is_some_and(|p| p.generation == old_generation)
            {
                state.entries.remove(&old_key);
            }
        }

        state.order.push_back((key, generation));
        state.entries.insert(
            key,
            Pending {
                generation,
                verdict,
            },
        );
        generation
    }

    fn complete(&self, key: (FlowId, u16)) -> Option<(u64, PolicyVerdict)> {
        let mut state = self.state.lock().ok()?;
        let pending = state.entries.remove(&key)?;
        // Stale order entries are skipped on eviction; compact when they pile up.
        if state.order.len() > self.capacity * 2 {
            let TrackerState { entries, order } = &mut *state;
            order.retain(|(k, g)| entries.get(k).is_some_and(|p| p.generation == *g));
        }
        Some((pending.generation, pending.verdict))
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.order.clear();
        }
    }

    fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }
}

/// Process-wide state shared by every flow.
///
/// Built when the monitor starts and torn down with [`MonitorContext::shutdown`].
/// The block policy is read-only; the cache and the transaction trackers
/// synchronize internally.
pub struct MonitorContext {
    cache: CorrelationCache,
    policy: BlockPolicy,
    block_mode: BlockMode,
    /// Queries sent upstream.
    forwarded: TransactionTracker,
    /// Blocked queries, kept apart so they never evict forwarded ones.
    sunk: TransactionTracker,
    correlator: Arc<dyn ProcessCorrelator>,
    lookups: Arc<Semaphore>,
    sink: Arc<dyn RecordSink>,
    identify_timeout: Duration,
    stats: Stats,
    /// Read-held by every state write and emission; shutdown takes it to stop them.
    running: RwLock<bool>,
}

impl MonitorContext {
    pub fn new(
        config: &PipelineConfig,
        policy: BlockPolicy,
        correlator: Arc<dyn ProcessCorrelator>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            cache: CorrelationCache::new(config.cache_capacity),
            policy,
            block_mode: config.block_mode,
            forwarded: TransactionTracker::new(config.pending_capacity),
            sunk: TransactionTracker::new(config.pending_capacity),
            correlator,
            lookups: Arc::new(Semaphore::new(config.max_concurrent_lookups.max(1))),
            sink,
            identify_timeout: config.identify_timeout,
            stats: Stats::new(),
            running: RwLock::new(true),
        }
    }

    /// Run the verdict path for one datagram. Never blocks.
    pub fn evaluate(&self, packet: &RawPacket) -> Evaluation {
        let mut draft = RecordDraft {
            timestamp: SystemTime::now(),
            flow: packet.flow,
            direction: packet.direction,
            message: None,
            verdict: None,
            error: None,
        };

        let running = self.running.read();
        if !running.as_deref().is_ok_and(|r| *r) {
            return Evaluation {
                decision: TrafficDecision::Forward,
                draft,
            };
        }

        let message = match DnsMessage::parse(&packet.bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(flow = packet.flow.id, error = %e, "rejected malformed DNS packet");
                self.stats.record_rejected();
                draft.error = Some(e.kind());
                // Fail open: a packet we cannot read is never the reason traffic stops.
                return Evaluation {
                    decision: TrafficDecision::Forward,
                    draft,
                };
            }
        };

        let decision = match packet.direction {
            Direction::Query => {
                let (verdict, decision) = self.evaluate_query(packet.flow.id, &message);
                draft.verdict = Some(verdict);
                decision
            }
            Direction::Response => {
                draft.verdict = self.evaluate_response(packet.flow.id, &message);
                TrafficDecision::Forward
            }
        };
        draft.message = Some(message);

        Evaluation { decision, draft }
    }

    fn evaluate_query(
        &self,
        flow: FlowId,
        message: &DnsMessage,
    ) -> (PolicyVerdict, TrafficDecision) {
        let domain = message.question().map_or(".", |q| q.name.as_str());
        let verdict = self.policy.evaluate(domain);
        let blocked = verdict.is_blocked();
        self.stats.record_query(blocked);

        let key = (flow, message.header.id);
        let (tracker, superseded) = if blocked {
            (&self.sunk, &self.forwarded)
        } else {
            (&self.forwarded, &self.sunk)
        };
        superseded.complete(key);
        let generation = tracker.begin(key, verdict.clone());
        debug!(flow, id = message.header.id, generation, domain, blocked, "query evaluated");

        let decision = match (blocked, self.block_mode) {
            (false, _) => TrafficDecision::Forward,
            (true, BlockMode::Respond) => {
                TrafficDecision::Respond(message.blocked_response().to_bytes())
            }
            (true, BlockMode::Drop) => TrafficDecision::Drop,
        };

        (verdict, decision)
    }

    fn evaluate_response(&self, flow: FlowId, message: &DnsMessage) -> Option<PolicyVerdict> {
        let key = (flow, message.header.id);
        let tracked = self
            .forwarded
            .complete(key)
            .or_else(|| self.sunk.complete(key));
        self.stats.record_response(tracked.is_some());

        let verdict = match tracked {
            Some((generation, verdict)) => {
                debug!(flow, id = message.header.id, generation, "response matched query");
                Some(verdict)
            }
            None => {
                debug!(flow, id = message.header.id, "unattributed response");
                None
            }
        };

        if verdict.as_ref().is_some_and(PolicyVerdict::is_blocked) {
            debug!(flow, id = message.header.id, "skipping cache for blocked query");
            return verdict;
        }

        for (owner, ip) in message.answer_addresses() {
            let domain = message.question().map_or(owner, |q| q.name.as_str());
            self.cache.record_answer(ip, domain.trim_end_matches('.'));
        }

        verdict
    }

    /// Resolve the originating process, bounded by the identification timeout.
    ///
    /// Lookups run on the blocking pool, at most `max_concurrent_lookups` at
    /// a time. A lookup that outlives the timeout is abandoned but keeps its
    /// slot until it finishes; with no slot free, only the pid (if known) is
    /// reported.
    pub async fn identify(&self, flow: FlowContext) -> Option<ProcessIdentity> {
        if flow.pid.is_none() && flow.client.is_none() {
            return None;
        }

        let Ok(permit) = self.lookups.clone().try_acquire_owned() else {
            debug!(flow = flow.id, "process lookups saturated, reporting pid only");
            return flow.pid.map(ProcessIdentity::unresolved);
        };

        let correlator = self.correlator.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let pid = flow
                .pid
                .or_else(|| flow.client.and_then(|addr| correlator.socket_owner(addr)))?;
            let identity = match correlator.identify(pid) {
                Ok(identity) => {
                    if let Err(e) = identity.completeness() {
                        debug!(error = %e, "process identity incomplete");
                    }
                    identity
                }
                Err(e) => {
                    debug!(error = %e, "process lookup failed");
                    ProcessIdentity::unresolved(pid)
                }
            };
            Some(identity)
        });

        match tokio::time::timeout(self.identify_timeout, lookup).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                warn!(flow = flow.id, error = %e, "process lookup task failed");
                flow.pid.map(ProcessIdentity::unresolved)
            }
            Err(_) => {
                debug!(flow = flow.id, "process lookup timed out");
                flow.pid.map(ProcessIdentity::unresolved)
            }
        }
    }

    /// Finalize and emit a record. This is the pipeline's only output.
    ///
    /// Returns `None` once the context has been shut down.
    pub fn emit(
        &self,
        draft: RecordDraft,
        process: Option<ProcessIdentity>,
    ) -> Option<FlowRecord> {
        let running = self.running.read().ok()?;
        if !*running {
            return None;
        }

        let (id, question, answers) = match draft.message {
            Some(message) => (
                Some(message.header.id),
                message.questions.into_iter().next(),
                message.answers,
            ),
            None => (None, None, Vec::new()),
        };

        let record = FlowRecord {
            seq: self.stats.record_emitted(),
            timestamp: draft.timestamp,
            flow: draft.flow.id,
            direction: draft.direction,
            id,
            question,
            answers,
            process,
            verdict: draft.verdict,
            error: draft.error,
        };
        self.sink.emit(&record);
        Some(record)
    }

    /// Identify and emit an evaluated flow on its own task.
    ///
    /// The task yields the pid the flow was attributed to, so the other half
    /// of the exchange can reuse it through [`RecordDraft::attribute`].
    pub fn spawn_record(self: &Arc<Self>, draft: RecordDraft) -> JoinHandle<Option<u32>> {
        let context = self.clone();
        tokio::spawn(async move {
            let process = context.identify(draft.flow).await;
            let pid = process.as_ref().map(|p| p.pid);
            context.emit(draft, process);
            pid
        })
    }

    /// Evaluate a datagram and return its decision right away.
    ///
    /// Identification and emission continue on a spawned task.
    pub fn handle(self: &Arc<Self>, packet: &RawPacket) -> TrafficDecision {
        let Evaluation { decision, draft } = self.evaluate(packet);
        self.spawn_record(draft);
        decision
    }

    /// Run the whole pipeline for one datagram, waiting for its record.
    pub async fn process(&self, packet: &RawPacket) -> (TrafficDecision, Option<FlowRecord>) {
        let Evaluation { decision, draft } = self.evaluate(packet);
        let process = self.identify(draft.flow).await;
        (decision, self.emit(draft, process))
    }

    /// Domain that most recently resolved to `ip`, if still cached.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.cache.lookup(ip)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_len(&self) -> usize {
        self.forwarded.len() + self.sunk.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.policy.blocked_count()
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    pub fn emitted_total(&self) -> u64 {
        self.stats.emitted_total()
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_ok_and(|r| *r)
    }

    /// Stop accepting state writes and drop all per-run state. Called when
    /// the monitor stops; waits for writes already under way.
    pub fn shutdown(&self) {
        match self.running.write() {
            Ok(mut running) => *running = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
        self.cache.clear();
        self.forwarded.clear();
        self.sunk.clear();
    }
}
