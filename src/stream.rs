//! Streaming manager: orchestrates per-LOD generation tasks, emits results
//! as they complete, and cancels superseded work (§4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, Stream, StreamExt};
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;

use crate::atlas::AtlasRegion;
use crate::error::ProcessError;
use crate::photo::LodLevel;

/// Grace period after cancelling an in-flight task for an LOD, giving it a
/// chance to observe cancellation before new work targeting the same LOD
/// is launched (§4.2 "Cancellation").
pub const CANCELLATION_GRACE: Duration = Duration::from_millis(16);

/// A single emitted event on the atlas stream.
#[derive(Debug, Clone)]
pub enum AtlasStreamResult {
    Loading {
        sequence: u64,
        lod: Option<LodLevel>,
        message: String,
    },
    Progress {
        sequence: u64,
        lod: LodLevel,
        message: String,
        progress: f32,
    },
    LodReady {
        sequence: u64,
        lod: LodLevel,
        atlas_count: usize,
        regions: Vec<AtlasRegion>,
        elapsed_ms: u64,
        reason: &'static str,
    },
    LodFailed {
        sequence: u64,
        lod: LodLevel,
        error: String,
        retryable: bool,
    },
    AtlasRemoved {
        sequence: u64,
        lod: LodLevel,
        reason: &'static str,
        removed_count: usize,
    },
}

impl AtlasStreamResult {
    pub fn sequence(&self) -> u64 {
        match self {
            AtlasStreamResult::Loading { sequence, .. }
            | AtlasStreamResult::Progress { sequence, .. }
            | AtlasStreamResult::LodReady { sequence, .. }
            | AtlasStreamResult::LodFailed { sequence, .. }
            | AtlasStreamResult::AtlasRemoved { sequence, .. } => *sequence,
        }
    }

    fn lod(&self) -> Option<LodLevel> {
        match self {
            AtlasStreamResult::Loading { lod, .. } => *lod,
            AtlasStreamResult::Progress { lod, .. }
            | AtlasStreamResult::LodReady { lod, .. }
            | AtlasStreamResult::LodFailed { lod, .. }
            | AtlasStreamResult::AtlasRemoved { lod, .. } => Some(*lod),
        }
    }

    fn variant_tag(&self) -> u8 {
        match self {
            AtlasStreamResult::Loading { .. } => 0,
            AtlasStreamResult::Progress { .. } => 1,
            AtlasStreamResult::LodReady { .. } => 2,
            AtlasStreamResult::LodFailed { .. } => 3,
            AtlasStreamResult::AtlasRemoved { .. } => 4,
        }
    }
}

struct ActiveJob {
    cancel: Arc<Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

/// A cooperative cancellation token: tasks poll [`CancellationToken::is_cancelled`]
/// at every suspension point (§5).
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Orchestrates in-flight per-LOD build tasks, their cancellation, and a
/// deduplicated, sequence-ordered broadcast of [`AtlasStreamResult`]s.
pub struct StreamingManager {
    sequence: AtomicU64,
    active_jobs: Mutex<HashMap<LodLevel, ActiveJob>>,
    seen: Mutex<Vec<(u64, u8, Option<LodLevel>)>>,
    sender: broadcast::Sender<AtlasStreamResult>,
    last_emitted: Mutex<Option<AtlasStreamResult>>,
}

impl StreamingManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);

        StreamingManager {
            sequence: AtomicU64::new(1),
            active_jobs: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
            sender,
            last_emitted: Mutex::new(None),
        }
    }

    /// The next monotonically increasing sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh raw subscription, with no replay of prior events.
    pub fn subscribe(&self) -> broadcast::Receiver<AtlasStreamResult> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> Option<AtlasStreamResult> {
        self.last_emitted.lock().clone()
    }

    /// The `AtlasStream` contract (§6): cold on first subscription, the
    /// replayed latest value (if any) arrives before subsequent live
    /// events.
    pub fn stream(&self) -> impl Stream<Item = AtlasStreamResult> + Send + 'static {
        let replay = stream::iter(self.latest());
        let live = BroadcastStream::new(self.subscribe()).filter_map(|item| async move { item.ok() });
        replay.chain(live)
    }

    /// Cancels any in-flight task previously assigned to `lod`, then waits
    /// the cancellation grace period before returning a fresh token for the
    /// new task (§4.2 "Cancellation").
    pub async fn begin_task(&self, lod: LodLevel) -> CancellationToken {
        let previous = {
            let mut jobs = self.active_jobs.lock();

            let previous = jobs.remove(&lod);
            let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let notify = Arc::new(Notify::new());

            jobs.insert(
                lod,
                ActiveJob {
                    cancel: notify.clone(),
                    cancelled: cancelled.clone(),
                },
            );

            previous
        };

        if let Some(previous) = previous {
            previous.cancelled.store(true, Ordering::Release);
            previous.cancel.notify_waiters();
            debug!("cancelled in-flight task for {:?}, waiting grace period", lod);
            tokio::time::sleep(CANCELLATION_GRACE).await;
        }

        let jobs = self.active_jobs.lock();
        let job = jobs.get(&lod).expect("just inserted");
        CancellationToken {
            cancelled: job.cancelled.clone(),
            notify: job.cancel.clone(),
        }
    }

    /// Clears the active-job entry for `lod` once its task has finished
    /// (successfully, by failure, or by cancellation).
    pub fn finish_task(&self, lod: LodLevel) {
        self.active_jobs.lock().remove(&lod);
    }

    /// Emits `result`, applying the `(sequence, variant, lod)` distinctness
    /// filter and dropping any emission with `sequence == 0` (§4.2
    /// "Ordering guarantees").
    pub fn emit(&self, result: AtlasStreamResult) {
        if result.sequence() == 0 {
            return;
        }

        let key = (result.sequence(), result.variant_tag(), result.lod());

        {
            let mut seen = self.seen.lock();
            if seen.contains(&key) {
                return;
            }
            seen.push(key);
            if seen.len() > 4096 {
                seen.remove(0);
            }
        }

        *self.last_emitted.lock() = Some(result.clone());
        let _ = self.sender.send(result);
    }

    /// If a persistent cache already exists, synthesizes an immediate
    /// `LodReady` for L0 under `sequence`, before any other LOD task is
    /// launched — the "zero-wait" fallback guarantee (§4.2).
    pub fn emit_persistent_cache_fallback(&self, sequence: u64, regions: Vec<AtlasRegion>) {
        info!("zero-wait fallback: emitting persistent cache for sequence {sequence}");
        self.emit(AtlasStreamResult::LodReady {
            sequence,
            lod: LodLevel::L0,
            atlas_count: 1,
            regions,
            elapsed_ms: 0,
            reason: "persistent cache zero-wait fallback",
        });
    }
}

impl Default for StreamingManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a per-photo processing error into whether the overall LOD
/// build should be considered cancelled (silently discarded, per §7).
pub fn is_cancellation(error: &ProcessError) -> bool {
    matches!(error, ProcessError::Cancelled)
}

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
