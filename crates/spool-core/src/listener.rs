//! Listener: per-task-type engine running two polling loops against the
//! store.
//!
//! The store offers no subscriptions, so everything is polled:
//! - the **claim loop** queries for claimable records and races other
//!   listeners for leases;
//! - the **watch loop** re-fetches every held lease, relays external
//!   disable signals to the owning handle, and renews leases so legitimate
//!   in-progress work is not reclaimed.
//!
//! The loops share only the stop signal and the held-lease map. Stopping is
//! cooperative: in-flight handler invocations run to completion, and a
//! handler that never resolves simply lets its lease expire, which is the
//! same recovery path as a process crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::{OwnerId, TaskId, TaskRecord, TaskStatus, TaskType};
use crate::error::SpoolError;
use crate::lease::{ClaimOutcome, FinishOutcome, LeaseManager};
use crate::ports::{Clock, TaskFilter, TaskStore};

/// Tuning for one listener.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Cadence of both polling loops. Bounds disable/expiry detection
    /// latency.
    pub poll_interval: std::time::Duration,
    /// How far each claim/renewal pushes the lease deadline out. Must
    /// comfortably exceed `poll_interval` or renewals cannot keep up.
    pub lease_duration: std::time::Duration,
    /// Cap on concurrently in-flight handler invocations. Unbounded when
    /// `None`.
    pub max_in_flight: Option<usize>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(500),
            lease_duration: std::time::Duration::from_secs(30),
            max_in_flight: None,
        }
    }
}

/// User work for one task type. Each claimed record becomes one `handle`
/// invocation; the handler must resolve the handle with exactly one of
/// `complete`, `delete`, or `release`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError>;
}

/// One-shot condition relayed to a handle by the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleSignal {
    None,
    Disabled,
    LeaseLost,
}

struct HandleShared {
    id: TaskId,
    manager: Arc<LeaseManager>,
    /// Local cache of the record. The handler owns `payload` for the
    /// lifetime of the lease; the watch loop merges in everything else.
    record: StdMutex<TaskRecord>,
    resolved: AtomicBool,
    signal_tx: watch::Sender<HandleSignal>,
    stop_rx: watch::Receiver<bool>,
    held: Arc<Mutex<HashMap<TaskId, Arc<HandleShared>>>>,
}

impl HandleShared {
    fn snapshot(&self) -> TaskRecord {
        self.record.lock().expect("record mutex poisoned").clone()
    }

    fn replace(&self, stored: TaskRecord) {
        *self.record.lock().expect("record mutex poisoned") = stored;
    }

    /// Fold remote state into the cache without clobbering the handler's
    /// payload mutations.
    fn merge_remote(&self, fresh: &TaskRecord) {
        let mut record = self.record.lock().expect("record mutex poisoned");
        record.status = fresh.status;
        record.version = fresh.version;
        record.lease_owner = fresh.lease_owner.clone();
        record.lease_expires_at = fresh.lease_expires_at;
        record.next_run_at = fresh.next_run_at;
        record.updated_at = fresh.updated_at;
    }

    /// Raise a signal at most once; later conditions never overwrite the
    /// first one.
    fn raise(&self, signal: HandleSignal) {
        self.signal_tx.send_if_modified(|current| {
            if *current == HandleSignal::None {
                *current = signal;
                true
            } else {
                false
            }
        });
    }

    fn mark_resolved(&self) -> Result<(), SpoolError> {
        self.resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SpoolError::HandleResolved)
    }

    async fn detach(&self) {
        self.held.lock().await.remove(&self.id);
    }
}

/// Live handle to one claimed task, passed to the handler.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<HandleShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id.clone()
    }

    /// Snapshot of the locally cached record.
    pub fn record(&self) -> TaskRecord {
        self.shared.snapshot()
    }

    pub fn status(&self) -> TaskStatus {
        self.shared
            .record
            .lock()
            .expect("record mutex poisoned")
            .status
    }

    pub fn payload(&self) -> serde_json::Value {
        self.shared
            .record
            .lock()
            .expect("record mutex poisoned")
            .payload
            .clone()
    }

    /// Replace the payload. Persisted by the terminal `complete()` write.
    pub fn set_payload(&self, payload: serde_json::Value) {
        self.shared
            .record
            .lock()
            .expect("record mutex poisoned")
            .payload = payload;
    }

    /// Mutate the payload in place.
    pub fn update_payload(&self, f: impl FnOnce(&mut serde_json::Value)) {
        let mut record = self.shared.record.lock().expect("record mutex poisoned");
        f(&mut record.payload);
    }

    /// Wait for the one-shot disabled notification.
    ///
    /// Returns `true` when the task was disabled. Returns `false` when the
    /// wait was cut short instead (listener shutdown, or the lease being
    /// lost/deleted out from under us) so a parked handler can always
    /// unwind.
    pub async fn wait_disabled(&self) -> bool {
        let mut signal_rx = self.shared.signal_tx.subscribe();
        let mut stop_rx = self.shared.stop_rx.clone();
        loop {
            match *signal_rx.borrow_and_update() {
                HandleSignal::Disabled => return true,
                HandleSignal::LeaseLost => return false,
                HandleSignal::None => {}
            }
            if *stop_rx.borrow_and_update() {
                return *signal_rx.borrow() == HandleSignal::Disabled;
            }
            tokio::select! {
                changed = signal_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return *signal_rx.borrow() == HandleSignal::Disabled;
                    }
                }
            }
        }
    }

    /// Terminal action: persist the payload and either re-arm (recurring)
    /// or terminate (one-shot) the task.
    pub async fn complete(&self) -> Result<(), SpoolError> {
        self.resolve(FinishOutcome::Complete).await
    }

    /// Terminal action: remove the record.
    pub async fn delete(&self) -> Result<(), SpoolError> {
        self.resolve(FinishOutcome::Delete).await
    }

    /// Terminal action: drop the lease without changing status. The
    /// cooperative answer to a disabled notification.
    pub async fn release(&self) -> Result<(), SpoolError> {
        self.shared.mark_resolved()?;
        let snapshot = self.shared.snapshot();
        let result = self.shared.manager.release(&snapshot).await;
        self.shared.detach().await;
        let stored = result?;
        self.shared.replace(stored);
        Ok(())
    }

    async fn resolve(&self, outcome: FinishOutcome) -> Result<(), SpoolError> {
        self.shared.mark_resolved()?;
        let snapshot = self.shared.snapshot();
        let result = self.shared.manager.finish(&snapshot, outcome).await;
        // Detach whatever happened: a failed terminal write means the lease
        // is already gone or will expire; the watch loop must not renew it.
        self.shared.detach().await;
        if let Some(stored) = result? {
            self.shared.replace(stored);
        }
        Ok(())
    }
}

struct ListenerCtx {
    task_type: TaskType,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    manager: Arc<LeaseManager>,
    handler: Arc<dyn TaskHandler>,
    poll_interval: std::time::Duration,
    lease_duration: ChronoDuration,
    max_in_flight: Option<usize>,
    held: Arc<Mutex<HashMap<TaskId, Arc<HandleShared>>>>,
    stop_rx: watch::Receiver<bool>,
}

/// Handle to a running listener.
/// - `request_stop()` flips the shared signal; both loops exit at their
///   next wake-up without aborting in-flight handler invocations.
/// - `stop_and_join()` additionally waits for both loops to exit.
pub struct Listener {
    task_type: TaskType,
    owner: OwnerId,
    stop_tx: watch::Sender<bool>,
    claim_task: JoinHandle<()>,
    watch_task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn spawn(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
        options: ListenOptions,
    ) -> Self {
        let owner = OwnerId::generate();
        let manager = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            owner.clone(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = Arc::new(ListenerCtx {
            task_type: task_type.clone(),
            store,
            clock,
            manager,
            handler,
            poll_interval: options.poll_interval,
            lease_duration: to_chrono(options.lease_duration),
            max_in_flight: options.max_in_flight,
            held: Arc::new(Mutex::new(HashMap::new())),
            stop_rx: stop_rx.clone(),
        });

        let claim_task = tokio::spawn(claim_loop(ctx.clone(), stop_rx.clone()));
        let watch_task = tokio::spawn(watch_loop(ctx, stop_rx));

        Self {
            task_type,
            owner,
            stop_tx,
            claim_task,
            watch_task,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Request shutdown. Prevents new poll cycles and new claims; never
    /// cancels outstanding store calls or handler logic.
    pub fn request_stop(&self) {
        // ignore send error: the loops may already be gone
        let _ = self.stop_tx.send(true);
    }

    /// Request shutdown and wait for both loops to exit.
    pub async fn stop_and_join(self) {
        self.request_stop();
        let _ = self.claim_task.await;
        let _ = self.watch_task.await;
    }
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

async fn claim_loop(ctx: Arc<ListenerCtx>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = sleep(ctx.poll_interval) => {}
        }
        if *stop_rx.borrow() {
            break;
        }
        if let Err(err) = claim_cycle(&ctx).await {
            warn!(
                task_type = %ctx.task_type,
                error = %err,
                "claim poll failed; retrying next cycle"
            );
        }
    }
    debug!(task_type = %ctx.task_type, owner = %ctx.manager.owner(), "claim loop stopped");
}

async fn claim_cycle(ctx: &ListenerCtx) -> Result<(), SpoolError> {
    let now = ctx.clock.now();
    let mut candidates = ctx
        .store
        .query(&ctx.task_type, TaskFilter::ClaimableAt(now))
        .await?;
    if candidates.is_empty() {
        return Ok(());
    }
    // Competing listeners poll the same partition; a random visit order
    // keeps them from all racing over the same head-of-line record.
    candidates.shuffle(&mut rand::thread_rng());

    for candidate in candidates {
        if let Some(max) = ctx.max_in_flight
            && ctx.held.lock().await.len() >= max
        {
            debug!(task_type = %ctx.task_type, "in-flight limit reached; deferring claims");
            break;
        }
        // A record we already hold can show up as claimable if its lease
        // expired before the watch loop renewed it; claiming it again here
        // would hand one task to two handlers.
        if ctx.held.lock().await.contains_key(&candidate.id) {
            continue;
        }
        match ctx.manager.claim(&candidate, ctx.lease_duration).await {
            Ok(ClaimOutcome::Claimed(stored)) => spawn_handler(ctx, stored).await,
            Ok(ClaimOutcome::LostRace) => {
                debug!(task_type = %ctx.task_type, id = %candidate.id, "lost claim race");
            }
            Err(err) => {
                warn!(
                    task_type = %ctx.task_type,
                    id = %candidate.id,
                    error = %err,
                    "claim attempt failed"
                );
            }
        }
    }
    Ok(())
}

async fn spawn_handler(ctx: &ListenerCtx, record: TaskRecord) {
    let id = record.id.clone();
    let (signal_tx, _) = watch::channel(HandleSignal::None);
    let shared = Arc::new(HandleShared {
        id: id.clone(),
        manager: ctx.manager.clone(),
        record: StdMutex::new(record),
        resolved: AtomicBool::new(false),
        signal_tx,
        stop_rx: ctx.stop_rx.clone(),
        held: ctx.held.clone(),
    });
    ctx.held.lock().await.insert(id, shared.clone());

    let handle = TaskHandle {
        shared: shared.clone(),
    };
    let handler = ctx.handler.clone();
    let task_type = ctx.task_type.clone();
    tokio::spawn(async move {
        // The invocation runs in its own task so a panic is contained there
        // and the bookkeeping below still runs.
        let invocation = tokio::spawn(async move { handler.handle(handle).await });
        match invocation.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    %task_type,
                    id = %shared.id,
                    error = %err,
                    "handler failed; lease left to expire"
                );
            }
            Err(join_err) => {
                warn!(
                    %task_type,
                    id = %shared.id,
                    error = %join_err,
                    "handler panicked; lease left to expire"
                );
            }
        }
        // A handler that returned without resolving forfeits the lease:
        // stop renewing and let expiry hand the task to another listener.
        if !shared.resolved.load(Ordering::SeqCst) {
            shared.detach().await;
        }
    });
}

async fn watch_loop(ctx: Arc<ListenerCtx>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = sleep(ctx.poll_interval) => {}
        }
        if *stop_rx.borrow() {
            break;
        }
        watch_cycle(&ctx).await;
    }
    // Parked `wait_disabled` callers observe the stop signal directly, so
    // no final sweep is needed here; leases still held simply expire.
    debug!(task_type = %ctx.task_type, owner = %ctx.manager.owner(), "watch loop stopped");
}

async fn watch_cycle(ctx: &ListenerCtx) {
    let now = ctx.clock.now();
    let entries: Vec<Arc<HandleShared>> = ctx.held.lock().await.values().cloned().collect();
    for shared in entries {
        if shared.resolved.load(Ordering::SeqCst) {
            continue;
        }

        let fresh = match ctx.store.get(&ctx.task_type, &shared.id).await {
            Ok(fresh) => fresh,
            Err(SpoolError::NotFound { .. }) => {
                // Deleted out from under us: wake any parked waiter and
                // stop renewing.
                shared.raise(HandleSignal::LeaseLost);
                shared.detach().await;
                continue;
            }
            Err(err) => {
                warn!(
                    task_type = %ctx.task_type,
                    id = %shared.id,
                    error = %err,
                    "watch fetch failed; retrying next cycle"
                );
                continue;
            }
        };

        if fresh.lease_owner.as_ref() != Some(ctx.manager.owner()) {
            shared.raise(HandleSignal::LeaseLost);
            shared.detach().await;
            continue;
        }

        if fresh.status == TaskStatus::Disabled {
            shared.raise(HandleSignal::Disabled);
        }
        shared.merge_remote(&fresh);

        if shared.resolved.load(Ordering::SeqCst) {
            continue;
        }
        // Renew once the lease is past half-life. Renewing every cycle
        // would churn the version token and fight the handler's own
        // terminal write for no gain.
        let due_for_renewal = fresh
            .lease_expires_at
            .map(|expires| expires - now < ctx.lease_duration / 2)
            .unwrap_or(true);
        if !due_for_renewal {
            continue;
        }
        let snapshot = shared.snapshot();
        match ctx.manager.renew(&snapshot, ctx.lease_duration).await {
            Ok(stored) => shared.merge_remote(&stored),
            Err(SpoolError::LeaseLost { .. }) => {
                shared.raise(HandleSignal::LeaseLost);
                shared.detach().await;
            }
            Err(err) => {
                warn!(
                    task_type = %ctx.task_type,
                    id = %shared.id,
                    error = %err,
                    "lease renewal failed; retrying next cycle"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use crate::impls::InMemoryStore;
    use crate::ports::ManualClock;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn task_type() -> TaskType {
        TaskType::new("jobs")
    }

    fn fast_options() -> ListenOptions {
        ListenOptions {
            poll_interval: StdDuration::from_millis(10),
            lease_duration: StdDuration::from_secs(60),
            max_in_flight: None,
        }
    }

    async fn seed_task(store: &Arc<InMemoryStore>, id: &str) -> TaskRecord {
        let record = TaskRecord::new(
            TaskId::new(id),
            task_type(),
            json!({"hello": "world"}),
            None,
            t0(),
            t0(),
        );
        store.insert(record).await.unwrap()
    }

    /// Poll the store until `predicate` holds or the deadline passes.
    async fn wait_for<F>(deadline: StdDuration, mut predicate: F)
    where
        F: AsyncFnMut() -> bool,
    {
        let result = tokio::time::timeout(deadline, async {
            loop {
                if predicate().await {
                    return;
                }
                sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "condition not reached within {deadline:?}");
    }

    struct MutateAndComplete;

    #[async_trait]
    impl TaskHandler for MutateAndComplete {
        async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
            task.set_payload(json!({"hello": "cosmos"}));
            task.complete().await
        }
    }

    #[tokio::test]
    async fn claims_and_completes_a_one_shot_task() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        seed_task(&store, "t1").await;

        let listener = Listener::spawn(
            store.clone(),
            clock,
            task_type(),
            Arc::new(MutateAndComplete),
            fast_options(),
        );

        wait_for(StdDuration::from_secs(2), async || {
            let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
            record.status == TaskStatus::Completed
        })
        .await;

        let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
        assert_eq!(record.payload, json!({"hello": "cosmos"}));
        assert_eq!(record.lease_owner, None);
        listener.stop_and_join().await;
    }

    struct ReleaseOnDisable {
        observed_disable: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskHandler for ReleaseOnDisable {
        async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
            if task.wait_disabled().await {
                self.observed_disable.store(true, Ordering::SeqCst);
            }
            task.release().await
        }
    }

    #[tokio::test]
    async fn relays_external_disable_and_releases() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        seed_task(&store, "t1").await;

        let observed = Arc::new(AtomicBool::new(false));
        let listener = Listener::spawn(
            store.clone(),
            clock.clone(),
            task_type(),
            Arc::new(ReleaseOnDisable {
                observed_disable: observed.clone(),
            }),
            fast_options(),
        );

        // Wait for the claim, then flip Disabled like an external process.
        wait_for(StdDuration::from_secs(2), async || {
            let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
            record.status == TaskStatus::Running
        })
        .await;
        // The flip itself can lose the CAS to listener traffic; retry like
        // any external writer would.
        loop {
            let current = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
            let mut flipped = current.clone();
            flipped.disable(clock.now());
            match store.conditional_update(flipped, current.version).await {
                Ok(_) => break,
                Err(SpoolError::VersionConflict { .. }) => continue,
                Err(err) => panic!("disable flip failed: {err}"),
            }
        }

        wait_for(StdDuration::from_secs(2), async || {
            let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
            record.status == TaskStatus::Disabled && record.lease_owner.is_none()
        })
        .await;
        assert!(observed.load(Ordering::SeqCst));
        listener.stop_and_join().await;
    }

    struct ParkForever {
        wait_result: Arc<Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl TaskHandler for ParkForever {
        async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
            let disabled = task.wait_disabled().await;
            *self.wait_result.lock().await = Some(disabled);
            task.release().await
        }
    }

    #[tokio::test]
    async fn stop_wakes_a_parked_handler() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        seed_task(&store, "t1").await;

        let wait_result = Arc::new(Mutex::new(None));
        let listener = Listener::spawn(
            store.clone(),
            clock,
            task_type(),
            Arc::new(ParkForever {
                wait_result: wait_result.clone(),
            }),
            fast_options(),
        );

        wait_for(StdDuration::from_secs(2), async || {
            let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
            record.status == TaskStatus::Running
        })
        .await;

        // Must not hang on the parked handler.
        tokio::time::timeout(StdDuration::from_secs(2), listener.stop_and_join())
            .await
            .expect("stop_and_join hung");

        wait_for(StdDuration::from_secs(2), async || {
            wait_result.lock().await.is_some()
        })
        .await;
        assert_eq!(*wait_result.lock().await, Some(false));
    }

    struct AlwaysFails {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _task: TaskHandle) -> Result<(), SpoolError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SpoolError::Store("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_handler_leaves_lease_to_expire_for_redelivery() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        seed_task(&store, "t1").await;

        let attempts = Arc::new(AtomicU32::new(0));
        let listener = Listener::spawn(
            store.clone(),
            clock.clone(),
            task_type(),
            Arc::new(AlwaysFails {
                attempts: attempts.clone(),
            }),
            ListenOptions {
                poll_interval: StdDuration::from_millis(10),
                lease_duration: StdDuration::from_secs(5),
                max_in_flight: None,
            },
        );

        wait_for(StdDuration::from_secs(2), async || {
            attempts.load(Ordering::SeqCst) >= 1
        })
        .await;

        // The record stays Running under a lease that nobody renews.
        let record = store.get(&task_type(), &TaskId::new("t1")).await.unwrap();
        assert_eq!(record.status, TaskStatus::Running);

        // Once the lease expires the claim loop redelivers.
        clock.advance(ChronoDuration::seconds(6));
        wait_for(StdDuration::from_secs(2), async || {
            attempts.load(Ordering::SeqCst) >= 2
        })
        .await;
        listener.stop_and_join().await;
    }

    struct SlowComplete {
        current: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for SlowComplete {
        async fn handle(&self, task: TaskHandle) -> Result<(), SpoolError> {
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            sleep(StdDuration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            task.complete().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn max_in_flight_bounds_handler_concurrency() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        for i in 0..3 {
            seed_task(&store, &format!("t{i}")).await;
        }

        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let listener = Listener::spawn(
            store.clone(),
            clock,
            task_type(),
            Arc::new(SlowComplete {
                current: current.clone(),
                peak: peak.clone(),
            }),
            ListenOptions {
                max_in_flight: Some(1),
                ..fast_options()
            },
        );

        wait_for(StdDuration::from_secs(5), async || {
            let all = store
                .query(&task_type(), TaskFilter::All)
                .await
                .unwrap();
            all.iter().all(|r| r.status == TaskStatus::Completed)
        })
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        listener.stop_and_join().await;
    }
}
