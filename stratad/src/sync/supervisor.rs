//! Decides when each enabled sync config runs: on request, after debounced
//! local changes, when the change log advanced past a state's cursor, on its
//! interval, or after the error backoff elapsed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::RecommendedWatcher;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineError;
use super::backoff::Backoff;
use super::engine::{SyncEngine, SyncSpec};
use super::local_watcher::{Debouncer, WatchEvent, watch_root};
use crate::store::{
    MetadataStore, SyncConfigRecord, SyncPhase, SyncStateRecord, now_unix,
};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub tick: Duration,
    pub debounce: Duration,
    pub shutdown_timeout: Duration,
    pub run_backoff: Backoff,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            debounce: Duration::from_millis(750),
            shutdown_timeout: Duration::from_secs(10),
            run_backoff: Backoff::for_runs(),
        }
    }
}

struct RunningSync {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub configs: Vec<SyncConfigRecord>,
    pub states: Vec<SyncStateRecord>,
    pub running: Vec<i64>,
}

pub struct SyncSupervisor {
    engine: Arc<SyncEngine>,
    store: Arc<MetadataStore>,
    config: SupervisorConfig,
    running: AsyncMutex<HashMap<i64, RunningSync>>,
    requested: Mutex<HashSet<i64>>,
    /// Unix seconds of the last run started per config in this process.
    last_started: Mutex<HashMap<i64, i64>>,
    wake: Notify,
}

impl SyncSupervisor {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<MetadataStore>, config: SupervisorConfig) -> Self {
        Self {
            engine,
            store,
            config,
            running: AsyncMutex::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
            last_started: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Runs until `shutdown` fires, then stops every in-flight run.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), EngineError> {
        let interrupted = self.engine.mark_interrupted().await?;
        if interrupted > 0 {
            info!(interrupted, "recovering interrupted sync runs");
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent>();
        let mut watchers: HashMap<i64, (PathBuf, RecommendedWatcher)> = HashMap::new();
        let mut debouncer = Debouncer::new(self.config.debounce);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = debouncer.next_deadline();
            let triggered = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => Vec::new(),
                _ = self.wake.notified() => Vec::new(),
                Some(event) = rx.recv() => {
                    debug!(config = event.config_id, event = ?event.event, "local change");
                    debouncer.push(event.config_id, Instant::now());
                    continue;
                }
                _ = sleep_until(deadline) => debouncer.drain_ready(Instant::now()),
            };
            if let Err(err) = self.tick(&mut watchers, &tx, &triggered, &shutdown).await {
                warn!(error = %err, "sync supervisor tick failed");
            }
        }

        drop(watchers);
        self.stop_all().await;
        Ok(())
    }

    async fn tick(
        &self,
        watchers: &mut HashMap<i64, (PathBuf, RecommendedWatcher)>,
        tx: &mpsc::UnboundedSender<WatchEvent>,
        triggered: &[i64],
        shutdown: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.reap().await;
        let configs = self.engine.list_configs().await?;
        self.refresh_watchers(&configs, watchers, tx).await;
        let requested: HashSet<i64> = std::mem::take(&mut *lock(&self.requested));
        let now = now_unix();

        for config in configs {
            if !config.enabled {
                continue;
            }
            let is_requested = requested.contains(&config.id);
            let is_triggered = triggered.contains(&config.id);
            if self.running.lock().await.contains_key(&config.id) {
                // picked up again once the current run finishes
                if is_requested || is_triggered {
                    lock(&self.requested).insert(config.id);
                }
                continue;
            }
            let states = self.store.list_sync_states(Some(config.id)).await?;
            if let Some(reason) = self
                .due_reason(&config, &states, is_requested, is_triggered, now)
                .await?
            {
                self.spawn_run(config, reason, shutdown).await;
            }
        }
        Ok(())
    }

    async fn due_reason(
        &self,
        config: &SyncConfigRecord,
        states: &[SyncStateRecord],
        requested: bool,
        triggered: bool,
        now: i64,
    ) -> Result<Option<&'static str>, EngineError> {
        if requested {
            return Ok(Some("requested"));
        }
        let errored: Vec<&SyncStateRecord> = states
            .iter()
            .filter(|state| state.phase == SyncPhase::Error)
            .collect();
        if !errored.is_empty() {
            let recovered = errored.iter().all(|state| {
                let attempt = (state.error_count - 1).clamp(0, 16) as u32;
                let wait = self.config.run_backoff.delay(attempt).as_secs() as i64;
                now - state.updated_at >= wait
            });
            return Ok(recovered.then_some("error recovery"));
        }
        if triggered {
            return Ok(Some("local change"));
        }
        for state in states {
            if self.store.latest_change_id(&state.backend_id).await? > state.change_cursor {
                return Ok(Some("remote change"));
            }
        }
        let last_synced = states.iter().filter_map(|state| state.last_sync_at).max();
        let last_started = lock(&self.last_started).get(&config.id).copied();
        let last = last_synced.max(last_started);
        let due = match last {
            Some(last) => now - last >= config.interval_secs as i64,
            None => true,
        };
        Ok(due.then_some("interval"))
    }

    async fn spawn_run(
        &self,
        config: SyncConfigRecord,
        reason: &'static str,
        shutdown: &CancellationToken,
    ) {
        let cancel = shutdown.child_token();
        let token = cancel.clone();
        let engine = self.engine.clone();
        let config_id = config.id;
        lock(&self.last_started).insert(config_id, now_unix());
        info!(config = %config.name, reason, "starting sync run");
        let handle = tokio::spawn(async move {
            match engine.run_config(&config, &token).await {
                Ok(summary) => info!(
                    config = %config.name,
                    scanned = summary.scanned,
                    resumed = summary.resumed,
                    completed = summary.completed,
                    failed = summary.failed,
                    bytes = summary.bytes,
                    conflicts = summary.conflicts,
                    "sync run complete"
                ),
                Err(EngineError::Cancelled) => info!(config = %config.name, "sync run cancelled"),
                Err(err) => warn!(config = %config.name, error = %err, "sync run failed"),
            }
        });
        self.running
            .lock()
            .await
            .insert(config_id, RunningSync { cancel, handle });
    }

    async fn reap(&self) {
        self.running
            .lock()
            .await
            .retain(|_, run| !run.handle.is_finished());
    }

    /// Local changes only matter to configs that upload.
    async fn refresh_watchers(
        &self,
        configs: &[SyncConfigRecord],
        watchers: &mut HashMap<i64, (PathBuf, RecommendedWatcher)>,
        tx: &mpsc::UnboundedSender<WatchEvent>,
    ) {
        let wanted: HashSet<i64> = configs
            .iter()
            .filter(|config| config.enabled && config.direction.allows_upload())
            .map(|config| config.id)
            .collect();
        watchers.retain(|id, _| wanted.contains(id));

        for config in configs.iter().filter(|config| wanted.contains(&config.id)) {
            let root = match self.engine.plan(config).await {
                Ok(plan) => plan.local_root,
                Err(err) => {
                    debug!(config = %config.name, error = %err, "not watching");
                    continue;
                }
            };
            if watchers.get(&config.id).is_some_and(|(watched, _)| *watched == root) {
                continue;
            }
            match watch_root(config.id, &root, tx.clone()) {
                Ok(watcher) => {
                    debug!(config = %config.name, root = %root.display(), "watching local root");
                    watchers.insert(config.id, (root, watcher));
                }
                Err(err) => {
                    debug!(config = %config.name, root = %root.display(), error = %err, "local watch unavailable");
                }
            }
        }
    }

    /// Cancels a config's in-flight run and waits for its current jobs.
    async fn stop_run(&self, config_id: i64) {
        let run = self.running.lock().await.remove(&config_id);
        if let Some(run) = run {
            run.cancel.cancel();
            let abort = run.handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, run.handle)
                .await
                .is_err()
            {
                warn!(config = config_id, "sync run did not stop in time; aborting");
                abort.abort();
            }
        }
    }

    async fn stop_all(&self) {
        let runs: Vec<RunningSync> = self.running.lock().await.drain().map(|(_, run)| run).collect();
        if runs.is_empty() {
            return;
        }
        info!(count = runs.len(), "stopping sync runs");
        let mut aborts = Vec::new();
        let mut handles = Vec::new();
        for run in runs {
            run.cancel.cancel();
            aborts.push(run.handle.abort_handle());
            handles.push(run.handle);
        }
        let joined = futures_util::future::join_all(handles);
        if tokio::time::timeout(self.config.shutdown_timeout, joined)
            .await
            .is_err()
        {
            warn!(timeout = ?self.config.shutdown_timeout, "sync runs did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    pub fn request_run(&self, config_id: i64) {
        lock(&self.requested).insert(config_id);
        self.wake.notify_one();
    }

    pub async fn create(&self, spec: SyncSpec) -> Result<SyncConfigRecord, EngineError> {
        let config = self.engine.create_config(spec).await?;
        self.request_run(config.id);
        Ok(config)
    }

    pub async fn pause(&self, name: &str) -> Result<SyncConfigRecord, EngineError> {
        let config = self.engine.get_config(name).await?;
        self.stop_run(config.id).await;
        self.engine.pause_config(&config).await
    }

    pub async fn resume(&self, name: &str) -> Result<SyncConfigRecord, EngineError> {
        let config = self.engine.get_config(name).await?;
        let config = self.engine.resume_config(&config).await?;
        self.request_run(config.id);
        Ok(config)
    }

    pub async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let config = self.engine.get_config(name).await?;
        self.stop_run(config.id).await;
        self.engine.remove_config(name).await
    }

    pub async fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .running
            .lock()
            .await
            .iter()
            .filter(|(_, run)| !run.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn status(&self) -> Result<SupervisorStatus, EngineError> {
        Ok(SupervisorStatus {
            configs: self.engine.list_configs().await?,
            states: self.engine.states(None).await?,
            running: self.running_ids().await,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}
