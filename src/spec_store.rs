//! The configuration store: owns the current [`Snapshot`] and keeps it in sync with bootstrap
//! values, the data adapter and the network.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use rand::{thread_rng, Rng};
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::StatsigOptions,
    data_adapter::{id_list_key, DataAdapter, CONFIG_SPECS_KEY, ID_LISTS_KEY},
    fetcher::{Fetcher, DOWNLOAD_CONFIG_SPECS_ENDPOINT, GET_ID_LISTS_ENDPOINT},
    id_list::{IdList, IdListMetadata, IdLists},
    snapshot::{Reason, Snapshot},
    spec::ConfigSpecs,
    Result,
};

#[derive(Debug, Clone, Copy)]
enum SyncKind {
    Specs,
    IdLists,
}

/// `SpecStore` provides a Sync storage for the current snapshot that allows concurrent access for
/// readers and writers, and runs the background syncs that refresh it.
pub struct SpecStore {
    snapshot: RwLock<Arc<Snapshot>>,
    fetcher: Arc<dyn Fetcher>,
    data_adapter: Option<Arc<dyn DataAdapter>>,
    bootstrap_values: Option<String>,
    rulesets_sync_interval: Duration,
    id_lists_sync_interval: Duration,
    sync_jitter: Duration,
    local_mode: bool,
    /// Set to `true` to stop background syncs. Only consulted between sync cycles.
    stop: watch::Sender<bool>,
    /// Held for the duration of every spec sync cycle (including the initial one).
    specs_cycle: tokio::sync::Mutex<()>,
    /// Held for the duration of every ID list sync cycle (including the initial one).
    id_lists_cycle: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpecStore {
    /// Create an uninitialized store. Nothing is fetched until [`init`](SpecStore::init).
    pub fn new(fetcher: Arc<dyn Fetcher>, options: &StatsigOptions) -> SpecStore {
        let (stop, _) = watch::channel(false);
        SpecStore {
            snapshot: RwLock::new(Arc::new(Snapshot::uninitialized())),
            fetcher,
            data_adapter: options.data_adapter.clone(),
            bootstrap_values: options.bootstrap_values.clone(),
            rulesets_sync_interval: options.rulesets_sync_interval,
            id_lists_sync_interval: options.id_lists_sync_interval,
            sync_jitter: options.sync_jitter,
            local_mode: options.local_mode,
            stop,
            specs_cycle: tokio::sync::Mutex::new(()),
            id_lists_cycle: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Return the most recent snapshot. Never blocks on a sync.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        // The lock is only poisoned if a writer panicked while swapping an `Arc`, which leaves
        // the slot in a consistent state, so it's safe to keep reading.
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot with `f(current)`, unless `f` returns `None`.
    fn update_snapshot(&self, f: impl FnOnce(&Snapshot) -> Option<Snapshot>) -> bool {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        match f(&slot) {
            Some(next) => {
                *slot = Arc::new(next);
                true
            }
            None => false,
        }
    }

    /// Load the first snapshot and start background syncs.
    ///
    /// Sources are tried in priority order: bootstrap values, then the data adapter, then the
    /// network. A failing source is logged and the next one is tried. If all fail, the store stays
    /// uninitialized and background syncs keep trying.
    pub async fn init(self: &Arc<Self>) -> Reason {
        let specs_cycle = self.specs_cycle.lock().await;
        let id_lists_cycle = self.id_lists_cycle.lock().await;

        if let Some(adapter) = &self.data_adapter {
            if let Err(err) = adapter.initialize().await {
                log::warn!(target: "statsig", error:display = err; "failed to initialize data adapter");
            }
        }

        let mut reason = Reason::Uninitialized;

        if let Some(bootstrap) = &self.bootstrap_values {
            match self.apply_specs(bootstrap, Reason::Bootstrap) {
                Ok(true) => reason = Reason::Bootstrap,
                Ok(false) => {
                    log::warn!(target: "statsig", "bootstrap values contain no specs, ignoring");
                }
                Err(err) => {
                    log::warn!(target: "statsig", error:display = err; "failed to parse bootstrap values, ignoring");
                }
            }
        }

        if reason == Reason::Uninitialized {
            if let Some(adapter) = &self.data_adapter {
                match self.sync_specs_from_adapter(adapter.as_ref()).await {
                    Ok(true) => reason = Reason::DataAdapter,
                    Ok(false) => {}
                    Err(err) => {
                        log::warn!(target: "statsig", error:display = err; "failed to load specs from data adapter");
                    }
                }
            }
        }

        if reason == Reason::Uninitialized && !self.local_mode {
            match self.sync_specs_from_network().await {
                Ok(true) => reason = Reason::Network,
                Ok(false) => {}
                Err(err) => {
                    log::warn!(target: "statsig", error:display = err; "failed to download specs");
                }
            }
        }

        // Bootstrapped stores serve immediately; their ID lists arrive with the first background sync.
        let id_lists = match (reason, &self.data_adapter) {
            (Reason::DataAdapter, Some(adapter)) => {
                self.sync_id_lists_from_adapter(adapter.as_ref()).await
            }
            (Reason::Network, _) => self.sync_id_lists_from_network().await,
            _ => Ok(()),
        };
        if let Err(err) = id_lists {
            log::warn!(target: "statsig", error:display = err; "failed to load id lists");
        }

        drop(id_lists_cycle);
        drop(specs_cycle);

        log::debug!(target: "statsig", reason; "spec store initialized");
        self.start_background_sync();
        reason
    }

    fn start_background_sync(self: &Arc<Self>) {
        if *self.stop.borrow() {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        for (kind, key) in [(SyncKind::Specs, CONFIG_SPECS_KEY), (SyncKind::IdLists, ID_LISTS_KEY)] {
            if self.local_mode && !self.polls_adapter(key) {
                continue;
            }
            let store = Arc::clone(self);
            let stop = self.stop.subscribe();
            tasks.push(tokio::spawn(async move { store.sync_loop(kind, stop).await }));
        }
    }

    async fn sync_loop(&self, kind: SyncKind, mut stop: watch::Receiver<bool>) {
        let interval = match kind {
            SyncKind::Specs => self.rulesets_sync_interval,
            SyncKind::IdLists => self.id_lists_sync_interval,
        };

        loop {
            if *stop.borrow() {
                break;
            }

            let timeout = jitter(interval, self.sync_jitter);
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = stop.changed() => {
                    // Either a stop command or the store was dropped.
                    break;
                }
            }

            match kind {
                SyncKind::Specs => self.sync_specs().await,
                SyncKind::IdLists => self.sync_id_lists().await,
            }
        }
        log::debug!(target: "statsig", kind:debug = kind; "background sync stopped");
    }

    fn polls_adapter(&self, key: &str) -> bool {
        self.data_adapter
            .as_ref()
            .is_some_and(|adapter| adapter.supports_polling_updates_for(key))
    }

    /// One spec sync cycle. Failures are logged and retried on the next cycle.
    pub async fn sync_specs(&self) {
        let _cycle = self.specs_cycle.lock().await;

        let result = match &self.data_adapter {
            Some(adapter) if adapter.supports_polling_updates_for(CONFIG_SPECS_KEY) => {
                self.sync_specs_from_adapter(adapter.as_ref()).await
            }
            _ if self.local_mode => Ok(false),
            _ => self.sync_specs_from_network().await,
        };

        match result {
            Ok(updated) => {
                log::debug!(target: "statsig", updated; "spec sync finished");
            }
            Err(err) => {
                log::warn!(target: "statsig", error:display = err; "spec sync failed");
            }
        }
    }

    /// One ID list sync cycle. Failures are logged and retried on the next cycle.
    pub async fn sync_id_lists(&self) {
        let _cycle = self.id_lists_cycle.lock().await;

        let result = match &self.data_adapter {
            Some(adapter) if adapter.supports_polling_updates_for(ID_LISTS_KEY) => {
                self.sync_id_lists_from_adapter(adapter.as_ref()).await
            }
            _ if self.local_mode => Ok(()),
            _ => self.sync_id_lists_from_network().await,
        };

        if let Err(err) = result {
            log::warn!(target: "statsig", error:display = err; "id list sync failed");
        }
    }

    /// Parse a specs document and swap it in if it is newer than the current snapshot.
    fn apply_specs(&self, payload: &str, reason: Reason) -> Result<bool> {
        let specs: ConfigSpecs = serde_json::from_str(payload)?;
        if !specs.has_updates {
            return Ok(false);
        }

        let time = specs.time;
        let updated = self.update_snapshot(|current| {
            if current.is_initialized() && time <= current.last_update_time {
                return None;
            }
            Some(current.with_specs(specs, reason))
        });

        if updated {
            log::debug!(target: "statsig", reason, time; "specs updated");
        }
        Ok(updated)
    }

    async fn sync_specs_from_network(&self) -> Result<bool> {
        let since_time = self.get_snapshot().last_update_time;
        let body = self
            .fetcher
            .post(DOWNLOAD_CONFIG_SPECS_ENDPOINT, json!({ "sinceTime": since_time }))
            .await?;

        let Some(body) = body else {
            log::debug!(target: "statsig", "download_config_specs returned no body");
            return Ok(false);
        };

        let updated = self.apply_specs(&body, Reason::Network)?;

        if updated {
            if let Some(adapter) = &self.data_adapter {
                let time = self.get_snapshot().last_update_time;
                if let Err(err) = adapter.set(CONFIG_SPECS_KEY, &body, Some(time)).await {
                    log::warn!(target: "statsig", error:display = err; "failed to write specs to data adapter");
                }
            }
        }

        Ok(updated)
    }

    async fn sync_specs_from_adapter(&self, adapter: &dyn DataAdapter) -> Result<bool> {
        match adapter.get(CONFIG_SPECS_KEY).await? {
            Some(value) => self.apply_specs(&value.result, Reason::DataAdapter),
            None => Ok(false),
        }
    }

    async fn sync_id_lists_from_network(&self) -> Result<()> {
        let Some(body) = self.fetcher.post(GET_ID_LISTS_ENDPOINT, json!({})).await? else {
            return Ok(());
        };
        let remote: HashMap<String, IdListMetadata> = serde_json::from_str(&body)?;

        let current = self.get_snapshot();
        let mut lists = IdLists::new();
        for (name, metadata) in remote {
            let mut list = match current.id_lists.get(&name) {
                Some(list) if !list.is_replaced_by(&metadata) => list.clone(),
                _ => IdList::new(&metadata),
            };

            if metadata.size > list.size {
                if let Some(url) = metadata.url.as_deref() {
                    match self.fetcher.get_range(url, list.size).await {
                        Ok(Some(content)) => {
                            if list.apply_delta(&content).is_err() {
                                // Start over with a fresh download on the next sync.
                                log::warn!(target: "statsig", list:display = name; "id list is corrupted, dropping it");
                                continue;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            log::warn!(target: "statsig", list:display = name, error:display = err; "failed to download id list");
                        }
                    }
                }
            }

            lists.insert(name, list);
        }

        if let Some(adapter) = &self.data_adapter {
            if let Err(err) = write_id_lists(adapter.as_ref(), &lists).await {
                log::warn!(target: "statsig", error:display = err; "failed to write id lists to data adapter");
            }
        }

        let count = lists.len();
        self.update_snapshot(|current| Some(current.with_id_lists(lists)));
        log::debug!(target: "statsig", count; "id lists updated");
        Ok(())
    }

    async fn sync_id_lists_from_adapter(&self, adapter: &dyn DataAdapter) -> Result<()> {
        let Some(names) = adapter.get(ID_LISTS_KEY).await? else {
            return Ok(());
        };
        let names: Vec<String> = serde_json::from_str(&names.result)?;

        let mut lists = IdLists::new();
        for name in names {
            let Some(body) = adapter.get(&id_list_key(&name)).await? else {
                continue;
            };
            let mut list = IdList {
                name: name.clone(),
                ..IdList::default()
            };
            match list.apply_delta(&body.result) {
                Ok(()) => {
                    lists.insert(name, list);
                }
                Err(err) => {
                    log::warn!(target: "statsig", list:display = name, error:display = err; "skipping corrupted id list from data adapter");
                }
            }
        }

        self.update_snapshot(|current| Some(current.with_id_lists(lists)));
        Ok(())
    }

    /// Stop background syncs after their current cycle. Does not wait.
    ///
    /// A cycle that is already in flight runs to completion and may still update the snapshot.
    pub fn shutdown(&self) {
        // `send_replace` stores the value even when no task has subscribed yet.
        self.stop.send_replace(true);
    }

    /// Stop background syncs and wait for in-flight cycles to finish, for at most `timeout`.
    ///
    /// Returns `false` if the timeout elapsed first. In-flight cycles still complete in the
    /// background in that case.
    pub async fn shutdown_async(&self, timeout: Duration) -> bool {
        self.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let wait = async {
            for task in tasks {
                // A panicked task has nothing left to wait for.
                let _ = task.await;
            }
            // Waits for an initial sync that may still be running.
            drop(self.specs_cycle.lock().await);
            drop(self.id_lists_cycle.lock().await);

            if let Some(adapter) = &self.data_adapter {
                if let Err(err) = adapter.shutdown().await {
                    log::warn!(target: "statsig", error:display = err; "failed to shut down data adapter");
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                log::warn!(target: "statsig", timeout_ms = timeout.as_millis() as u64; "spec store shutdown timed out");
                false
            }
        }
    }
}

async fn write_id_lists(adapter: &dyn DataAdapter, lists: &IdLists) -> Result<()> {
    let names = lists.keys().collect::<Vec<_>>();
    adapter
        .set(ID_LISTS_KEY, &serde_json::to_string(&names)?, None)
        .await?;
    for (name, list) in lists {
        let body = list.ids.iter().map(|id| format!("+{id}\n")).collect::<String>();
        adapter.set(&id_list_key(name), &body, None).await?;
    }
    Ok(())
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
