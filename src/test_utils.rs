//! Shared test doubles.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    data_adapter::{AdapterResult, DataAdapter},
    fetcher::{Fetcher, DOWNLOAD_CONFIG_SPECS_ENDPOINT, GET_ID_LISTS_ENDPOINT, LOG_EVENT_ENDPOINT},
    snapshot::{Reason, Snapshot},
    spec::ConfigSpecs,
    Error, Result,
};

/// `time` of `tests/data/download_config_specs.json`.
pub const FIXTURE_TIME: u64 = 1631638014811;

pub fn fixture_json() -> String {
    std::fs::read_to_string("tests/data/download_config_specs.json")
        .expect("Failed to read tests/data/download_config_specs.json")
}

pub fn load_config_specs() -> ConfigSpecs {
    serde_json::from_str(&fixture_json()).expect("fixture should parse")
}

pub fn fixture_snapshot(reason: Reason) -> Snapshot {
    Snapshot::uninitialized().with_specs(load_config_specs(), reason)
}

/// A scripted [`Fetcher`] with per-endpoint latency that records delivered event batches.
#[derive(Default)]
pub struct MockFetcher {
    config_specs: Mutex<Option<String>>,
    id_lists: Mutex<Option<String>>,
    id_list_files: Mutex<HashMap<String, String>>,
    latencies: HashMap<&'static str, Duration>,
    log_event_failures: AtomicUsize,
    log_event_payloads: Mutex<Vec<Value>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> MockFetcher {
        MockFetcher::default()
    }

    pub fn with_config_specs(self, body: impl Into<String>) -> MockFetcher {
        self.set_config_specs(body);
        self
    }

    pub fn with_id_lists(self, body: impl Into<String>) -> MockFetcher {
        self.set_id_lists(body);
        self
    }

    pub fn with_id_list_file(self, url: &str, content: impl Into<String>) -> MockFetcher {
        self.set_id_list_file(url, content);
        self
    }

    pub fn with_latency(mut self, endpoint: &'static str, latency: Duration) -> MockFetcher {
        self.latencies.insert(endpoint, latency);
        self
    }

    /// Make the next `failures` deliveries to `log_event` fail.
    pub fn with_log_event_failures(self, failures: usize) -> MockFetcher {
        self.log_event_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn set_config_specs(&self, body: impl Into<String>) {
        *self.config_specs.lock().unwrap() = Some(body.into());
    }

    pub fn set_id_lists(&self, body: impl Into<String>) {
        *self.id_lists.lock().unwrap() = Some(body.into());
    }

    pub fn set_id_list_file(&self, url: &str, content: impl Into<String>) {
        self.id_list_files
            .lock()
            .unwrap()
            .insert(url.to_owned(), content.into());
    }

    /// All delivered events, in delivery order.
    pub fn logged_events(&self) -> Vec<Value> {
        self.log_event_payloads
            .lock()
            .unwrap()
            .iter()
            .flat_map(|payload| payload["events"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    pub fn logged_events_named(&self, name: &str) -> Vec<Value> {
        self.logged_events()
            .into_iter()
            .filter(|event| event["eventName"] == name)
            .collect()
    }

    pub fn log_event_payloads(&self) -> Vec<Value> {
        self.log_event_payloads.lock().unwrap().clone()
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == endpoint)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn post(&self, endpoint: &str, body: Value) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(endpoint.to_owned());
        if let Some(latency) = self.latencies.get(endpoint) {
            tokio::time::sleep(*latency).await;
        }

        match endpoint {
            DOWNLOAD_CONFIG_SPECS_ENDPOINT => Ok(self.config_specs.lock().unwrap().clone()),
            GET_ID_LISTS_ENDPOINT => Ok(self.id_lists.lock().unwrap().clone()),
            LOG_EVENT_ENDPOINT => {
                let failed = self
                    .log_event_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    return Err(Error::Transport("simulated failure".to_owned()));
                }
                self.log_event_payloads.lock().unwrap().push(body);
                Ok(None)
            }
            _ => Err(Error::UnexpectedStatus(404)),
        }
    }

    async fn get_range(&self, url: &str, range_start: u64) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(url.to_owned());
        let files = self.id_list_files.lock().unwrap();
        let content = files.get(url).ok_or(Error::UnexpectedStatus(404))?;
        Ok(content
            .get(range_start as usize..)
            .filter(|tail| !tail.is_empty())
            .map(str::to_owned))
    }
}

/// In-memory [`DataAdapter`] that counts writes.
#[derive(Default)]
pub struct MemoryDataAdapter {
    values: Mutex<HashMap<String, String>>,
    set_calls: AtomicUsize,
    polled_keys: Vec<String>,
}

impl MemoryDataAdapter {
    pub fn new() -> MemoryDataAdapter {
        MemoryDataAdapter::default()
    }

    pub fn with_value(self, key: &str, value: impl Into<String>) -> MemoryDataAdapter {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.into());
        self
    }

    /// Make background syncs poll `key` from this adapter.
    pub fn polling(mut self, key: &str) -> MemoryDataAdapter {
        self.polled_keys.push(key.to_owned());
        self
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.into());
    }

    pub fn set_count(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataAdapter for MemoryDataAdapter {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<AdapterResult>> {
        Ok(self.value(key).map(AdapterResult::new))
    }

    async fn set(&self, key: &str, value: &str, _time: Option<u64>) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.put(key, value);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn supports_polling_updates_for(&self, key: &str) -> bool {
        self.polled_keys.iter().any(|k| k == key)
    }
}
