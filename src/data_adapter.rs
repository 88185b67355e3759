//! Pluggable key/value persistence for specs and ID lists.
use async_trait::async_trait;

use crate::Result;

/// Key under which the `download_config_specs` document is stored.
pub const CONFIG_SPECS_KEY: &str = "statsig.cache";
/// Key under which the JSON array of known ID list names is stored.
pub const ID_LISTS_KEY: &str = "statsig.id_lists";

/// Key under which the body of ID list `name` is stored.
pub fn id_list_key(name: &str) -> String {
    format!("{ID_LISTS_KEY}::{name}")
}

/// A stored value and, optionally, when it was written (milliseconds since epoch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterResult {
    /// The stored value.
    pub result: String,
    /// Write time, if the adapter tracks it.
    pub time: Option<u64>,
}

impl AdapterResult {
    /// A result without a write time.
    pub fn new(result: impl Into<String>) -> AdapterResult {
        AdapterResult {
            result: result.into(),
            time: None,
        }
    }
}

/// Storage the SDK consults before (or instead of) the network.
///
/// The SDK reads with [`get`](DataAdapter::get) while initializing and, for keys where
/// [`supports_polling_updates_for`](DataAdapter::supports_polling_updates_for) returns `true`,
/// on every sync. It writes with [`set`](DataAdapter::set) only after a successful network sync.
#[async_trait]
pub trait DataAdapter: Send + Sync {
    /// Called once before the first read.
    async fn initialize(&self) -> Result<()>;

    /// Read `key`. `Ok(None)` if nothing is stored.
    async fn get(&self, key: &str) -> Result<Option<AdapterResult>>;

    /// Store `value` under `key`.
    async fn set(&self, key: &str, value: &str, time: Option<u64>) -> Result<()>;

    /// Called when the SDK shuts down.
    async fn shutdown(&self) -> Result<()>;

    /// Return `true` to make background syncs read `key` from this adapter instead of the
    /// network.
    fn supports_polling_updates_for(&self, _key: &str) -> bool {
        false
    }
}
