//! A server-side SDK for Statsig feature gates, dynamic configs, experiments and layers.
//!
//! # Overview
//!
//! The SDK revolves around a [`Server`] that evaluates specs for a [`StatsigUser`]. Specs are
//! downloaded from the Statsig API (or supplied as bootstrap values, or read from a
//! [`DataAdapter`]) and kept in sync in the background. Evaluation itself is synchronous and never
//! touches the network.
//!
//! Every evaluation result carries a [`Reason`] telling where its data came from. Before the
//! first successful sync all results fall back to defaults with [`Reason::Uninitialized`].
//!
//! Exposures are logged automatically and delivered in batches. Call [`Server::shutdown`] before
//! exiting to deliver what is still queued.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation never fails: missing specs, type
//! mismatches and broken rules produce a default value and, where useful, a diagnostic event.
//! Only construction may return an error (e.g., an invalid API URL).
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target `statsig` for
//! logging messages. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod conditions;
mod config;
mod data_adapter;
mod dynamic_config;
mod error;
mod evaluator;
mod events;
mod fetcher;
mod id_list;
mod server;
mod sharder;
mod snapshot;
mod spec;
mod spec_store;
mod user;
mod user_agent;

#[cfg(test)]
mod test_utils;

pub use config::StatsigOptions;
pub use data_adapter::{id_list_key, AdapterResult, DataAdapter, CONFIG_SPECS_KEY, ID_LISTS_KEY};
pub use dynamic_config::{DynamicConfig, EvaluationDetails, FeatureGate, Layer};
pub use error::{Error, Result};
pub use evaluator::{evaluate, Decision, Overrides, SecondaryExposure};
pub use events::{
    LogEvent, LogEventProcessor, CONFIG_EXPOSURE_EVENT, DEFAULT_VALUE_TYPE_MISMATCH_EVENT,
    GATE_EXPOSURE_EVENT, LAYER_EXPOSURE_EVENT,
};
pub use fetcher::{
    Fetcher, HttpFetcher, DOWNLOAD_CONFIG_SPECS_ENDPOINT, GET_ID_LISTS_ENDPOINT,
    LOG_EVENT_ENDPOINT,
};
pub use server::Server;
pub use snapshot::{Reason, Snapshot};
pub use spec::SpecKind;
pub use spec_store::SpecStore;
pub use user::StatsigUser;
