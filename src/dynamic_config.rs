//! Evaluation results handed to application code.
use std::{fmt, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{
    evaluator::Decision,
    events::{LogEvent, LogEventProcessor},
    snapshot::Reason,
    StatsigUser,
};

/// Where an evaluation result came from and how fresh the underlying specs were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationDetails {
    /// Source of the data the result was computed from.
    pub reason: Reason,
    /// Time (milliseconds since epoch) of the specs the result was computed from.
    pub config_sync_time: u64,
    /// Time the specs were first obtained.
    pub init_time: u64,
    /// Time the evaluation happened.
    pub server_time: u64,
}

impl From<&Decision> for EvaluationDetails {
    fn from(decision: &Decision) -> EvaluationDetails {
        EvaluationDetails {
            reason: decision.reason,
            config_sync_time: decision.config_sync_time,
            init_time: decision.init_time,
            server_time: decision.server_time,
        }
    }
}

/// The evaluated value of a feature gate.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGate {
    /// Gate name.
    pub name: String,
    /// `true` if the gate passed.
    pub value: bool,
    /// Id of the rule that decided the result.
    pub rule_id: String,
    /// Name of the matched rule's group, if any.
    pub group_name: Option<String>,
    /// Id type the result was bucketed on.
    pub id_type: String,
    /// Provenance and timing of the result.
    pub details: EvaluationDetails,
}

impl From<&Decision> for FeatureGate {
    fn from(decision: &Decision) -> FeatureGate {
        FeatureGate {
            name: decision.name.clone(),
            value: decision.value,
            rule_id: decision.rule_id.clone(),
            group_name: decision.group_name.clone(),
            id_type: decision.id_type.clone(),
            details: EvaluationDetails::from(decision),
        }
    }
}

/// Reports diagnostics (and, for layers, exposures) on behalf of the user a result was computed
/// for.
#[derive(Clone)]
pub(crate) struct EventSink {
    logger: Arc<LogEventProcessor>,
    user: StatsigUser,
}

impl EventSink {
    pub(crate) fn new(logger: Arc<LogEventProcessor>, user: StatsigUser) -> EventSink {
        EventSink { logger, user }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("user", &self.user).finish()
    }
}

/// Name of the JSON type of `value`, as reported in `default_value_type_mismatch` events.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome of a typed parameter lookup.
enum Lookup<T> {
    Missing,
    Found(T),
    Mismatch {
        value_type: &'static str,
        default_value_type: &'static str,
    },
}

/// Read `key` from `values` as a `T` shaped like `default`.
///
/// A `null` default accepts any stored type that deserializes into `T`.
fn lookup<T, F>(values: &Map<String, Value>, key: &str, default: &T, guard: F) -> Lookup<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&T) -> bool,
{
    let Some(stored) = values.get(key) else {
        return Lookup::Missing;
    };

    let default_value_type = serde_json::to_value(default)
        .map(|v| json_type_name(&v))
        .unwrap_or("null");
    let value_type = json_type_name(stored);

    let type_matches = default_value_type == "null" || default_value_type == value_type;
    let parsed = if type_matches {
        serde_json::from_value::<T>(stored.clone()).ok()
    } else {
        None
    };

    match parsed {
        Some(value) if guard(&value) => Lookup::Found(value),
        _ => Lookup::Mismatch {
            value_type,
            default_value_type,
        },
    }
}

fn object_of(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// The evaluated value of a dynamic config or experiment.
///
/// # Examples
/// ```no_run
/// # async fn f(server: &statsig::Server, user: &statsig::StatsigUser) {
/// let config = server.get_config(user, "pricing");
/// let discount: f64 = config.get("discount", 0.0);
/// let tier = config.get_with_guard("tier", "basic".to_owned(), |t| !t.is_empty());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DynamicConfig {
    /// Config or experiment name.
    pub name: String,
    /// Parameters. Prefer the typed [`get`](DynamicConfig::get).
    pub value: Map<String, Value>,
    /// Id of the rule that decided the result.
    pub rule_id: String,
    /// Experiment group, if the matched rule is one.
    pub group_name: Option<String>,
    /// Id type the result was bucketed on.
    pub id_type: String,
    /// Provenance and timing of the result.
    pub details: EvaluationDetails,
    sink: Option<EventSink>,
}

impl DynamicConfig {
    pub(crate) fn new(decision: &Decision, sink: Option<EventSink>) -> DynamicConfig {
        DynamicConfig {
            name: decision.name.clone(),
            value: object_of(&decision.json_value),
            rule_id: decision.rule_id.clone(),
            group_name: decision.group_name.clone(),
            id_type: decision.id_type.clone(),
            details: EvaluationDetails::from(decision),
            sink,
        }
    }

    /// Return parameter `key`, or `default` if it is missing or not of the default's type.
    ///
    /// A parameter of the wrong type is reported with a `statsig::default_value_type_mismatch`
    /// event.
    pub fn get<T: Serialize + DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_with_guard(key, default, |_| true)
    }

    /// Like [`get`](DynamicConfig::get), but also falls back to `default` (and reports a
    /// mismatch) when `guard` rejects the stored value.
    pub fn get_with_guard<T, F>(&self, key: &str, default: T, guard: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        match lookup(&self.value, key, &default, guard) {
            Lookup::Found(value) => value,
            Lookup::Missing => default,
            Lookup::Mismatch {
                value_type,
                default_value_type,
            } => {
                report_mismatch(
                    self.sink.as_ref(),
                    &self.name,
                    key,
                    &self.rule_id,
                    value_type,
                    default_value_type,
                );
                default
            }
        }
    }
}

/// The evaluated value of a layer. Reading a parameter logs a layer exposure for it.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Layer name.
    pub name: String,
    /// Parameters. Reading them directly logs no exposure.
    pub value: Map<String, Value>,
    /// Id of the rule that decided the result.
    pub rule_id: String,
    /// Experiment group, if the user was allocated to one.
    pub group_name: Option<String>,
    /// Experiment the user was allocated to through this layer, if any.
    pub allocated_experiment: Option<String>,
    /// Provenance and timing of the result.
    pub details: EvaluationDetails,
    decision: Decision,
    sink: Option<EventSink>,
    log_exposures: bool,
}

impl Layer {
    pub(crate) fn new(decision: Decision, sink: Option<EventSink>, log_exposures: bool) -> Layer {
        Layer {
            name: decision.name.clone(),
            value: object_of(&decision.json_value),
            rule_id: decision.rule_id.clone(),
            group_name: decision.group_name.clone(),
            allocated_experiment: decision.config_delegate.clone(),
            details: EvaluationDetails::from(&decision),
            decision,
            sink,
            log_exposures,
        }
    }

    /// Return parameter `key`, or `default` if it is missing or not of the default's type.
    ///
    /// Logs a layer exposure for `key` only when the stored value is returned.
    pub fn get<T: Serialize + DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_with_guard(key, default, |_| true)
    }

    /// Like [`get`](Layer::get), but also falls back to `default` when `guard` rejects the value.
    pub fn get_with_guard<T, F>(&self, key: &str, default: T, guard: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        match lookup(&self.value, key, &default, guard) {
            Lookup::Found(value) => {
                if self.log_exposures {
                    self.log_parameter_exposure(key, false);
                }
                value
            }
            Lookup::Missing => default,
            Lookup::Mismatch {
                value_type,
                default_value_type,
            } => {
                report_mismatch(
                    self.sink.as_ref(),
                    &self.name,
                    key,
                    &self.rule_id,
                    value_type,
                    default_value_type,
                );
                default
            }
        }
    }

    pub(crate) fn log_parameter_exposure(&self, parameter_name: &str, is_manual: bool) {
        if let Some(sink) = &self.sink {
            sink.logger.log(LogEvent::layer_exposure(
                &sink.user,
                &self.decision,
                parameter_name,
                is_manual,
            ));
        }
    }
}

fn report_mismatch(
    sink: Option<&EventSink>,
    name: &str,
    parameter: &str,
    rule_id: &str,
    value_type: &str,
    default_value_type: &str,
) {
    log::debug!(target: "statsig",
                spec_name = name,
                parameter,
                value_type,
                default_value_type;
                "parameter does not match the requested type, returning default");
    if let Some(sink) = sink {
        sink.logger.log(LogEvent::default_value_type_mismatch(
            &sink.user,
            name,
            parameter,
            rule_id,
            value_type,
            default_value_type,
        ));
    }
}
