//! Rule evaluation. A pure function of a [`Snapshot`], a user, and local overrides.
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    sharder::{passes_percentage, Md5Sharder},
    snapshot::{Reason, Snapshot},
    spec::{Spec, SpecKind},
    StatsigUser,
};

/// Rule id reported for a spec that has no matching rule.
pub const DEFAULT_RULE_ID: &str = "default";
/// Rule id reported for a disabled spec.
pub const DISABLED_RULE_ID: &str = "disabled";
/// Rule id reported for a value forced by a local override.
pub const OVERRIDE_RULE_ID: &str = "override";

/// A nested gate result discovered while evaluating another spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryExposure {
    /// Name of the nested gate.
    pub gate: String,
    /// `"true"` or `"false"`.
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    /// Rule that decided the nested gate.
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

/// Result of evaluating one spec for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Kind the name was looked up as.
    pub kind: SpecKind,
    /// Requested spec name.
    pub name: String,
    /// Gate result. For configs and layers, `true` if a rule passed.
    pub value: bool,
    /// Config or layer value. For gates, the boolean result.
    pub json_value: Value,
    /// Id of the matched rule, [`DEFAULT_RULE_ID`] or [`DISABLED_RULE_ID`].
    pub rule_id: String,
    /// Group of the matched rule, if any.
    pub group_name: Option<String>,
    /// Id type of the matched rule.
    pub id_type: String,
    /// Where the data for this decision came from.
    pub reason: Reason,
    /// Nested gate exposures, deduplicated by gate name and rule id.
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// For layers delegating to an experiment: the exposures of the layer alone.
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    /// For layers: experiment the user was allocated to.
    pub config_delegate: Option<String>,
    /// For layers: parameters owned by `config_delegate`.
    pub explicit_parameters: Vec<String>,
    /// `true` if the matched rule is an experiment group.
    pub is_experiment_group: bool,
    /// `true` if the evaluated experiment is running.
    pub is_experiment_active: bool,
    /// `last_update_time` of the snapshot.
    pub config_sync_time: u64,
    /// `init_time` of the snapshot.
    pub init_time: u64,
    /// Evaluation time (milliseconds since epoch).
    pub server_time: u64,
}

impl Decision {
    fn fallback(kind: SpecKind, name: &str, snapshot: &Snapshot, now: DateTime<Utc>) -> Decision {
        Decision {
            kind,
            name: name.to_owned(),
            value: false,
            json_value: match kind {
                SpecKind::Gate => Value::Bool(false),
                SpecKind::Config | SpecKind::Layer => Value::Object(Map::new()),
            },
            rule_id: DEFAULT_RULE_ID.to_owned(),
            group_name: None,
            id_type: String::new(),
            reason: snapshot.reason,
            secondary_exposures: Vec::new(),
            undelegated_secondary_exposures: Vec::new(),
            config_delegate: None,
            explicit_parameters: Vec::new(),
            is_experiment_group: false,
            is_experiment_active: false,
            config_sync_time: snapshot.last_update_time,
            init_time: snapshot.init_time,
            server_time: now.timestamp_millis().max(0) as u64,
        }
    }
}

/// Caller-registered values that short-circuit evaluation.
///
/// Each override applies either to every user or to a single user id (matched against the user's
/// `user_id` and custom ids). A user-specific override wins over an all-users one.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    gates: HashMap<String, HashMap<String, Value>>,
    configs: HashMap<String, HashMap<String, Value>>,
    layers: HashMap<String, HashMap<String, Value>>,
}

/// Key used for overrides that apply to every user.
const ALL_USERS: &str = "";

impl Overrides {
    fn table(&self, kind: SpecKind) -> &HashMap<String, HashMap<String, Value>> {
        match kind {
            SpecKind::Gate => &self.gates,
            SpecKind::Config => &self.configs,
            SpecKind::Layer => &self.layers,
        }
    }

    fn table_mut(&mut self, kind: SpecKind) -> &mut HashMap<String, HashMap<String, Value>> {
        match kind {
            SpecKind::Gate => &mut self.gates,
            SpecKind::Config => &mut self.configs,
            SpecKind::Layer => &mut self.layers,
        }
    }

    /// Force `name` to `value` for `user_id`, or for every user if `user_id` is `None`.
    pub fn set(&mut self, kind: SpecKind, name: impl Into<String>, value: Value, user_id: Option<&str>) {
        self.table_mut(kind)
            .entry(name.into())
            .or_default()
            .insert(user_id.unwrap_or(ALL_USERS).to_owned(), value);
    }

    /// Remove the override for `user_id`, or every override of `name` if `user_id` is `None`.
    pub fn remove(&mut self, kind: SpecKind, name: &str, user_id: Option<&str>) {
        let table = self.table_mut(kind);
        match user_id {
            None => {
                table.remove(name);
            }
            Some(user_id) => {
                if let Some(by_user) = table.get_mut(name) {
                    by_user.remove(user_id);
                    if by_user.is_empty() {
                        table.remove(name);
                    }
                }
            }
        }
    }

    /// Remove every override.
    pub fn clear(&mut self) {
        self.gates.clear();
        self.configs.clear();
        self.layers.clear();
    }

    /// `true` if no override is registered.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty() && self.configs.is_empty() && self.layers.is_empty()
    }

    /// Override applying to `user`, preferring one registered for any of the user's ids.
    pub fn get(&self, kind: SpecKind, name: &str, user: &StatsigUser) -> Option<&Value> {
        let by_user = self.table(kind).get(name)?;
        user.user_id
            .iter()
            .chain(user.custom_ids.values())
            .find_map(|id| by_user.get(id.as_str()))
            .or_else(|| by_user.get(ALL_USERS))
    }
}

/// Evaluate spec `name` of the given kind for `user`.
///
/// Never fails: a missing snapshot, an unknown name, or a broken rule all produce a usable
/// default decision whose [`Reason`] explains where the answer came from.
pub fn evaluate(
    snapshot: &Snapshot,
    user: &StatsigUser,
    name: &str,
    kind: SpecKind,
    overrides: &Overrides,
    now: DateTime<Utc>,
) -> Decision {
    let mut decision = Decision::fallback(kind, name, snapshot, now);

    if let Some(value) = overrides.get(kind, name, user) {
        decision.reason = Reason::LocalOverride;
        decision.rule_id = OVERRIDE_RULE_ID.to_owned();
        match kind {
            SpecKind::Gate => {
                decision.value = value.as_bool().unwrap_or(false);
                decision.json_value = Value::Bool(decision.value);
            }
            SpecKind::Config | SpecKind::Layer => {
                decision.value = true;
                decision.json_value = value.clone();
            }
        }
        return decision;
    }

    if !snapshot.is_initialized() {
        decision.reason = Reason::Uninitialized;
        return decision;
    }

    let Some(spec) = snapshot.specs.get(kind, name) else {
        decision.reason = Reason::Unrecognized;
        return decision;
    };

    let mut ctx = EvalContext::new(snapshot, user, now);
    ctx.in_progress.insert((kind, spec.name.as_str()));
    let result = ctx.eval_spec(spec);

    decision.value = result.value;
    decision.json_value = result.json_value;
    decision.rule_id = result.rule_id;
    decision.group_name = result.group_name;
    decision.id_type = result.id_type;
    decision.is_experiment_group = result.is_experiment_group;
    decision.is_experiment_active = result.is_experiment_active;
    decision.config_delegate = result.config_delegate;
    decision.explicit_parameters = result.explicit_parameters;
    decision.undelegated_secondary_exposures = result.undelegated_secondary_exposures;
    decision.secondary_exposures = ctx.exposures;

    log::trace!(target: "statsig",
                spec_name = name,
                rule_id:display = decision.rule_id,
                value = decision.value,
                reason = decision.reason;
                "evaluated spec");

    decision
}

/// Outcome of walking one spec's rules.
#[derive(Debug, Default)]
struct SpecResult {
    value: bool,
    json_value: Value,
    rule_id: String,
    group_name: Option<String>,
    id_type: String,
    is_experiment_group: bool,
    is_experiment_active: bool,
    config_delegate: Option<String>,
    explicit_parameters: Vec<String>,
    undelegated_secondary_exposures: Vec<SecondaryExposure>,
}

impl SpecResult {
    fn fallback(spec: &Spec, rule_id: &str) -> SpecResult {
        SpecResult {
            value: false,
            json_value: spec.default_value.clone(),
            rule_id: rule_id.to_owned(),
            id_type: spec.id_type.clone(),
            is_experiment_active: spec.is_active.unwrap_or(false),
            ..SpecResult::default()
        }
    }
}

/// State threaded through one top-level evaluation and all nested gate evaluations it triggers.
pub(crate) struct EvalContext<'a> {
    pub snapshot: &'a Snapshot,
    pub user: &'a StatsigUser,
    pub now: DateTime<Utc>,
    exposures: Vec<SecondaryExposure>,
    /// Specs currently being evaluated up the call chain. Revisiting one is a cycle.
    in_progress: HashSet<(SpecKind, &'a str)>,
}

impl<'a> EvalContext<'a> {
    fn new(snapshot: &'a Snapshot, user: &'a StatsigUser, now: DateTime<Utc>) -> Self {
        EvalContext {
            snapshot,
            user,
            now,
            exposures: Vec::new(),
            in_progress: HashSet::new(),
        }
    }

    fn eval_spec(&mut self, spec: &'a Spec) -> SpecResult {
        if !spec.enabled {
            return SpecResult::fallback(spec, DISABLED_RULE_ID);
        }

        for rule in &spec.rules {
            if rule.is_experiment_group && spec.is_active == Some(false) {
                continue;
            }

            // Every condition is evaluated so that all nested gate exposures are recorded.
            let mut matched = true;
            for condition in &rule.conditions {
                matched &= condition.eval(self);
            }
            if !matched {
                continue;
            }

            if let Some(delegate) = rule.config_delegate.as_deref() {
                if let Some(result) = self.eval_delegate(delegate) {
                    return result;
                }
            }

            let unit_id = self.user.get_unit_id(&rule.id_type).unwrap_or_default();
            let rule_salt = rule.salt.as_deref().unwrap_or(&rule.id);
            let pass = passes_percentage(
                &Md5Sharder,
                &spec.salt,
                rule_salt,
                unit_id,
                rule.pass_percentage,
            );

            return SpecResult {
                value: pass,
                json_value: if pass {
                    rule.return_value.clone()
                } else {
                    spec.default_value.clone()
                },
                rule_id: rule.id.clone(),
                group_name: rule.group_name.clone(),
                id_type: rule.id_type.clone(),
                is_experiment_group: rule.is_experiment_group,
                is_experiment_active: spec.is_active.unwrap_or(false),
                ..SpecResult::default()
            };
        }

        SpecResult::fallback(spec, DEFAULT_RULE_ID)
    }

    /// Evaluate the experiment a layer rule delegates to. `None` if the experiment is unknown, in
    /// which case the layer rule itself applies.
    fn eval_delegate(&mut self, name: &str) -> Option<SpecResult> {
        let snapshot = self.snapshot;
        let spec = snapshot.specs.get(SpecKind::Config, name)?;
        let key = (SpecKind::Config, spec.name.as_str());
        if !self.in_progress.insert(key) {
            log::warn!(target: "statsig", spec_name = name; "delegation cycle detected");
            return None;
        }

        let undelegated = self.exposures.clone();
        let mut result = self.eval_spec(spec);
        self.in_progress.remove(&key);

        result.config_delegate = Some(spec.name.clone());
        result.explicit_parameters = spec.explicit_parameters.clone().unwrap_or_default();
        result.undelegated_secondary_exposures = undelegated;
        Some(result)
    }

    /// Evaluate a gate referenced by a condition and record it as a secondary exposure.
    ///
    /// Returns `None` on a reference cycle, which the calling condition treats as "no match".
    pub(crate) fn eval_nested_gate(&mut self, name: &str) -> Option<bool> {
        let snapshot = self.snapshot;
        let Some(spec) = snapshot.specs.get(SpecKind::Gate, name) else {
            self.push_exposure(name, false, "");
            return Some(false);
        };

        let key = (SpecKind::Gate, spec.name.as_str());
        if !self.in_progress.insert(key) {
            log::warn!(target: "statsig", spec_name = name; "nested gate cycle detected, failing closed");
            return None;
        }
        let result = self.eval_spec(spec);
        self.in_progress.remove(&key);

        self.push_exposure(name, result.value, &result.rule_id);
        Some(result.value)
    }

    fn push_exposure(&mut self, gate: &str, value: bool, rule_id: &str) {
        let exists = self
            .exposures
            .iter()
            .any(|e| e.gate == gate && e.rule_id == rule_id);
        if !exists {
            self.exposures.push(SecondaryExposure {
                gate: gate.to_owned(),
                gate_value: value.to_string(),
                rule_id: rule_id.to_owned(),
            });
        }
    }
}
