//! Rule definitions as served by the `download_config_specs` endpoint.
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::Condition;

/// Response format of the `download_config_specs` endpoint. Bootstrap values and data adapter
/// payloads use the same format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSpecs {
    /// Each spec is wrapped in `TryParse` so that a spec in an unexpected format does not prevent
    /// serving the rest.
    #[serde(default)]
    pub feature_gates: Vec<TryParse<Spec>>,
    /// Dynamic configs and experiments.
    #[serde(default)]
    pub dynamic_configs: Vec<TryParse<Spec>>,
    /// Layers.
    #[serde(default)]
    pub layer_configs: Vec<TryParse<Spec>>,
    /// Layer name to the experiments allocated in it.
    #[serde(default)]
    pub layers: HashMap<String, Vec<String>>,
    /// `false` if nothing changed since the requested time.
    #[serde(default)]
    pub has_updates: bool,
    /// Generation of this document (milliseconds since epoch).
    #[serde(default)]
    pub time: u64,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Kind of a spec, which decides where it is looked up and how its result is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecKind {
    /// Feature gates.
    Gate,
    /// Dynamic configs and experiments.
    Config,
    /// Layers.
    Layer,
}

/// A named rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Unique name within its kind.
    pub name: String,
    /// Wire type, e.g. `"feature_gate"`.
    #[serde(rename = "type", default)]
    pub spec_type: String,
    /// Salt used for bucketing.
    pub salt: String,
    /// A disabled spec always returns its default value.
    pub enabled: bool,
    /// Value returned when no rule passes.
    #[serde(default)]
    pub default_value: Value,
    /// Rules in evaluation order. The first matching rule decides.
    pub rules: Vec<Rule>,
    /// Id type used when a rule does not name one.
    #[serde(default = "default_id_type")]
    pub id_type: String,
    /// `"feature_gate"`, `"dynamic_config"`, `"experiment"`, `"layer"`, ...
    #[serde(default)]
    pub entity: Option<String>,
    /// For experiments: whether experiment groups are assigned.
    #[serde(default)]
    pub is_active: Option<bool>,
    /// For experiments in a layer: parameters the experiment owns.
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
}

/// One ordered branch of a [`Spec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Human-readable rule name.
    #[serde(default)]
    pub name: String,
    /// Rule id reported in results and exposures.
    pub id: String,
    /// Bucketing salt. Defaults to the rule id.
    #[serde(default)]
    pub salt: Option<String>,
    /// Share (0-100) of matching units that pass.
    pub pass_percentage: f64,
    /// All conditions must match.
    pub conditions: Vec<Condition>,
    /// Value returned when the rule passes.
    #[serde(default)]
    pub return_value: Value,
    /// Id type the rule buckets on.
    #[serde(default = "default_id_type")]
    pub id_type: String,
    /// Experiment group name.
    #[serde(default)]
    pub group_name: Option<String>,
    /// For layer rules: experiment to delegate to.
    #[serde(default)]
    pub config_delegate: Option<String>,
    /// `true` if the rule assigns an experiment group.
    #[serde(default)]
    pub is_experiment_group: bool,
}

pub(crate) fn default_id_type() -> String {
    "userID".to_owned()
}

/// Parsed specs indexed by name. Part of a [`Snapshot`](crate::Snapshot).
#[derive(Debug, Clone, Default)]
pub struct Specs {
    /// Feature gates by name.
    pub gates: HashMap<String, Arc<Spec>>,
    /// Dynamic configs and experiments by name.
    pub configs: HashMap<String, Arc<Spec>>,
    /// Layers by name.
    pub layers: HashMap<String, Arc<Spec>>,
}

impl Specs {
    /// Index a parsed document. Specs that failed to parse are logged and skipped.
    pub fn from_config_specs(specs: ConfigSpecs) -> Specs {
        fn index(list: Vec<TryParse<Spec>>, kind: &str) -> HashMap<String, Arc<Spec>> {
            list.into_iter()
                .filter_map(|spec| match spec {
                    TryParse::Parsed(spec) => Some((spec.name.clone(), Arc::new(spec))),
                    TryParse::ParseFailed(value) => {
                        log::warn!(target: "statsig",
                                   kind,
                                   name:display = value.get("name").and_then(Value::as_str).unwrap_or("<unknown>");
                                   "skipping spec that failed to parse");
                        None
                    }
                })
                .collect()
        }

        Specs {
            gates: index(specs.feature_gates, "gate"),
            configs: index(specs.dynamic_configs, "config"),
            layers: index(specs.layer_configs, "layer"),
        }
    }

    /// Look up `name` among specs of `kind`.
    pub fn get(&self, kind: SpecKind, name: &str) -> Option<&Arc<Spec>> {
        match kind {
            SpecKind::Gate => self.gates.get(name),
            SpecKind::Config => self.configs.get(name),
            SpecKind::Layer => self.layers.get(name),
        }
    }

    /// Number of specs of all kinds.
    pub fn len(&self) -> usize {
        self.gates.len() + self.configs.len() + self.layers.len()
    }

    /// `true` if no spec is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use super::{ConfigSpecs, SpecKind, Specs, TryParse};

    #[test]
    fn parse_download_config_specs() {
        let f = File::open("tests/data/download_config_specs.json")
            .expect("Failed to open tests/data/download_config_specs.json");
        let specs: ConfigSpecs = serde_json::from_reader(BufReader::new(f)).unwrap();
        assert!(specs.has_updates);
        assert_eq!(specs.time, 1631638014811);

        let specs = Specs::from_config_specs(specs);
        assert!(specs.get(SpecKind::Gate, "always_on_gate").is_some());
        assert!(specs.get(SpecKind::Config, "test_config").is_some());
        assert!(specs.get(SpecKind::Layer, "a_layer").is_some());
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let specs: ConfigSpecs = serde_json::from_str(
            r#"
              {
                "has_updates": true,
                "time": 1,
                "feature_gates": [
                  {
                    "name": "success",
                    "type": "feature_gate",
                    "salt": "s",
                    "enabled": true,
                    "defaultValue": false,
                    "rules": []
                  },
                  {
                    "name": "fail_parsing",
                    "type": "feature_gate",
                    "enabled": "not-a-bool",
                    "rules": []
                  }
                ]
              }
            "#,
        )
        .unwrap();
        assert!(matches!(specs.feature_gates[0], TryParse::Parsed(_)));
        assert!(matches!(specs.feature_gates[1], TryParse::ParseFailed(_)));

        let specs = Specs::from_config_specs(specs);
        assert_eq!(specs.gates.len(), 1);
        assert!(specs.gates.contains_key("success"));
    }
}
