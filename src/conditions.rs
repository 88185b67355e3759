use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    evaluator::EvalContext,
    id_list::{hash_id, IdLists},
    sharder::{Md5Sharder, Sharder, USER_BUCKET_SHARDS},
    spec::default_id_type,
    user_agent,
};

/// A single predicate of a [`Rule`](crate::spec::Rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// What the condition inspects.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// How the inspected value is compared with `target_value`.
    #[serde(default)]
    pub operator: Option<Operator>,
    /// User, environment or user agent field to read, depending on the type.
    #[serde(default)]
    pub field: Option<String>,
    /// Value (or list of values) to compare against.
    #[serde(default)]
    pub target_value: Value,
    /// Extra parameters, e.g. the `salt` of a `user_bucket` condition.
    #[serde(default)]
    pub additional_values: HashMap<String, Value>,
    /// Id type used by `unit_id` and `user_bucket` conditions.
    #[serde(default = "default_id_type")]
    pub id_type: String,
}

/// Source of the value a [`Condition`] tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Always matches.
    Public,
    /// Matches if the gate named by the target passes.
    PassGate,
    /// Matches if the gate named by the target fails.
    FailGate,
    /// Matches if any of the listed gates passes.
    MultiPassGate,
    /// Matches if any of the listed gates fails.
    MultiFailGate,
    /// A field of the user, including `custom` and private attributes.
    UserField,
    /// A field of the user's environment, e.g. `tier`.
    EnvironmentField,
    /// An IP-derived field of the user, e.g. `country`.
    IpBased,
    /// A field parsed from the user agent, e.g. `os_name`.
    UaBased,
    /// Evaluation time, in milliseconds since epoch.
    CurrentTime,
    /// The user's bucket (0-999) for the condition's salt.
    UserBucket,
    /// The unit id selected by `id_type`.
    UnitId,
    /// Condition type this SDK does not know about. Never matches.
    #[serde(other)]
    Unknown,
}

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Numeric `>`.
    Gt,
    /// Numeric `>=`.
    Gte,
    /// Numeric `<`.
    Lt,
    /// Numeric `<=`.
    Lte,
    /// Dotted version `>`.
    VersionGt,
    /// Dotted version `>=`.
    VersionGte,
    /// Dotted version `<`.
    VersionLt,
    /// Dotted version `<=`.
    VersionLte,
    /// Dotted version equality.
    VersionEq,
    /// Dotted version inequality.
    VersionNeq,
    /// Case-insensitive membership in the target list.
    Any,
    /// Case-insensitive non-membership in the target list.
    #[serde(rename = "none")]
    NoneOf,
    /// Case-sensitive membership in the target list.
    AnyCaseSensitive,
    /// Case-sensitive non-membership in the target list.
    #[serde(rename = "none_case_sensitive")]
    NoneOfCaseSensitive,
    /// Starts with any target, ignoring case.
    StrStartsWithAny,
    /// Ends with any target, ignoring case.
    StrEndsWithAny,
    /// Contains any target, ignoring case.
    StrContainsAny,
    /// Contains no target, ignoring case.
    StrContainsNone,
    /// Matches the target regular expression.
    StrMatches,
    /// JSON equality.
    Eq,
    /// JSON inequality.
    Neq,
    /// Time strictly before the target.
    Before,
    /// Time strictly after the target.
    After,
    /// Same UTC calendar day as the target.
    On,
    /// Hashed value is in the ID list named by the target.
    InSegmentList,
    /// Hashed value is not in the ID list named by the target.
    NotInSegmentList,
    /// Array shares at least one element with the target.
    ArrayContainsAny,
    /// Array shares no element with the target.
    ArrayContainsNone,
    /// Array contains every target element.
    ArrayContainsAll,
    /// Array misses at least one target element.
    NotArrayContainsAll,
    /// Operator this SDK does not know about. Never matches.
    #[serde(other)]
    Unknown,
}

impl Condition {
    /// Evaluate the condition against the context's user. Returns `false` if the condition cannot
    /// be applied (missing field, malformed target value, nested gate cycle, unknown type).
    pub(crate) fn eval(&self, ctx: &mut EvalContext<'_>) -> bool {
        self.try_eval(ctx).unwrap_or(false)
    }

    fn try_eval(&self, ctx: &mut EvalContext<'_>) -> Option<bool> {
        let value = match self.condition_type {
            ConditionType::Public => return Some(true),

            ConditionType::PassGate | ConditionType::FailGate => {
                let gate = self.target_value.as_str()?;
                let pass = ctx.eval_nested_gate(gate)?;
                return Some(if self.condition_type == ConditionType::PassGate {
                    pass
                } else {
                    !pass
                });
            }

            ConditionType::MultiPassGate | ConditionType::MultiFailGate => {
                let want = self.condition_type == ConditionType::MultiPassGate;
                // Every listed gate is evaluated so each one is recorded as an exposure.
                let mut any = false;
                for gate in self.target_value.as_array()? {
                    any |= ctx.eval_nested_gate(gate.as_str()?)? == want;
                }
                return Some(any);
            }

            ConditionType::UserField | ConditionType::IpBased => {
                ctx.user.get_field(self.field.as_deref()?)
            }

            ConditionType::UaBased => {
                let field = self.field.as_deref()?;
                ctx.user.get_field(field).or_else(|| {
                    let ua = user_agent::parse(ctx.user.user_agent.as_deref()?);
                    ua.get(field).map(Value::from)
                })
            }

            ConditionType::EnvironmentField => {
                ctx.user.get_environment_field(self.field.as_deref()?)
            }

            ConditionType::CurrentTime => Some(Value::from(ctx.now.timestamp_millis())),

            ConditionType::UserBucket => {
                let salt = self
                    .additional_values
                    .get("salt")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let unit_id = ctx.user.get_unit_id(&self.id_type).unwrap_or_default();
                let bucket = Md5Sharder.get_shard(format!("{salt}.{unit_id}"), USER_BUCKET_SHARDS);
                Some(Value::from(bucket))
            }

            ConditionType::UnitId => ctx.user.get_unit_id(&self.id_type).map(Value::from),

            ConditionType::Unknown => {
                log::warn!(target: "statsig", "unsupported condition type, treating as non-matching");
                return None;
            }
        };

        self.operator?
            .try_eval(value.as_ref(), &self.target_value, &ctx.snapshot.id_lists)
    }
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, value: Option<&Value>, target: &Value, id_lists: &IdLists) -> bool {
        self.try_eval(value, target, id_lists).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, value: Option<&Value>, target: &Value, id_lists: &IdLists) -> Option<bool> {
        match self {
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let value = as_f64(value?)?;
                let target = as_f64(target)?;
                Some(match self {
                    Self::Gt => value > target,
                    Self::Gte => value >= target,
                    Self::Lt => value < target,
                    _ => value <= target,
                })
            }

            Self::VersionGt
            | Self::VersionGte
            | Self::VersionLt
            | Self::VersionLte
            | Self::VersionEq
            | Self::VersionNeq => {
                let ordering = compare_versions(&as_string(value?)?, &as_string(target)?)?;
                Some(match self {
                    Self::VersionGt => ordering == Ordering::Greater,
                    Self::VersionGte => ordering != Ordering::Less,
                    Self::VersionLt => ordering == Ordering::Less,
                    Self::VersionLte => ordering != Ordering::Greater,
                    Self::VersionEq => ordering == Ordering::Equal,
                    _ => ordering != Ordering::Equal,
                })
            }

            Self::Any | Self::NoneOf | Self::AnyCaseSensitive | Self::NoneOfCaseSensitive => {
                let case_sensitive =
                    matches!(self, Self::AnyCaseSensitive | Self::NoneOfCaseSensitive);
                let found = match value.and_then(as_string) {
                    Some(value) => target_strings(target)?.iter().any(|t| {
                        if case_sensitive {
                            *t == value
                        } else {
                            t.eq_ignore_ascii_case(&value)
                        }
                    }),
                    None => false,
                };
                Some(if matches!(self, Self::Any | Self::AnyCaseSensitive) {
                    found
                } else {
                    !found
                })
            }

            Self::StrStartsWithAny
            | Self::StrEndsWithAny
            | Self::StrContainsAny
            | Self::StrContainsNone => {
                let targets = target_strings(target)?;
                let found = match value.and_then(as_string) {
                    Some(value) => {
                        let value = value.to_lowercase();
                        targets.iter().map(|t| t.to_lowercase()).any(|t| match self {
                            Self::StrStartsWithAny => value.starts_with(&t),
                            Self::StrEndsWithAny => value.ends_with(&t),
                            _ => value.contains(&t),
                        })
                    }
                    None => false,
                };
                Some(if *self == Self::StrContainsNone {
                    !found
                } else {
                    found
                })
            }

            Self::StrMatches => {
                let value = as_string(value?)?;
                let regex = Regex::new(target.as_str()?).ok()?;
                Some(regex.is_match(&value))
            }

            Self::Eq | Self::Neq => {
                let value = value.unwrap_or(&Value::Null);
                let equal = value == target || matches!((as_f64(value), as_f64(target)), (Some(a), Some(b)) if a == b && value.is_number() && target.is_number());
                Some(if *self == Self::Eq { equal } else { !equal })
            }

            Self::Before | Self::After | Self::On => {
                let value = as_time(value?)?;
                let target = as_time(target)?;
                Some(match self {
                    Self::Before => value < target,
                    Self::After => value > target,
                    _ => value.date_naive() == target.date_naive(),
                })
            }

            Self::InSegmentList | Self::NotInSegmentList => {
                let list = id_lists.get(target.as_str()?);
                let found = match (list, value.and_then(as_string)) {
                    (Some(list), Some(value)) => list.contains_hashed(&hash_id(&value)),
                    _ => false,
                };
                Some(if *self == Self::InSegmentList {
                    found
                } else {
                    !found
                })
            }

            Self::ArrayContainsAny
            | Self::ArrayContainsNone
            | Self::ArrayContainsAll
            | Self::NotArrayContainsAll => {
                let values = value?.as_array()?;
                let values = values.iter().filter_map(as_string).collect::<Vec<_>>();
                let targets = target_strings(target)?;
                Some(match self {
                    Self::ArrayContainsAny => targets.iter().any(|t| values.contains(t)),
                    Self::ArrayContainsNone => !targets.iter().any(|t| values.contains(t)),
                    Self::ArrayContainsAll => targets.iter().all(|t| values.contains(t)),
                    _ => !targets.iter().all(|t| values.contains(t)),
                })
            }

            Self::Unknown => None,
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Target values are usually arrays, but a single scalar is accepted as a one-element list.
fn target_strings(target: &Value) -> Option<Vec<String>> {
    match target {
        Value::Array(values) => Some(values.iter().filter_map(as_string).collect()),
        other => as_string(other).map(|s| vec![s]),
    }
}

/// Interpret a number as epoch seconds or milliseconds (values with fewer than 11 digits are
/// seconds) and strings as such numbers, RFC 3339 timestamps, or `YYYY-MM-DD` dates.
fn as_time(value: &Value) -> Option<DateTime<Utc>> {
    fn from_number(n: i64) -> Option<DateTime<Utc>> {
        if n.unsigned_abs() < 100_000_000_000 {
            DateTime::from_timestamp(n, 0)
        } else {
            DateTime::from_timestamp_millis(n)
        }
    }

    match value {
        Value::Number(n) => from_number(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?),
        Value::String(s) => {
            if let Ok(n) = s.trim().parse::<i64>() {
                return from_number(n);
            }
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
            Some(date.and_hms_opt(0, 0, 0)?.and_utc())
        }
        _ => None,
    }
}

/// Compare two version strings. Semantic versions are compared with semver rules; anything else
/// is compared as dot-separated numbers (`"1.2.3.4"`), ignoring a `-suffix`, with missing parts
/// treated as zero.
fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    if let (Ok(a), Ok(b)) = (Version::parse(a), Version::parse(b)) {
        return Some(a.cmp(&b));
    }

    fn parts(v: &str) -> Option<Vec<u64>> {
        let v = v.split('-').next()?.trim();
        if v.is_empty() {
            return None;
        }
        v.split('.').map(|part| part.parse().ok()).collect()
    }

    let a = parts(a)?;
    let b = parts(b)?;
    for i in 0..a.len().max(b.len()) {
        let ordering = a
            .get(i)
            .copied()
            .unwrap_or(0)
            .cmp(&b.get(i).copied().unwrap_or(0));
        if ordering != Ordering::Equal {
            return Some(ordering);
        }
    }
    Some(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use serde_json::{json, Value};

    use super::Operator;
    use crate::id_list::{hash_id, IdList, IdLists};

    fn eval(op: Operator, value: Option<Value>, target: Value) -> bool {
        op.eval(value.as_ref(), &target, &IdLists::new())
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval(Operator::Gte, Some(json!(18)), json!(18)));
        assert!(!eval(Operator::Gte, Some(json!(17)), json!(18)));
        assert!(eval(Operator::Gt, Some(json!("19")), json!(18)));
        assert!(!eval(Operator::Gt, Some(json!(18)), json!(18)));
        assert!(eval(Operator::Lte, Some(json!(18.0)), json!("18")));
        assert!(eval(Operator::Lt, Some(json!(17)), json!(18)));
        assert!(!eval(Operator::Lt, None, json!(18)));
        assert!(!eval(Operator::Lt, Some(json!("abc")), json!(18)));
    }

    #[test]
    fn version_comparisons() {
        assert!(eval(Operator::VersionGt, Some(json!("1.0.1")), json!("1.0.0")));
        assert!(!eval(Operator::VersionGte, Some(json!("1.2.0")), json!("1.10.0")));
        assert!(eval(Operator::VersionGte, Some(json!("1.13.0")), json!("1.5.0")));
        assert!(eval(Operator::VersionLt, Some(json!("1.2.3.4")), json!("1.2.3.5")));
        assert!(eval(Operator::VersionEq, Some(json!("1.2")), json!("1.2.0.0")));
        assert!(eval(Operator::VersionNeq, Some(json!("1.2-beta")), json!("1.3")));
        assert!(eval(Operator::VersionLte, Some(json!("0.9.9")), json!("1.0.0")));
        assert!(!eval(Operator::VersionGt, Some(json!("not.a.version")), json!("1.0.0")));
    }

    #[test]
    fn any_and_none() {
        let target = json!(["alice", "Bob", 42]);
        assert!(eval(Operator::Any, Some(json!("alice")), target.clone()));
        assert!(eval(Operator::Any, Some(json!("bob")), target.clone()));
        assert!(eval(Operator::Any, Some(json!(42)), target.clone()));
        assert!(!eval(Operator::Any, Some(json!("charlie")), target.clone()));
        assert!(!eval(Operator::Any, None, target.clone()));

        assert!(!eval(Operator::NoneOf, Some(json!("alice")), target.clone()));
        assert!(eval(Operator::NoneOf, Some(json!("charlie")), target.clone()));
        assert!(eval(Operator::NoneOf, None, target.clone()));

        assert!(!eval(Operator::AnyCaseSensitive, Some(json!("bob")), target.clone()));
        assert!(eval(Operator::AnyCaseSensitive, Some(json!("Bob")), target.clone()));
        assert!(eval(Operator::NoneOfCaseSensitive, Some(json!("bob")), target));
    }

    #[test]
    fn string_operators() {
        let target = json!(["@statsig.com", "@example"]);
        assert!(eval(Operator::StrEndsWithAny, Some(json!("a@STATSIG.com")), target.clone()));
        assert!(eval(Operator::StrStartsWithAny, Some(json!("hello")), json!(["HE"])));
        assert!(eval(Operator::StrContainsAny, Some(json!("x@example.org")), target.clone()));
        assert!(!eval(Operator::StrContainsNone, Some(json!("x@example.org")), target.clone()));
        assert!(eval(Operator::StrContainsNone, Some(json!("x@other.org")), target));
        assert!(eval(Operator::StrMatches, Some(json!("test@example.com")), json!("^test.*")));
        assert!(!eval(Operator::StrMatches, Some(json!("example@test.com")), json!("^test.*")));
        // Invalid regex fails closed.
        assert!(!eval(Operator::StrMatches, Some(json!("anything")), json!("(")));
    }

    #[test]
    fn equality() {
        assert!(eval(Operator::Eq, Some(json!("a")), json!("a")));
        assert!(eval(Operator::Eq, Some(json!(1)), json!(1.0)));
        assert!(eval(Operator::Eq, None, Value::Null));
        assert!(eval(Operator::Neq, Some(json!("a")), json!("b")));
        assert!(!eval(Operator::Neq, Some(json!(true)), json!(true)));
    }

    #[test]
    fn time_operators() {
        // 2021-09-14T16:46:54Z in seconds and milliseconds.
        assert!(eval(Operator::Before, Some(json!(1631638014)), json!(1631638014811u64 + 1000)));
        assert!(eval(Operator::After, Some(json!(1631638014811u64)), json!("2021-09-01")));
        assert!(eval(Operator::On, Some(json!("2021-09-14T23:00:00Z")), json!(1631638014811u64)));
        assert!(!eval(Operator::On, Some(json!("2021-09-15T00:00:01Z")), json!(1631638014811u64)));
        assert!(!eval(Operator::Before, Some(json!("garbage")), json!(1)));
    }

    #[test]
    fn segment_lists() {
        let mut list = IdList {
            name: "beta_users".to_owned(),
            ..Default::default()
        };
        list.ids = HashSet::from([hash_id("u1")]);
        let lists: IdLists = HashMap::from([("beta_users".to_owned(), list)]);

        let target = json!("beta_users");
        assert!(Operator::InSegmentList.eval(Some(&json!("u1")), &target, &lists));
        assert!(!Operator::InSegmentList.eval(Some(&json!("u2")), &target, &lists));
        assert!(Operator::NotInSegmentList.eval(Some(&json!("u2")), &target, &lists));
        assert!(Operator::NotInSegmentList.eval(Some(&json!("u1")), &json!("missing"), &lists));
    }

    #[test]
    fn array_operators() {
        let value = Some(json!(["a", "b"]));
        assert!(eval(Operator::ArrayContainsAny, value.clone(), json!(["b", "c"])));
        assert!(!eval(Operator::ArrayContainsNone, value.clone(), json!(["b", "c"])));
        assert!(eval(Operator::ArrayContainsAll, value.clone(), json!(["a", "b"])));
        assert!(eval(Operator::NotArrayContainsAll, value.clone(), json!(["a", "c"])));
        assert!(!eval(Operator::ArrayContainsAny, Some(json!("a")), json!(["a"])));
    }

    #[test]
    fn unknown_operator_never_matches() {
        let op: Operator = serde_json::from_value(json!("some_future_operator")).unwrap();
        assert_eq!(op, Operator::Unknown);
        assert!(!eval(op, Some(json!(1)), json!(1)));
    }
}
