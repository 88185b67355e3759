use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The subject an evaluation is computed for.
///
/// A user is identified by `user_id` and/or any number of custom ids (`custom_ids`), keyed by id
/// type (e.g., `"companyID"`). Rules select which id to bucket on through their `idType`.
///
/// # Examples
/// ```
/// # use statsig::StatsigUser;
/// let user = StatsigUser::with_user_id("a-user")
///     .email("a-user@example.com")
///     .custom("plan", "premium")
///     .custom_id("companyID", "acme");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigUser {
    /// Primary user identifier.
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Raw user agent string, parsed by `ua_based` conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Two-letter country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Locale, e.g. `en_US`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Application version, compared with `version_*` operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Additional ids by id type.
    #[serde(rename = "customIDs", default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
    /// Application-defined attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
    /// Attributes used for evaluation only. They are never attached to logged events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private_attributes: HashMap<String, Value>,
    /// Environment the user is evaluated in (e.g., `tier`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub statsig_environment: HashMap<String, String>,
}

impl StatsigUser {
    /// Create a user identified by `user_id`.
    pub fn with_user_id(user_id: impl Into<String>) -> StatsigUser {
        StatsigUser {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Create a user identified only by a custom id.
    pub fn with_custom_id(id_type: impl Into<String>, id: impl Into<String>) -> StatsigUser {
        StatsigUser::default().custom_id(id_type, id)
    }

    /// Set `email`.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set `ip`.
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set `user_agent`.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set `country`.
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set `locale`.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Set `app_version`.
    pub fn app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    /// Add an id of type `id_type` (e.g., `"companyID"`).
    pub fn custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    /// Add a custom attribute.
    pub fn custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Add an attribute used for evaluation but never logged.
    pub fn private_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.private_attributes.insert(key.into(), value.into());
        self
    }

    /// Set an environment attribute (e.g., `tier`).
    pub fn environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.statsig_environment.insert(key.into(), value.into());
        self
    }

    /// Return `true` if the user carries at least one identifier.
    pub fn has_identity(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty()) || !self.custom_ids.is_empty()
    }

    /// Resolve the id used for bucketing under the given id type.
    ///
    /// `"userID"` (case-insensitive) selects `user_id`; anything else is looked up in
    /// `custom_ids`, first verbatim and then lowercased.
    pub(crate) fn get_unit_id(&self, id_type: &str) -> Option<&str> {
        if id_type.is_empty() || id_type.eq_ignore_ascii_case("userid") {
            return self.user_id.as_deref();
        }
        self.custom_ids
            .get(id_type)
            .or_else(|| self.custom_ids.get(&id_type.to_lowercase()))
            .map(String::as_str)
    }

    /// Look up a top-level or custom field by name.
    pub(crate) fn get_field(&self, field: &str) -> Option<Value> {
        let top_level = match field.to_lowercase().as_str() {
            "userid" | "user_id" => Some(&self.user_id),
            "email" => Some(&self.email),
            "ip" | "ipaddress" | "ip_address" => Some(&self.ip),
            "useragent" | "user_agent" => Some(&self.user_agent),
            "country" => Some(&self.country),
            "locale" => Some(&self.locale),
            "appversion" | "app_version" => Some(&self.app_version),
            _ => None,
        };
        if let Some(value) = top_level {
            return value.clone().map(Value::String);
        }

        let lower = field.to_lowercase();
        self.custom
            .get(field)
            .or_else(|| self.custom.get(&lower))
            .or_else(|| self.private_attributes.get(field))
            .or_else(|| self.private_attributes.get(&lower))
            .filter(|v| !v.is_null())
            .cloned()
    }

    pub(crate) fn get_environment_field(&self, field: &str) -> Option<Value> {
        self.statsig_environment
            .get(field)
            .or_else(|| self.statsig_environment.get(&field.to_lowercase()))
            .map(|v| Value::String(v.clone()))
    }

    /// A copy suitable for attaching to logged events.
    pub(crate) fn to_loggable(&self) -> StatsigUser {
        StatsigUser {
            private_attributes: HashMap::new(),
            ..self.clone()
        }
    }
}
