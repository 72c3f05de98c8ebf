use std::collections::HashMap;

use crate::{error::StepError, template::Template};

/// Values stored in a session: strings, numbers, booleans, or any JSON blob.
pub use serde_json::Value;

/// Per-virtual-user variable store.
///
/// A session belongs to exactly one virtual user for that user's whole
/// lifetime. Steps receive it by value and hand back the updated one, so
/// there is no shared or ambient state to lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    user_id: u64,
    vars: HashMap<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_user(user_id: u64) -> Self {
        Self {
            user_id,
            vars: HashMap::new(),
        }
    }

    /// Id of the virtual user owning this session.
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Convenience accessor for string variables.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Returns the session with `key` bound to `value`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn remove(mut self, key: &str) -> Self {
        self.vars.remove(key);
        self
    }

    /// Returns the session with every entry of `record` bound, overwriting
    /// existing keys of the same name.
    #[must_use]
    pub fn merge<I, K>(mut self, record: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.vars
            .extend(record.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Substitutes every `#{name}` placeholder of `template`.
    ///
    /// See [`Template`] for the exact rules. Scenario steps parse their
    /// templates once and call [`Template::render`] directly.
    pub fn render(&self, template: &str) -> Result<String, StepError> {
        Template::parse(template).render(self)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }
}
