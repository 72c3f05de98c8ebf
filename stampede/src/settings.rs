//! Named, overridable run parameters.
//!
//! Where the overrides come from (environment, CLI, a config file) is up to
//! the caller: [`RunSettings::resolve`] only needs a lookup function.
//!
//! ```rust
//! use std::time::Duration;
//! use stampede::RunSettings;
//!
//! let settings = RunSettings::resolve(|key| (key == "USERS").then(|| "50".to_string())).unwrap();
//! assert_eq!(settings.users, 50);
//! assert_eq!(settings.ramp_duration, Duration::from_secs(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::SettingsError, injection::InjectionProfile};

pub const USERS: &str = "USERS";
pub const RAMP_DURATION: &str = "RAMP_DURATION";
pub const TEST_DURATION: &str = "TEST_DURATION";

/// User count, ramp duration and total test duration of a run.
///
/// Durations (de)serialize as seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub users: u64,
    #[serde(with = "seconds")]
    pub ramp_duration: Duration,
    #[serde(with = "seconds")]
    pub test_duration: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            users: 5,
            ramp_duration: Duration::from_secs(10),
            test_duration: Duration::from_secs(20),
        }
    }
}

impl RunSettings {
    /// Defaults overridden by whatever `lookup` returns for [`USERS`],
    /// [`RAMP_DURATION`] and [`TEST_DURATION`].
    pub fn resolve<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(value) = lookup(USERS) {
            settings.users = value.trim().parse().map_err(|e| SettingsError {
                key: USERS.to_owned(),
                value: value.clone(),
                message: format!("{e}"),
            })?;
        }
        if let Some(value) = lookup(RAMP_DURATION) {
            settings.ramp_duration = parse_duration(RAMP_DURATION, &value)?;
        }
        if let Some(value) = lookup(TEST_DURATION) {
            settings.test_duration = parse_duration(TEST_DURATION, &value)?;
        }
        tracing::debug!(?settings, "Resolved run settings");
        Ok(settings)
    }

    /// All users ramped linearly over the ramp duration.
    pub fn injection(&self) -> InjectionProfile {
        InjectionProfile::new().ramp_users(self.users, self.ramp_duration)
    }
}

/// Seconds (`"10"`, `"2.5"`, `"10s"`) or milliseconds (`"500ms"`).
fn parse_duration(key: &str, value: &str) -> Result<Duration, SettingsError> {
    let error = |message: String| SettingsError {
        key: key.to_owned(),
        value: value.to_owned(),
        message,
    };
    let trimmed = value.trim();
    let (number, scale) = match trimmed.strip_suffix("ms") {
        Some(ms) => (ms, 1e-3),
        None => (trimmed.strip_suffix('s').unwrap_or(trimmed), 1.0),
    };
    let number: f64 = number.trim().parse().map_err(|e| error(format!("{e}")))?;
    Duration::try_from_secs_f64(number * scale).map_err(|e| error(format!("{e}")))
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let settings = RunSettings::resolve(|_| None).unwrap();
        assert_eq!(settings, RunSettings::default());
        assert_eq!(settings.users, 5);
        assert_eq!(settings.ramp_duration, Duration::from_secs(10));
        assert_eq!(settings.test_duration, Duration::from_secs(20));
    }

    #[test]
    fn overrides() {
        let settings = RunSettings::resolve(lookup(&[
            ("USERS", " 20 "),
            ("RAMP_DURATION", "30s"),
            ("TEST_DURATION", "1500ms"),
        ]))
        .unwrap();
        assert_eq!(settings.users, 20);
        assert_eq!(settings.ramp_duration, Duration::from_secs(30));
        assert_eq!(settings.test_duration, Duration::from_millis(1500));
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = RunSettings::resolve(lookup(&[("USERS", "many")])).unwrap_err();
        assert_eq!(err.key, "USERS");
        assert_eq!(err.value, "many");

        let err = RunSettings::resolve(lookup(&[("TEST_DURATION", "-3")])).unwrap_err();
        assert_eq!(err.key, "TEST_DURATION");
    }

    #[test]
    fn deserializes_partial_documents() {
        let settings: RunSettings =
            serde_json::from_str(r#"{"users": 2, "ramp_duration": 2.5}"#).unwrap();
        assert_eq!(settings.users, 2);
        assert_eq!(settings.ramp_duration, Duration::from_millis(2500));
        assert_eq!(settings.test_duration, Duration::from_secs(20));
    }

    #[test]
    fn injection_ramps_all_users() {
        let settings = RunSettings::default();
        let offsets = settings.injection().schedule(Duration::from_millis(100)).unwrap();
        assert_eq!(offsets.len(), 5);
        assert_eq!(offsets[4], Duration::from_secs(8));
    }
}
