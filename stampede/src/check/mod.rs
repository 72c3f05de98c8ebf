//! Response checks: extraction, validation and saving into the session.
//!
//! A [`Check`] pulls one value out of a [`Response`] (status, a header, a
//! JSON body field, or the whole body), validates it with a [`Predicate`],
//! and optionally saves it into the session under a name.
//!
//! Checks attached to one request are evaluated in declaration order by
//! [`evaluate_all`]. The first failing check stops evaluation, and saves are
//! only applied when *every* check passed, so a KO request never leaves half
//! of its extractions behind in the session.
//!
//! ```rust
//! use stampede::{check::{Check, evaluate_all}, transport::Response, Session};
//!
//! let response = Response::new(200).with_body(r#"{"token":"abc"}"#);
//! let checks = [
//!     Check::status().is(200),
//!     Check::json_path("$.token").save_as("jwtToken"),
//! ];
//! let eval = evaluate_all(&checks, &response, Session::new());
//! assert!(eval.passed());
//! assert_eq!(eval.session.get_str("jwtToken"), Some("abc"));
//! ```
mod json_path;
pub use json_path::JsonPath;

use std::{fmt, sync::LazyLock};

use thiserror::Error;

use crate::{
    session::{Session, Value},
    template::Template,
    transport::Response,
};

/// Where a check reads its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum Extractor {
    Status,
    Header(String),
    JsonPath(JsonPath),
    BodyString,
}

impl Extractor {
    fn extract(&self, response: &Response) -> Result<Option<Value>, String> {
        match self {
            Self::Status => Ok(Some(Value::from(response.status))),
            Self::Header(name) => Ok(response.header(name).map(Value::from)),
            Self::BodyString => Ok(Some(Value::String(response.body_string()))),
            Self::JsonPath(path) => {
                let doc: Value = serde_json::from_slice(&response.body)
                    .map_err(|e| format!("body is not valid JSON: {e}"))?;
                Ok(path.select(&doc).cloned())
            }
        }
    }
}

impl fmt::Display for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Header(name) => write!(f, "header({name})"),
            Self::JsonPath(path) => write!(f, "jsonPath({path})"),
            Self::BodyString => f.write_str("bodyString"),
        }
    }
}

/// An expected value; string expectations may reference session variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    Value(Value),
    Template(Template),
}

impl Expected {
    fn resolve(&self, session: &Session) -> Result<Value, String> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Template(t) => t
                .render(session)
                .map(Value::String)
                .map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Template(t) => write!(f, "{t}"),
        }
    }
}

impl From<Value> for Expected {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Expected {
    fn from(value: &str) -> Self {
        Self::Template(Template::parse(value))
    }
}

impl From<String> for Expected {
    fn from(value: String) -> Self {
        Self::Template(Template::parse(value))
    }
}

macro_rules! expected_from_value {
    ($($t:ty),*) => {
        $(impl From<$t> for Expected {
            fn from(value: $t) -> Self {
                Self::Value(Value::from(value))
            }
        })*
    };
}

expected_from_value!(bool, u16, u32, u64, i32, i64, f64);

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// A value was extracted.
    Exists,
    /// Nothing was extracted.
    NotExists,
    /// Always passes; saves the value when there is one.
    Optional,
    Is(Expected),
    /// Passes when the value differs or nothing was extracted.
    Not(Expected),
    In(Vec<Expected>),
    /// Numeric value within `[min, max]`.
    Between { min: f64, max: f64 },
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists => f.write_str("exists"),
            Self::NotExists => f.write_str("notExists"),
            Self::Optional => f.write_str("optional"),
            Self::Is(e) => write!(f, "is({e})"),
            Self::Not(e) => write!(f, "not({e})"),
            Self::In(list) => {
                f.write_str("in(")?;
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
            Self::Between { min, max } => write!(f, "between({min}, {max})"),
        }
    }
}

/// Why a check did not pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("check {check} failed: expected {expected}, found {}", .found.as_deref().unwrap_or("nothing"))]
pub struct CheckFailure {
    /// The check as written, e.g. `status.is(200)`.
    pub check: String,
    pub expected: String,
    pub found: Option<String>,
}

/// Extraction, validation and optional save of one response value.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub extractor: Extractor,
    pub predicate: Predicate,
    pub save_as: Option<String>,
}

impl Check {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            extractor,
            predicate: Predicate::Exists,
            save_as: None,
        }
    }

    pub fn status() -> Self {
        Self::new(Extractor::Status)
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::new(Extractor::Header(name.into()))
    }

    pub fn json_path(path: impl Into<String>) -> Self {
        Self::new(Extractor::JsonPath(JsonPath::new(path)))
    }

    pub fn body_string() -> Self {
        Self::new(Extractor::BodyString)
    }

    #[must_use]
    pub fn is(mut self, expected: impl Into<Expected>) -> Self {
        self.predicate = Predicate::Is(expected.into());
        self
    }

    #[must_use]
    pub fn not(mut self, expected: impl Into<Expected>) -> Self {
        self.predicate = Predicate::Not(expected.into());
        self
    }

    #[must_use]
    pub fn is_in<I>(mut self, expected: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Expected>,
    {
        self.predicate = Predicate::In(expected.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn between(mut self, min: f64, max: f64) -> Self {
        self.predicate = Predicate::Between { min, max };
        self
    }

    #[must_use]
    pub fn exists(mut self) -> Self {
        self.predicate = Predicate::Exists;
        self
    }

    #[must_use]
    pub fn not_exists(mut self) -> Self {
        self.predicate = Predicate::NotExists;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.predicate = Predicate::Optional;
        self
    }

    #[must_use]
    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }

    pub fn is_status_check(&self) -> bool {
        matches!(self.extractor, Extractor::Status)
    }

    /// Check applied to requests that declare no status check of their own:
    /// `status in {200..=209, 304}`.
    pub fn implicit_status() -> &'static Check {
        static IMPLICIT: LazyLock<Check> =
            LazyLock::new(|| Check::status().is_in((200u16..=209).chain([304])));
        &IMPLICIT
    }

    /// Runs the check without touching the session.
    ///
    /// On success, returns the pending save (if the check has a save target
    /// and extracted a value).
    pub fn inspect(
        &self,
        response: &Response,
        session: &Session,
    ) -> Result<Option<(String, Value)>, CheckFailure> {
        let found = self
            .extractor
            .extract(response)
            .map_err(|message| self.failure(message, None))?;

        let passed = match &self.predicate {
            Predicate::Exists => found.is_some(),
            Predicate::NotExists => found.is_none(),
            Predicate::Optional => true,
            Predicate::Is(expected) => {
                let expected = expected
                    .resolve(session)
                    .map_err(|msg| self.failure(msg, found.as_ref()))?;
                found.as_ref().is_some_and(|v| values_match(v, &expected))
            }
            Predicate::Not(expected) => {
                let expected = expected
                    .resolve(session)
                    .map_err(|msg| self.failure(msg, found.as_ref()))?;
                found.as_ref().is_none_or(|v| !values_match(v, &expected))
            }
            Predicate::In(list) => {
                let mut hit = false;
                for expected in list {
                    let expected = expected
                        .resolve(session)
                        .map_err(|msg| self.failure(msg, found.as_ref()))?;
                    if found.as_ref().is_some_and(|v| values_match(v, &expected)) {
                        hit = true;
                        break;
                    }
                }
                hit
            }
            Predicate::Between { min, max } => found
                .as_ref()
                .and_then(as_number)
                .is_some_and(|n| n >= *min && n <= *max),
        };

        if !passed {
            return Err(self.failure(self.predicate.to_string(), found.as_ref()));
        }

        Ok(match (&self.save_as, found) {
            (Some(key), Some(value)) => Some((key.clone(), value)),
            _ => None,
        })
    }

    /// Evaluates this check alone. See [`evaluate_all`].
    pub fn evaluate(&self, response: &Response, session: Session) -> Evaluation {
        evaluate_all([self], response, session)
    }

    fn failure(&self, expected: String, found: Option<&Value>) -> CheckFailure {
        CheckFailure {
            check: self.to_string(),
            expected,
            found: found.map(render_value),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.extractor, self.predicate)?;
        if let Some(key) = &self.save_as {
            write!(f, ".saveAs({key})")?;
        }
        Ok(())
    }
}

/// Outcome of evaluating the checks of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The input session plus every save, or the input session untouched if
    /// any check failed.
    pub session: Session,
    pub failure: Option<CheckFailure>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Evaluates `checks` in order against `response`.
///
/// Stops at the first failure. Saves are collected while evaluating and only
/// written into the session once every check passed.
pub fn evaluate_all<'a, I>(checks: I, response: &Response, session: Session) -> Evaluation
where
    I: IntoIterator<Item = &'a Check>,
{
    let mut saves = Vec::new();
    for check in checks {
        match check.inspect(response, &session) {
            Ok(Some(save)) => saves.push(save),
            Ok(None) => {}
            Err(failure) => {
                return Evaluation {
                    session,
                    failure: Some(failure),
                }
            }
        }
    }
    Evaluation {
        session: session.merge(saves),
        failure: None,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equal as JSON, or equal once both sides are rendered as text (so `200`
/// matches `"200"` and a templated `"#{gameId}"` matches a numeric id).
fn values_match(found: &Value, expected: &Value) -> bool {
    found == expected || render_value(found) == render_value(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_response(body: Value) -> Response {
        Response::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string())
    }

    mod predicates {
        use super::*;

        #[test]
        fn status_is_and_not() {
            let res = Response::new(404);
            let session = Session::new();
            assert!(Check::status().is(404).inspect(&res, &session).is_ok());
            assert!(Check::status().not(500).inspect(&res, &session).is_ok());
            let failure = Check::status().not(404).inspect(&res, &session).unwrap_err();
            assert_eq!(failure.check, "status.not(404)");
            assert_eq!(failure.found.as_deref(), Some("404"));
        }

        #[test]
        fn status_in_and_between() {
            let res = Response::new(201);
            let session = Session::new();
            assert!(Check::status().is_in([200, 201]).inspect(&res, &session).is_ok());
            assert!(Check::status().is_in([200]).inspect(&res, &session).is_err());
            assert!(Check::status().between(200.0, 299.0).inspect(&res, &session).is_ok());
        }

        #[test]
        fn templated_expectation() {
            let res = json_response(json!({ "name": "Mario", "id": 4 }));
            let session = Session::new().set("gameName", "Mario").set("gameId", 4);
            assert!(Check::json_path("$.name").is("#{gameName}").inspect(&res, &session).is_ok());
            assert!(Check::json_path("$.id").is("#{gameId}").inspect(&res, &session).is_ok());

            let failure = Check::json_path("$.name")
                .is("#{missing}")
                .inspect(&res, &session)
                .unwrap_err();
            assert!(failure.expected.contains("missing"));
        }

        #[test]
        fn exists_not_exists_optional() {
            let res = json_response(json!({ "token": "abc" }));
            let session = Session::new();
            assert!(Check::json_path("$.token").inspect(&res, &session).is_ok());
            assert!(Check::json_path("$.nope").inspect(&res, &session).is_err());
            assert!(Check::json_path("$.nope").not_exists().inspect(&res, &session).is_ok());
            assert_eq!(
                Check::json_path("$.nope").optional().save_as("x").inspect(&res, &session),
                Ok(None)
            );
        }

        #[test]
        fn header_and_body() {
            let res = Response::new(200)
                .with_header("Location", "/videogame/7")
                .with_body("Video game deleted");
            let session = Session::new();
            assert!(Check::header("location").is("/videogame/7").inspect(&res, &session).is_ok());
            assert!(Check::body_string().is("Video game deleted").inspect(&res, &session).is_ok());
        }

        #[test]
        fn json_path_on_non_json_body_fails() {
            let res = Response::new(200).with_body("<html>");
            let failure = Check::json_path("$.token")
                .inspect(&res, &Session::new())
                .unwrap_err();
            assert!(failure.expected.contains("not valid JSON"));
        }
    }

    #[test]
    fn implicit_status_accepts_2xx_and_304() {
        let session = Session::new();
        let check = Check::implicit_status();
        for status in [200, 201, 204, 304] {
            assert!(check.inspect(&Response::new(status), &session).is_ok());
        }
        for status in [301, 404, 500] {
            assert!(check.inspect(&Response::new(status), &session).is_err());
        }
    }

    #[test]
    fn save_on_success() {
        let res = json_response(json!({ "token": "abc" }));
        let eval = Check::json_path("$.token")
            .save_as("jwtToken")
            .evaluate(&res, Session::new());
        assert!(eval.passed());
        assert_eq!(eval.session.get_str("jwtToken"), Some("abc"));
    }

    #[test]
    fn failing_check_returns_input_session_unchanged() {
        let res = json_response(json!({ "other": 1 }));
        let session = Session::new().set("jwtToken", "old");
        let eval = Check::json_path("$.token")
            .save_as("jwtToken")
            .evaluate(&res, session.clone());
        assert!(!eval.passed());
        assert_eq!(eval.session, session);
    }

    #[test]
    fn saves_are_gated_on_every_check_passing() {
        let res = json_response(json!({ "token": "abc", "id": 9 }));
        let session = Session::new();
        let checks = [
            Check::json_path("$.token").save_as("jwtToken"),
            Check::json_path("$.id").save_as("gameId"),
            Check::status().is(201),
            Check::json_path("$.token").save_as("never"),
        ];

        let eval = evaluate_all(&checks, &res, session.clone());
        let failure = eval.failure.expect("status check should fail");
        assert_eq!(failure.check, "status.is(201)");
        assert_eq!(eval.session, session);
        assert!(eval.session.get("jwtToken").is_none());
    }

    #[test]
    fn failure_message_names_rule_and_values() {
        let failure = Check::status().is(200).inspect(&Response::new(500), &Session::new());
        assert_eq!(
            failure.unwrap_err().to_string(),
            "check status.is(200) failed: expected is(200), found 500"
        );
    }
}
