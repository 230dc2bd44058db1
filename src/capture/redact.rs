//! Credential redaction for diagnostic metadata.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ConfigError;

pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values are always hidden.
const SENSITIVE_KEY_PATTERN: &str =
    r"(?i)(password|passwd|secret|token|api[_-]?key|authorization|credential|private[_-]?key)";

/// `key=value` or `key: value` credential fragments inside free text.
const INLINE_SECRET_PATTERN: &str =
    r"(?i)\b(password|passwd|secret|token|api[_-]?key)(\s*[=:]\s*)([^\s&,;]+)";

/// Userinfo embedded in URLs, e.g. `redis://:pw@host`.
const URL_USERINFO_PATTERN: &str = r"://[^/\s@]*:[^/\s@]+@";

/// Strips credentials from metadata before it is persisted.
#[derive(Debug, Clone)]
pub struct Redactor {
    sensitive_key: Regex,
    inline_secret: Regex,
    url_userinfo: Regex,
    extra_keys: Vec<String>,
}

impl Redactor {
    /// Builds a redactor; `extra_keys` are additional case-insensitive key fragments.
    pub fn new(extra_keys: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            sensitive_key: compile(SENSITIVE_KEY_PATTERN)?,
            inline_secret: compile(INLINE_SECRET_PATTERN)?,
            url_userinfo: compile(URL_USERINFO_PATTERN)?,
            extra_keys: extra_keys.iter().map(|k| k.to_lowercase()).collect(),
        })
    }

    /// Returns a copy of `map` with sensitive values replaced.
    pub fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if self.is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    self.redact_value(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::String(s) => Value::String(self.redact_text(s)),
            other => other.clone(),
        }
    }

    /// Masks inline credentials and URL passwords in free text.
    pub fn redact_text(&self, text: &str) -> String {
        let text = self
            .inline_secret
            .replace_all(text, format!("${{1}}${{2}}{}", REDACTED).as_str());
        self.url_userinfo.replace_all(&text, "://***@").into_owned()
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        if self.sensitive_key.is_match(key) {
            return true;
        }
        let key = key.to_lowercase();
        self.extra_keys.iter().any(|k| key.contains(k.as_str()))
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}
