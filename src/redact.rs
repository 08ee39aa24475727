//! Sensitive-field redaction for audited payloads.
//!
//! Field names are matched case-insensitively against a denylist compiled
//! once into a [`RegexSet`]. A matching field keeps its key while its whole
//! value, nested structure included, is replaced by the redaction marker.

use std::fmt::Debug;
use std::sync::LazyLock;

use regex::RegexSet;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::diff::{pointer_tokens, PatchOperation};

/// Marker written in place of sensitive values.
pub const REDACTION_MARKER: &str = "***REDACTED***";

/// Suffix appended to bodies cut at the configured size limit.
pub const TRUNCATION_SUFFIX: &str = "…[truncated]";

/// Built-in denylist over normalized field names.
///
/// Names are matched in two forms: split into lowercase `_`-joined words
/// (`newPassword` → `new_password`, `X-Api-Key` → `x_api_key`) and
/// compacted to bare lowercase alphanumerics (`pAsSwOrD` → `password`).
/// Words must match whole, so `author` or `tokenCount` stay visible.
const SENSITIVE_PATTERNS: &[&str] = &[
    r"(^|_)(password|passwd)s?(_|$)",
    r"(^|_)secrets?(_|$)",
    r"(^|_)api_?keys?(_|$)",
    r"(^|_)access_?keys?(_|$)",
    r"(^|_)private_?keys?(_|$)",
    r"(^|_)tokens?$",
    r"(^|_)credentials?(_|$)",
    r"(^|_)auth(orization)?$",
    r"^key[12]$",
    r"(^|_)cookies?(_|$)",
];

static DEFAULT_REDACTOR: LazyLock<Redactor> = LazyLock::new(Redactor::default);

/// Shared redactor built from the built-in denylist.
#[must_use]
pub fn default_redactor() -> &'static Redactor {
    &DEFAULT_REDACTOR
}

/// Precompiled field-name matcher and marker.
#[derive(Debug, Clone)]
pub struct Redactor {
    field_set: RegexSet,
    extra_set: Option<RegexSet>,
    marker: String,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            field_set: builtin_set(),
            extra_set: None,
            marker: REDACTION_MARKER.to_owned(),
        }
    }
}

fn builtin_set() -> RegexSet {
    RegexSet::new(SENSITIVE_PATTERNS).unwrap_or_else(|_| RegexSet::empty())
}

/// `_`-joined lowercase words of `name`, split on separators and case changes.
fn word_form(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.ends_with('_') {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Lowercase alphanumerics of `name` with everything else dropped.
fn compact_form(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl Redactor {
    /// Build a redactor from the built-in denylist plus `extra_fields`.
    ///
    /// Extra names are matched literally (case-insensitive substring).
    #[must_use]
    pub fn new(extra_fields: &[String], marker: impl Into<String>) -> Self {
        let extras: Vec<String> = extra_fields
            .iter()
            .filter(|f| !f.trim().is_empty())
            .map(|f| format!("(?i){}", regex::escape(f.trim())))
            .collect();

        let extra_set = if extras.is_empty() {
            None
        } else {
            RegexSet::new(&extras)
                .inspect_err(|err| warn!(%err, "extra redaction fields rejected, using built-in denylist"))
                .ok()
        };

        Self {
            field_set: builtin_set(),
            extra_set,
            marker: marker.into(),
        }
    }

    /// Build a redactor from the redaction section of the configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::RedactionConfig) -> Self {
        Self::new(&config.extra_fields, config.marker.clone())
    }

    /// Marker written in place of sensitive values.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Whether `field_name` is on the denylist.
    #[must_use]
    pub fn is_sensitive(&self, field_name: &str) -> bool {
        self.field_set.is_match(&word_form(field_name))
            || self.field_set.is_match(&compact_form(field_name))
            || self.extra_set.as_ref().is_some_and(|set| set.is_match(field_name))
    }

    /// Return a copy of `value` with every sensitive field redacted at any depth.
    #[must_use]
    pub fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            other => other.clone(),
        }
    }

    fn sanitize_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let sanitized = if self.is_sensitive(key) {
                    Value::String(self.marker.clone())
                } else {
                    self.sanitize_value(value)
                };
                (key.clone(), sanitized)
            })
            .collect()
    }

    /// Mask the values of diff operations.
    ///
    /// An operation whose path passes through a sensitive field keeps its
    /// path and kind but carries the marker as both `value` and `oldValue`,
    /// so a changed secret is visible as a change without exposing either
    /// side. Other operations have their values redacted structurally.
    #[must_use]
    pub fn redact_patch(&self, ops: Vec<PatchOperation>) -> Vec<PatchOperation> {
        ops.into_iter()
            .map(|mut op| {
                let sensitive = pointer_tokens(&op.path).any(|token| self.is_sensitive(&token));
                let mask = |value: Option<Value>| {
                    value.map(|v| {
                        if sensitive {
                            Value::String(self.marker.clone())
                        } else {
                            self.sanitize_value(&v)
                        }
                    })
                };
                op.value = mask(op.value.take());
                op.old_value = mask(op.old_value.take());
                op
            })
            .collect()
    }

    /// Serialize `payload` and redact it.
    ///
    /// Never fails: when serialization fails the payload's debug
    /// representation is returned as a plain string.
    pub fn sanitize<T>(&self, payload: &T) -> Value
    where
        T: Serialize + Debug + ?Sized,
    {
        match serde_json::to_value(payload) {
            Ok(value) => self.sanitize_value(&value),
            Err(err) => {
                warn!(%err, "payload not serializable; storing debug representation");
                Value::String(format!("{payload:?}"))
            }
        }
    }

    /// Redact a serialized body.
    ///
    /// JSON documents are redacted structurally and re-serialized;
    /// `application/x-www-form-urlencoded` style bodies have the values of
    /// sensitive keys replaced. Anything else is returned unchanged.
    #[must_use]
    pub fn sanitize_str(&self, raw: &str) -> String {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            return serde_json::to_string(&self.sanitize_value(&value))
                .unwrap_or_else(|_| raw.to_owned());
        }
        if looks_form_encoded(raw) {
            return self.sanitize_form(raw);
        }
        raw.to_owned()
    }

    fn sanitize_form(&self, raw: &str) -> String {
        raw.split('&')
            .map(|pair| match pair.split_once('=') {
                Some((key, _)) if self.is_sensitive(key) => format!("{key}={}", self.marker),
                _ => pair.to_owned(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Redact a header list into a JSON object keyed by header name.
    ///
    /// Repeated headers are joined with `", "` in arrival order.
    #[must_use]
    pub fn sanitize_headers<'a, I>(&self, headers: I) -> Value
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = Map::new();
        for (name, value) in headers {
            let value = if self.is_sensitive(name) {
                self.marker.clone()
            } else {
                value.to_owned()
            };
            match map.get_mut(name) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                _ => {
                    map.insert(name.to_owned(), Value::String(value));
                }
            }
        }
        Value::Object(map)
    }
}

fn looks_form_encoded(raw: &str) -> bool {
    !raw.is_empty()
        && raw.contains('=')
        && !raw.chars().any(char::is_whitespace)
        && raw.split('&').all(|pair| pair.contains('='))
}

/// Cut `body` to at most `max_bytes` on a char boundary, marking the cut.
#[must_use]
pub fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_SUFFIX}", &body[..end])
}
