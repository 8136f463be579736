//! Filename tag parsing
//!
//! Asset names carry annotations in curly-brace blocks placed before the
//! extension:
//!
//! ```text
//! sprites{tps}/hero{fix}{scale=0.5}.png
//! music{formats=ogg&mp3}.wav
//! ```
//!
//! A bare tag parses to `true`, a valued tag to a number when the value is
//! fully numeric (otherwise a string), and an `&`-joined value to a list whose
//! elements are parsed independently. Later blocks win on key collision.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Mapping of tag name to value, ordered by key for reproducible output.
pub type Tags = BTreeMap<String, TagValue>;

/// A single tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Bare tag, e.g. `{tps}`
    Bool(bool),
    /// Fully numeric value, e.g. `{scale=0.5}`
    Number(Number),
    /// Any other value, e.g. `{lang=en}`
    String(String),
    /// `&`-joined values, e.g. `{sizes=1&2}`
    List(Vec<TagValue>),
}

impl TagValue {
    /// Parse a single value as number-or-string.
    pub fn parse_scalar(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(int) = raw.parse::<i64>() {
            return TagValue::Number(int.into());
        }
        if let Ok(float) = raw.parse::<f64>() {
            if let Some(number) = Number::from_f64(float).filter(|_| float.is_finite()) {
                return TagValue::Number(number);
            }
        }
        TagValue::String(raw.to_string())
    }

    /// Whether the tag should count as "set" when used as a flag.
    pub fn is_truthy(&self) -> bool {
        match self {
            TagValue::Bool(b) => *b,
            TagValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            TagValue::String(s) => !s.is_empty(),
            TagValue::List(_) => true,
        }
    }

    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// String view of the value, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Number(value.into())
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<Vec<TagValue>> for TagValue {
    fn from(values: Vec<TagValue>) -> Self {
        TagValue::List(values)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{}", b),
            TagValue::Number(n) => write!(f, "{}", n),
            TagValue::String(s) => write!(f, "{}", s),
            TagValue::List(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join("&"))
            }
        }
    }
}

fn tag_block_regex() -> &'static Regex {
    static TAG_BLOCK: OnceLock<Regex> = OnceLock::new();
    TAG_BLOCK.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("tag block pattern is valid"))
}

/// Extract every tag block from a file or folder name.
///
/// Names without tag blocks yield an empty mapping. Blocks with an empty key
/// are ignored.
pub fn parse_tags(name: &str) -> Tags {
    let mut tags = Tags::new();

    for capture in tag_block_regex().captures_iter(name) {
        let body = &capture[1];
        let (key, value) = match body.split_once('=') {
            Some((key, raw)) => {
                let value = if raw.contains('&') {
                    TagValue::List(raw.split('&').map(TagValue::parse_scalar).collect())
                } else {
                    TagValue::parse_scalar(raw)
                };
                (key.trim(), value)
            }
            None => (body.trim(), TagValue::Bool(true)),
        };

        if key.is_empty() {
            continue;
        }
        tags.insert(key.to_string(), value);
    }

    tags
}

/// Remove every tag block from a name: `hero{fix}.png` -> `hero.png`.
pub fn strip_tags(name: &str) -> String {
    tag_block_regex().replace_all(name, "").into_owned()
}

/// Strip tag blocks from every component of a relative path.
pub fn strip_path_tags(path: &Path) -> PathBuf {
    path.components()
        .map(|component| match component {
            Component::Normal(part) => PathBuf::from(strip_tags(&part.to_string_lossy())),
            other => PathBuf::from(other.as_os_str()),
        })
        .collect()
}
