//! Test parameter parsing
//!
//! Test parameters arrive as one flat string such as
//! `Key=foo;Value=bar;SCSI_1=0,1,Dynamic;SCSI_2=0,2,Fixed`. Parsing never
//! fails: malformed tokens are dropped with a warning and the caller decides
//! what a missing mandatory key means for the verdict.
//!
//! Keys of the form `BASE_<digits>` whose `BASE` is a registered counted alias
//! are folded into `BASE`. Callers ask how many were given with
//! [`ParameterSet::alias_count`]; the individual values are kept for
//! diagnostics but never enter the main mapping.

use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Bases folded by [`ParameterParser::new`]
pub const DEFAULT_COUNTED_ALIASES: &[&str] = &["SCSI", "IDE"];

static ALIAS_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.+)_(?P<index>\d+)$").expect("alias key pattern is valid")
});

/// A shell variable name, as required by `constants.sh`
static SHELL_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing mandatory parameter `{0}`")]
    Missing(String),
    #[error("parameter `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// One occurrence of a counted alias, e.g. `SCSI_2=0,2,Fixed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasEntry {
    /// The key as written, `SCSI_2`
    pub key: String,
    pub value: String,
}

/// Parsed test parameters, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterSet {
    values: IndexMap<String, String>,
    aliases: IndexMap<String, Vec<AliasEntry>>,
}

impl ParameterSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Value of a mandatory key.
    pub fn require(&self, key: &str) -> Result<&str, ParamError> {
        self.get(key).ok_or_else(|| ParamError::Missing(key.to_string()))
    }

    /// Converts a mandatory key explicitly; nothing is coerced at parse time.
    pub fn parse_value<T>(&self, key: &str) -> Result<T, ParamError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.require(key)?;
        value.parse::<T>().map_err(|e| ParamError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }

    /// Like [`parse_value`](Self::parse_value) but an absent key yields `default`.
    pub fn parse_value_or<T>(&self, key: &str, default: T) -> Result<T, ParamError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.parse_value(key) {
            Err(ParamError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    /// How many `BASE_<n>` keys were folded into `base`
    pub fn alias_count(&self, base: &str) -> usize {
        self.aliases.get(base).map_or(0, Vec::len)
    }

    pub fn alias_entries(&self, base: &str) -> &[AliasEntry] {
        self.aliases.get(base).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Counted alias bases that occurred, with their counts
    pub fn alias_counts(&self) -> impl Iterator<Item = (&str, usize)> {
        self.aliases.iter().map(|(base, entries)| (base.as_str(), entries.len()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Distinct entries: plain keys plus one per counted alias base
    pub fn len(&self) -> usize {
        self.values.len() + self.aliases.len()
    }

    /// True when neither plain keys nor aliases were parsed
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.aliases.is_empty()
    }

    /// Renders the set back into `key=value;key=value` form.
    ///
    /// Alias entries are written with their original keys, so parsing the
    /// result with the same parser yields an equal set.
    pub fn to_param_string(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(
                self.aliases
                    .values()
                    .flatten()
                    .map(|entry| format!("{}={}", entry.key, entry.value)),
            )
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Renders the set as a `constants.sh` file for the guest script to source.
    ///
    /// Every counted alias also gets a `BASE_COUNT` line. Keys that are not
    /// valid shell identifiers are skipped.
    pub fn to_constants_sh(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            push_assignment(&mut out, key, value);
        }
        for (base, entries) in &self.aliases {
            for entry in entries {
                push_assignment(&mut out, &entry.key, &entry.value);
            }
            push_assignment(&mut out, &format!("{base}_COUNT"), &entries.len().to_string());
        }
        out
    }
}

fn push_assignment(out: &mut String, key: &str, value: &str) {
    if !SHELL_IDENT.is_match(key) {
        warn!("Skipping parameter `{key}` in constants.sh: not a shell identifier");
        return;
    }
    let escaped = value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    out.push_str(&format!("{key}=\"{escaped}\"\n"));
}

impl<K, V> FromIterator<(K, V)> for ParameterSet
where
    K: Into<String>,
    V: Into<String>,
{
    /// Builds a set of plain keys; no alias folding happens here.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            aliases: IndexMap::new(),
        }
    }
}

/// Parser with a registry of counted alias bases
#[derive(Debug, Clone)]
pub struct ParameterParser {
    counted: HashSet<String>,
}

impl Default for ParameterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterParser {
    /// A parser that folds [`DEFAULT_COUNTED_ALIASES`]
    pub fn new() -> Self {
        Self {
            counted: DEFAULT_COUNTED_ALIASES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A parser that treats every key literally
    pub fn without_aliases() -> Self {
        Self {
            counted: HashSet::new(),
        }
    }

    /// Registers another counted alias base.
    pub fn with_alias(mut self, base: impl Into<String>) -> Self {
        self.counted.insert(base.into());
        self
    }

    fn counted_base<'k>(&self, key: &'k str) -> Option<&'k str> {
        let caps = ALIAS_KEY.captures(key)?;
        let base = caps.name("base")?.as_str();
        self.counted.contains(base).then_some(base)
    }

    pub fn parse(&self, raw: &str) -> ParameterSet {
        let mut set = ParameterSet::default();

        for segment in raw.split(';') {
            if segment.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                warn!("Dropping malformed parameter `{}`: no `=`", segment.trim());
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                warn!("Dropping malformed parameter `{}`: empty key", segment.trim());
                continue;
            }

            if let Some(base) = self.counted_base(key) {
                let entries = set.aliases.entry(base.to_string()).or_default();
                entries.push(AliasEntry {
                    key: key.to_string(),
                    value: value.to_string(),
                });
                debug!("Counted alias {key} as {base} (#{})", entries.len());
                continue;
            }

            if let Some(previous) = set.values.insert(key.to_string(), value.to_string()) {
                debug!("Parameter {key} given again, `{previous}` replaced by `{value}`");
            }
        }

        set
    }
}

/// Parses `raw` with the default alias registry.
pub fn parse(raw: &str) -> ParameterSet {
    ParameterParser::new().parse(raw)
}
