//! Playbook Variables
//!
//! The variable scope threaded through a playbook run. A scope is a map
//! keyed by variable name with insert, merge, selection and interpolation
//! semantics.
//!
//! # Interpolation
//!
//! A variable named `__target__` is referenced in command strings as
//! `__target__:value`:
//!
//! ```
//! use soarflow::playbook::{Variable, Variables};
//!
//! let vars = Variables::from_iter([Variable::string("__target__", "10.0.0.1")]);
//! assert_eq!(vars.interpolate("ping __target__:value"), "ping 10.0.0.1");
//! ```

use std::collections::hash_map::{Iter, Values};
use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};

/// Suffix appended to a variable name to form an interpolation token.
pub const VALUE_SUFFIX: &str = ":value";

/// Variable types understood by the condition evaluator.
pub mod variable_type {
    pub const BOOL: &str = "bool";
    pub const DICTIONARY: &str = "dictionary";
    pub const FLOAT: &str = "float";
    pub const HEX_STRING: &str = "hexstring";
    pub const INTEGER: &str = "integer";
    pub const IPV4_ADDRESS: &str = "ipv4-addr";
    pub const IPV6_ADDRESS: &str = "ipv6-addr";
    pub const LONG: &str = "long";
    pub const MAC_ADDRESS: &str = "mac-addr";
    pub const HASH: &str = "hash";
    pub const MD5_HASH: &str = "md5-hash";
    pub const SHA256_HASH: &str = "sha256-hash";
    pub const STRING: &str = "string";
    pub const URI: &str = "uri";
    pub const UUID: &str = "uuid";
}

/// A single named playbook variable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Variable {
    /// Variable type, e.g. `string`, `integer`, `ipv4-addr`
    #[serde(rename = "type")]
    pub var_type: String,

    /// Name in the style `__name__`; doubles as the map key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub value: String,

    /// Constant variables are never overwritten by a merge
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub constant: bool,

    /// External variables may be overridden by the caller at trigger time
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

impl Variable {
    /// Creates a variable of the given type.
    pub fn new(
        var_type: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            var_type: var_type.into(),
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Creates a `string` variable.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(variable_type::STRING, name, value)
    }

    /// Marks the variable as constant.
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    /// Marks the variable as external.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Returns the interpolation token for this variable.
    pub fn token(&self) -> String {
        format!("{}{}", self.name, VALUE_SUFFIX)
    }
}

/// A variable scope keyed by variable name.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Variables {
    entries: HashMap<String, Variable>,
}

impl<'de> Deserialize<'de> for Variables {
    /// Every variable takes its name from its map key.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, Variable>::deserialize(deserializer)?;
        let entries = raw
            .into_iter()
            .map(|(key, mut variable)| {
                variable.name = key.clone();
                (key, variable)
            })
            .collect();
        Ok(Self { entries })
    }
}

impl Variables {
    /// Creates an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a variable only if its name is absent.
    ///
    /// Returns true if the variable was inserted. The existing value wins.
    pub fn insert(&mut self, variable: Variable) -> bool {
        if self.entries.contains_key(&variable.name) {
            return false;
        }
        self.entries.insert(variable.name.clone(), variable);
        true
    }

    /// Inserts or overwrites a variable unconditionally.
    ///
    /// Returns true if a prior value was replaced.
    pub fn insert_or_replace(&mut self, variable: Variable) -> bool {
        self.entries
            .insert(variable.name.clone(), variable)
            .is_some()
    }

    /// Inserts every variable of `source` that is absent here.
    pub fn insert_range(&mut self, source: &Variables) {
        for variable in source.values() {
            self.insert(variable.clone());
        }
    }

    /// Overwrites entries with those from `source`; `source` wins on conflict.
    ///
    /// Entries already marked constant keep their value.
    pub fn merge(&mut self, source: &Variables) {
        for (name, variable) in &source.entries {
            if let Some(existing) = self.entries.get(name) {
                if existing.constant && existing.value != variable.value {
                    debug!("Keeping constant variable '{}' during merge", name);
                    continue;
                }
            }
            self.entries.insert(name.clone(), variable.clone());
        }
    }

    /// Returns the subset of entries whose name is in `names`.
    ///
    /// Unknown names are ignored.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Variables {
        let mut selected = Variables::new();
        for name in names {
            if let Some(variable) = self.entries.get(name.as_ref()) {
                selected.insert_or_replace(variable.clone());
            }
        }
        selected
    }

    /// Replaces every `__name__:value` token with the stored value.
    ///
    /// Tokens for unknown names are left verbatim. Substituted values are
    /// not scanned again.
    pub fn interpolate(&self, input: &str) -> String {
        if self.entries.is_empty() || !input.contains(VALUE_SUFFIX) {
            return input.to_string();
        }

        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(first) = rest.chars().next() {
            match self.longest_token_at(rest) {
                Some((token_len, value)) => {
                    output.push_str(value);
                    rest = &rest[token_len..];
                }
                None => {
                    output.push(first);
                    rest = &rest[first.len_utf8()..];
                }
            }
        }

        output
    }

    /// Finds the longest variable token at the start of `text`.
    fn longest_token_at<'a>(&'a self, text: &str) -> Option<(usize, &'a str)> {
        self.entries
            .iter()
            .filter(|(name, _)| {
                text.starts_with(name.as_str()) && text[name.len()..].starts_with(VALUE_SUFFIX)
            })
            .max_by_key(|(name, _)| name.len())
            .map(|(name, variable)| (name.len() + VALUE_SUFFIX.len(), variable.value.as_str()))
    }

    /// Looks up a variable by name.
    pub fn find(&self, name: &str) -> Option<&Variable> {
        self.entries.get(name)
    }

    /// Returns true if a variable with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the variable referenced by a `__name__:value` token inside
    /// `text`, preferring the longest name.
    pub fn referenced_in(&self, text: &str) -> Option<&Variable> {
        self.entries
            .iter()
            .filter(|(name, _)| text.contains(&format!("{}{}", name, VALUE_SUFFIX)))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, variable)| variable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, Variable> {
        self.entries.iter()
    }

    pub fn values(&self) -> Values<'_, String, Variable> {
        self.entries.values()
    }
}

impl FromIterator<Variable> for Variables {
    /// Builds a scope with `insert` semantics: the first occurrence wins.
    fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
        let mut variables = Variables::new();
        for variable in iter {
            variables.insert(variable);
        }
        variables
    }
}

impl<'a> IntoIterator for &'a Variables {
    type Item = (&'a String, &'a Variable);
    type IntoIter = Iter<'a, String, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
