//! Label selector mini-language.
//!
//! Grammar: comma separated `key[=value[|value2...]]` tokens. A `!` in the key
//! negates the requirement, a token without `=` is shorthand for `app=<token>`
//! (or `!key`, the negated-existence form), an empty input selects everything
//! and the literal `nil` disables selection.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

const IMPLICIT_KEY: &str = "app";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    /// Sorted, deduplicated; empty for the existence operators.
    pub values: SmallVec<[String; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LabelSelector {
    Everything,
    Equality(BTreeMap<String, String>),
    /// AND-combined, ordered by key.
    Requirements(Vec<Requirement>),
}

/// Split `input` on commas and build a selector. `None` means "no selector".
pub fn parse_selector(input: &str) -> Option<LabelSelector> {
    let tokens: Vec<&str> = input.split(',').collect();
    LabelSelector::build(&tokens)
}

impl LabelSelector {
    pub fn build<S: AsRef<str>>(tokens: &[S]) -> Option<LabelSelector> {
        let first = match tokens.first() {
            None => return Some(LabelSelector::Everything),
            Some(t) => t.as_ref(),
        };
        if first.is_empty() {
            return Some(LabelSelector::Everything);
        }
        if first == "nil" {
            return None;
        }

        let mut pairs: BTreeMap<String, String> = BTreeMap::new();
        let mut structured = false;
        for raw in tokens {
            let token = raw.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                None if token.starts_with('!') => {
                    pairs.insert(token.to_string(), String::new());
                    structured = true;
                }
                None => {
                    pairs.insert(IMPLICIT_KEY.to_string(), token.to_string());
                }
                Some((key, value)) => {
                    if value.is_empty() || value.contains('|') || key.contains('!') {
                        structured = true;
                    }
                    pairs.insert(key.to_string(), value.to_string());
                }
            }
        }

        if !structured {
            return Some(LabelSelector::Equality(pairs));
        }

        let mut requirements = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let negated = key.contains('!');
            let key = if negated { key.replace('!', "").trim().to_string() } else { key };
            let (operator, values): (Operator, SmallVec<[String; 2]>) = match (value.is_empty(), negated) {
                (true, true) => (Operator::DoesNotExist, SmallVec::new()),
                (true, false) => (Operator::Exists, SmallVec::new()),
                (false, true) => (Operator::NotIn, value.split('|').map(str::to_string).collect()),
                (false, false) => (Operator::In, value.split('|').map(str::to_string).collect()),
            };
            match Requirement::new(key, operator, values) {
                Ok(r) => requirements.push(r),
                Err(reason) => warn!(%reason, "label selector: requirement dropped"),
            }
        }
        requirements.sort_by(|a, b| a.key.cmp(&b.key));
        Some(LabelSelector::Requirements(requirements))
    }

    /// Whether an object carrying `labels` is selected.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelSelector::Everything => true,
            LabelSelector::Equality(pairs) => pairs.iter().all(|(k, v)| labels.get(k) == Some(v)),
            LabelSelector::Requirements(reqs) => reqs.iter().all(|r| r.matches(labels)),
        }
    }

    /// Render in Kubernetes `labelSelector` query syntax. Empty for `Everything`.
    pub fn to_query_string(&self) -> String {
        self.to_string()
    }

    pub fn is_everything(&self) -> bool {
        match self {
            LabelSelector::Everything => true,
            LabelSelector::Equality(p) => p.is_empty(),
            LabelSelector::Requirements(r) => r.is_empty(),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelector::Everything => Ok(()),
            LabelSelector::Equality(pairs) => {
                let parts: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
                f.write_str(&parts.join(","))
            }
            LabelSelector::Requirements(reqs) => {
                let parts: Vec<String> = reqs.iter().map(|r| r.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl Requirement {
    pub fn new(key: String, operator: Operator, mut values: SmallVec<[String; 2]>) -> Result<Self, String> {
        validate_key(&key)?;
        match operator {
            Operator::In | Operator::NotIn => {
                if values.is_empty() {
                    return Err(format!("{key}: values must be non-empty for set operators"));
                }
                for v in values.iter() {
                    validate_value(v)?;
                }
                values.sort();
                values.dedup();
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !values.is_empty() {
                    return Err(format!("{key}: values must be empty for existence operators"));
                }
            }
        }
        Ok(Self { key, operator, values })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
            Operator::In => labels.get(&self.key).map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => labels.get(&self.key).map(|v| !self.values.contains(v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

fn validate_name(name: &str, what: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err(format!("{what} {name:?} must be 1-63 characters"));
    }
    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() || !name.chars().all(is_name_char) {
        return Err(format!("{what} {name:?} must be alphanumeric with '-', '_' or '.' inside"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), String> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            let ok = !prefix.is_empty()
                && prefix.len() <= 253
                && prefix.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            if !ok {
                return Err(format!("label key prefix {prefix:?} must be a DNS subdomain"));
            }
            name
        }
        None => key,
    };
    validate_name(name, "label key")
}

fn validate_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    validate_name(value, "label value")
}
