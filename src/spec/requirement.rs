//! Package requirement parsing (`name[extras] constraint`)

use crate::spec::version::Constraint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single package requirement in canonical form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// PEP 503 normalized name (lower-case, `-` separated)
    pub name: String,
    /// Sorted, de-duplicated extras
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    /// Canonical constraint; empty means any version
    pub constraint: Constraint,
}

impl Requirement {
    /// Sort key: name, then constraint text
    pub fn sort_key(&self) -> (String, String, String) {
        (
            self.name.clone(),
            self.constraint.to_string(),
            self.extras.join(","),
        )
    }
}

/// Normalize a distribution name: trim, lower-case, collapse `-`, `_`, `.` runs to `-`
pub fn normalize_name(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let valid_edges = trimmed
        .chars()
        .next()
        .zip(trimmed.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !valid_edges
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("invalid package name '{}'", trimmed));
    }

    let mut name = String::with_capacity(trimmed.len());
    let mut in_separator = false;
    for c in trimmed.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                name.push('-');
            }
            in_separator = true;
        } else {
            name.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    Ok(name)
}

impl FromStr for Requirement {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty requirement".to_string());
        }
        if input.contains(';') || input.contains('@') {
            return Err(format!(
                "markers and direct references are not supported in '{}'",
                input
            ));
        }

        let name_end = input
            .find(|c: char| matches!(c, '[' | '<' | '>' | '=' | '!' | '~' | ' ' | '\t' | ','))
            .unwrap_or(input.len());
        let name = normalize_name(&input[..name_end])?;
        let mut rest = input[name_end..].trim_start();

        let mut extras = Vec::new();
        if let Some(tail) = rest.strip_prefix('[') {
            let close = tail
                .find(']')
                .ok_or_else(|| format!("unclosed extras in '{}'", input))?;
            for extra in tail[..close].split(',') {
                if extra.trim().is_empty() {
                    continue;
                }
                extras.push(normalize_name(extra)?);
            }
            rest = tail[close + 1..].trim_start();
        }
        extras.sort();
        extras.dedup();

        let constraint = rest
            .parse::<Constraint>()
            .map_err(|e| format!("{} in '{}'", e, input))?;

        Ok(Self {
            name,
            extras,
            constraint,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        write!(f, "{}", self.constraint)
    }
}
