//! Python package versions and version-constraint clauses
//!
//! Implements the subset of PEP 440 that environment specs accept:
//! release segments, `a`/`b`/`rc` pre-releases, `.post` and `.dev`
//! suffixes, and `.*` wildcards on `==`/`!=` clauses.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Pre-release phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

impl PreRelease {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "a",
            Self::Beta => "b",
            Self::Rc => "rc",
        }
    }
}

/// A parsed package version
#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

impl Version {
    /// Build a final release version from its segments
    pub fn from_release(release: Vec<u64>) -> Self {
        Self {
            release,
            pre: None,
            post: None,
            dev: None,
        }
    }

    /// Release segments (`1.4.2` -> `[1, 4, 2]`)
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Upper bound of a prefix match: drop `keep`.. segments and bump the last kept one.
    ///
    /// `1.4.5` with `keep = 2` gives `1.5`. `None` when the bumped segment
    /// would overflow, i.e. the range has no upper bound.
    pub fn bump_prefix(&self, keep: usize) -> Option<Self> {
        let keep = keep.clamp(1, self.release.len());
        let mut release = self.release[..keep].to_vec();
        if let Some(last) = release.last_mut() {
            *last = last.checked_add(1)?;
        }
        Some(Self::from_release(release))
    }

    /// Canonical spelling: trailing zero segments dropped, at least `major.minor` kept.
    ///
    /// `2`, `2.0` and `2.0.0` all become `2.0`.
    fn canonical(mut self) -> Self {
        while self.release.len() > 2 && self.release.last() == Some(&0) {
            self.release.pop();
        }
        if self.release.len() < 2 {
            self.release.resize(2, 0);
        }
        self
    }

    /// Ordering key for the suffixes: dev-only releases sort before
    /// pre-releases, which sort before the final release, then post releases.
    fn suffix_key(&self) -> (i8, u8, u64, i8, u64, i8, u64) {
        let (pre_rank, pre_kind, pre_n) = match (self.pre, self.post, self.dev) {
            (Some((kind, n)), _, _) => (0, kind as u8, n),
            (None, None, Some(_)) => (-1, 0, 0),
            _ => (1, 0, 0),
        };
        let (post_rank, post_n) = match self.post {
            Some(n) => (1, n),
            None => (0, 0),
        };
        let (dev_rank, dev_n) = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        (pre_rank, pre_kind, pre_n, post_rank, post_n, dev_rank, dev_n)
    }
}

fn cmp_release(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_release(&self.release, &other.release)
            .then_with(|| self.suffix_key().cmp(&other.suffix_key()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let release: Vec<String> = self.release.iter().map(u64::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((kind, n)) = self.pre {
            write!(f, "{}{}", kind.as_str(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        Ok(())
    }
}

/// Split a leading run of ASCII digits off `s`
fn take_number(s: &str) -> Option<(u64, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

/// Strip an optional `.`, `-` or `_` separator
fn strip_separator(s: &str) -> &str {
    s.strip_prefix(['.', '-', '_']).unwrap_or(s)
}

impl FromStr for Version {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let lowered = input.trim().to_ascii_lowercase();
        let mut rest = lowered.strip_prefix('v').unwrap_or(lowered.as_str());

        let mut release = Vec::new();
        loop {
            let (n, tail) = take_number(rest).ok_or_else(|| format!("invalid version '{}'", input))?;
            release.push(n);
            rest = tail;
            match rest.strip_prefix('.') {
                Some(tail) if tail.starts_with(|c: char| c.is_ascii_digit()) => rest = tail,
                _ => break,
            }
        }

        let mut version = Version::from_release(release);

        let candidate = strip_separator(rest);
        for (prefix, kind) in [
            ("alpha", PreRelease::Alpha),
            ("beta", PreRelease::Beta),
            ("rc", PreRelease::Rc),
            ("a", PreRelease::Alpha),
            ("b", PreRelease::Beta),
            ("c", PreRelease::Rc),
        ] {
            if let Some(tail) = candidate.strip_prefix(prefix) {
                let tail = strip_separator(tail);
                let (n, tail) = take_number(tail).unwrap_or((0, tail));
                version.pre = Some((kind, n));
                rest = tail;
                break;
            }
        }

        let candidate = strip_separator(rest);
        if let Some(tail) = candidate.strip_prefix("post") {
            let tail = strip_separator(tail);
            let (n, tail) = take_number(tail).unwrap_or((0, tail));
            version.post = Some(n);
            rest = tail;
        }

        let candidate = strip_separator(rest);
        if let Some(tail) = candidate.strip_prefix("dev") {
            let tail = strip_separator(tail);
            let (n, tail) = take_number(tail).unwrap_or((0, tail));
            version.dev = Some(n);
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(format!("invalid version '{}'", input));
        }
        Ok(version)
    }
}

/// Comparison operator of a constraint clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    Compatible,
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    Less,
    Greater,
    Arbitrary,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compatible => "~=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessEqual => "<=",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::Greater => ">",
            Self::Arbitrary => "===",
        }
    }

    /// Split a leading operator off a clause. Longest match first.
    fn split(clause: &str) -> Option<(Self, &str)> {
        const OPERATORS: [(&str, Operator); 8] = [
            ("===", Operator::Arbitrary),
            ("~=", Operator::Compatible),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            ("<=", Operator::LessEqual),
            (">=", Operator::GreaterEqual),
            ("<", Operator::Less),
            (">", Operator::Greater),
        ];
        OPERATORS
            .iter()
            .find_map(|(text, op)| clause.strip_prefix(text).map(|rest| (*op, rest)))
    }
}

/// One `op version` clause of a constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub op: Operator,
    pub version: Version,
    /// `==1.2.*` style prefix match
    pub wildcard: bool,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)?;
        if self.wildcard {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

impl FromStr for Clause {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let (op, rest) =
            Operator::split(&compact).ok_or_else(|| format!("missing operator in '{}'", input))?;

        let (version_text, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (rest, false),
        };
        if wildcard && !matches!(op, Operator::Equal | Operator::NotEqual) {
            return Err(format!("wildcard only allowed with == or != in '{}'", input));
        }

        let mut version: Version = version_text.parse()?;
        if wildcard && (version.pre.is_some() || version.post.is_some() || version.dev.is_some()) {
            return Err(format!("wildcard needs a plain release prefix in '{}'", input));
        }
        if op == Operator::Compatible && version.release.len() < 2 {
            return Err(format!("~= needs at least two release segments in '{}'", input));
        }
        // Segment count is meaningful for prefixes, `~=` and `===`
        if !wildcard && !matches!(op, Operator::Compatible | Operator::Arbitrary) {
            version = version.canonical();
        }

        Ok(Self {
            op,
            version,
            wildcard,
        })
    }
}

/// A comma-separated set of clauses. Empty means any version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Constraint {
    clauses: Vec<Clause>,
}

impl Constraint {
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_any(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl FromStr for Constraint {
    type Err = String;

    /// Parse and canonicalize: clauses are de-duplicated and sorted by text
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut clauses: Vec<Clause> = Vec::new();
        for part in input.split(',') {
            if part.trim().is_empty() {
                if input.trim().is_empty() {
                    continue;
                }
                return Err(format!("empty clause in '{}'", input.trim()));
            }
            clauses.push(part.parse()?);
        }
        clauses.sort_by_key(|c| c.to_string());
        clauses.dedup_by(|a, b| a.to_string() == b.to_string());
        Ok(Self { clauses })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.clauses.iter().map(Clause::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl TryFrom<String> for Constraint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Constraint> for String {
    fn from(value: Constraint) -> Self {
        value.to_string()
    }
}

/// Bound of a version interval: `(version, inclusive)`
type Bound = Option<(Version, bool)>;

/// Intersection of constraint clauses as a version interval.
///
/// Used to detect requirement sets no version can satisfy before the
/// resolver is invoked. Pre-release admission rules are ignored.
#[derive(Debug, Clone, Default)]
pub struct VersionRange {
    lower: Bound,
    upper: Bound,
    exact: Vec<Version>,
    excluded: Vec<Version>,
}

impl VersionRange {
    /// Narrow the range by one clause
    pub fn restrict(&mut self, clause: &Clause) {
        let v = &clause.version;
        match (clause.op, clause.wildcard) {
            (Operator::Equal, true) => {
                self.raise_lower(v.clone(), true);
                if let Some(upper) = v.bump_prefix(v.release.len()) {
                    self.lower_upper(upper, false);
                }
            }
            (Operator::Equal, false) | (Operator::Arbitrary, _) => self.exact.push(v.clone()),
            (Operator::NotEqual, false) => self.excluded.push(v.clone()),
            (Operator::NotEqual, true) => {}
            (Operator::Compatible, _) => {
                self.raise_lower(v.clone(), true);
                if let Some(upper) = v.bump_prefix(v.release.len() - 1) {
                    self.lower_upper(upper, false);
                }
            }
            (Operator::GreaterEqual, _) => self.raise_lower(v.clone(), true),
            (Operator::Greater, _) => self.raise_lower(v.clone(), false),
            (Operator::LessEqual, _) => self.lower_upper(v.clone(), true),
            (Operator::Less, _) => self.lower_upper(v.clone(), false),
        }
    }

    fn raise_lower(&mut self, version: Version, inclusive: bool) {
        let replace = match &self.lower {
            None => true,
            Some((current, current_inclusive)) => match version.cmp(current) {
                Ordering::Greater => true,
                Ordering::Equal => *current_inclusive && !inclusive,
                Ordering::Less => false,
            },
        };
        if replace {
            self.lower = Some((version, inclusive));
        }
    }

    fn lower_upper(&mut self, version: Version, inclusive: bool) {
        let replace = match &self.upper {
            None => true,
            Some((current, current_inclusive)) => match version.cmp(current) {
                Ordering::Less => true,
                Ordering::Equal => *current_inclusive && !inclusive,
                Ordering::Greater => false,
            },
        };
        if replace {
            self.upper = Some((version, inclusive));
        }
    }

    fn within_bounds(&self, version: &Version) -> bool {
        let above = match &self.lower {
            None => true,
            Some((lower, true)) => version >= lower,
            Some((lower, false)) => version > lower,
        };
        let below = match &self.upper {
            None => true,
            Some((upper, true)) => version <= upper,
            Some((upper, false)) => version < upper,
        };
        above && below
    }

    /// Whether no version can satisfy every clause seen so far
    pub fn is_empty(&self) -> bool {
        if let Some(first) = self.exact.first() {
            if self.exact.iter().any(|v| v != first) {
                return true;
            }
            return !self.within_bounds(first) || self.excluded.contains(first);
        }
        match (&self.lower, &self.upper) {
            (Some((lower, lower_inc)), Some((upper, upper_inc))) => match lower.cmp(upper) {
                Ordering::Greater => true,
                Ordering::Equal => {
                    !(*lower_inc && *upper_inc) || self.excluded.contains(lower)
                }
                Ordering::Less => false,
            },
            _ => false,
        }
    }
}
