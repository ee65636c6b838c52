//! Capability-based authorization.
//!
//! Every operation class names a capability with a fixed number of URL-glob
//! parameters. A user's authorization set is the union of capability
//! instances given inline in the user's configuration
//! (`"CapResourceRead(git,*,*)"`) and instances pulled in by naming a rule
//! bundle from the server's rule-definition document. Checks are two-level:
//! [`Authorization::has_capability`] gates whether the operation is
//! allowable at all, [`Authorization::is_authorized`] matches the concrete
//! coordinates against the instance globs (full-string match, `*` standing
//! for `.*`).

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::error::{DepiError, Result};

/// Operation classes and their glob arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    LinkRead,
    LinkAdd,
    LinkRemove,
    LinkMarkDirty,
    LinkMarkClean,
    ResGroupRead,
    ResGroupAdd,
    ResGroupRemove,
    ResGroupChange,
    ResGroupWatch,
    ResourceRead,
    ResourceAdd,
    ResourceRemove,
    ResourceChange,
    DepiWatch,
    BranchCreate,
    BranchSwitch,
    BranchList,
    BranchTag,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 19] = [
        Self::LinkRead,
        Self::LinkAdd,
        Self::LinkRemove,
        Self::LinkMarkDirty,
        Self::LinkMarkClean,
        Self::ResGroupRead,
        Self::ResGroupAdd,
        Self::ResGroupRemove,
        Self::ResGroupChange,
        Self::ResGroupWatch,
        Self::ResourceRead,
        Self::ResourceAdd,
        Self::ResourceRemove,
        Self::ResourceChange,
        Self::DepiWatch,
        Self::BranchCreate,
        Self::BranchSwitch,
        Self::BranchList,
        Self::BranchTag,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkRead => "CapLinkRead",
            Self::LinkAdd => "CapLinkAdd",
            Self::LinkRemove => "CapLinkRemove",
            Self::LinkMarkDirty => "CapLinkMarkDirty",
            Self::LinkMarkClean => "CapLinkMarkClean",
            Self::ResGroupRead => "CapResGroupRead",
            Self::ResGroupAdd => "CapResGroupAdd",
            Self::ResGroupRemove => "CapResGroupRemove",
            Self::ResGroupChange => "CapResGroupChange",
            Self::ResGroupWatch => "CapResGroupWatch",
            Self::ResourceRead => "CapResourceRead",
            Self::ResourceAdd => "CapResourceAdd",
            Self::ResourceRemove => "CapResourceRemove",
            Self::ResourceChange => "CapResourceChange",
            Self::DepiWatch => "CapDepiWatch",
            Self::BranchCreate => "CapBranchCreate",
            Self::BranchSwitch => "CapBranchSwitch",
            Self::BranchList => "CapBranchList",
            Self::BranchTag => "CapBranchTag",
        }
    }

    /// Number of glob parameters an instance of this class carries.
    pub fn arity(&self) -> usize {
        match self {
            Self::LinkRead
            | Self::LinkAdd
            | Self::LinkRemove
            | Self::LinkMarkDirty
            | Self::LinkMarkClean => 6,
            Self::ResGroupRead
            | Self::ResGroupAdd
            | Self::ResGroupRemove
            | Self::ResGroupChange
            | Self::ResGroupWatch => 2,
            Self::ResourceRead | Self::ResourceAdd | Self::ResourceRemove | Self::ResourceChange => 3,
            Self::DepiWatch
            | Self::BranchCreate
            | Self::BranchSwitch
            | Self::BranchList
            | Self::BranchTag => 0,
        }
    }
}

fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern.replace('*', ".*")))
}

/// One capability instance: a class plus compiled parameter globs.
#[derive(Debug, Clone)]
pub struct Capability {
    kind: CapabilityKind,
    patterns: Vec<String>,
    regexes: Vec<Regex>,
}

impl Capability {
    pub fn new(kind: CapabilityKind, patterns: Vec<String>) -> Result<Self> {
        if patterns.len() != kind.arity() {
            return Err(DepiError::validation(format!(
                "{} takes {} patterns, {} were supplied",
                kind.name(),
                kind.arity(),
                patterns.len()
            )));
        }
        let regexes = patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DepiError::validation(format!("bad capability pattern: {e}")))?;
        Ok(Self {
            kind,
            patterns,
            regexes,
        })
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn verify(&self, args: &[&str]) -> bool {
        if args.len() != self.regexes.len() {
            warn!(
                "capability {} verified with {} arguments for {} patterns",
                self.kind.name(),
                args.len(),
                self.patterns.len()
            );
            return false;
        }
        args.iter()
            .zip(&self.regexes)
            .all(|(arg, re)| re.is_match(arg))
    }
}

/// Parse `"CapName(p1,p2,…)"` or a bare `"CapName"` into the name part and
/// its patterns.
fn split_capability_spec(spec: &str) -> (String, Vec<String>) {
    match spec.split_once('(') {
        Some((name, rest)) => {
            let inner = rest.trim_end_matches(')');
            let patterns = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|p| p.trim().to_string()).collect()
            };
            (name.trim().to_string(), patterns)
        }
        None => (spec.trim().to_string(), Vec::new()),
    }
}

/// Instantiate every capability class whose name matches the (possibly
/// globbed) spec name and whose arity fits the supplied patterns. Classes
/// matched by name but with the wrong arity are skipped with a warning.
pub fn find_capabilities(spec: &str, origin: &str) -> Vec<Capability> {
    let (name_glob, patterns) = split_capability_spec(spec);
    let Ok(name_re) = glob_to_regex(&name_glob) else {
        warn!("bad capability name pattern {name_glob:?} in {origin}");
        return Vec::new();
    };
    let mut caps = Vec::new();
    for kind in CapabilityKind::ALL {
        if !name_re.is_match(kind.name()) {
            continue;
        }
        if kind.arity() != patterns.len() {
            warn!(
                "skipping {} matched by {} in {}: takes {} patterns, {} were supplied",
                kind.name(),
                name_glob,
                origin,
                kind.arity(),
                patterns.len()
            );
            continue;
        }
        match Capability::new(kind, patterns.clone()) {
            Ok(cap) => caps.push(cap),
            Err(err) => warn!("skipping {} in {}: {}", kind.name(), origin, err),
        }
    }
    caps
}

/// Named rule bundles loaded from the server's `auth_def_file`.
pub struct RuleBundles {
    rules: HashMap<String, Vec<Capability>>,
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: HashMap<String, Vec<String>>,
}

impl RuleBundles {
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|e| {
            DepiError::Config(format!("cannot read auth rules {}: {}", path.display(), e))
        })?;
        let file: RuleFile = serde_json::from_str(&body).map_err(|e| {
            DepiError::Config(format!("cannot parse auth rules {}: {}", path.display(), e))
        })?;
        let mut rules = HashMap::new();
        for (name, specs) in file.rules {
            let mut caps = Vec::new();
            for spec in &specs {
                caps.extend(find_capabilities(spec, &format!("rule {name}")));
            }
            rules.insert(name, caps);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, name: &str) -> Option<&[Capability]> {
        self.rules.get(name).map(|v| v.as_slice())
    }
}

/// A user's effective capability set.
#[derive(Debug, Default)]
pub struct Authorization {
    caps: HashMap<CapabilityKind, Vec<Capability>>,
}

impl Authorization {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        let mut caps: HashMap<CapabilityKind, Vec<Capability>> = HashMap::new();
        for cap in capabilities {
            caps.entry(cap.kind()).or_default().push(cap);
        }
        Self { caps }
    }

    /// Build a user's set from its configured `auth_rules` entries: inline
    /// capability specs, or names of server rule bundles.
    pub fn from_user_config(auth_rules: &[String], bundles: &RuleBundles, user: &str) -> Self {
        let mut caps = Vec::new();
        for item in auth_rules {
            if item.starts_with("Cap") {
                caps.extend(find_capabilities(item, &format!("user {user} config")));
            } else if let Some(bundle) = bundles.get(item) {
                caps.extend(bundle.iter().cloned());
            } else {
                warn!("unknown server rule {} in config for user {}", item, user);
            }
        }
        Self::new(caps)
    }

    pub fn has_capability(&self, kind: CapabilityKind) -> bool {
        self.caps.contains_key(&kind)
    }

    pub fn is_authorized(&self, kind: CapabilityKind, args: &[&str]) -> bool {
        self.caps
            .get(&kind)
            .map(|caps| caps.iter().any(|c| c.verify(args)))
            .unwrap_or(false)
    }
}

/// An authenticated principal.
pub struct User {
    pub name: String,
    pub password: String,
    /// `None` when authorization is disabled server-wide.
    pub authorization: Option<Authorization>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_full_string_only() {
        let cap = Capability::new(
            CapabilityKind::ResourceRead,
            vec!["git".into(), "rg*".into(), "/src/*".into()],
        )
        .unwrap();
        assert!(cap.verify(&["git", "rg1", "/src/main.c"]));
        assert!(!cap.verify(&["git2", "rg1", "/src/main.c"]));
        assert!(!cap.verify(&["git", "rg1", "/other/main.c"]));
        assert!(!cap.verify(&["git", "rg1"]));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        assert!(Capability::new(CapabilityKind::BranchCreate, vec!["x".into()]).is_err());
        assert!(Capability::new(CapabilityKind::LinkRead, vec![]).is_err());
    }

    #[test]
    fn name_glob_expands_to_matching_classes() {
        let caps = find_capabilities("CapBranch*", "test");
        assert_eq!(caps.len(), 4);

        let caps = find_capabilities("CapResource*(*,*,*)", "test");
        assert_eq!(caps.len(), 4);

        // Arity mismatch: Cap* matches everything but only zero-arity
        // classes accept zero patterns.
        let caps = find_capabilities("Cap*", "test");
        assert_eq!(caps.len(), 5);
    }

    #[test]
    fn authorization_union_over_instances() {
        let auth = Authorization::new(
            vec![
                Capability::new(
                    CapabilityKind::ResourceRead,
                    vec!["git".into(), "rg1".into(), "/a/*".into()],
                )
                .unwrap(),
                Capability::new(
                    CapabilityKind::ResourceRead,
                    vec!["git".into(), "rg1".into(), "/b/*".into()],
                )
                .unwrap(),
            ],
        );
        assert!(auth.has_capability(CapabilityKind::ResourceRead));
        assert!(!auth.has_capability(CapabilityKind::ResourceAdd));
        assert!(auth.is_authorized(CapabilityKind::ResourceRead, &["git", "rg1", "/a/x"]));
        assert!(auth.is_authorized(CapabilityKind::ResourceRead, &["git", "rg1", "/b/y"]));
        assert!(!auth.is_authorized(CapabilityKind::ResourceRead, &["git", "rg1", "/c/z"]));
    }

    #[test]
    fn user_config_mixes_specs_and_bundles() {
        let bundles = RuleBundles {
            rules: HashMap::from([(
                "reader".to_string(),
                find_capabilities("CapResGroupRead(*,*)", "test"),
            )]),
        };
        let auth = Authorization::from_user_config(
            &[
                "reader".to_string(),
                "CapBranchList".to_string(),
                "bogus-rule".to_string(),
            ],
            &bundles,
            "mark",
        );
        assert!(auth.has_capability(CapabilityKind::ResGroupRead));
        assert!(auth.has_capability(CapabilityKind::BranchList));
        assert!(!auth.has_capability(CapabilityKind::BranchCreate));
    }
}
