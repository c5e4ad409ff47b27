//! Capability types: resource URIs, constraints, and the capability token.
//!
//! Resource URIs follow `scheme://resource_type/operation/path`, e.g.
//! `res://fs/read/tmp/reports`. The resource type is a closed set
//! ([`ResourceKind`]); scope matching switches on it instead of dispatching
//! through open-ended traits.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ids::{CapabilityId, PrincipalId};

/// Matches any operation, or any path suffix when used as the final segment.
pub const WILDCARD: &str = "*";

const MAX_URI_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Fs,
    Net,
    Exec,
    Session,
    Tool,
    Agent,
    Export,
}

impl ResourceKind {
    pub const ALL: [Self; 7] = [
        Self::Fs,
        Self::Net,
        Self::Exec,
        Self::Session,
        Self::Tool,
        Self::Agent,
        Self::Export,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Net => "net",
            Self::Exec => "exec",
            Self::Session => "session",
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Export => "export",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// Whether a scope segment admits a target segment at `index`.
    ///
    /// Network scopes accept a `*.` host wildcard in the first segment; every
    /// other kind compares segments literally.
    fn segment_matches(self, index: usize, scope: &str, target: &str) -> bool {
        match (self, index, scope.strip_prefix("*.")) {
            (Self::Net, 0, Some(suffix)) => target
                .strip_suffix(suffix)
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
            _ => scope == target,
        }
    }

    fn accepts_wildcard_segment(self, index: usize, segment: &str) -> bool {
        matches!(self, Self::Net)
            && index == 0
            && segment
                .strip_prefix("*.")
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('*'))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Segment-prefix containment. A trailing `*` scope segment admits any suffix.
fn path_covers(kind: ResourceKind, scope: &[String], target: &[String]) -> bool {
    for (index, segment) in scope.iter().enumerate() {
        if segment == WILDCARD {
            return true;
        }
        match target.get(index) {
            Some(candidate) if kind.segment_matches(index, segment, candidate) => {}
            _ => return false,
        }
    }
    true
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}

fn check_segments(kind: ResourceKind, segments: &[String]) -> Result<(), &'static str> {
    let last = segments.len().saturating_sub(1);
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err("empty path segment");
        }
        if segment == "." || segment == ".." {
            return Err("relative path segments are not allowed");
        }
        if segment.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err("path segments may not contain whitespace");
        }
        if segment.contains('*') {
            let trailing = segment == WILDCARD && index == last;
            if !trailing && !kind.accepts_wildcard_segment(index, segment) {
                return Err("`*` is only allowed as the final path segment");
            }
        }
    }
    Ok(())
}

fn valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}

fn valid_operation(operation: &str) -> bool {
    operation == WILDCARD
        || (!operation.is_empty()
            && operation.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
            }))
}

/// A parsed, validated resource URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUri {
    scheme: String,
    kind: ResourceKind,
    operation: String,
    segments: Vec<String>,
}

impl ResourceUri {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidResourceUri {
            uri: raw.to_owned(),
            reason: reason.to_owned(),
        };

        if raw.len() > MAX_URI_LEN {
            return Err(invalid("uri too long"));
        }
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing `://` separator"))?;
        if !valid_scheme(scheme) {
            return Err(invalid("scheme must match [a-z][a-z0-9+.-]*"));
        }

        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let mut parts = rest.split('/');
        let kind = parts
            .next()
            .and_then(ResourceKind::parse)
            .ok_or_else(|| invalid("unknown resource type"))?;
        let operation = parts.next().ok_or_else(|| invalid("missing operation"))?;
        if !valid_operation(operation) {
            return Err(invalid("operation must match [a-z0-9_.-]+ or `*`"));
        }

        let segments: Vec<String> = parts.map(str::to_owned).collect();
        check_segments(kind, &segments).map_err(invalid)?;

        Ok(Self {
            scheme: scheme.to_owned(),
            kind,
            operation: operation.to_owned(),
            segments,
        })
    }

    pub fn new(
        scheme: &str,
        kind: ResourceKind,
        operation: &str,
        path: &str,
    ) -> Result<Self, ProtocolError> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            Self::parse(&format!("{scheme}://{kind}/{operation}"))
        } else {
            Self::parse(&format!("{scheme}://{kind}/{operation}/{path}"))
        }
    }

    /// Scope covering every path of `kind` for one operation under the `res` scheme.
    pub fn root(kind: ResourceKind, operation: &str) -> Result<Self, ProtocolError> {
        Self::new("res", kind, operation, "")
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    /// Whether `other` lies inside the scope this URI names.
    pub fn covers(&self, other: &ResourceUri) -> bool {
        self.scheme == other.scheme
            && self.kind == other.kind
            && (self.operation == WILDCARD || self.operation == other.operation)
            && path_covers(self.kind, &self.segments, &other.segments)
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.kind, self.operation)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceUri {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceUri {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceUri> for String {
    fn from(uri: ResourceUri) -> Self {
        uri.to_string()
    }
}

/// Scope restrictions attached to a capability.
///
/// Constraint sets form a partial order through [`CapabilityConstraints::is_subset_of`];
/// delegation may only move down that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConstraints {
    /// Permitted operations. Empty means exactly the URI's own operation.
    pub operations: BTreeSet<String>,
    /// Permitted path prefixes. Empty means anything the URI covers.
    pub path_prefixes: Vec<String>,
    /// Upper bound on the lifetime of this capability and anything delegated from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ttl_secs: Option<u64>,
}

impl CapabilityConstraints {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn operations<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefixes.push(prefix.into());
        self
    }

    pub fn with_max_ttl_secs(mut self, secs: u64) -> Self {
        self.max_ttl_secs = Some(secs);
        self
    }

    /// Path prefixes follow the same segment rules as the URI they narrow.
    /// A leading or trailing `/` is ignored; an empty prefix is rejected.
    pub fn check_paths(&self, uri: &ResourceUri) -> Result<(), ProtocolError> {
        for prefix in &self.path_prefixes {
            let invalid = |reason: &str| ProtocolError::InvalidResourceUri {
                uri: format!("{uri} (path prefix `{prefix}`)"),
                reason: reason.to_owned(),
            };
            let trimmed = prefix.trim_matches('/');
            if trimmed.is_empty() {
                return Err(invalid("empty path prefix"));
            }
            let segments: Vec<String> = trimmed.split('/').map(str::to_owned).collect();
            check_segments(uri.kind(), &segments).map_err(invalid)?;
        }
        Ok(())
    }

    fn effective_operations(&self, uri: &ResourceUri) -> BTreeSet<String> {
        if self.operations.is_empty() {
            BTreeSet::from([uri.operation().to_owned()])
        } else {
            self.operations.clone()
        }
    }

    pub fn permits_operation(&self, uri: &ResourceUri, operation: &str) -> bool {
        let operations = self.effective_operations(uri);
        operations.contains(WILDCARD) || operations.contains(operation)
    }

    pub fn permits_path(&self, kind: ResourceKind, segments: &[String]) -> bool {
        self.path_prefixes.is_empty()
            || self
                .path_prefixes
                .iter()
                .any(|prefix| path_covers(kind, &split_path(prefix), segments))
    }

    /// `self ⊆ wider` for capabilities scoped to `uri`.
    pub fn is_subset_of(&self, wider: &Self, uri: &ResourceUri) -> bool {
        let mine = self.effective_operations(uri);
        let theirs = wider.effective_operations(uri);
        let operations_narrower =
            theirs.contains(WILDCARD) || (!mine.contains(WILDCARD) && mine.is_subset(&theirs));

        let paths_narrower = wider.path_prefixes.is_empty()
            || (!self.path_prefixes.is_empty()
                && self
                    .path_prefixes
                    .iter()
                    .all(|prefix| wider.permits_path(uri.kind(), &split_path(prefix))));

        let ttl_narrower = match (self.max_ttl_secs, wider.max_ttl_secs) {
            (_, None) => true,
            (Some(mine), Some(theirs)) => mine <= theirs,
            (None, Some(_)) => false,
        };

        operations_narrower && paths_narrower && ttl_narrower
    }
}

/// A scoped, time-bounded permission held by one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub resource_uri: ResourceUri,
    pub principal_id: PrincipalId,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_capability_id: Option<CapabilityId>,
    pub delegation_depth: u8,
    #[serde(default)]
    pub constraints: CapabilityConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Capability {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_delegated(&self) -> bool {
        self.parent_capability_id.is_some()
    }

    /// Canonical text covered by the signature (every field except the signature).
    pub fn signing_payload(&self) -> String {
        let operations: Vec<&str> = self
            .constraints
            .operations
            .iter()
            .map(String::as_str)
            .collect();
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.resource_uri,
            self.principal_id,
            self.granted_at.to_rfc3339(),
            self.expires_at
                .map(|expires_at| expires_at.to_rfc3339())
                .unwrap_or_default(),
            self.parent_capability_id
                .as_ref()
                .map(CapabilityId::as_str)
                .unwrap_or_default(),
            self.delegation_depth,
            operations.join(","),
            self.constraints.path_prefixes.join(","),
            self.constraints
                .max_ttl_secs
                .map(|secs| secs.to_string())
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn uri(raw: &str) -> ResourceUri {
        ResourceUri::parse(raw).unwrap()
    }

    #[test]
    fn parses_scheme_kind_operation_and_path() {
        let parsed = uri("res://fs/read/tmp/reports");
        assert_eq!(parsed.scheme(), "res");
        assert_eq!(parsed.kind(), ResourceKind::Fs);
        assert_eq!(parsed.operation(), "read");
        assert_eq!(parsed.path(), "tmp/reports");
        assert_eq!(parsed.to_string(), "res://fs/read/tmp/reports");
    }

    #[test]
    fn trailing_slash_is_ignored() {
        assert_eq!(uri("res://session/create/").to_string(), "res://session/create");
    }

    #[test]
    fn rejects_malformed_uris() {
        for raw in [
            "fs/read/tmp",
            "RES://fs/read/tmp",
            "res://disk/read/tmp",
            "res://fs",
            "res://fs/READ/tmp",
            "res://fs/read//tmp",
            "res://fs/read/../etc",
            "res://fs/read/*/tmp",
            "res://fs/read/tmp dir",
        ] {
            assert!(ResourceUri::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn covers_uses_segment_prefixes() {
        let scope = uri("res://fs/read/tmp");
        assert!(scope.covers(&uri("res://fs/read/tmp")));
        assert!(scope.covers(&uri("res://fs/read/tmp/a/b")));
        assert!(!scope.covers(&uri("res://fs/read/tmpfile")));
        assert!(!scope.covers(&uri("res://fs/write/tmp")));
        assert!(!scope.covers(&uri("other://fs/read/tmp")));
        assert!(uri("res://fs/*/tmp").covers(&uri("res://fs/write/tmp/x")));
        assert!(uri("res://tool/execute").covers(&uri("res://tool/execute/calculate")));
    }

    #[test]
    fn net_scopes_accept_host_wildcards() {
        let scope = uri("res://net/connect/*.example.com");
        assert!(scope.covers(&uri("res://net/connect/api.example.com")));
        assert!(scope.covers(&uri("res://net/connect/a.b.example.com/443")));
        assert!(!scope.covers(&uri("res://net/connect/example.com")));
        assert!(!scope.covers(&uri("res://net/connect/badexample.com")));
        assert!(ResourceUri::parse("res://fs/read/*.example.com").is_err());
    }

    #[test]
    fn serde_uses_string_form_and_validates() {
        let parsed = uri("res://export/write/S1");
        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, "\"res://export/write/S1\"");
        let back: ResourceUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parsed);
        assert!(serde_json::from_str::<ResourceUri>("\"nope\"").is_err());
    }

    #[test]
    fn empty_operations_mean_the_uri_operation() {
        let scope = uri("res://fs/read/tmp");
        let constraints = CapabilityConstraints::unrestricted();
        assert!(constraints.permits_operation(&scope, "read"));
        assert!(!constraints.permits_operation(&scope, "write"));

        let explicit = CapabilityConstraints::operations(["read", "list"]);
        assert!(explicit.permits_operation(&scope, "list"));
    }

    #[test]
    fn narrowing_examples() {
        let scope = uri("res://fs/*/tmp");
        let wide = CapabilityConstraints::operations(["read", "write"]).with_path_prefix("tmp");
        let narrow = CapabilityConstraints::operations(["read"]).with_path_prefix("tmp/reports");
        assert!(narrow.is_subset_of(&wide, &scope));
        assert!(!wide.is_subset_of(&narrow, &scope));

        let unbounded_ttl = CapabilityConstraints::operations(["read"]);
        let bounded = unbounded_ttl.clone().with_max_ttl_secs(60);
        assert!(bounded.is_subset_of(&unbounded_ttl, &scope));
        assert!(!unbounded_ttl.is_subset_of(&bounded, &scope));
    }

    #[test]
    fn path_prefixes_follow_segment_rules() {
        let scope = uri("res://fs/read");
        let check = |prefix: &str| {
            CapabilityConstraints::unrestricted()
                .with_path_prefix(prefix)
                .check_paths(&scope)
        };
        assert!(check("tmp/reports").is_ok());
        assert!(check("/tmp/").is_ok());
        assert!(check("tmp/*").is_ok());
        for bad in ["", "/", "tmp/../etc", "./tmp", "tmp//a", "tmp dir", "*/tmp"] {
            assert!(check(bad).is_err(), "{bad:?} was accepted");
        }

        let hosts = uri("res://net/connect");
        let wildcard_host = CapabilityConstraints::unrestricted().with_path_prefix("*.example.com");
        assert!(wildcard_host.check_paths(&hosts).is_ok());
        assert!(wildcard_host.check_paths(&scope).is_err());
    }

    #[test]
    fn signing_payload_changes_with_scope() {
        let capability = Capability {
            id: CapabilityId::from_string("c1"),
            resource_uri: uri("res://fs/read/tmp"),
            principal_id: PrincipalId::from_string("p1"),
            granted_at: Utc::now(),
            expires_at: None,
            parent_capability_id: None,
            delegation_depth: 1,
            constraints: CapabilityConstraints::unrestricted(),
            signature: None,
        };
        let mut widened = capability.clone();
        widened.resource_uri = uri("res://fs/read");
        assert_ne!(capability.signing_payload(), widened.signing_payload());
    }

    fn constraints_strategy() -> impl Strategy<Value = CapabilityConstraints> {
        let operations = proptest::sample::subsequence(vec!["read", "write", "execute", "*"], 0..=4);
        let prefixes =
            proptest::sample::subsequence(vec!["tmp", "tmp/a", "tmp/a/b", "var", "var/log"], 0..=3);
        let ttl = proptest::option::of(0_u64..100);
        (operations, prefixes, ttl).prop_map(|(operations, prefixes, ttl)| {
            CapabilityConstraints {
                operations: operations.into_iter().map(str::to_owned).collect(),
                path_prefixes: prefixes.into_iter().map(str::to_owned).collect(),
                max_ttl_secs: ttl,
            }
        })
    }

    proptest! {
        #[test]
        fn subset_is_reflexive(c in constraints_strategy()) {
            let scope = uri("res://fs/read");
            prop_assert!(c.is_subset_of(&c, &scope));
        }

        #[test]
        fn subset_is_transitive(
            a in constraints_strategy(),
            b in constraints_strategy(),
            c in constraints_strategy(),
        ) {
            let scope = uri("res://fs/read");
            if a.is_subset_of(&b, &scope) && b.is_subset_of(&c, &scope) {
                prop_assert!(a.is_subset_of(&c, &scope));
            }
        }

        #[test]
        fn subset_never_grants_new_operations(
            a in constraints_strategy(),
            b in constraints_strategy(),
            op in proptest::sample::select(vec!["read", "write", "execute", "admin"]),
        ) {
            let scope = uri("res://fs/read");
            if a.is_subset_of(&b, &scope) && a.permits_operation(&scope, op) {
                prop_assert!(b.permits_operation(&scope, op));
            }
        }
    }
}
