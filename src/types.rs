//! Core types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical cache key, e.g. `/api/transactions/user/7`.
///
/// Keys are opaque to the cache; only prefix matching looks at their
/// `/`-separated segments.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether `self` equals `prefix` or lies underneath it.
    ///
    /// Matching is per segment: `/api/stats/user/7` is within
    /// `/api/stats/user/7` and `/api/stats`, but not within `/api/stats/user/70`
    /// or `/api/stat`.
    pub fn is_within(&self, prefix: &CacheKey) -> bool {
        let mut mine = self.segments();
        for theirs in prefix.segments() {
            match mine.next() {
                Some(seg) if seg == theirs => {}
                _ => return false,
            }
        }
        true
    }

    /// Append a segment.
    pub fn join(&self, segment: impl fmt::Display) -> Self {
        let base = self.0.trim_end_matches('/');
        CacheKey(format!("{}/{}", base, segment))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        CacheKey::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        CacheKey(s)
    }
}

/// Server-side user identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role the server routes pushes by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

/// The signed-in user as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl Identity {
    pub fn new(id: u64, username: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
            role,
            first_name: None,
            last_name: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching_is_segment_aware() {
        let key = CacheKey::from("/api/stats/user/7");

        assert!(key.is_within(&"/api/stats".into()));
        assert!(key.is_within(&"/api/stats/user/7".into()));
        assert!(key.is_within(&"/".into()));
        assert!(!key.is_within(&"/api/stats/user/70".into()));
        assert!(!key.is_within(&"/api/stat".into()));
        assert!(!key.is_within(&"/api/stats/user/7/daily".into()));
    }

    #[test]
    fn test_join() {
        let root = CacheKey::from("/api/transactions/");
        assert_eq!(root.join("user").join(UserId(7)).as_str(), "/api/transactions/user/7");
    }

    #[test]
    fn test_identity_wire_format() {
        let identity: Identity = serde_json::from_str(
            r#"{"id": 7, "username": "awa", "role": "admin", "firstName": "Awa"}"#,
        )
        .unwrap();

        assert_eq!(identity.id, UserId(7));
        assert!(identity.is_admin());
        assert_eq!(identity.first_name.as_deref(), Some("Awa"));
    }
}
