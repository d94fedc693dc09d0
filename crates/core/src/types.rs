//! Identity types for the content store
//!
//! Identities are plain integers assigned by the owning instance. They are
//! never reused, so a bundle imported twice always receives fresh ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a content node in one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Raw integer value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

/// Identity of a user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a group (lab)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision number of a document (1-based, strictly ascending)
pub type RevisionNumber = u32;

/// Version number of a media binary (1-based, strictly ascending)
pub type MediaVersionNumber = u32;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Account of the identity requesting an export or import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Requesting user
    pub user: UserId,
    /// Username of the requesting user
    pub username: String,
    /// System administrators may export any user or group
    pub admin: bool,
}

impl Identity {
    /// Create a non-admin identity
    pub fn new(user: UserId, username: impl Into<String>) -> Self {
        Self {
            user,
            username: username.into(),
            admin: false,
        }
    }

    /// Create an administrator identity
    pub fn admin(user: UserId, username: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::new(user, username)
        }
    }
}

/// A user account known to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Account id
    pub id: UserId,
    /// Unique login name; the cross-instance identity of a user
    pub username: String,
    /// Display name
    pub display_name: String,
    /// Contact address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A group (lab) known to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id
    pub id: GroupId,
    /// Unique group name
    pub name: String,
    /// All members, PIs included
    pub members: Vec<UserId>,
    /// Principal investigators, who may export the whole group
    pub pis: Vec<UserId>,
}

impl Group {
    /// Whether `user` is a PI of this group
    pub fn is_pi(&self, user: UserId) -> bool {
        self.pis.contains(&user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_and_order() {
        assert_eq!(NodeId(42).to_string(), "42");
        assert!(NodeId(1) < NodeId(2));
        assert_eq!(NodeId::from(7).as_u64(), 7);
    }

    #[test]
    fn test_node_id_serializes_transparently() {
        let json = serde_json::to_string(&NodeId(12)).unwrap();
        assert_eq!(json, "12");
    }

    #[test]
    fn test_identity_constructors() {
        let plain = Identity::new(UserId(1), "alice");
        assert!(!plain.admin);
        let admin = Identity::admin(UserId(2), "root");
        assert!(admin.admin);
        assert_eq!(admin.username, "root");
    }

    #[test]
    fn test_group_pi_lookup() {
        let group = Group {
            id: GroupId(1),
            name: "lab".into(),
            members: vec![UserId(1), UserId(2)],
            pis: vec![UserId(1)],
        };
        assert!(group.is_pi(UserId(1)));
        assert!(!group.is_pi(UserId(2)));
    }
}
