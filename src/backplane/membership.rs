//! Group membership with a reverse index.
//!
//! Tracks the connections owned by this process, which groups each belongs
//! to, and who is in each group. Groups exist only while they have members.
//! Transitions report whether a group was created or emptied so a caller can
//! keep transport subscriptions in step.

use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionId;

use super::BackplaneError;

/// Membership state for one process.
///
/// # Example
///
/// ```text
/// groups:    { "room-1": {a, b}, "room-2": {b} }
/// by_member: { a: {"room-1"}, b: {"room-1", "room-2"} }
/// ```
#[derive(Debug, Default)]
pub struct GroupMembership {
    /// Connections owned by this process.
    connections: HashSet<ConnectionId>,
    /// Group name -> members.
    groups: HashMap<String, HashSet<ConnectionId>>,
    /// Reverse index: connection -> groups it belongs to.
    by_member: HashMap<ConnectionId, HashSet<String>>,
}

impl GroupMembership {
    /// Create empty membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a local connection. Returns `false` if it was already tracked.
    pub fn add_connection(&mut self, id: ConnectionId) -> bool {
        self.connections.insert(id)
    }

    /// Whether `id` is a local connection.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains(id)
    }

    /// Forget a connection and leave all its groups.
    ///
    /// Returns the groups that became empty (and were destroyed).
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Vec<String> {
        self.connections.remove(id);
        let Some(groups) = self.by_member.remove(id) else {
            return Vec::new();
        };

        let mut emptied = Vec::new();
        for group in groups {
            if let Some(members) = self.groups.get_mut(&group) {
                members.remove(id);
                if members.is_empty() {
                    self.groups.remove(&group);
                    emptied.push(group);
                }
            }
        }
        emptied
    }

    /// Add a local connection to a group.
    ///
    /// Returns `true` when this created the group.
    pub fn subscribe(&mut self, group: &str, id: &ConnectionId) -> Result<bool, BackplaneError> {
        if !self.connections.contains(id) {
            return Err(BackplaneError::UnknownConnection(id.clone()));
        }

        let created = !self.groups.contains_key(group);
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(id.clone());
        self.by_member
            .entry(id.clone())
            .or_default()
            .insert(group.to_string());
        Ok(created)
    }

    /// Remove a connection from a group.
    ///
    /// Returns `true` when this emptied (and destroyed) the group.
    pub fn unsubscribe(&mut self, group: &str, id: &ConnectionId) -> bool {
        if let Some(groups) = self.by_member.get_mut(id) {
            groups.remove(group);
            if groups.is_empty() {
                self.by_member.remove(id);
            }
        }

        let Some(members) = self.groups.get_mut(group) else {
            return false;
        };
        if !members.remove(id) || !members.is_empty() {
            return false;
        }
        self.groups.remove(group);
        true
    }

    /// Members of a group (empty if the group does not exist).
    pub fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Groups a connection belongs to.
    pub fn groups_of(&self, id: &ConnectionId) -> Vec<String> {
        self.by_member
            .get(id)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every local connection.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().cloned().collect()
    }

    /// Whether a group currently exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn test_first_subscribe_creates_group() {
        let mut m = GroupMembership::new();
        m.add_connection(id("a"));
        m.add_connection(id("b"));

        assert!(m.subscribe("room", &id("a")).unwrap());
        assert!(!m.subscribe("room", &id("b")).unwrap());
        assert!(!m.subscribe("room", &id("a")).unwrap());

        let mut members = m.members("room");
        members.sort();
        assert_eq!(members, vec![id("a"), id("b")]);
    }

    #[test]
    fn test_subscribe_unknown_connection_fails() {
        let mut m = GroupMembership::new();
        let err = m.subscribe("room", &id("ghost")).unwrap_err();
        assert!(matches!(err, BackplaneError::UnknownConnection(_)));
        assert!(!m.has_group("room"));
    }

    #[test]
    fn test_last_unsubscribe_destroys_group() {
        let mut m = GroupMembership::new();
        m.add_connection(id("a"));
        m.add_connection(id("b"));
        m.subscribe("room", &id("a")).unwrap();
        m.subscribe("room", &id("b")).unwrap();

        assert!(!m.unsubscribe("room", &id("a")));
        assert!(m.unsubscribe("room", &id("b")));
        assert!(!m.has_group("room"));
        assert!(m.groups_of(&id("b")).is_empty());
    }

    #[test]
    fn test_unsubscribe_non_member_is_noop() {
        let mut m = GroupMembership::new();
        m.add_connection(id("a"));
        m.subscribe("room", &id("a")).unwrap();

        assert!(!m.unsubscribe("room", &id("b")));
        assert!(!m.unsubscribe("other", &id("a")));
        assert!(m.has_group("room"));
    }

    #[test]
    fn test_remove_connection_reports_emptied_groups() {
        let mut m = GroupMembership::new();
        m.add_connection(id("a"));
        m.add_connection(id("b"));
        m.subscribe("solo", &id("a")).unwrap();
        m.subscribe("shared", &id("a")).unwrap();
        m.subscribe("shared", &id("b")).unwrap();

        let emptied = m.remove_connection(&id("a"));
        assert_eq!(emptied, vec!["solo".to_string()]);
        assert!(!m.contains(&id("a")));
        assert_eq!(m.members("shared"), vec![id("b")]);
        assert!(m.remove_connection(&id("a")).is_empty());
    }
}
