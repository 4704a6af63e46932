//! `MigrationRecord` - one immutable structural change

use crate::migration::checksum::calculate_checksum;

/// One migration: identity, position in the chain and its actions
///
/// Records are immutable once built; the checksum is derived from the actions
/// at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    identifier: String,
    ordering_key: i64,
    name: String,
    parent_identifier: Option<String>,
    apply_action: String,
    revert_action: Option<String>,
    checksum: String,
}

impl MigrationRecord {
    /// Create a record with the conventional identifier `m{ordering_key}_{name}`
    #[must_use]
    pub fn new(
        ordering_key: i64,
        name: impl Into<String>,
        apply_action: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let identifier = format!("m{ordering_key}_{name}");
        Self::with_identifier(identifier, ordering_key, name, apply_action)
    }

    /// Create a record with an explicit identifier
    #[must_use]
    pub fn with_identifier(
        identifier: impl Into<String>,
        ordering_key: i64,
        name: impl Into<String>,
        apply_action: impl Into<String>,
    ) -> Self {
        let apply_action = apply_action.into();
        Self {
            identifier: identifier.into(),
            ordering_key,
            name: name.into(),
            parent_identifier: None,
            checksum: calculate_checksum(&apply_action, None),
            apply_action,
            revert_action: None,
        }
    }

    /// Set the record that must be applied immediately before this one
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_identifier = Some(parent.into());
        self
    }

    /// Set or clear the parent
    #[must_use]
    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent_identifier = parent;
        self
    }

    /// Attach a revert action, making the record reversible
    #[must_use]
    pub fn revert(mut self, revert_action: impl Into<String>) -> Self {
        let revert_action = revert_action.into();
        self.checksum = calculate_checksum(&self.apply_action, Some(&revert_action));
        self.revert_action = Some(revert_action);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn ordering_key(&self) -> i64 {
        self.ordering_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_identifier(&self) -> Option<&str> {
        self.parent_identifier.as_deref()
    }

    pub fn apply_action(&self) -> &str {
        &self.apply_action
    }

    pub fn revert_action(&self) -> Option<&str> {
        self.revert_action.as_deref()
    }

    /// `SHA-256` of the apply and revert actions
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_reversible(&self) -> bool {
        self.revert_action.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conventional_identifier() {
        let record = MigrationRecord::new(20240120120000, "create_users", "CREATE TABLE users ();");
        assert_eq!(record.identifier(), "m20240120120000_create_users");
        assert_eq!(record.ordering_key(), 20240120120000);
        assert_eq!(record.name(), "create_users");
        assert_eq!(record.parent_identifier(), None);
        assert!(!record.is_reversible());
    }

    #[test]
    fn test_revert_changes_checksum() {
        let forward = MigrationRecord::new(1, "a", "CREATE TABLE a ();");
        let reversible = forward.clone().revert("DROP TABLE a;");
        assert!(reversible.is_reversible());
        assert_eq!(reversible.revert_action(), Some("DROP TABLE a;"));
        assert_ne!(forward.checksum(), reversible.checksum());
    }

    #[test]
    fn test_parent_builder() {
        let record = MigrationRecord::new(2, "b", "SELECT 1;").parent("m1_a");
        assert_eq!(record.parent_identifier(), Some("m1_a"));
        let record = record.with_parent(None);
        assert_eq!(record.parent_identifier(), None);
    }
}
