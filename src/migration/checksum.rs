//! Checksum calculation for migration actions

use crate::migration::EngineError;
use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a migration's actions
///
/// This is stored in the ledger when the migration is applied and compared on
/// every later run, so that a migration edited after deployment is noticed.
/// The revert action is part of the digest; a record with no revert action
/// hashes differently from one with an empty revert action.
///
/// # Returns
///
/// Returns the lowercase hexadecimal SHA-256 digest.
#[must_use]
pub fn calculate_checksum(apply_action: &str, revert_action: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"up\0");
    hasher.update(apply_action.as_bytes());
    if let Some(revert) = revert_action {
        hasher.update(b"\0down\0");
        hasher.update(revert.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Validate a stored checksum against the current one
///
/// # Errors
///
/// Returns `EngineError::ChecksumMismatch` if they differ.
pub fn validate_checksum(identifier: &str, stored: &str, current: &str) -> Result<(), EngineError> {
    if stored == current {
        Ok(())
    } else {
        Err(EngineError::ChecksumMismatch {
            identifier: identifier.to_string(),
            stored: stored.to_string(),
            current: current.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = calculate_checksum("CREATE TABLE users (id BIGINT);", None);
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sum, calculate_checksum("CREATE TABLE users (id BIGINT);", None));
    }

    #[test]
    fn test_checksum_covers_revert_action() {
        let up = "CREATE TABLE users (id BIGINT);";
        let without = calculate_checksum(up, None);
        let empty = calculate_checksum(up, Some(""));
        let with = calculate_checksum(up, Some("DROP TABLE users;"));
        assert_ne!(without, empty);
        assert_ne!(without, with);
        assert_ne!(empty, with);
    }

    #[test]
    fn test_validate_checksum() {
        assert!(validate_checksum("m1_a", "abc", "abc").is_ok());
        match validate_checksum("m1_a", "abc", "def") {
            Err(EngineError::ChecksumMismatch { identifier, stored, current }) => {
                assert_eq!(identifier, "m1_a");
                assert_eq!(stored, "abc");
                assert_eq!(current, "def");
            }
            other => panic!("Expected ChecksumMismatch, got {other:?}"),
        }
    }
}
