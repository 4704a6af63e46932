//! Rendering of engine results for the terminal and for `--json`

use chrono::{DateTime, Utc};
use colored::Colorize;
use lockstep::migration::{MigrationInfo, MigrationRecord, MigrationStatus};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Serialize)]
pub struct AppliedView {
    pub identifier: String,
    pub sequence: i64,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,
    pub checksum: String,
}

#[derive(Debug, Serialize)]
pub struct PendingView {
    pub identifier: String,
    pub parent: Option<String>,
    pub reversible: bool,
}

/// Machine-readable form of a [`MigrationStatus`]
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub applied: Vec<AppliedView>,
    pub pending: Vec<PendingView>,
    pub total: usize,
    pub applied_count: usize,
    pub pending_count: usize,
    pub up_to_date: bool,
}

impl From<&MigrationStatus> for StatusView {
    fn from(status: &MigrationStatus) -> Self {
        Self {
            applied: status
                .applied
                .iter()
                .map(|e| AppliedView {
                    identifier: e.identifier.clone(),
                    sequence: e.sequence,
                    applied_at: e.applied_at,
                    execution_time_ms: e.execution_time_ms,
                    checksum: e.checksum.clone(),
                })
                .collect(),
            pending: status.pending.iter().map(PendingView::from).collect(),
            total: status.total,
            applied_count: status.applied_count,
            pending_count: status.pending_count,
            up_to_date: status.is_up_to_date(),
        }
    }
}

impl From<&MigrationRecord> for PendingView {
    fn from(record: &MigrationRecord) -> Self {
        Self {
            identifier: record.identifier().to_string(),
            parent: record.parent_identifier().map(str::to_string),
            reversible: record.is_reversible(),
        }
    }
}

/// # Errors
///
/// Fails only if serialization fails.
pub fn status_json(status: &MigrationStatus) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&StatusView::from(status))
}

pub fn status_text(status: &MigrationStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        let _ = writeln!(out, "Applied Migrations: None");
    } else {
        let _ = writeln!(out, "Applied Migrations ({}):", status.applied_count);
        for entry in &status.applied {
            let time = entry
                .execution_time_ms
                .map_or_else(|| "N/A".to_string(), |ms| format!("{ms}ms"));
            let _ = writeln!(
                out,
                "  {} {} ({}, {})",
                "✓".green(),
                entry.identifier,
                entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                time
            );
        }
    }

    let _ = writeln!(out);

    if status.pending.is_empty() {
        let _ = writeln!(out, "Pending Migrations: None");
    } else {
        let _ = writeln!(out, "Pending Migrations ({}):", status.pending_count);
        for record in &status.pending {
            let _ = writeln!(out, "  {} {}", "…".yellow(), record.identifier());
        }
    }

    let _ = writeln!(
        out,
        "\nSummary: {} applied, {} pending",
        status.applied_count, status.pending_count
    );
    out
}

/// Numbered list of identifiers, used for dry runs
pub fn plan_text(verb: &str, records: &[MigrationRecord]) -> String {
    if records.is_empty() {
        return format!("No migrations to {verb}\n");
    }
    let mut out = format!("Would {verb} {} migration(s):\n", records.len());
    for (i, record) in records.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, record.identifier());
    }
    out
}

pub fn info_text(info: &MigrationInfo) -> String {
    let record = &info.record;
    let mut out = String::new();
    let _ = writeln!(out, "\n{}\n", "Migration Information".bold());
    let _ = writeln!(out, "Identifier: {}", record.identifier());
    let _ = writeln!(out, "Ordering Key: {}", record.ordering_key());
    let _ = writeln!(out, "Name: {}", record.name());
    let _ = writeln!(out, "Parent: {}", record.parent_identifier().unwrap_or("none"));
    let _ = writeln!(out, "Checksum: {}", record.checksum());
    let _ = writeln!(out, "Reversible: {}", if record.is_reversible() { "yes" } else { "no" });

    match &info.entry {
        Some(entry) => {
            let _ = writeln!(out, "Status: Applied (#{})", entry.sequence);
            let _ = writeln!(
                out,
                "Applied At: {}",
                entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(ms) = entry.execution_time_ms {
                let _ = writeln!(out, "Execution Time: {ms}ms");
            }
            if entry.checksum != record.checksum() {
                let _ = writeln!(out, "{}", "Checksum differs from the applied version".red());
            }
            if info.is_head {
                let _ = writeln!(out, "Ledger Head: yes");
            }
        }
        None => {
            let _ = writeln!(out, "Status: Pending");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep::LedgerEntry;

    fn status() -> MigrationStatus {
        MigrationStatus::new(
            vec![LedgerEntry {
                identifier: "m1_a".to_string(),
                ordering_key: 1,
                checksum: "abc".to_string(),
                applied_at: Utc::now(),
                sequence: 1,
                execution_time_ms: Some(4),
            }],
            vec![MigrationRecord::new(2, "b", "SELECT 1;")
                .parent("m1_a")
                .revert("SELECT 2;")],
        )
    }

    #[test]
    fn test_status_json_shape() {
        let json = status_json(&status()).expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["applied_count"], 1);
        assert_eq!(value["pending_count"], 1);
        assert_eq!(value["up_to_date"], false);
        assert_eq!(value["applied"][0]["identifier"], "m1_a");
        assert_eq!(value["pending"][0]["parent"], "m1_a");
        assert_eq!(value["pending"][0]["reversible"], true);
    }

    #[test]
    fn test_status_text_lists_both_sides() {
        colored::control::set_override(false);
        let text = status_text(&status());
        assert!(text.contains("m1_a"));
        assert!(text.contains("4ms"));
        assert!(text.contains("m2_b"));
        assert!(text.contains("1 applied, 1 pending"));
    }

    #[test]
    fn test_plan_text() {
        assert_eq!(plan_text("apply", &[]), "No migrations to apply\n");
        let text = plan_text("revert", &[MigrationRecord::new(2, "b", "SELECT 1;")]);
        assert!(text.starts_with("Would revert 1 migration(s):"));
        assert!(text.contains("1. m2_b"));
    }
}
