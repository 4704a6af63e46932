//! Migration repository and chain validation
//!
//! The repository turns a migration source into a [`MigrationChain`]: an arena
//! of records sorted by ordering key with O(1) lookup by identifier. Loading is
//! read-only and fails on anything that is not a single parent-linked chain.

use crate::migration::file::discover_migrations;
use crate::migration::{MigrationRecord, RepositoryError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
enum Source {
    Directory(PathBuf),
    Records(Vec<MigrationRecord>),
}

/// Where migration records come from
#[derive(Debug, Clone)]
pub struct MigrationRepository {
    source: Source,
}

impl MigrationRepository {
    /// Repository backed by a directory of `m{key}_{name}.sql` files
    pub fn from_dir(migrations_dir: impl AsRef<Path>) -> Self {
        Self {
            source: Source::Directory(migrations_dir.as_ref().to_path_buf()),
        }
    }

    /// Repository backed by in-memory records
    ///
    /// Records are validated exactly like file-sourced ones; parents are taken
    /// as given.
    pub fn from_records(records: Vec<MigrationRecord>) -> Self {
        Self {
            source: Source::Records(records),
        }
    }

    /// Directory this repository reads, if any
    pub fn directory(&self) -> Option<&Path> {
        match &self.source {
            Source::Directory(dir) => Some(dir),
            Source::Records(_) => None,
        }
    }

    /// Load and validate the chain
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the source cannot be read or the records do
    /// not form a single chain.
    pub fn load(&self) -> Result<MigrationChain, RepositoryError> {
        let records = match &self.source {
            Source::Directory(dir) => discover_migrations(dir)?,
            Source::Records(records) => records.clone(),
        };
        MigrationChain::new(records)
    }
}

/// Validated, totally ordered migration chain
#[derive(Debug, Clone, Default)]
pub struct MigrationChain {
    records: Vec<MigrationRecord>,
    index: HashMap<String, usize>,
}

impl MigrationChain {
    /// Sort `records` by ordering key and validate the chain invariants
    ///
    /// Checks run in this order: duplicate keys, duplicate identifiers, unknown
    /// parents, cycles, branches, then root and predecessor links.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::DuplicateKey`, `DuplicateIdentifier`,
    /// `BrokenChain` or `Cycle`.
    pub fn new(mut records: Vec<MigrationRecord>) -> Result<Self, RepositoryError> {
        records.sort_by(|a, b| {
            a.ordering_key()
                .cmp(&b.ordering_key())
                .then_with(|| a.identifier().cmp(b.identifier()))
        });

        for pair in records.windows(2) {
            if pair[0].ordering_key() == pair[1].ordering_key() {
                return Err(RepositoryError::DuplicateKey {
                    key: pair[0].ordering_key(),
                    first: pair[0].identifier().to_string(),
                    second: pair[1].identifier().to_string(),
                });
            }
        }

        let mut index = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if index.insert(record.identifier().to_string(), position).is_some() {
                return Err(RepositoryError::DuplicateIdentifier(record.identifier().to_string()));
            }
        }

        let parents = resolve_parents(&records, &index)?;
        detect_cycle(&records, &parents)?;
        detect_branch(&records, &parents)?;
        check_linear(&records, &parents)?;

        Ok(Self { records, index })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MigrationRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MigrationRecord> {
        self.records.iter()
    }

    /// Look up a record by identifier
    pub fn get(&self, identifier: &str) -> Option<&MigrationRecord> {
        self.index.get(identifier).map(|&i| &self.records[i])
    }

    /// Position of a record in apply order
    pub fn position(&self, identifier: &str) -> Option<usize> {
        self.index.get(identifier).copied()
    }

    /// The record that must apply immediately before `identifier`
    pub fn parent_of(&self, identifier: &str) -> Option<&MigrationRecord> {
        self.get(identifier)
            .and_then(MigrationRecord::parent_identifier)
            .and_then(|parent| self.get(parent))
    }

    pub fn root(&self) -> Option<&MigrationRecord> {
        self.records.first()
    }

    pub fn head(&self) -> Option<&MigrationRecord> {
        self.records.last()
    }

    /// Records after the first `applied` ones, in apply order
    pub fn after(&self, applied: usize) -> &[MigrationRecord] {
        &self.records[applied.min(self.records.len())..]
    }
}

impl<'a> IntoIterator for &'a MigrationChain {
    type Item = &'a MigrationRecord;
    type IntoIter = std::slice::Iter<'a, MigrationRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Map every record to the arena index of its parent
fn resolve_parents(
    records: &[MigrationRecord],
    index: &HashMap<String, usize>,
) -> Result<Vec<Option<usize>>, RepositoryError> {
    records
        .iter()
        .map(|record| match record.parent_identifier() {
            None => Ok(None),
            Some(parent) => index.get(parent).copied().map(Some).ok_or_else(|| {
                RepositoryError::BrokenChain {
                    identifier: record.identifier().to_string(),
                    reason: format!("parent '{parent}' does not exist"),
                }
            }),
        })
        .collect()
}

/// Walk parent links from every record; each record has at most one parent,
/// so a walk that returns to its own path is a cycle.
fn detect_cycle(
    records: &[MigrationRecord],
    parents: &[Option<usize>],
) -> Result<(), RepositoryError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; records.len()];

    for start in 0..records.len() {
        let mut path: Vec<usize> = Vec::new();
        let mut current = Some(start);

        while let Some(node) = current {
            match marks[node] {
                Mark::Done => break,
                Mark::OnPath => {
                    let from = path.iter().position(|&n| n == node).unwrap_or(0);
                    let mut cycle: Vec<String> = path[from..]
                        .iter()
                        .map(|&n| records[n].identifier().to_string())
                        .collect();
                    cycle.push(records[node].identifier().to_string());
                    return Err(RepositoryError::Cycle(cycle));
                }
                Mark::Unvisited => {
                    marks[node] = Mark::OnPath;
                    path.push(node);
                    current = parents[node];
                }
            }
        }

        for node in path {
            marks[node] = Mark::Done;
        }
    }

    Ok(())
}

fn detect_branch(
    records: &[MigrationRecord],
    parents: &[Option<usize>],
) -> Result<(), RepositoryError> {
    let mut child_of: Vec<Option<usize>> = vec![None; records.len()];

    for (child, parent) in parents.iter().enumerate() {
        let Some(parent) = *parent else { continue };
        if let Some(sibling) = child_of[parent] {
            return Err(RepositoryError::BrokenChain {
                identifier: records[child].identifier().to_string(),
                reason: format!(
                    "branches from '{}', which is already the parent of '{}'",
                    records[parent].identifier(),
                    records[sibling].identifier()
                ),
            });
        }
        child_of[parent] = Some(child);
    }

    Ok(())
}

fn check_linear(
    records: &[MigrationRecord],
    parents: &[Option<usize>],
) -> Result<(), RepositoryError> {
    for (position, record) in records.iter().enumerate() {
        let expected = position.checked_sub(1);
        if parents[position] == expected {
            continue;
        }

        let reason = match (expected, record.parent_identifier()) {
            (None, parent) => format!(
                "first migration in key order must be the root, but it names parent '{}'",
                parent.unwrap_or_default()
            ),
            (Some(previous), None) => format!(
                "has no parent but is not first in key order (previous is '{}')",
                records[previous].identifier()
            ),
            (Some(previous), Some(parent)) => format!(
                "expected parent '{}' (its predecessor in key order) but found '{parent}'",
                records[previous].identifier()
            ),
        };

        return Err(RepositoryError::BrokenChain {
            identifier: record.identifier().to_string(),
            reason,
        });
    }

    Ok(())
}
