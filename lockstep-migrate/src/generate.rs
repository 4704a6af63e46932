//! Migration file generation

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use lockstep::migration::MigrationRepository;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A freshly written migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedMigration {
    pub path: PathBuf,
    pub identifier: String,
    pub ordering_key: i64,
    /// Head of the existing chain, written as the new file's parent
    pub parent: Option<String>,
}

/// Write a new `m{timestamp}_{name}.sql` file chained onto the current head
///
/// The ordering key is `now` as `YYYYMMDDHHMMSS`, bumped past the head's key
/// if the clock is behind it.
///
/// # Errors
///
/// Fails if `name` is not `[A-Za-z0-9_]+`, if the existing migrations do not
/// form a valid chain, or if the file cannot be written.
pub fn generate_migration(
    migrations_dir: &Path,
    name: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<GeneratedMigration> {
    let valid_name = Regex::new(r"^[A-Za-z0-9_]+$")?;
    if !valid_name.is_match(name) {
        bail!("migration name '{name}' must contain only letters, digits and underscores");
    }

    fs::create_dir_all(migrations_dir).with_context(|| {
        format!("Failed to create migrations directory {}", migrations_dir.display())
    })?;

    let chain = MigrationRepository::from_dir(migrations_dir)
        .load()
        .context("Existing migrations must form a valid chain before adding another")?;
    let head = chain.head();

    let mut ordering_key: i64 = now
        .format("%Y%m%d%H%M%S")
        .to_string()
        .parse()
        .context("Failed to derive an ordering key from the current time")?;
    if let Some(head) = head {
        if head.ordering_key() >= ordering_key {
            ordering_key = head.ordering_key() + 1;
        }
    }

    let identifier = format!("m{ordering_key}_{name}");
    let path = migrations_dir.join(format!("{identifier}.sql"));
    let parent = head.map(|h| h.identifier().to_string());

    let parent_line = match &parent {
        Some(parent) => format!("-- lockstep:parent {parent}"),
        None => "-- lockstep:parent none".to_string(),
    };
    let template = format!(
        "-- Migration: {name}\n\
         -- Generated: {generated}\n\
         {parent_line}\n\
         \n\
         -- lockstep:up\n\
         -- Write the forward change here.\n\
         \n\
         -- lockstep:down\n\
         -- Write the statements that undo the up section, or delete this section\n\
         -- to make the migration irreversible.\n",
        generated = now.format("%Y-%m-%d %H:%M:%S UTC"),
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("Failed to create migration file {}", path.display()))?;
    file.write_all(template.as_bytes())
        .with_context(|| format!("Failed to write migration file {}", path.display()))?;

    Ok(GeneratedMigration {
        path,
        identifier,
        ordering_key,
        parent,
    })
}
