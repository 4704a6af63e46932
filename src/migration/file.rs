//! Migration file discovery and parsing
//!
//! A migration file is named `m{ordering_key}_{name}.sql` and holds an `up`
//! section and an optional `down` section:
//!
//! ```sql
//! -- lockstep:parent m20240120120000_create_users
//! -- lockstep:up
//! ALTER TABLE users ADD COLUMN locale TEXT;
//! -- lockstep:down
//! ALTER TABLE users DROP COLUMN locale;
//! ```
//!
//! The `parent` directive is optional. Without it, the parent is the file that
//! precedes this one in ordering-key order; `-- lockstep:parent none` marks a
//! root explicitly.

use crate::migration::{MigrationRecord, RepositoryError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static FILE_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^m(\d{1,18})_([A-Za-z0-9_]+)\.sql$").ok());

static DIRECTIVE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^--\s*lockstep:([A-Za-z_]+)\s*(.*?)\s*$").ok());

/// Parent declared in a migration file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentDecl {
    /// No directive; the predecessor in key order
    Implied,
    /// `-- lockstep:parent none`
    Root,
    /// `-- lockstep:parent <identifier>`
    Explicit(String),
}

/// Sections and header parsed from a migration file body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSource {
    pub parent: ParentDecl,
    pub up: String,
    pub down: Option<String>,
}

/// A migration file found on disk
#[derive(Debug, Clone)]
pub struct MigrationFile {
    /// Path to the migration file
    pub path: PathBuf,

    /// File stem, used verbatim as the record identifier
    pub identifier: String,

    /// Ordering key parsed from the file name
    pub ordering_key: i64,

    /// Human-readable migration name
    pub name: String,

    /// Parsed body
    pub source: MigrationSource,
}

impl MigrationFile {
    /// Parse a migration file name into ordering key and name
    ///
    /// Expected format: `m{digits}_{name}.sql`
    ///
    /// # Example
    /// - `m20240120120000_create_users_table.sql` → key: 20240120120000,
    ///   name: "create_users_table"
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidFormat` if the name does not match.
    pub fn parse_filename(filename: &str) -> Result<(i64, String), RepositoryError> {
        let invalid = |reason: String| RepositoryError::InvalidFormat {
            origin: filename.to_string(),
            reason,
        };

        let re = (*FILE_NAME)
            .as_ref()
            .ok_or_else(|| invalid("file name pattern failed to compile".to_string()))?;

        let caps = re.captures(filename).ok_or_else(|| {
            invalid(
                "file name does not match expected pattern: m{ORDERING_KEY}_{name}.sql".to_string(),
            )
        })?;

        let key = caps[1]
            .parse::<i64>()
            .map_err(|e| invalid(format!("ordering key out of range: {e}")))?;

        Ok((key, caps[2].to_string()))
    }

    /// Read and parse one migration file
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Io` if the file cannot be read and
    /// `RepositoryError::InvalidFormat` if its name or body is malformed.
    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RepositoryError::InvalidFormat {
                origin: path.display().to_string(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let (ordering_key, name) = Self::parse_filename(filename)?;
        let identifier = filename.trim_end_matches(".sql").to_string();

        let content = fs::read_to_string(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let source = parse_migration_source(filename, &content)?;

        Ok(Self {
            path: path.to_path_buf(),
            identifier,
            ordering_key,
            name,
            source,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Up,
    Down,
}

/// Parse the body of a migration file
///
/// `origin` is only used in error messages.
///
/// # Errors
///
/// Returns `RepositoryError::InvalidFormat` if:
/// - a statement appears before the `up` section
/// - a section or the `parent` directive is repeated or out of place
/// - a directive is unknown
/// - the `up` section is missing or empty
pub fn parse_migration_source(
    origin: &str,
    content: &str,
) -> Result<MigrationSource, RepositoryError> {
    let invalid = |line: usize, reason: &str| RepositoryError::InvalidFormat {
        origin: origin.to_string(),
        reason: format!("line {line}: {reason}"),
    };

    let directive = (*DIRECTIVE).as_ref().ok_or_else(|| RepositoryError::InvalidFormat {
        origin: origin.to_string(),
        reason: "directive pattern failed to compile".to_string(),
    })?;

    let mut section = Section::Header;
    let mut parent = ParentDecl::Implied;
    let mut up: Option<String> = None;
    let mut down: Option<String> = None;

    for (index, line) in content.lines().enumerate() {
        let number = index + 1;

        if let Some(caps) = directive.captures(line.trim()) {
            let argument = &caps[2];
            match &caps[1] {
                "parent" => {
                    if section != Section::Header {
                        return Err(invalid(number, "parent directive must precede the up section"));
                    }
                    if parent != ParentDecl::Implied {
                        return Err(invalid(number, "parent declared more than once"));
                    }
                    parent = match argument {
                        "" => {
                            return Err(invalid(
                                number,
                                "parent directive needs an identifier or 'none'",
                            ))
                        }
                        "none" => ParentDecl::Root,
                        id => ParentDecl::Explicit(id.to_string()),
                    };
                }
                "up" => {
                    if up.is_some() {
                        return Err(invalid(number, "up section declared more than once"));
                    }
                    section = Section::Up;
                    up = Some(String::new());
                }
                "down" => {
                    if up.is_none() {
                        return Err(invalid(number, "down section must follow the up section"));
                    }
                    if down.is_some() {
                        return Err(invalid(number, "down section declared more than once"));
                    }
                    section = Section::Down;
                    down = Some(String::new());
                }
                other => {
                    let reason = format!("unknown directive 'lockstep:{other}'");
                    return Err(invalid(number, &reason));
                }
            }
            continue;
        }

        let body = match section {
            Section::Header => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    continue;
                }
                return Err(invalid(number, "statement outside of a section"));
            }
            Section::Up => up.as_mut(),
            Section::Down => down.as_mut(),
        };

        if let Some(body) = body {
            body.push_str(line);
            body.push('\n');
        }
    }

    let up = match up.map(|s| s.trim().to_string()) {
        Some(up) if has_statement(&up) => up,
        Some(_) => {
            return Err(RepositoryError::InvalidFormat {
                origin: origin.to_string(),
                reason: "up section is empty".to_string(),
            })
        }
        None => {
            return Err(RepositoryError::InvalidFormat {
                origin: origin.to_string(),
                reason: "missing '-- lockstep:up' section".to_string(),
            })
        }
    };

    let down = down
        .map(|s| s.trim().to_string())
        .filter(|s| has_statement(s));

    Ok(MigrationSource { parent, up, down })
}

/// Whether `body` holds anything besides blank lines and `--` comments
fn has_statement(body: &str) -> bool {
    body.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    })
}

/// Discover all migration files in a directory
///
/// Scans the directory for `.sql` files, parses each one, sorts them by
/// ordering key and resolves implied parents. Hidden files and files with other
/// extensions are ignored. The result does not depend on directory iteration
/// order.
///
/// # Errors
///
/// Returns errors if:
/// - The directory doesn't exist or can't be read
/// - A `.sql` file has an invalid name or body
pub fn discover_migrations(migrations_dir: &Path) -> Result<Vec<MigrationRecord>, RepositoryError> {
    if !migrations_dir.exists() {
        return Err(RepositoryError::SourceNotFound(migrations_dir.to_path_buf()));
    }

    if !migrations_dir.is_dir() {
        return Err(RepositoryError::InvalidFormat {
            origin: migrations_dir.display().to_string(),
            reason: "path is not a directory".to_string(),
        });
    }

    let io_error = |source| RepositoryError::Io {
        path: migrations_dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(migrations_dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();

        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }

        files.push(MigrationFile::load(&path)?);
    }

    // Sort by ordering key, then name, so duplicate keys still sort stably
    files.sort_by(|a, b| {
        a.ordering_key
            .cmp(&b.ordering_key)
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut records = Vec::with_capacity(files.len());
    let mut previous: Option<String> = None;
    for file in files {
        let identifier = file.identifier;
        let parent = match file.source.parent {
            ParentDecl::Implied => previous.clone(),
            ParentDecl::Root => None,
            ParentDecl::Explicit(id) => Some(id),
        };

        let mut record = MigrationRecord::with_identifier(
            identifier.clone(),
            file.ordering_key,
            file.name,
            file.source.up,
        )
        .with_parent(parent);
        if let Some(down) = file.source.down {
            record = record.revert(down);
        }

        records.push(record);
        previous = Some(identifier);
    }

    log::debug!(
        "Discovered {} migration file(s) in {}",
        records.len(),
        migrations_dir.display()
    );

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filename() {
        let (key, name) = MigrationFile::parse_filename("m20240120120000_create_users_table.sql")
            .expect("valid file name");
        assert_eq!(key, 20240120120000);
        assert_eq!(name, "create_users_table");

        let (key, name) = MigrationFile::parse_filename("m0001_init.sql").expect("valid file name");
        assert_eq!(key, 1);
        assert_eq!(name, "init");
    }

    #[test]
    fn test_parse_filename_rejects_bad_names() {
        for name in [
            "20240120120000_create_users.sql",
            "m20240120120000.sql",
            "m20240120120000_create-users.sql",
            "m20240120120000_create_users.rs",
            "mabc_create_users.sql",
        ] {
            assert!(
                matches!(
                    MigrationFile::parse_filename(name),
                    Err(RepositoryError::InvalidFormat { .. })
                ),
                "should reject {name}"
            );
        }
    }

    #[test]
    fn test_parse_source_with_both_sections() {
        let source = parse_migration_source(
            "m2_add_locale.sql",
            "-- lockstep:parent m1_create_users\n\
             -- lockstep:up\n\
             ALTER TABLE users ADD COLUMN locale TEXT;\n\
             \n\
             -- lockstep:down\n\
             ALTER TABLE users DROP COLUMN locale;\n",
        )
        .expect("valid source");

        assert_eq!(source.parent, ParentDecl::Explicit("m1_create_users".to_string()));
        assert_eq!(source.up, "ALTER TABLE users ADD COLUMN locale TEXT;");
        assert_eq!(source.down.as_deref(), Some("ALTER TABLE users DROP COLUMN locale;"));
    }

    #[test]
    fn test_parse_source_header_comments_and_root() {
        let source = parse_migration_source(
            "m1_init.sql",
            "-- Initial schema\n\
             -- lockstep:parent none\n\n\
             -- lockstep:up\n\
             CREATE TABLE users (id BIGINT);\n",
        )
        .expect("valid source");
        assert_eq!(source.parent, ParentDecl::Root);
        assert_eq!(source.down, None);
    }

    #[test]
    fn test_parse_source_keeps_comments_inside_sections() {
        let source = parse_migration_source(
            "m1_init.sql",
            "-- lockstep:up\n-- users of the bot\nCREATE TABLE users (id BIGINT);\n",
        )
        .expect("valid source");
        assert_eq!(source.up, "-- users of the bot\nCREATE TABLE users (id BIGINT);");
    }

    #[test]
    fn test_comment_only_down_section_is_irreversible() {
        let source = parse_migration_source(
            "m1_init.sql",
            "-- lockstep:up\n\
             CREATE TABLE users (id BIGINT);\n\
             -- lockstep:down\n\
             -- nothing to undo yet\n",
        )
        .expect("valid source");
        assert_eq!(source.down, None);
    }

    #[test]
    fn test_parse_source_errors() {
        let cases = [
            ("CREATE TABLE t ();\n-- lockstep:up\nSELECT 1;", "statement outside"),
            ("-- lockstep:up\n   \n", "up section is empty"),
            ("-- lockstep:up\n-- fill me in\n\n-- later\n", "up section is empty"),
            ("-- lockstep:down\nDROP TABLE t;", "down section must follow"),
            ("-- lockstep:up\nSELECT 1;\n-- lockstep:up\nSELECT 2;", "more than once"),
            ("-- lockstep:up\nSELECT 1;\n-- lockstep:parent m1_a", "must precede"),
            ("-- lockstep:sideways\n-- lockstep:up\nSELECT 1;", "unknown directive"),
            ("-- just a comment\n", "missing"),
        ];

        for (content, expected) in cases {
            match parse_migration_source("m9_case.sql", content) {
                Err(RepositoryError::InvalidFormat { reason, .. }) => {
                    assert!(reason.contains(expected), "'{reason}' should contain '{expected}'");
                }
                other => panic!("Expected InvalidFormat for {content:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_discover_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover_migrations(&missing),
            Err(RepositoryError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_discover_resolves_implied_parents_in_key_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = |name: &str, body: &str| {
            fs::write(dir.path().join(name), body).expect("write migration");
        };
        // Written out of order on purpose
        write("m3_c.sql", "-- lockstep:up\nSELECT 3;\n");
        write("m1_a.sql", "-- lockstep:up\nSELECT 1;\n-- lockstep:down\nSELECT -1;\n");
        write("m2_b.sql", "-- lockstep:parent m1_a\n-- lockstep:up\nSELECT 2;\n");
        write("README.md", "not a migration");
        write(".m4_hidden.sql", "garbage");

        let records = discover_migrations(dir.path()).expect("discover");
        let ids: Vec<&str> = records.iter().map(MigrationRecord::identifier).collect();
        assert_eq!(ids, vec!["m1_a", "m2_b", "m3_c"]);
        assert_eq!(records[0].parent_identifier(), None);
        assert_eq!(records[1].parent_identifier(), Some("m1_a"));
        assert_eq!(records[2].parent_identifier(), Some("m2_b"));
        assert!(records[0].is_reversible());
        assert!(!records[2].is_reversible());
    }

    #[test]
    fn test_identifier_is_the_file_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m0001_init.sql");
        fs::write(&path, "-- lockstep:up\nSELECT 1;\n").expect("write migration");

        let file = MigrationFile::load(&path).expect("load");
        assert_eq!(file.identifier, "m0001_init");
        assert_eq!(file.ordering_key, 1);
    }
}
