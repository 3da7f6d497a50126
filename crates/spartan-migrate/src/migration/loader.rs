//! Migration definition loading.
//!
//! Directory I/O lives behind [`MigrationSource`]; [`load`] is a pure
//! function of the entries it is given.

use super::definition::{MigrationDefinition, UNIT_EXTENSION};
use super::error::MigrationError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One named unit of migration source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Entry name, e.g. `2024010100_create_farms.sql`.
    pub name: String,
    /// Raw contents.
    pub contents: String,
}

impl SourceEntry {
    /// Create a source entry.
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// A snapshot provider of migration source entries.
pub trait MigrationSource {
    /// Read every entry. Order is not significant.
    fn entries(&self) -> Result<Vec<SourceEntry>, MigrationError>;

    /// Human-readable location, used in error messages.
    fn location(&self) -> String;
}

/// Reads units from the regular files of a single directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    /// Create a source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn source_error(&self, err: impl std::fmt::Display) -> MigrationError {
        MigrationError::Source {
            location: self.location(),
            reason: err.to_string(),
        }
    }
}

impl MigrationSource for DirectorySource {
    fn entries(&self) -> Result<Vec<SourceEntry>, MigrationError> {
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| self.source_error(e))?;

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| self.source_error(e))?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                tracing::debug!(path = %item.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            if !name.ends_with(UNIT_EXTENSION) {
                tracing::debug!(name = %name, "skipping non-migration file");
                continue;
            }

            // Follows symlinks, so a linked unit counts as a regular file.
            let metadata = std::fs::metadata(item.path()).map_err(|e| self.source_error(e))?;
            if !metadata.is_file() {
                tracing::debug!(name = %name, "skipping non-file entry");
                continue;
            }

            let contents =
                std::fs::read_to_string(item.path()).map_err(|e| self.source_error(e))?;
            entries.push(SourceEntry::new(name, contents));
        }

        Ok(entries)
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Parse and order a snapshot of source entries.
///
/// Entries not ending in `.sql` are ignored. The result is sorted ascending
/// by identifier (see [`compare_identifiers`](super::definition::compare_identifiers)).
/// Two units sharing an identifier or a version token are a conflict.
pub fn load(entries: Vec<SourceEntry>) -> Result<Vec<MigrationDefinition>, MigrationError> {
    let mut definitions = Vec::with_capacity(entries.len());

    for entry in entries {
        if !entry.name.ends_with(UNIT_EXTENSION) {
            tracing::debug!(name = %entry.name, "skipping non-migration source entry");
            continue;
        }
        definitions.push(MigrationDefinition::parse(&entry.name, &entry.contents)?);
    }

    definitions.sort_by(|a, b| a.order(b));

    // Identical identifiers share a version token, so one check covers both.
    let mut by_version: HashMap<&str, &str> = HashMap::new();
    for def in &definitions {
        let key = def.version.trim_start_matches('0');
        if let Some(first) = by_version.insert(key, &def.identifier) {
            return Err(MigrationError::DefinitionConflict {
                first: first.to_string(),
                second: def.identifier.clone(),
            });
        }
    }

    Ok(definitions)
}

/// Read a source and load its definitions.
pub fn load_from(source: &dyn MigrationSource) -> Result<Vec<MigrationDefinition>, MigrationError> {
    let entries = source.entries()?;
    let definitions = load(entries)?;
    tracing::debug!(
        location = %source.location(),
        count = definitions.len(),
        "loaded migration definitions"
    );
    Ok(definitions)
}
