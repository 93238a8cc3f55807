//! Explicit manifest of migrations and seeds.
//!
//! Files are picked up from `<root>/migrations` and `<root>/modules/<module>/migrations`
//! (or `seeds`); code-defined migrations are added with [`Registry::register`].

use std::fmt;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{MigrationError, MigrationResult};
use crate::ledger::ArtifactKind;
use crate::migration::{FileMigration, Migration};

pub const FILE_EXTENSION: &str = "toml";

/// Splits `<10-digit timestamp>_<slug>` into its parts.
pub fn parse_file_name(stem: &str) -> Option<(u64, &str)> {
    let (ts, slug) = stem.split_once('_')?;
    if ts.len() != 10 || !ts.bytes().all(|b| b.is_ascii_digit()) || slug.is_empty() {
        return None;
    }
    Some((ts.parse().ok()?, slug))
}

/// Hex-encoded SHA-256 of `source`. Stored as `mkey` / `skey`.
pub fn content_key(source: &[u8]) -> String {
    Sha256::digest(source)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct RegistryEntry {
    /// File stem, e.g. `1700000000_create_users`.
    pub name: String,
    pub timestamp: u64,
    pub module: Option<String>,
    /// Ledger `filepath`; relative to the project root for discovered files.
    pub file_path: String,
    /// Raw bytes the content key is computed from.
    pub source: Vec<u8>,
    pub migration: Box<dyn Migration>,
}

impl RegistryEntry {
    /// A code-defined entry. `name` must follow the `<timestamp>_<slug>` pattern.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<Vec<u8>>,
        migration: impl Migration + 'static,
    ) -> MigrationResult<Self> {
        let name = name.into();
        let Some((timestamp, _)) = parse_file_name(&name) else {
            return Err(MigrationError::Message(format!(
                "'{}' does not match <10-digit timestamp>_<name>",
                name
            )));
        };
        Ok(Self {
            file_path: name.clone(),
            name,
            timestamp,
            module: None,
            source: source.into(),
            migration: Box::new(migration),
        })
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn content_key(&self) -> String {
        content_key(&self.source)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("timestamp", &self.timestamp)
            .field("module", &self.module)
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Registry {
    kind: ArtifactKind,
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Adds an entry, keeping the list ordered by timestamp then name.
    pub fn register(&mut self, entry: RegistryEntry) -> &mut Self {
        let at = self
            .entries
            .partition_point(|e| (e.timestamp, e.name.as_str()) <= (entry.timestamp, entry.name.as_str()));
        self.entries.insert(at, entry);
        self
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Entries of one module, or all of them.
    pub fn filtered<'a>(&'a self, module: Option<&'a str>) -> impl Iterator<Item = &'a RegistryEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| module.is_none_or(|m| e.module.as_deref() == Some(m)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads every matching file under `root`. Missing directories are empty.
    pub fn discover(kind: ArtifactKind, root: &Path) -> MigrationResult<Self> {
        let mut registry = Self::new(kind);
        registry.load_dir(root, &root.join(kind.directory()), None)?;

        let modules = root.join("modules");
        if modules.is_dir() {
            for entry in WalkDir::new(&modules)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_dir() {
                    continue;
                }
                let module = entry.file_name().to_string_lossy().into_owned();
                registry.load_dir(root, &entry.path().join(kind.directory()), Some(module))?;
            }
        }

        tracing::debug!(
            operation = "registry_discover",
            kind = kind.label(),
            count = registry.len(),
            root = %root.display(),
            "splitmig registry"
        );
        Ok(registry)
    }

    fn load_dir(&mut self, root: &Path, dir: &Path, module: Option<String>) -> MigrationResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|s| s.to_str()) != Some(FILE_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((timestamp, _)) = parse_file_name(stem) else {
                tracing::debug!(file = %path.display(), "skipping file without timestamp prefix");
                continue;
            };

            let relative = path.strip_prefix(root).unwrap_or(path);
            let file_path = relative.to_string_lossy().replace('\\', "/");
            let source = fs::read(path)?;
            let text = std::str::from_utf8(&source).map_err(|e| MigrationError::Parse {
                path: file_path.clone(),
                message: e.to_string(),
            })?;
            let migration = FileMigration::parse(&file_path, text)?;

            self.register(RegistryEntry {
                name: stem.to_owned(),
                timestamp,
                module: module.clone(),
                file_path,
                source,
                migration: Box::new(migration),
            });
        }
        Ok(())
    }
}
