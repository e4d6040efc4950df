//! Where migration scripts come from.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::SourceError;

/// An ordered set of named migration scripts.
pub trait MigrationSource: Send + Sync {
    /// All script names, in lexical order.
    fn list(&self) -> Result<Vec<String>, SourceError>;

    /// Raw text of the script called `name`.
    fn content(&self, name: &str) -> Result<String, SourceError>;
}

impl<T: MigrationSource + ?Sized> MigrationSource for Box<T> {
    fn list(&self) -> Result<Vec<String>, SourceError> {
        (**self).list()
    }

    fn content(&self, name: &str) -> Result<String, SourceError> {
        (**self).content(name)
    }
}

/// Scripts stored as files under a directory.
///
/// Names are paths relative to the root with `/` separators, so
/// `2024/01_init.sql` sorts after `2023/99_last.sql`.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = format!("{prefix}{file_name}");

            if path.is_dir() {
                self.walk(&path, &format!("{name}/"), out)?;
            } else {
                out.push(name);
            }
        }
        Ok(())
    }
}

impl MigrationSource for DirSource {
    fn list(&self) -> Result<Vec<String>, SourceError> {
        let mut names = Vec::new();
        self.walk(&self.root, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    fn content(&self, name: &str) -> Result<String, SourceError> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SourceError::InvalidName(name.to_string()));
        }

        let path = self.root.join(relative);
        std::fs::read_to_string(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(name.to_string()),
            _ => SourceError::Io { path, source },
        })
    }
}

/// Scripts held in memory, e.g. embedded with `include_str!`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    scripts: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(name, content);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.scripts.insert(name.into(), content.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.scripts.remove(name)
    }
}

impl<N: Into<String>, C: Into<String>> FromIterator<(N, C)> for MemorySource {
    fn from_iter<I: IntoIterator<Item = (N, C)>>(iter: I) -> Self {
        Self {
            scripts: iter
                .into_iter()
                .map(|(name, content)| (name.into(), content.into()))
                .collect(),
        }
    }
}

impl MigrationSource for MemorySource {
    fn list(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.scripts.keys().cloned().collect())
    }

    fn content(&self, name: &str) -> Result<String, SourceError> {
        self.scripts
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }
}

/// Drops scripts qualified for another engine.
///
/// A name whose file part has at least three dot-separated segments
/// (`01_init.mysql.sql`) is qualified by the second-to-last one and kept
/// only when that equals `engine`. Unqualified names are always kept.
pub fn for_engine(names: Vec<String>, engine: &str) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| match engine_qualifier(name) {
            Some(qualifier) => qualifier == engine,
            None => true,
        })
        .collect()
}

fn engine_qualifier(name: &str) -> Option<&str> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let segments: Vec<&str> = file.split('.').collect();
    if segments.len() >= 3 {
        Some(segments[segments.len() - 2])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_source_lists_recursively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("02_later")).unwrap();
        std::fs::write(dir.path().join("02_later/01_a.sql"), "select 2;").unwrap();
        std::fs::write(dir.path().join("01_first.sql"), "select 1;").unwrap();
        std::fs::write(dir.path().join("03_last.sql"), "select 3;").unwrap();

        let source = DirSource::new(dir.path());
        assert_eq!(
            source.list().unwrap(),
            vec!["01_first.sql", "02_later/01_a.sql", "03_last.sql"]
        );
        assert_eq!(source.content("02_later/01_a.sql").unwrap(), "select 2;");
    }

    #[test]
    fn dir_source_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSource::new(dir.path());

        assert!(matches!(
            source.content("../secret.sql"),
            Err(SourceError::InvalidName(_))
        ));
        assert!(matches!(
            source.content("missing.sql"),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSource::new(dir.path().join("nope"));
        assert!(matches!(source.list(), Err(SourceError::Io { .. })));
    }

    #[test]
    fn memory_source_orders_by_name() {
        let source: MemorySource = [("02_b.sql", "b"), ("01_a.sql", "a")].into_iter().collect();
        assert_eq!(source.list().unwrap(), vec!["01_a.sql", "02_b.sql"]);
        assert_eq!(source.content("01_a.sql").unwrap(), "a");
    }

    #[test]
    fn engine_filter_uses_second_to_last_segment() {
        let names = vec![
            "01_init.sql".to_string(),
            "02_index.mysql.sql".to_string(),
            "02_index.postgresql.sql".to_string(),
            "v1.2/03_data.sql".to_string(),
        ];

        assert_eq!(
            for_engine(names.clone(), "postgresql"),
            vec!["01_init.sql", "02_index.postgresql.sql", "v1.2/03_data.sql"]
        );
        assert_eq!(
            for_engine(names, "sqlite"),
            vec!["01_init.sql", "v1.2/03_data.sql"]
        );
    }
}
