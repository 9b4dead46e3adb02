use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/panel.db";

/// Turns whatever the operator configured (`./panel.db`, `sqlite:panel.db`,
/// `sqlite://...`) into a sqlx URL and creates the file's parent directory.
pub fn prepare_database_url(raw: &str) -> Result<String> {
    let database_url = normalize(raw);
    if let Some(parent) = sqlite_file(&database_url)
        .as_deref()
        .and_then(Path::parent)
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create parent directory '{}' for database url '{database_url}'",
                parent.display()
            )
        })?;
    }
    Ok(database_url)
}

fn normalize(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_DATABASE_URL.to_string();
    }
    if raw.starts_with("sqlite::memory:") || raw.contains("://") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw).replace('\\', "/");
    format!("sqlite://{path}")
}

fn sqlite_file(database_url: &str) -> Option<PathBuf> {
    let path = database_url.strip_prefix("sqlite://")?;
    let path = path.split('?').next().unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_become_sqlite_urls() {
        assert_eq!(normalize("./data/test.db"), "sqlite://./data/test.db");
        assert_eq!(normalize("sqlite:panel.db"), "sqlite://panel.db");
        assert_eq!(normalize("  "), DEFAULT_DATABASE_URL);
        assert_eq!(normalize("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn memory_urls_have_no_backing_file() {
        assert_eq!(sqlite_file("sqlite::memory:"), None);
        assert_eq!(
            sqlite_file("sqlite://./data/x.db?mode=rwc"),
            Some(PathBuf::from("./data/x.db"))
        );
    }

    #[test]
    fn creates_missing_parent_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db_path = temp.path().join("nested").join("panel.db");
        prepare_database_url(&db_path.to_string_lossy()).expect("prepare");
        assert!(temp.path().join("nested").is_dir());
    }
}
