use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::error::{AppError, Result};

/// Which pass of the workflow a chart belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Version {
    V1,
    V2,
}

impl Version {
    fn suffix(self) -> &'static str {
        match self {
            Version::V1 => "v1",
            Version::V2 => "v2",
        }
    }
}

/// Directory that generated code may write charts into.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AppError::Sandbox(format!("Failed to create output dir: {e}")))
    }

    /// `<root>/<basename>_<version>.png`.
    pub fn chart_path(&self, basename: &str, version: Version) -> Result<PathBuf> {
        validate_basename(basename)?;
        Ok(self
            .root
            .join(format!("{basename}_{}.png", version.suffix())))
    }
}

/// A basename must be a single plain path component.
pub fn validate_basename(basename: &str) -> Result<()> {
    if basename.is_empty() {
        return Err(AppError::InvalidOutputPath("basename is empty".to_string()));
    }
    if basename.contains(['/', '\\']) || basename.starts_with('.') {
        return Err(AppError::InvalidOutputPath(format!(
            "basename must be a plain file name: {basename}"
        )));
    }
    let mut components = Path::new(basename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(AppError::InvalidOutputPath(format!(
            "basename must be a plain file name: {basename}"
        ))),
    }
}
