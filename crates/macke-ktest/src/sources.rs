//! Where vectors come from: whole `klee-out-N` directories, or individual
//! `.err` files named on the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::TestVector;

/// An error report written by KLEE together with the ktest that reproduces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorArtifact {
    pub error_file: PathBuf,
    pub ktest: PathBuf,
}

impl ErrorArtifact {
    pub fn for_error_file(error_file: &Path) -> Self {
        Self {
            error_file: error_file.to_path_buf(),
            ktest: corresponding_ktest(error_file),
        }
    }
}

/// KLEE names error reports `testNNNNNN.<kind>.err` next to `testNNNNNN.ktest`.
pub fn corresponding_ktest(error_file: &Path) -> PathBuf {
    let file_name = error_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.split('.').next().unwrap_or_default();
    error_file.with_file_name(format!("{stem}.ktest"))
}

fn is_error_file_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".err"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSources {
    pub run_directories: Vec<PathBuf>,
    pub error_files: Vec<PathBuf>,
}

impl VectorSources {
    pub fn is_empty(&self) -> bool {
        self.run_directories.is_empty() && self.error_files.is_empty()
    }

    /// Checks that at least one source is given and every source exists.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.is_empty() {
            return Err(LoadError::NoSources);
        }
        for dir in &self.run_directories {
            if !dir.is_dir() {
                return Err(LoadError::InvalidRunDirectory { path: dir.clone() });
            }
        }
        for file in &self.error_files {
            if !is_error_file_name(file) || !file.is_file() {
                return Err(LoadError::InvalidErrorFile { path: file.clone() });
            }
        }
        Ok(())
    }

    /// All error artifacts: run directories first, then explicit files, each
    /// in the order given.
    pub fn error_artifacts(&self) -> Result<Vec<ErrorArtifact>, LoadError> {
        self.validate()?;
        let mut artifacts = Vec::new();
        for dir in &self.run_directories {
            artifacts.extend(error_artifacts_in_dir(dir)?);
        }
        artifacts.extend(
            self.error_files
                .iter()
                .map(|file| ErrorArtifact::for_error_file(file)),
        );
        Ok(artifacts)
    }

    pub fn load_vectors(&self) -> Result<Vec<TestVector>, LoadError> {
        let artifacts = self.error_artifacts()?;
        tracing::debug!(count = artifacts.len(), "loading error artifacts");
        Ok(artifacts
            .iter()
            .map(|artifact| TestVector::load(&artifact.ktest))
            .collect())
    }
}

fn error_artifacts_in_dir(dir: &Path) -> Result<Vec<ErrorArtifact>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::ReadDirectory {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut error_files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::ReadDirectory {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && is_error_file_name(&path) {
            error_files.push(path);
        }
    }
    // `read_dir` order is filesystem dependent.
    error_files.sort();
    Ok(error_files
        .iter()
        .map(|file| ErrorArtifact::for_error_file(file))
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no vector sources given: name a previous KLEE run directory or an .err file")]
    NoSources,
    #[error("`{}` is not a valid directory", path.display())]
    InvalidRunDirectory { path: PathBuf },
    #[error("`{}` is not a valid .err file", path.display())]
    InvalidErrorFile { path: PathBuf },
    #[error("failed to list `{}`: {source}", path.display())]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
