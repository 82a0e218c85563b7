//! Test vectors recorded by earlier KLEE runs.
//!
//! A vector is the list of named byte buffers KLEE wrote into a `.ktest` file
//! for a path that ended in an error. Vectors are read once and never change
//! afterwards; the instrumentation passes only ever borrow them.

mod ktest;
mod sources;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use ktest::{BOUT_MAGIC, KTEST_MAGIC, KTEST_VERSION, KTest, KTestError, KTestObject};
pub use sources::{ErrorArtifact, LoadError, VectorSources, corresponding_ktest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVector {
    /// File the vector was loaded from.
    pub source: PathBuf,
    pub objects: Vec<KTestObject>,
    /// Set when the vector's provenance is unreliable; such vectors are never
    /// replayed.
    pub had_error: bool,
}

impl TestVector {
    pub fn new(source: impl Into<PathBuf>, objects: Vec<KTestObject>) -> Self {
        Self {
            source: source.into(),
            objects,
            had_error: false,
        }
    }

    pub fn from_ktest(source: impl Into<PathBuf>, ktest: KTest) -> Self {
        Self::new(source, ktest.objects)
    }

    /// Loads the vector stored in a `.ktest` file.
    ///
    /// An unreadable or malformed file does not abort the load: it yields an
    /// empty vector flagged with `had_error`, which admissibility filtering
    /// then drops.
    pub fn load(path: &Path) -> Self {
        match KTest::from_file(path) {
            Ok(ktest) => Self::from_ktest(path, ktest),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ktest could not be loaded");
                Self {
                    source: path.to_path_buf(),
                    objects: Vec::new(),
                    had_error: true,
                }
            }
        }
    }

    pub fn object(&self, name: &str) -> Option<&KTestObject> {
        self.objects.iter().find(|object| object.name == name)
    }

    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|object| object.name.as_str())
    }
}
