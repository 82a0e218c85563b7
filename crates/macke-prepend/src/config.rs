use macke_ktest::VectorSources;
use serde::{Deserialize, Serialize};

use crate::error::PrependError;
use crate::sampling::SamplingConfig;

/// Status the instrumented program exits with when a call reproduces a
/// recorded error.
pub const MATCH_EXIT_CODE: i32 = 0;

/// Prefix of the shadow function's name.
pub const SHADOW_PREFIX: &str = "__macke_error_";

pub fn shadow_name(target: &str) -> String {
    format!("{SHADOW_PREFIX}{target}")
}

fn default_exit_code() -> i32 {
    MATCH_EXIT_CODE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrependConfig {
    /// Function whose calls get the replay checks.
    pub target: String,
    #[serde(default)]
    pub sources: VectorSources,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
}

impl PrependConfig {
    pub fn new(target: impl Into<String>, sources: VectorSources) -> Self {
        Self {
            target: target.into(),
            sources,
            sampling: SamplingConfig::default(),
            exit_code: MATCH_EXIT_CODE,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn shadow_name(&self) -> String {
        shadow_name(&self.target)
    }

    /// Full validation, including that every vector source exists on disk.
    pub fn validate(&self) -> Result<(), PrependError> {
        self.validate_options()?;
        self.sources.validate()?;
        Ok(())
    }

    /// Everything except the vector sources.
    pub fn validate_options(&self) -> Result<(), PrependError> {
        if self.target.trim().is_empty() {
            return Err(PrependError::MissingTarget);
        }
        if let Some(threshold) = self.sampling.threshold() {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(PrependError::InvalidThreshold { threshold });
            }
        }
        if let SamplingConfig::External { symbol, .. } = &self.sampling {
            let valid = !symbol.is_empty()
                && symbol
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'));
            if !valid {
                return Err(PrependError::InvalidSamplerSymbol {
                    symbol: symbol.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sources_in(dir: &std::path::Path) -> VectorSources {
        VectorSources {
            run_directories: vec![dir.to_path_buf()],
            error_files: vec![],
        }
    }

    #[test]
    fn defaults_exit_zero_and_sample_by_wall_clock() {
        let config = PrependConfig::new("f", VectorSources::default());
        assert_eq!(config.exit_code, 0);
        assert_eq!(config.shadow_name(), "__macke_error_f");
        assert_eq!(config.sampling, SamplingConfig::WallClock { threshold: 0.5 });
    }

    #[test]
    fn missing_target_is_rejected_first() {
        let config = PrependConfig::new("", VectorSources::default());
        assert!(matches!(config.validate(), Err(PrependError::MissingTarget)));
    }

    #[test]
    fn missing_sources_are_rejected() {
        let config = PrependConfig::new("f", VectorSources::default());
        assert!(matches!(config.validate(), Err(PrependError::NoVectorSources)));
    }

    #[test]
    fn source_paths_are_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PrependConfig::new("f", sources_in(&dir.path().join("klee-out-0")));
        assert!(matches!(
            config.validate(),
            Err(PrependError::InvalidRunDirectory { .. })
        ));

        let not_err = dir.path().join("test000001.ktest");
        std::fs::write(&not_err, b"KTEST").expect("write");
        let config = PrependConfig::new(
            "f",
            VectorSources {
                run_directories: vec![],
                error_files: vec![not_err],
            },
        );
        assert!(matches!(
            config.validate(),
            Err(PrependError::InvalidErrorFile { .. })
        ));

        let config = PrependConfig::new("f", sources_in(dir.path()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn threshold_must_be_a_fraction() {
        let config = PrependConfig::new("f", VectorSources::default())
            .with_sampling(SamplingConfig::WallClock { threshold: 1.5 });
        assert!(matches!(
            config.validate_options(),
            Err(PrependError::InvalidThreshold { .. })
        ));
        let config = PrependConfig::new("f", VectorSources::default())
            .with_sampling(SamplingConfig::WallClock { threshold: f64::NAN });
        assert!(config.validate_options().is_err());
    }

    #[test]
    fn sampler_symbol_must_be_a_plain_name() {
        let config = PrependConfig::new("f", VectorSources::default()).with_sampling(
            SamplingConfig::External {
                symbol: "bad name".to_string(),
                threshold: 0.5,
            },
        );
        assert!(matches!(
            config.validate_options(),
            Err(PrependError::InvalidSamplerSymbol { .. })
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: PrependConfig = serde_json::from_str(
            r#"{"target":"f","sources":{"run_directories":["klee-out-0"],"error_files":[]}}"#,
        )
        .expect("deserialize");
        assert_eq!(config.exit_code, MATCH_EXIT_CODE);
        assert_eq!(config.sources.run_directories, vec![PathBuf::from("klee-out-0")]);
    }
}
