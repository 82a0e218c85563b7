use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use macke_codegen::{Backend, BackendConfig, CodegenMode, CraneliftBackend};
use macke_ir::{IrModule, verify_module};
use macke_prepend::{PrependConfig, PrependReport, run_prepend};

/// What the driver writes for the instrumented module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmitFormat {
    /// The IR module as JSON, readable by `--input`.
    Json,
    /// Human readable IR listing.
    Text,
    /// Relocatable object file from the Cranelift backend.
    Object,
}

#[derive(Debug)]
pub struct PrependOutcome {
    pub module: IrModule,
    pub report: PrependReport,
}

pub fn load_module(path: &Path) -> Result<IrModule> {
    let source =
        fs::read_to_string(path).with_context(|| format!("failed to read `{}`", path.display()))?;
    let module: IrModule = serde_json::from_str(&source)
        .with_context(|| format!("`{}` is not a valid IR module", path.display()))?;
    verify_module(&module).with_context(|| format!("`{}` failed verification", path.display()))?;
    Ok(module)
}

/// Loads `input`, prepends the configured errors and returns the result.
pub fn prepend_file(input: &Path, config: &PrependConfig) -> Result<PrependOutcome> {
    let mut module = load_module(input)?;
    let report = run_prepend(&mut module, config)?;
    Ok(PrependOutcome { module, report })
}

pub fn render_module(module: &IrModule, format: EmitFormat) -> Result<Vec<u8>> {
    match format {
        EmitFormat::Json => {
            let mut bytes =
                serde_json::to_vec_pretty(module).context("failed to serialize module")?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        EmitFormat::Text => Ok(module.to_string().into_bytes()),
        EmitFormat::Object => {
            let artifact = CraneliftBackend
                .compile_module(
                    module,
                    &BackendConfig {
                        mode: CodegenMode::Aot,
                        ..BackendConfig::default()
                    },
                )
                .context("codegen failed")?;
            if artifact.object.is_empty() {
                bail!("AOT backend produced no object bytes");
            }
            Ok(artifact.object)
        }
    }
}

/// Object files always go to disk; next to the input unless `output` is set.
pub fn output_path(input: &Path, output: Option<&Path>, format: EmitFormat) -> Option<PathBuf> {
    match (output, format) {
        (Some(path), _) => Some(path.to_path_buf()),
        (None, EmitFormat::Object) => Some(input.with_extension("o")),
        (None, EmitFormat::Json | EmitFormat::Text) => None,
    }
}

/// Writes `bytes` to `path`, or to stdout when there is no path.
pub fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    let Some(path) = path else {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(bytes).context("failed to write to stdout")?;
        return stdout.flush().context("failed to write to stdout");
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create output directory `{}`", parent.display())
        })?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write `{}`", path.display()))
}

pub fn write_report(path: &Path, report: &PrependReport) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
    bytes.push(b'\n');
    write_output(Some(path), &bytes)
}
