use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use macke::{EmitFormat, output_path, prepend_file, render_module, write_output, write_report};
use macke_ktest::VectorSources;
use macke_prepend::{DEFAULT_SAMPLE_THRESHOLD, MATCH_EXIT_CODE, PrependConfig, SamplingConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SamplingKind {
    /// Reseed `rand` from the clock on every call (KLEE-compatible default).
    WallClock,
    /// Check every call.
    Always,
    /// Ask a link-time provided `double sampler(void)`.
    External,
}

/// Prepend errors found by earlier KLEE runs to a function, so that calls
/// reproducing one of them terminate the program before the function runs.
#[derive(Parser, Debug)]
#[command(name = "macke-prepend", version)]
struct Cli {
    /// IR module to instrument (JSON).
    #[arg(long, env = "MACKE_INPUT")]
    input: PathBuf,

    /// Where to write the result; stdout for json and text when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Function whose calls get the replay checks.
    #[arg(long = "prepend-to-function", env = "MACKE_PREPEND_TO_FUNCTION", default_value = "")]
    prepend_to_function: String,

    /// `klee-out-N` directory whose `.err` files are prepended.
    #[arg(long = "previous-klee-run-directory", value_name = "DIR")]
    previous_klee_run_directory: Vec<PathBuf>,

    /// Single `.err` file to prepend.
    #[arg(long = "error-file-to-prepend", value_name = "FILE")]
    error_file_to_prepend: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = SamplingKind::WallClock, env = "MACKE_SAMPLING")]
    sampling: SamplingKind,

    /// Sampler function for `--sampling external`.
    #[arg(long, env = "MACKE_SAMPLER_SYMBOL")]
    sampler_symbol: Option<String>,

    /// Checks are skipped when the sampled fraction exceeds this value.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_THRESHOLD, env = "MACKE_SAMPLE_THRESHOLD")]
    sample_threshold: f64,

    /// Exit status of a program that reproduces a prepended error.
    #[arg(long, default_value_t = MATCH_EXIT_CODE, allow_negative_numbers = true)]
    exit_code: i32,

    #[arg(long, value_enum, default_value_t = EmitFormat::Json)]
    emit: EmitFormat,

    /// Also write a JSON report of admitted and skipped vectors.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

impl Cli {
    fn sampling_config(&self) -> Result<SamplingConfig> {
        let threshold = self.sample_threshold;
        Ok(match self.sampling {
            SamplingKind::WallClock => SamplingConfig::WallClock { threshold },
            SamplingKind::Always => SamplingConfig::Always,
            SamplingKind::External => {
                let Some(symbol) = self.sampler_symbol.clone() else {
                    bail!("`--sampling external` needs `--sampler-symbol`");
                };
                SamplingConfig::External { symbol, threshold }
            }
        })
    }

    fn prepend_config(&self) -> Result<PrependConfig> {
        let sources = VectorSources {
            run_directories: self.previous_klee_run_directory.clone(),
            error_files: self.error_file_to_prepend.clone(),
        };
        Ok(PrependConfig::new(self.prepend_to_function.clone(), sources)
            .with_sampling(self.sampling_config()?)
            .with_exit_code(self.exit_code))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(&Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.prepend_config()?;
    let outcome = prepend_file(&cli.input, &config)?;

    if let Some(path) = &cli.report {
        write_report(path, &outcome.report)?;
    }

    let bytes = render_module(&outcome.module, cli.emit)?;
    let output = output_path(&cli.input, cli.output.as_deref(), cli.emit);
    write_output(output.as_deref(), &bytes)?;
    if let Some(path) = &output {
        tracing::info!(path = %path.display(), bytes = bytes.len(), "wrote instrumented module");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("macke-prepend").chain(args.iter().copied()))
            .expect("cli parse should succeed")
    }

    #[test]
    fn parse_klee_run_options() {
        let cli = parse(&[
            "--input",
            "m.json",
            "--prepend-to-function",
            "f",
            "--previous-klee-run-directory",
            "klee-out-0",
            "--previous-klee-run-directory",
            "klee-out-1",
            "--error-file-to-prepend",
            "test000001.ptr.err",
        ]);
        let config = cli.prepend_config().expect("config");
        assert_eq!(config.target, "f");
        assert_eq!(
            config.sources.run_directories,
            vec![PathBuf::from("klee-out-0"), PathBuf::from("klee-out-1")]
        );
        assert_eq!(
            config.sources.error_files,
            vec![PathBuf::from("test000001.ptr.err")]
        );
        assert_eq!(config.sampling, SamplingConfig::WallClock { threshold: 0.5 });
        assert_eq!(config.exit_code, MATCH_EXIT_CODE);
        assert_eq!(cli.emit, EmitFormat::Json);
    }

    #[test]
    fn parse_sampling_and_exit_code() {
        let cli = parse(&[
            "--input",
            "m.json",
            "--sampling",
            "external",
            "--sampler-symbol",
            "macke_sample",
            "--sample-threshold",
            "0.25",
            "--exit-code",
            "-3",
            "--emit",
            "object",
        ]);
        let config = cli.prepend_config().expect("config");
        assert_eq!(
            config.sampling,
            SamplingConfig::External {
                symbol: "macke_sample".to_string(),
                threshold: 0.25,
            }
        );
        assert_eq!(config.exit_code, -3);
        assert_eq!(cli.emit, EmitFormat::Object);
    }

    #[test]
    fn external_sampling_requires_symbol() {
        let cli = parse(&["--input", "m.json", "--sampling", "external"]);
        let err = cli.prepend_config().expect_err("symbol required");
        assert!(err.to_string().contains("--sampler-symbol"));
    }

    #[test]
    fn sampling_names_are_kebab_case() {
        let cli = parse(&["--input", "m.json", "--sampling", "wall-clock"]);
        assert_eq!(cli.sampling, SamplingKind::WallClock);
        let cli = parse(&["--input", "m.json", "--sampling", "always"]);
        assert_eq!(
            cli.prepend_config().expect("config").sampling,
            SamplingConfig::Always
        );
    }
}
