//! `shroud obfuscate`: runs the pipeline and writes the object and its reports.

/// Module for the `obfuscate` subcommand, which runs the obfuscation pipeline on
/// an x86-64 ELF relocatable object.
///
/// The pass list comes from `--level`, `--pass-order` or a `--config` file, in
/// that order of increasing precedence for the pass list; the remaining flags
/// override individual settings. A JSON report is written with `--report` for
/// successful and failed runs alike.
use super::CliError;
use async_trait::async_trait;
use clap::{ArgAction, Args};
use shroud_transform::{
    obfuscate, parse_pass_order, CancelToken, Event, EventSink, NullSink, PipelineConfig,
};
use shroud_utils::errors::{ConfigError, ObfuscateError};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Level used when neither `--level`, `--pass-order` nor `--config` is given.
pub const DEFAULT_LEVEL: u8 = 2;

/// Arguments for the `obfuscate` subcommand.
#[derive(Args, Debug, Default)]
pub struct ObfuscateArgs {
    /// ELF relocatable object to obfuscate
    pub input: PathBuf,

    /// Preset: 0 none, 1 subst, 2 bogus+subst, 3 +flatten, 4 +strenc and sym
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=4))]
    pub level: Option<u8>,

    /// Flattening cycles of the scheduled `flatten` pass
    #[arg(long)]
    pub cycles: Option<u8>,

    /// Percentage of blocks `bogus` guards
    #[arg(long)]
    pub bogus_percent: Option<u8>,

    /// Add (`true`) or remove (`false`) string encryption
    #[arg(long, value_name = "BOOL", action = ArgAction::Set)]
    pub string_encrypt: Option<bool>,

    /// Explicit pass order, e.g. `bogus(10%),flatten(cycles=1),subst`
    #[arg(long)]
    pub pass_order: Option<String>,

    /// Output object (default: `<input stem>.obf.o` next to the input)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Random seed; 0 or absent picks a time-derived seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to write the JSON run report
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Print progress events as JSON lines on stderr
    #[arg(long)]
    pub events: bool,

    /// Keep DWARF debug sections
    #[arg(long)]
    pub keep_debug: bool,

    /// Verify after every pass instead of only at the end
    #[arg(long)]
    pub verify_each_pass: bool,

    /// Code size growth ceiling, in percent
    #[arg(long)]
    pub max_size_growth: Option<f64>,

    /// Emulated instruction count growth ceiling, in percent
    #[arg(long)]
    pub max_runtime_overhead: Option<f64>,
}

impl ObfuscateArgs {
    /// Resolves the flags into a validated pipeline configuration.
    pub fn build_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None if self.level.is_none() && self.pass_order.is_none() => {
                PipelineConfig::from_level(DEFAULT_LEVEL)?
            }
            None => PipelineConfig::default(),
        };

        match (self.level, &self.pass_order) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "--level and --pass-order are mutually exclusive".to_string(),
                ));
            }
            (Some(level), None) => {
                let preset = PipelineConfig::from_level(level)?;
                config.passes = preset.passes;
                config.level = preset.level;
            }
            (None, Some(order)) => {
                config.passes = parse_pass_order(order)?;
                config.level = None;
            }
            (None, None) => {}
        }

        if let Some(enable) = self.string_encrypt {
            let explicit = config.level.is_none();
            config.set_string_encryption(enable, explicit)?;
        }
        if let Some(cycles) = self.cycles {
            config.set_cycles(cycles)?;
        }
        if let Some(percent) = self.bogus_percent {
            config.set_bogus_percent(percent)?;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.emit.keep_debug |= self.keep_debug;
        config.verify_each_pass |= self.verify_each_pass;
        if self.max_size_growth.is_some() {
            config.verification.max_size_growth = self.max_size_growth;
        }
        if self.max_runtime_overhead.is_some() {
            config.verification.max_runtime_overhead = self.max_runtime_overhead;
        }

        config.validate()?;
        Ok(config)
    }

    fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| default_output(&self.input))
    }
}

/// `dir/name.o` becomes `dir/name.obf.o`.
fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    input.with_file_name(format!("{stem}.obf.o"))
}

fn write_report<T: serde::Serialize>(path: &Path, report: &T) -> Result<(), ObfuscateError> {
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    info!(path = %path.display(), "wrote report");
    Ok(())
}

/// Prints events as JSON lines on stderr until the run drops its sender.
fn spawn_event_printer(mut rx: mpsc::UnboundedReceiver<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{line}"),
                Err(e) => warn!("unprintable event: {e}"),
            }
        }
    })
}

/// Executes the `obfuscate` subcommand.
#[async_trait]
impl super::Command for ObfuscateArgs {
    async fn execute(self) -> Result<(), CliError> {
        let config = self.build_config()?;
        let input = fs::read(&self.input).map_err(|source| {
            shroud_utils::errors::ParseError::FileRead {
                path: self.input.display().to_string(),
                source,
            }
        })?;

        let cancel = CancelToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling at the next pass boundary");
                    cancel.cancel();
                }
            })
        };

        let (sender, printer) = if self.events {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(spawn_event_printer(rx)))
        } else {
            (None, None)
        };
        let sink: &dyn EventSink = match &sender {
            Some(tx) => tx,
            None => &NullSink,
        };

        let outcome = obfuscate(input, &config, sink, &cancel).await;
        interrupt.abort();
        drop(sender);
        if let Some(printer) = printer {
            let _ = printer.await;
        }

        match outcome {
            Ok(result) => {
                let output = self.output_path();
                fs::write(&output, &result.output)?;
                if let Some(path) = &self.report {
                    write_report(path, &result.report)?;
                }
                let sizes = &result.report.sizes;
                info!(
                    output = %output.display(),
                    seed = result.report.input_params.seed,
                    "{}",
                    result.report.verification.summary()
                );
                println!(
                    "Obfuscation complete: {} -> {} bytes, code {} -> {} bytes, seed {}",
                    sizes.input_bytes,
                    sizes.output_bytes,
                    sizes.code_before,
                    sizes.code_after,
                    result.report.input_params.seed
                );
                println!("{}", output.display());
                Ok(())
            }
            Err(error) => {
                if let Some(path) = &self.report {
                    write_report(path, &error.report)?;
                }
                Err(Box::new(error).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::add_object;
    use crate::commands::Command;
    use shroud_transform::PassSpec;

    fn args(input: &Path) -> ObfuscateArgs {
        ObfuscateArgs {
            input: input.to_path_buf(),
            ..ObfuscateArgs::default()
        }
    }

    #[test]
    fn default_level_applies_without_pass_list() {
        let config = args(Path::new("a.o")).build_config().unwrap();
        assert_eq!(config.level, Some(DEFAULT_LEVEL));
        assert!(!config.passes.is_empty());
    }

    #[test]
    fn pass_order_overrides_level_preset() {
        let mut args = args(Path::new("a.o"));
        args.pass_order = Some("bogus(10%),flatten(cycles=1)".to_string());
        args.cycles = Some(2);
        let config = args.build_config().unwrap();
        assert_eq!(config.level, None);
        assert_eq!(
            config.passes,
            vec![PassSpec::Bogus { percent: 10 }, PassSpec::Flatten { cycles: 2 }]
        );
    }

    #[test]
    fn level_and_pass_order_conflict() {
        let mut args = args(Path::new("a.o"));
        args.level = Some(1);
        args.pass_order = Some("subst".to_string());
        assert!(matches!(args.build_config(), Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn string_encrypt_false_conflicts_with_explicit_strenc() {
        let mut args = args(Path::new("a.o"));
        args.pass_order = Some("subst,strenc".to_string());
        args.string_encrypt = Some(false);
        assert!(matches!(args.build_config(), Err(ConfigError::Conflict(_))));

        args.pass_order = None;
        args.level = Some(4);
        let config = args.build_config().unwrap();
        assert!(!config.string_encryption());
    }

    #[test]
    fn string_encrypt_true_appends_strenc() {
        let mut args = args(Path::new("a.o"));
        args.level = Some(1);
        args.string_encrypt = Some(true);
        let config = args.build_config().unwrap();
        assert_eq!(config.passes.last(), Some(&PassSpec::StringEncrypt));
    }

    #[test]
    fn ceilings_reach_verification() {
        let mut args = args(Path::new("a.o"));
        args.max_size_growth = Some(400.0);
        args.max_runtime_overhead = Some(900.0);
        let config = args.build_config().unwrap();
        assert_eq!(config.verification.max_size_growth, Some(400.0));
        assert_eq!(config.verification.max_runtime_overhead, Some(900.0));
    }

    #[test]
    fn default_output_sits_next_to_input() {
        assert_eq!(
            default_output(Path::new("/tmp/build/main.o")),
            PathBuf::from("/tmp/build/main.obf.o")
        );
    }

    #[tokio::test]
    async fn level_zero_round_trips_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("add.o");
        fs::write(&input, add_object()).unwrap();
        let report = dir.path().join("report.json");

        let mut args = args(&input);
        args.level = Some(0);
        args.seed = Some(7);
        args.report = Some(report.clone());
        args.execute().await.unwrap();

        let output = fs::read(dir.path().join("add.obf.o")).unwrap();
        let module = shroud_core::decode_object(&output).unwrap();
        assert!(module.function_by_name("add").is_some());

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["input_params"]["seed"], 7);
        assert_eq!(json["fingerprints"]["input"].as_str().unwrap().len(), 64);
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn failed_run_writes_failure_report() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("garbage.o");
        fs::write(&input, b"not an object").unwrap();
        let report = dir.path().join("report.json");

        let mut args = args(&input);
        args.report = Some(report.clone());
        let err = args.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), 4);

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["kind"], "parse");
        assert_eq!(json["exit_code"], 4);
    }
}
