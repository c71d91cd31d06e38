//! Command-line arguments of a pipeline program
//!
//! A pipeline program's `main` hands its definition and body to
//! [`run_pipeline`]; the flags below tune the run.
//!
//! ```bash
//! cargo run --example danubefile -- --dry-run --param DEPLOY=false
//! ```

use crate::executor::{RunReport, Runner};
use crate::infrastructure::{Config, init_logging};
use crate::pipeline::{Pipeline, PipelineDef, StepResult};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Flags accepted by every pipeline program
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(author, version, about = "Run a danube pipeline", long_about = None)]
pub struct PipelineArgs {
    /// Log what would run without touching containers, secrets or input
    #[arg(long)]
    pub dry_run: bool,

    /// Build parameter override, as NAME=VALUE
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// YAML configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl PipelineArgs {
    /// Configuration from the file, the environment, then these flags
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => Config::default(),
        };
        config.apply_env();
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        Ok(config)
    }

    /// `def` with the parameter overrides applied
    ///
    /// # Errors
    ///
    /// Returns an error for unknown parameters or invalid values.
    pub fn apply(&self, def: PipelineDef) -> Result<PipelineDef> {
        def.with_overrides(&self.params)
            .context("Invalid build parameter override")
    }

    /// Runs one pipeline with these flags
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not start.
    pub fn execute<F>(&self, def: PipelineDef, body: F) -> Result<RunReport>
    where
        F: FnOnce(&Pipeline) -> StepResult,
    {
        let config = self.load_config()?;
        init_logging(&config.log_level);

        let def = self.apply(def)?;
        let runner = Runner::from_config(config).context("Failed to set up the runner")?;
        let report = runner.run(def, body).context("Pipeline could not start")?;
        Ok(report)
    }
}

/// Parses the process arguments, runs the pipeline and prints a summary
///
/// Exit code 0 for `Completed` and `EarlyExit`, 1 otherwise.
pub fn run_pipeline<F>(def: PipelineDef, body: F) -> ExitCode
where
    F: FnOnce(&Pipeline) -> StepResult,
{
    let args = PipelineArgs::parse();
    match args.execute(def, body) {
        Ok(report) => {
            println!("{}", format_report(&report));
            ExitCode::from(report.exit_code())
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Human-readable run summary
#[must_use]
pub fn format_report(report: &RunReport) -> String {
    let mut out = format!(
        "Pipeline {} on {}: {}\n",
        report.name, report.branch, report.state
    );
    for stage in &report.stages {
        out.push_str(&format!(
            "  {:<24} {:<8} {:>8.2}s{}\n",
            stage.name,
            stage.state,
            stage.duration.as_secs_f64(),
            if stage.overran { "  (timeout exceeded)" } else { "" }
        ));
    }
    for artifact in &report.artifacts {
        out.push_str(&format!(
            "  artifact {}: {} file(s)\n",
            artifact.name,
            artifact.files.len()
        ));
    }
    if let Some(reason) = &report.stop_reason {
        out.push_str(&format!("  stopped early: {reason}\n"));
    }
    if let Some(error) = &report.error {
        out.push_str(&format!("  error: {error}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BuildParam;
    use crate::testing::Harness;

    #[test]
    fn test_parse_flags() {
        let args = PipelineArgs::try_parse_from([
            "pipeline",
            "--dry-run",
            "-p",
            "DEPLOY=false",
            "--param",
            "TARGET=staging",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert!(args.dry_run);
        assert_eq!(args.params, vec!["DEPLOY=false", "TARGET=staging"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_config_applies_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("danube.yaml");
        std::fs::write(&path, "workers: 2\nlog_level: warn\n").unwrap();

        let args = PipelineArgs {
            dry_run: true,
            config: Some(path),
            log_level: Some("trace".into()),
            ..PipelineArgs::default()
        };
        let config = args.load_config().unwrap();

        assert!(config.dry_run);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = PipelineArgs {
            config: Some(PathBuf::from("/nonexistent/danube.yaml")),
            ..PipelineArgs::default()
        };
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_apply_rejects_unknown_param() {
        let args = PipelineArgs {
            params: vec!["NOPE=1".into()],
            ..PipelineArgs::default()
        };
        let def = PipelineDef::new("alpine").param(BuildParam::bool("DEPLOY", "", false));
        assert!(args.apply(def).is_err());
    }

    #[test]
    fn test_format_report() {
        let harness = Harness::new();
        let report = harness
            .runner()
            .run(PipelineDef::new("alpine").name("ci"), |p| {
                p.stage("Build", |_| Ok(()))?;
                p.stage("Gate", |s| s.stop("not on release"))
            })
            .unwrap();

        let text = format_report(&report);
        assert!(text.starts_with("Pipeline ci on main: EarlyExit"));
        assert!(text.contains("Build"));
        assert!(text.contains("SKIPPED"));
        assert!(text.contains("stopped early: not on release"));
    }
}
