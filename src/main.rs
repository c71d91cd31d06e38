//! danube - maintenance commands for danube pipelines
//!
//! Pipelines themselves are Rust programs that call
//! `danube::cli::run_pipeline`; this binary looks after the environment
//! they run in.
//!
//! ## Commands
//!
//! - `danube doctor` - Check the container engine and the log collector
//! - `danube cleanup` - Remove containers left behind by earlier runs
//! - `danube completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Is docker reachable, is the collector up?
//! danube doctor --config danube.yaml
//!
//! # Remove leftovers after a crashed run
//! danube cleanup --engine podman
//!
//! # Generate shell completions
//! danube completions bash > /etc/bash_completion.d/danube
//! ```

use std::process::ExitCode;

fn main() -> ExitCode {
    match danube::cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("DANUBE_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
