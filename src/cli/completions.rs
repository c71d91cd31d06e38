//! `danube completions`

use anyhow::{Context, Result};
use clap_complete::Shell;
use std::io::{self, Write};
use std::path::Path;

/// Completion script for `shell`, covering every danube subcommand
///
/// # Errors
///
/// Returns an error if clap produced a non UTF-8 script.
pub fn generate_completions(shell: Shell) -> Result<String> {
    let mut script = Vec::new();
    clap_complete::generate(shell, &mut super::build_cli(), "danube", &mut script);
    String::from_utf8(script).context("completion script is not valid UTF-8")
}

/// Writes the script for `shell` to `output`, or to stdout
///
/// # Errors
///
/// Returns an error if the destination cannot be written.
pub fn emit(shell: Shell, output: Option<&Path>) -> Result<()> {
    let script = generate_completions(shell)?;
    match output {
        Some(path) => {
            std::fs::write(path, &script)
                .with_context(|| format!("cannot write {shell} completions to {}", path.display()))?;
            tracing::info!(%shell, path = %path.display(), "Wrote completion script");
        }
        None => io::stdout()
            .lock()
            .write_all(script.as_bytes())
            .context("cannot write completions to stdout")?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_script_knows_subcommands() {
        let script = generate_completions(Shell::Bash).unwrap();
        for sub in ["doctor", "cleanup", "completions"] {
            assert!(script.contains(sub), "missing {sub}");
        }
    }

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("danube.fish");

        emit(Shell::Fish, Some(&path)).unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, generate_completions(Shell::Fish).unwrap());
        assert!(written.contains("complete -c danube"));
    }

    #[test]
    fn test_emit_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/_danube");
        assert!(emit(Shell::Zsh, Some(&path)).is_err());
    }
}
