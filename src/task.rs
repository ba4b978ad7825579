//! Executes a single build command as a subprocess, with stdout and stderr
//! combined into a per-output side-car log file.
//! Unaware of the build graph and scheduling; work.rs drives this.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// The result of executing one command.
pub struct TaskResult {
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// The side-car log for an output `dir/name` lives at `dir/.out.name._`.
pub fn log_path(output: &str) -> PathBuf {
    let path = Path::new(output);
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => String::new(),
    };
    path.with_file_name(format!(".out.{}._", name))
}

/// Create the parent directory of `path` if it has one.
pub fn create_parent_dirs(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Run `cmdline` via the shell, redirecting both output streams into the
/// side-car log, and measure how long it takes.  An Err means we failed
/// outside of the subprocess itself.
pub fn run_task(cmdline: &str, log: &Path) -> anyhow::Result<TaskResult> {
    let log_file = std::fs::File::create(log)?;
    let log_file2 = log_file.try_clone()?;
    let start = Instant::now();
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmdline)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file2))
        .status()?;
    let elapsed = start.elapsed();

    let (exit_code, note) = describe_termination(&status);
    if let Some(note) = note {
        // Record why the process died so the log replay shows it.
        let mut f = std::fs::OpenOptions::new().append(true).open(log)?;
        writeln!(f, "{}", note)?;
    }

    Ok(TaskResult { exit_code, elapsed })
}

#[cfg(unix)]
fn describe_termination(status: &ExitStatus) -> (i32, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => (code, None),
        None => {
            let sig = status.signal().unwrap_or(0);
            let note = if sig == libc::SIGINT {
                "interrupted".to_owned()
            } else {
                format!("signal {}", sig)
            };
            (128 + sig, Some(note))
        }
    }
}

#[cfg(not(unix))]
fn describe_termination(status: &ExitStatus) -> (i32, Option<String>) {
    (status.code().unwrap_or(1), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_a_hidden_sidecar() {
        assert_eq!(log_path("obj/foo.o"), PathBuf::from("obj/.out.foo.o._"));
        assert_eq!(log_path("foo"), PathBuf::from(".out.foo._"));
    }

    #[test]
    fn captures_stdout_and_stderr_interleaved() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("log");
        let result = run_task("echo one; echo two >&2", &log)?;
        assert_eq!(result.exit_code, 0);
        let text = std::fs::read_to_string(&log)?;
        assert!(text.contains("one"));
        assert!(text.contains("two"));
        Ok(())
    }

    #[test]
    fn reports_nonzero_exit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("log");
        let result = run_task("exit 3", &log)?;
        assert_eq!(result.exit_code, 3);
        Ok(())
    }

    #[test]
    fn measures_elapsed_time() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("log");
        let result = run_task("sleep 0.05", &log)?;
        assert!(result.elapsed >= Duration::from_millis(40));
        Ok(())
    }
}
