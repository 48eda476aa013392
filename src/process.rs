//! Shell command execution, used by the default execution queue.

use std::io::Write;

/// Run `args` through the system shell, forwarding any output it produced.
/// Returns whether the command exited successfully; failure to launch at
/// all counts as failure.
pub fn run_shell_command(args: &str) -> bool {
    match run_command(args) {
        Ok((success, output)) => {
            if !output.is_empty() {
                let stdout = std::io::stdout();
                let mut stdout = stdout.lock();
                let _ = stdout.write_all(&output);
                let _ = stdout.flush();
            }
            success
        }
        Err(err) => {
            eprintln!("error: {}", err);
            false
        }
    }
}

#[cfg(unix)]
fn shell_command(args: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(args);
    cmd
}

#[cfg(windows)]
fn shell_command(args: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd");
    cmd.arg("/c").arg(args);
    cmd
}

#[cfg(any(unix, windows))]
fn run_command(args: &str) -> anyhow::Result<(bool, Vec<u8>)> {
    let output = shell_command(args).output()?;
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok((output.status.success(), combined))
}

#[cfg(not(any(unix, windows)))]
fn run_command(_args: &str) -> anyhow::Result<(bool, Vec<u8>)> {
    anyhow::bail!("this platform cannot run shell commands");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn reports_exit_status() {
        assert!(run_shell_command("true"));
        assert!(!run_shell_command("false"));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output() {
        let (success, output) = run_command("echo hello").unwrap();
        assert!(success);
        assert_eq!(output, b"hello\n");
    }
}
