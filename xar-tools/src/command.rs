use anyhow::{bail, format_err, Error};

/// Run an external command to completion, capturing its output.
///
/// A non-zero exit status or termination by signal is an error carrying the
/// captured stderr.
pub fn run_command(mut command: std::process::Command) -> Result<String, Error> {
    let output = command
        .output()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    if !output.status.success() {
        match output.status.code() {
            Some(code) => {
                let msg = String::from_utf8(output.stderr)
                    .map(|m| {
                        if m.is_empty() {
                            String::from("no error message")
                        } else {
                            m
                        }
                    })
                    .unwrap_or_else(|_| String::from("non utf8 error message (suppressed)"));
                bail!("command {:?} failed with status code {} - {}", command, code, msg);
            }
            None => bail!("command {:?} terminated by signal", command),
        }
    }

    String::from_utf8(output.stdout)
        .map_err(|err| format_err!("command {:?} produced non utf8 output - {}", command, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_captures_stdout() {
        let mut command = std::process::Command::new("echo");
        command.arg("ok");
        assert_eq!(run_command(command).unwrap(), "ok\n");
    }

    #[test]
    fn test_run_command_reports_failure() {
        let mut command = std::process::Command::new("sh");
        command.arg("-c").arg("echo broken >&2; exit 3");
        let err = run_command(command).unwrap_err().to_string();
        assert!(err.contains("status code 3"), "{}", err);
        assert!(err.contains("broken"), "{}", err);
    }

    #[test]
    fn test_run_command_missing_binary() {
        let command = std::process::Command::new("/nonexistent/really-not-here");
        assert!(run_command(command).is_err());
    }
}
