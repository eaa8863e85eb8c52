//! Execution of host tools.

use std::process::Command;

use tracing::{debug, trace};

use crate::error::{ProbeError, Result};

/// Captured result of a host tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs host tools. Probes only talk to the host through this trait.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Whether `program` can be found on this host.
    fn has_program(&self, program: &str) -> bool;
}

/// Runs tools found on the host `PATH` (or given by absolute path).
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let resolved =
            which::which(program).map_err(|_| ProbeError::Unavailable(program.to_string()))?;

        trace!(program, ?args, "Running host tool");
        let output = Command::new(resolved).args(args).output()?;

        let out = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program, status = out.status, "Host tool finished");
        Ok(out)
    }

    fn has_program(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Run a tool and return its stdout, turning a non-zero exit into an error.
pub fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<String> {
    let output = runner.run(program, args)?;
    if !output.success() {
        return Err(ProbeError::CommandFailed {
            program: program.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Replays canned outputs keyed by `program arg1 arg2 ...`.
    #[derive(Default)]
    pub struct FakeRunner {
        outputs: HashMap<String, CommandOutput>,
        programs: Vec<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(self, command_line: &str, stdout: &str) -> Self {
            self.with_status(command_line, 0, stdout)
        }

        pub fn failing(self, command_line: &str, status: i32) -> Self {
            self.with_status(command_line, status, "")
        }

        pub fn with_status(mut self, command_line: &str, status: i32, stdout: &str) -> Self {
            let program = command_line.split(' ').next().unwrap_or_default().to_string();
            if !self.programs.contains(&program) {
                self.programs.push(program);
            }
            self.outputs.insert(
                command_line.to_string(),
                CommandOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: if status == 0 { String::new() } else { "failed".to_string() },
                },
            );
            self
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let mut line = program.to_string();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            self.calls.lock().unwrap().push(line.clone());
            if !self.has_program(program) {
                return Err(ProbeError::Unavailable(program.to_string()));
            }
            self.outputs
                .get(&line)
                .cloned()
                .ok_or_else(|| ProbeError::CommandFailed {
                    program: program.to_string(),
                    status: 127,
                    stderr: format!("unexpected call: {line}"),
                })
        }

        fn has_program(&self, program: &str) -> bool {
            self.programs.iter().any(|p| p == program)
        }
    }
}
