use crate::{MyResult, WrapperError};
use std::{
    env,
    error::Error,
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    str::FromStr,
};
use tracing::{debug, info};

pub const COUNT_UTILITY: &str = "wc";

// Probed for the log only; no container execution is wired in.
const CONTAINER_RUNTIMES: [&str; 2] = ["docker", "singularity"];

/// Execution method as requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMethod {
    Environment,
    Auto,
}

/// Concrete way the counting utility gets run once `auto` is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner {
    Environment,
}

#[derive(Debug, Clone)]
pub struct ExecMethodError {
    method: String,
}

impl Display for ExecMethodError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" is not a valid execution method (expected environment or auto)",
            self.method
        )
    }
}

impl Error for ExecMethodError {}

impl FromStr for ExecMethod {
    type Err = ExecMethodError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "environment" => Ok(ExecMethod::Environment),
            "auto" => Ok(ExecMethod::Auto),
            _ => Err(ExecMethodError {
                method: input.to_string(),
            }),
        }
    }
}

impl Display for ExecMethod {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ExecMethod::Environment => write!(f, "environment"),
            ExecMethod::Auto => write!(f, "auto"),
        }
    }
}

impl Display for Runner {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Runner::Environment => write!(f, "environment"),
        }
    }
}

/// First executable named `program` in the directories of `path_var`.
pub fn find_on_path(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    env::split_paths(path_var?)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}

pub fn resolve_method(requested: ExecMethod, path_var: Option<&OsStr>) -> MyResult<Runner> {
    match requested {
        ExecMethod::Environment => Ok(Runner::Environment),
        ExecMethod::Auto => {
            for runtime in CONTAINER_RUNTIMES {
                let available = find_on_path(runtime, path_var).is_some();
                debug!(runtime, available, "probed container runtime");
            }
            match find_on_path(COUNT_UTILITY, path_var) {
                Some(found) => {
                    debug!(utility = %found.display(), "found counting utility on PATH");
                    Ok(Runner::Environment)
                }
                None => Err(WrapperError::NoMethod),
            }
        }
    }
}

#[derive(Debug)]
pub struct CountCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl CountCommand {
    pub fn new(runner: Runner, input: &Path) -> Self {
        match runner {
            Runner::Environment => CountCommand {
                program: OsString::from(COUNT_UTILITY),
                args: vec![input.as_os_str().to_os_string()],
            },
        }
    }

    /// Runs to completion with stdout written over `output`.
    pub fn run(&self, output: &Path) -> MyResult<()> {
        let out = File::create(output)
            .map_err(|e| WrapperError::File(format!("{}: {}", output.display(), e)))?;
        let command = self.to_string();
        info!(%command, "running counting command");

        let status = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::from(out))
            .status()
            .map_err(|source| WrapperError::Spawn {
                command: command.clone(),
                source,
            })?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(WrapperError::CommandFailed { command, code }),
            // killed by a signal
            None => Err(WrapperError::CommandFailed { command, code: 1 }),
        }
    }
}

impl Display for CountCommand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

pub fn execute(runner: Runner, input: &Path, output: &Path) -> MyResult<()> {
    CountCommand::new(runner, input).run(output)
}
