use clap::{App, Arg, ErrorKind};
use std::{
    env,
    error::Error,
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

pub mod exec;
pub mod staging;

pub use exec::{ExecMethod, ExecMethodError, Runner};

pub type MyResult<T> = Result<T, WrapperError>;

pub const USAGE: &str = "wcwrap --file <FILE> --output <OUTPUT> [--exec_method <METHOD>]";

/// Set by the batch scheduler when running inside a job allocation.
pub const JOB_ID_VAR: &str = "SLURM_JOB_ID";

/// Code reported when the pipeline panics before settling on a status.
pub const PANIC_EXIT_CODE: i32 = 1;

const STAGING_ATTEMPTS: usize = 10;
const STAGING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Config {
    file: PathBuf,
    output: PathBuf,
    exec_method: ExecMethod,
    work_dir: PathBuf,
}

impl Config {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn exec_method(&self) -> ExecMethod {
        self.exec_method
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Action {
    /// Help or version text was requested; nothing else runs.
    Help(String),
    Count(Config),
}

#[derive(Debug)]
pub enum WrapperError {
    ArgParse(String),
    UnknownOption(String),
    Usage(String),
    InvalidMethod(ExecMethodError),
    NotStaged { path: PathBuf, attempts: usize },
    File(String),
    NoMethod,
    Spawn { command: String, source: io::Error },
    CommandFailed { command: String, code: i32 },
}

impl WrapperError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WrapperError::ArgParse(_) => 2,
            WrapperError::UnknownOption(_) => 3,
            WrapperError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => 127,
            WrapperError::CommandFailed { code, .. } => *code,
            _ => 1,
        }
    }
}

impl Display for WrapperError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WrapperError::ArgParse(msg) | WrapperError::UnknownOption(msg) => write!(f, "{}", msg),
            WrapperError::Usage(msg) => write!(
                f,
                "error: {}\n\nUSAGE:\n    {}\n\nFor more information try --help",
                msg, USAGE
            ),
            WrapperError::InvalidMethod(e) => write!(f, "error: {}", e),
            WrapperError::NotStaged { path, attempts } => write!(
                f,
                "error: input file {} not found after {} attempts",
                path.display(),
                attempts
            ),
            WrapperError::File(msg) => write!(f, "error: {}", msg),
            WrapperError::NoMethod => write!(f, "error: no valid execution method detected"),
            WrapperError::Spawn { command, source } => {
                write!(f, "error: failed to execute \"{}\": {}", command, source)
            }
            WrapperError::CommandFailed { command, code } => {
                write!(f, "error: command \"{}\" failed with exit code {}", command, code)
            }
        }
    }
}

impl Error for WrapperError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WrapperError::InvalidMethod(e) => Some(e),
            WrapperError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExecMethodError> for WrapperError {
    fn from(e: ExecMethodError) -> Self {
        WrapperError::InvalidMethod(e)
    }
}

/// Prints the exit code on the way out of the entry point, whichever path is taken.
///
/// Starts out as a failure so that a panic unwinding past it still reports non-zero.
#[derive(Debug)]
pub struct ExitReport {
    code: i32,
}

impl ExitReport {
    pub fn new() -> Self {
        ExitReport {
            code: PANIC_EXIT_CODE,
        }
    }

    pub fn set(&mut self, code: i32) {
        self.code = code;
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

impl Default for ExitReport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExitReport {
    fn drop(&mut self) {
        // a closed stdout must not turn into a panic here
        let _ = writeln!(io::stdout().lock(), "Exit code: {}", self.code);
    }
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("wcwrap")
        .version("0.1.0")
        .author("Marcin Rogowski <rogowskimarcin11@gmail.com>")
        .about("Runs wc on a staged input file and stores the result")
        .usage(USAGE)
        .arg(
            Arg::with_name("file")
                .long("file")
                .value_name("FILE")
                .takes_value(true)
                .help("Input file to count"),
        )
        .arg(
            Arg::with_name("output")
                .long("output")
                .value_name("OUTPUT")
                .takes_value(true)
                .help("File receiving the counts"),
        )
        .arg(
            Arg::with_name("exec_method")
                .long("exec_method")
                .value_name("METHOD")
                .takes_value(true)
                .default_value("auto")
                .help("Execution method: environment or auto"),
        )
}

/// Parses `args` and overlays the lower-case environment overrides read through `lookup`.
///
/// Environment values win over flags; an empty variable is treated as unset.
pub fn parse_args<I, T, F>(args: I, lookup: F) -> MyResult<Action>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: Fn(&str) -> Option<OsString>,
{
    let matches = match app().get_matches_from_safe(args) {
        Ok(matches) => matches,
        Err(e) => {
            return match e.kind {
                ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => Ok(Action::Help(e.message)),
                ErrorKind::UnknownArgument => Err(WrapperError::UnknownOption(e.message)),
                _ => Err(WrapperError::ArgParse(e.message)),
            }
        }
    };

    let file = overlay(&lookup, "file", matches.value_of_os("file"))
        .map(PathBuf::from)
        .ok_or_else(|| WrapperError::Usage("missing required parameter --file".to_string()))?;
    let output = overlay(&lookup, "output", matches.value_of_os("output"))
        .map(PathBuf::from)
        .ok_or_else(|| WrapperError::Usage("missing required parameter --output".to_string()))?;
    let exec_method = overlay(&lookup, "exec_method", matches.value_of_os("exec_method"))
        .map(|m| m.to_string_lossy().parse::<ExecMethod>())
        .transpose()?
        .unwrap_or(ExecMethod::Auto);

    Ok(Action::Count(Config {
        file,
        output,
        exec_method,
        work_dir: locate_work_dir(&lookup),
    }))
}

fn overlay<F>(lookup: &F, key: &str, flag: Option<&OsStr>) -> Option<OsString>
where
    F: Fn(&str) -> Option<OsString>,
{
    lookup(key)
        .filter(|value| !value.is_empty())
        .or_else(|| flag.map(OsStr::to_os_string))
}

fn locate_work_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<OsString>,
{
    let cwd = || env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if lookup(JOB_ID_VAR).map_or(false, |id| !id.is_empty()) {
        return cwd();
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(cwd)
}

/// Reserved names next to the output file; computed but never created.
#[derive(Debug, PartialEq)]
pub struct AuxPaths {
    pub log: PathBuf,
    pub tmp: PathBuf,
}

impl AuxPaths {
    pub fn beside(output: &Path) -> Self {
        let dir = output.parent().unwrap_or_else(|| Path::new("/"));
        AuxPaths {
            log: dir.join("_log"),
            tmp: dir.join("_tmp"),
        }
    }
}

fn absolute(path: &Path) -> MyResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|e| WrapperError::File(format!("cannot resolve {}: {}", path.display(), e)))
}

/// Absolute output path with a canonical, writable parent directory.
pub fn resolve_output(path: &Path) -> MyResult<PathBuf> {
    let abs = absolute(path)?;
    let (parent, name) = match (abs.parent(), abs.file_name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => {
            return Err(WrapperError::File(format!(
                "{} is not a valid output file path",
                abs.display()
            )))
        }
    };
    let dir = parent
        .canonicalize()
        .map_err(|e| WrapperError::File(format!("{}: {}", parent.display(), e)))?;
    let meta = dir
        .metadata()
        .map_err(|e| WrapperError::File(format!("{}: {}", dir.display(), e)))?;
    if !meta.is_dir() {
        return Err(WrapperError::File(format!("{} is not a directory", dir.display())));
    }
    tempfile::Builder::new()
        .prefix(".wcwrap")
        .tempfile_in(&dir)
        .map_err(|e| WrapperError::File(format!("{} is not writable: {}", dir.display(), e)))?;
    Ok(dir.join(name))
}

pub fn run(config: Config) -> MyResult<()> {
    debug!(work_dir = %config.work_dir.display(), "located working directory");

    let output = resolve_output(&config.output)?;
    let aux = AuxPaths::beside(&output);
    debug!(log = %aux.log.display(), tmp = %aux.tmp.display(), "reserved auxiliary paths");

    let input = staging::wait_for_file(&absolute(&config.file)?, STAGING_ATTEMPTS, STAGING_INTERVAL)?;
    info!(input = %input.display(), output = %output.display(), "resolved paths");

    let runner = exec::resolve_method(config.exec_method, env::var_os("PATH").as_deref())?;
    info!("Selected execution method: {}", runner);

    exec::execute(runner, &input, &output)
}

/// Full pipeline behind `main`: returns the code the process should exit with.
pub fn entry<I, T, F>(args: I, lookup: F) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: Fn(&str) -> Option<OsString>,
{
    let mut report = ExitReport::new();
    let outcome = parse_args(args, lookup).and_then(|action| match action {
        Action::Help(text) => {
            if !text.is_empty() {
                let _ = writeln!(io::stdout().lock(), "{}", text);
            }
            Ok(())
        }
        Action::Count(config) => run(config),
    });
    match outcome {
        Ok(()) => report.set(0),
        Err(e) => {
            let _ = writeln!(io::stderr().lock(), "{}", e);
            report.set(e.exit_code());
        }
    }
    report.code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, fs};
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<OsString> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn count_config(action: Action) -> Config {
        match action {
            Action::Count(config) => config,
            Action::Help(text) => panic!("unexpected help: {}", text),
        }
    }

    #[test]
    fn test_parse_args_flags() {
        let config = count_config(
            parse_args(
                ["wcwrap", "--file", "in.txt", "--output", "out.txt", "--exec_method", "environment"],
                no_env,
            )
            .unwrap(),
        );
        assert_eq!(config.file(), Path::new("in.txt"));
        assert_eq!(config.output(), Path::new("out.txt"));
        assert_eq!(config.exec_method(), ExecMethod::Environment);
    }

    #[test]
    fn test_parse_args_default_method() {
        let config =
            count_config(parse_args(["wcwrap", "--file", "a", "--output", "b"], no_env).unwrap());
        assert_eq!(config.exec_method(), ExecMethod::Auto);
    }

    #[test]
    fn test_env_overrides_flags() {
        let env = env_of(&[("file", "/staged/in.txt"), ("exec_method", "environment")]);
        let config = count_config(
            parse_args(
                ["wcwrap", "--file", "a", "--output", "b", "--exec_method", "auto"],
                env,
            )
            .unwrap(),
        );
        assert_eq!(config.file(), Path::new("/staged/in.txt"));
        assert_eq!(config.output(), Path::new("b"));
        assert_eq!(config.exec_method(), ExecMethod::Environment);
    }

    #[test]
    fn test_env_supplies_required() {
        let env = env_of(&[("file", "in"), ("output", "out")]);
        let config = count_config(parse_args(["wcwrap"], env).unwrap());
        assert_eq!(config.file(), Path::new("in"));
        assert_eq!(config.output(), Path::new("out"));
    }

    #[test]
    fn test_empty_env_is_unset() {
        let env = env_of(&[("file", "")]);
        let config =
            count_config(parse_args(["wcwrap", "--file", "a", "--output", "b"], env).unwrap());
        assert_eq!(config.file(), Path::new("a"));
    }

    #[test]
    fn test_missing_required() {
        let res = parse_args(["wcwrap", "--output", "b"], no_env);
        let err = res.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("--file"));
        assert!(err.to_string().contains("USAGE"));

        let err = parse_args(["wcwrap", "--file", "a"], no_env).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("--output"));
    }

    #[test]
    fn test_invalid_method() {
        let err = parse_args(
            ["wcwrap", "--file", "a", "--output", "b", "--exec_method", "docker"],
            no_env,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);

        let env = env_of(&[("exec_method", "podman")]);
        let err = parse_args(
            ["wcwrap", "--file", "a", "--output", "b", "--exec_method", "auto"],
            env,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("podman"));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_args(["wcwrap", "--bogus"], no_env).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        let err =
            parse_args(["wcwrap", "--file", "a", "--output", "b", "extra"], no_env).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("extra"));

        let err = parse_args(["wcwrap", "--output", "b", "--file"], no_env).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_help() {
        match parse_args(["wcwrap", "--help"], no_env).unwrap() {
            Action::Help(text) => {
                assert!(text.contains(USAGE));
                assert!(text.contains("--exec_method"));
            }
            Action::Count(config) => panic!("unexpected config: {:?}", config),
        }
    }

    #[test]
    fn test_work_dir_under_job() {
        let env = env_of(&[(JOB_ID_VAR, "4242")]);
        let config =
            count_config(parse_args(["wcwrap", "--file", "a", "--output", "b"], env).unwrap());
        assert_eq!(config.work_dir(), env::current_dir().unwrap());
    }

    #[test]
    fn test_work_dir_outside_job() {
        let config =
            count_config(parse_args(["wcwrap", "--file", "a", "--output", "b"], no_env).unwrap());
        let exe = env::current_exe().unwrap();
        assert_eq!(config.work_dir(), exe.parent().unwrap());
    }

    #[test]
    fn test_aux_paths() {
        let aux = AuxPaths::beside(Path::new("/data/run/counts.txt"));
        assert_eq!(
            aux,
            AuxPaths {
                log: PathBuf::from("/data/run/_log"),
                tmp: PathBuf::from("/data/run/_tmp"),
            }
        );
    }

    #[test]
    fn test_resolve_output() {
        let dir = TempDir::new().unwrap();
        let res = resolve_output(&dir.path().join("counts.txt"));
        assert_eq!(
            res.unwrap(),
            dir.path().canonicalize().unwrap().join("counts.txt")
        );

        let res = resolve_output(&dir.path().join("missing").join("counts.txt"));
        assert_eq!(res.unwrap_err().exit_code(), 1);

        // the writability check leaves nothing behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_output_unwritable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // privileged users write through mode bits; nothing to check then
        let writable = fs::write(locked.join("x"), "").is_ok();
        if !writable {
            let err = resolve_output(&locked.join("counts.txt")).unwrap_err();
            assert_eq!(err.exit_code(), 1);
            assert!(err.to_string().contains("is not writable"));
        }
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_exit_report() {
        let mut report = ExitReport::new();
        assert_eq!(report.code(), 1);
        report.set(0);
        assert_eq!(report.code(), 0);
    }

    #[test]
    fn test_exit_codes() {
        let spawn = WrapperError::Spawn {
            command: "wc x".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.exit_code(), 127);

        let spawn = WrapperError::Spawn {
            command: "wc x".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(spawn.exit_code(), 1);

        let failed = WrapperError::CommandFailed {
            command: "wc x".to_string(),
            code: 5,
        };
        assert_eq!(failed.exit_code(), 5);
        assert_eq!(failed.to_string(), "error: command \"wc x\" failed with exit code 5");
    }
}
