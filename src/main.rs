use std::{
    env,
    io::{self, IsTerminal},
    panic,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    // the exit report has already printed PANIC_EXIT_CODE while unwinding
    let code = panic::catch_unwind(|| wcwrap::entry(env::args_os(), |key| env::var_os(key)))
        .unwrap_or(wcwrap::PANIC_EXIT_CODE);
    std::process::exit(code);
}
