use crate::{MyResult, WrapperError};
use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::{debug, warn};

/// Calls `probe` up to `attempts` times, sleeping `interval` between calls.
///
/// Returns the first `Some` the probe yields, or `None` once attempts run out.
/// No sleep follows the final attempt.
pub fn poll<T, F>(attempts: usize, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut(usize) -> Option<T>,
{
    for attempt in 1..=attempts {
        if let Some(found) = probe(attempt) {
            return Some(found);
        }
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    None
}

/// Waits for `path` to be staged and returns its canonical form.
pub fn wait_for_file(path: &Path, attempts: usize, interval: Duration) -> MyResult<PathBuf> {
    let staged = poll(attempts, interval, |attempt| {
        debug!(attempt, path = %path.display(), "checking for staged input");
        match path.canonicalize() {
            Ok(canonical) => Some(canonical),
            Err(e) => {
                warn!(attempt, attempts, "input {} not staged yet: {}", path.display(), e);
                None
            }
        }
    });

    let canonical = staged.ok_or_else(|| WrapperError::NotStaged {
        path: path.to_path_buf(),
        attempts,
    })?;
    if !canonical.is_file() {
        return Err(WrapperError::File(format!(
            "{} is not a regular file",
            canonical.display()
        )));
    }
    Ok(canonical)
}
