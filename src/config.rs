//! Run configuration: the keys the core consumes, with no file parsing of
//! its own — reading a project's TOML config is the frontend's job.

use camino::Utf8PathBuf;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub paths: Vec<Utf8PathBuf>,
    pub force: bool,
    pub dry_run: bool,
    pub stop_after_first_failure: bool,
    pub max_failures: Option<u32>,
    pub check_casing_of_paths: bool,
    pub clean_lockfile: bool,
    pub filterwarnings: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            paths: Vec::new(),
            force: false,
            dry_run: false,
            stop_after_first_failure: false,
            max_failures: None,
            check_casing_of_paths: false,
            clean_lockfile: false,
            filterwarnings: Vec::new(),
        }
    }
}

impl RunConfig {
    /// `stop_after_first_failure` is sugar for `max_failures = 1`; when
    /// neither is set the stop policy never fires.
    pub fn effective_max_failures(&self) -> usize {
        if self.stop_after_first_failure {
            1
        } else {
            self.max_failures.map(|n| n as usize).unwrap_or(usize::MAX)
        }
    }
}
