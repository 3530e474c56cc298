//! Some useful tools for the project.
//!
//! Usually, you don't need to use this module directly.
//! [`crate::api`] and [`crate::planner`] will automatically use these tools.

use std::num::NonZeroUsize;
use std::sync::LazyLock;
use std::thread::available_parallelism;

use reqwest::Url;

/// The number of CPUs available to the program.
/// You can consider this as cache of [`std::thread::available_parallelism`].
pub static NUM_CPUS: LazyLock<NonZeroUsize> =
    LazyLock::new(|| available_parallelism().unwrap_or(NonZeroUsize::MIN));

/// Upper bound of the default number of concurrent downloads.
const MAX_DEFAULT_JOBS: usize = 8;

/// The default number of concurrent downloads: [`NUM_CPUS`], but no more than 8.
pub fn default_jobs() -> NonZeroUsize {
    NonZeroUsize::new(NUM_CPUS.get().min(MAX_DEFAULT_JOBS)).unwrap_or(NonZeroUsize::MIN)
}

/// Return the final path segment of `file_url`, which is the name we save the file under.
///
/// Query strings and fragments are ignored. Returns `None` if the url has no usable
/// final segment, e.g. `https://host/` or `https://host/dir/`.
pub fn file_name_from_url(file_url: &str) -> Option<String> {
    let name = match Url::parse(file_url) {
        Ok(url) => url.path_segments()?.last()?.to_owned(),
        // relative or otherwise odd urls, fall back to plain string splitting
        Err(_) => {
            let path = file_url.split(['?', '#']).next()?;
            path.rsplit('/').next()?.to_owned()
        }
    };

    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
