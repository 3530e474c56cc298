//! Decide which posts of a page to download, then download them.
//!
//! See [`plan`] for the decision rule and [`DownloadPlanner`] for the download loop.
//!
//! Following is the low-level module wrapped by this module:
//! - [`crate::download`]
//! - [`crate::inventory`]

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::Post;
use crate::download::Downloader;
use crate::inventory::LocalInventory;
use crate::tool::default_jobs;

const PB_FINISH_MODE: ProgressFinish = ProgressFinish::Abandon;

/// What to do with a single post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The file is already present.
    Skip,
    /// The file must be downloaded.
    Fetch,
}

/// Decide, for each post in order, whether to download it.
///
/// A post is skipped iff its file name is in `inventory` and `overwrite` is `false`.
/// Additionally, a file name already planned for [`Decision::Fetch`] earlier in
/// `posts` is skipped, so that two concurrent downloads never write the same file.
pub fn plan(posts: &[Post], inventory: &LocalInventory, overwrite: bool) -> Vec<Decision> {
    let mut planned: HashSet<&str> = HashSet::new();
    posts
        .iter()
        .map(|post| {
            let name = post.file_name.as_str();
            if (!overwrite && inventory.contains(name)) || !planned.insert(name) {
                Decision::Skip
            } else {
                Decision::Fetch
            }
        })
        .collect()
}

/// Run-wide progress, shared by every page of a run.
///
/// `downloaded` counts the posts resolved so far (fetched, skipped, failed or not started),
/// `total_planned` is the number of posts the run expects to resolve.
/// Both only ever grow. They are for display only.
pub struct ProgressCounter {
    downloaded: AtomicU64,
    total_planned: AtomicU64,
    bar: ProgressBar,
}

impl ProgressCounter {
    /// A counter rendered as a progress bar on stderr.
    pub fn new(total_planned: u64) -> Self {
        Self::with_bar(total_planned, Self::build_process_bar(total_planned))
    }

    /// A counter that draws nothing, e.g. for `--quiet`.
    pub fn hidden(total_planned: u64) -> Self {
        Self::with_bar(total_planned, ProgressBar::hidden())
    }

    fn with_bar(total_planned: u64, bar: ProgressBar) -> Self {
        bar.set_length(total_planned);
        Self {
            downloaded: AtomicU64::new(0),
            total_planned: AtomicU64::new(total_planned),
            bar,
        }
    }

    /// Build a process bar with a specific length and custom style.
    #[inline]
    fn build_process_bar(len: u64) -> ProgressBar {
        // see: https://docs.rs/indicatif/latest/indicatif/#templates
        const PROCESS_CHARS: &str = "#>-";
        const TEMPLATE: &str =
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}";

        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap()
            .progress_chars(PROCESS_CHARS);

        ProgressBar::new(len)
            .with_style(style)
            .with_finish(PB_FINISH_MODE)
    }

    /// The number of posts resolved so far.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// The number of posts the run expects to resolve.
    pub fn total_planned(&self) -> u64 {
        self.total_planned.load(Ordering::Acquire)
    }

    /// Notification before a post is resolved: shows the current count.
    pub fn begin(&self, file_name: &str) {
        let current = self.downloaded();
        tracing::trace!(current, total = self.total_planned(), file_name, "begin");
        self.bar.set_message(file_name.to_owned());
        self.bar.set_position(current);
    }

    /// Notification after a post is resolved: shows the incremented count.
    /// Returns the new count.
    pub fn finish(&self, file_name: &str) -> u64 {
        let current = self.downloaded.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(current, total = self.total_planned(), file_name, "finish");
        self.bar.inc(1);
        current
    }

    /// Print `msg` without garbling the bar.
    pub fn println(&self, msg: impl AsRef<str>) {
        // why `suspend`: https://docs.rs/indicatif/0.17.8/indicatif/struct.ProgressBar.html#method.suspend
        self.bar.suspend(|| eprintln!("{}", msg.as_ref()));
    }

    /// Stop drawing, leaving the bar as is.
    pub fn done(&self) {
        self.bar.finish_with_message("done");
    }
}

/// The outcome of downloading one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageReport {
    /// Files downloaded.
    pub fetched: u64,
    /// Files already present.
    pub skipped: u64,
    /// Files that failed to download.
    pub failed: u64,
    /// Files planned for download but never started, because of an interrupt.
    pub not_started: u64,
}

/** Downloads the posts of a page into the download directory.

- [`plan`] decides against a [`LocalInventory`] snapshot which posts to download.
    *Every decision of a page is taken before its first download starts.*

- The number of concurrent downloads is limited to `jobs`, see [`Self::with_jobs`].

- A failed download is reported and counted; it does not stop the others.

- Once the interrupt flag is set (see [`Self::with_interrupt`]), downloads already running
    complete but the ones still waiting for a slot are not started.

# Example
```no_run
use std::sync::Arc;

use reqwest::Client;
use booru_mirror::api::Post;
use booru_mirror::inventory::LocalInventory;
use booru_mirror::planner::{DownloadPlanner, ProgressCounter};

#[tokio::main]
async fn main() {
    let planner = DownloadPlanner::build(Client::new(), "download_dir", false).await.unwrap();
    let mut inventory = LocalInventory::scan("download_dir").unwrap();
    let posts = vec![Post::from_file_url("https://img3.gelbooru.com/images/a.jpg").unwrap()];

    let progress = Arc::new(ProgressCounter::new(posts.len() as u64));
    let report = planner.run(posts, &mut inventory, &progress).await;
    println!("{report:?}");
}
```
*/
pub struct DownloadPlanner {
    downloader: Downloader,
    overwrite: bool,
    jobs: NonZeroUsize,
    interrupted: Arc<AtomicBool>,
}

impl DownloadPlanner {
    /// Create a new planner writing into `download_dir`.
    ///
    /// # Errors
    ///
    /// If the `download_dir` cannot be created, an error will be returned.
    pub async fn build(
        client: Client,
        download_dir: impl Into<PathBuf>,
        overwrite: bool,
    ) -> std::io::Result<Self> {
        let downloader = Downloader::session(client, download_dir).ensure().await?;
        Ok(Self {
            downloader,
            overwrite,
            jobs: default_jobs(),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Limit the number of concurrent downloads.
    pub fn with_jobs(mut self, jobs: NonZeroUsize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Share an interrupt flag. Once it is set, queued downloads are not started.
    pub fn with_interrupt(mut self, interrupted: Arc<AtomicBool>) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Download the posts of one page, updating `inventory` with the files written.
    ///
    /// # Panics
    ///
    /// If one of the download tasks panic, the panic will be resumed when `join` the task.
    pub async fn run(
        &self,
        posts: Vec<Post>,
        inventory: &mut LocalInventory,
        progress: &Arc<ProgressCounter>,
    ) -> PageReport {
        let decisions = plan(&posts, inventory, self.overwrite);

        let mut report = PageReport::default();
        let semaphore = Arc::new(Semaphore::new(self.jobs.get()));
        let mut download_join_set = JoinSet::new();

        for (post, decision) in posts.into_iter().zip(decisions) {
            let Post {
                file_url,
                file_name,
            } = post;

            if decision == Decision::Skip {
                progress.begin(&file_name);
                tracing::debug!(%file_name, "already present, skipping");
                report.skipped += 1;
                progress.finish(&file_name);
                continue;
            }

            let download_future = self.downloader.fetch(file_url.clone(), &file_name);
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            let interrupted = self.interrupted.clone();
            download_join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore was closed too early");

                progress.begin(&file_name);
                let result = if interrupted.load(Ordering::Acquire) {
                    None
                } else {
                    Some(
                        download_future
                            .await
                            .with_context(|| format!("Failed to download {file_url}")),
                    )
                };
                progress.finish(&file_name);

                (file_name, result)
            });
        }

        while let Some(task_result) = download_join_set.join_next().await {
            let (file_name, result) = match task_result {
                Ok(task_result) => task_result,
                Err(join_error) => {
                    if let Ok(reason) = join_error.try_into_panic() {
                        // Expect unknown error, so we just resume the panic
                        std::panic::resume_unwind(reason)
                    }
                    // task was cancelled if not panic, so we do nothing here
                    panic!("Unexpected task cancelled");
                }
            };

            match result {
                None => {
                    tracing::debug!(%file_name, "interrupted, not started");
                    report.not_started += 1;
                }
                Some(Ok(path)) => {
                    tracing::debug!(path = %path.display(), "downloaded");
                    report.fetched += 1;
                    inventory.insert(file_name);
                }
                // why `{:#}`: https://docs.rs/anyhow/1.0.86/anyhow/struct.Error.html#display-representations
                Some(Err(err)) => {
                    tracing::warn!(%file_name, "{err:#}");
                    report.failed += 1;
                    progress.println(format!("{err:#}"));
                }
            }
        }

        report
    }
}
