//! A core module to mirror every post of a query into a local directory.
//!
//! See [`PaginationDriver`] for more information.
//!
//! Following is the module wrapped by this module:
//! - [`crate::api`]
//! - [`crate::planner`]

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::{Client, Url};
use thiserror::Error;

use crate::api::{ApiError, PostIndex, RetryPolicy};
use crate::inventory::LocalInventory;
use crate::planner::{DownloadPlanner, PageReport, ProgressCounter};
use crate::query::{QueryError, QuerySpec};

/// Fatal errors of a run. Per-file download failures are not among them,
/// they are counted in [`RunSummary::failed`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunError {
    /// The query is invalid. Nothing was sent.
    #[error(transparent)]
    Config(#[from] QueryError),
    /// The count probe or a page request failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The download directory could not be prepared or scanned.
    #[error("failed to prepare the download directory: {}", .path.display())]
    Io {
        /// The download directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The states a run goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Init,
    Counting,
    Capping,
    PageLoop,
    Done,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// The count reported by the count probe.
    pub reported_count: u64,
    /// The number of posts the run planned for, see [`effective_total`].
    pub effective_total: u64,
    /// The number of page requests sent.
    pub pages_fetched: u64,
    /// Files downloaded.
    pub fetched: u64,
    /// Files already present.
    pub skipped: u64,
    /// Files that failed to download.
    pub failed: u64,
    /// Files planned for download but never started, because of an interrupt.
    pub not_started: u64,
    /// Entries skipped because they had no usable `file_url`.
    pub malformed: u64,
    /// Whether the run stopped early because of [`PaginationDriver::interrupt_handle`].
    pub interrupted: bool,
}

impl RunSummary {
    fn add(&mut self, report: PageReport) {
        self.fetched += report.fetched;
        self.skipped += report.skipped;
        self.failed += report.failed;
        self.not_started += report.not_started;
    }
}

/// The number of posts a run resolves.
///
/// With a page ceiling `P` that is `min(reported, (P + 1) * limit)`,
/// without one it is `min(reported, limit)`.
pub fn effective_total(reported: u64, limit: u64, page_ceiling: Option<u64>) -> u64 {
    let cap = match page_ceiling {
        Some(ceiling) => ceiling.saturating_add(1).saturating_mul(limit),
        None => limit,
    };
    reported.min(cap)
}

/** Mirror every post of a query into the download directory, page by page.

1. The count probe asks for the total number of matching posts.
2. The total is capped, see [`effective_total`].
3. The download directory is scanned once into a [`LocalInventory`].
4. Each page is fetched and handed to the [`DownloadPlanner`], then the page index advances,
    until the page ceiling is passed, a page comes back empty, the total is reached,
    or the interrupt flag is set.
    Without a page ceiling exactly one page is fetched.

A failed count probe or page request aborts the run; a failed file download does not.

# Example
```no_run
use reqwest::Client;
use booru_mirror::api::url::ENDPOINT;
use booru_mirror::driver::PaginationDriver;
use booru_mirror::query::QuerySpec;

#[tokio::main]
async fn main() -> Result<(), booru_mirror::driver::RunError> {
    let spec = QuerySpec {
        tags_include: vec!["cat".to_owned()],
        ..QuerySpec::default()
    };

    let driver = PaginationDriver::build(Client::new(), ENDPOINT.clone(), "download_dir", false)
        .await?
        .with_page_ceiling(Some(2));
    let summary = driver.run(spec).await?;
    println!("{summary:?}");

    Ok(())
}
```
*/
pub struct PaginationDriver {
    client: Client,
    endpoint: Url,
    download_dir: PathBuf,
    planner: DownloadPlanner,
    page_ceiling: Option<u64>,
    retry: RetryPolicy,
    show_progress: bool,
    interrupted: Arc<AtomicBool>,
}

impl PaginationDriver {
    /// Create a driver downloading into `download_dir`, which is created if missing.
    ///
    /// # Errors
    ///
    /// [`RunError::Io`] if the `download_dir` cannot be created.
    pub async fn build(
        client: Client,
        endpoint: Url,
        download_dir: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Result<Self, RunError> {
        let download_dir = download_dir.into();
        let interrupted = Arc::new(AtomicBool::new(false));
        let planner = DownloadPlanner::build(client.clone(), download_dir.clone(), overwrite)
            .await
            .map_err(|source| RunError::Io {
                path: download_dir.clone(),
                source,
            })?
            .with_interrupt(interrupted.clone());
        Ok(Self {
            client,
            endpoint,
            download_dir,
            planner,
            page_ceiling: None,
            retry: RetryPolicy::default(),
            show_progress: false,
            interrupted,
        })
    }

    /// Iterate up to and including page `ceiling`, instead of a single page.
    pub fn with_page_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.page_ceiling = ceiling;
        self
    }

    /// Limit the number of concurrent downloads within a page.
    pub fn with_jobs(mut self, jobs: NonZeroUsize) -> Self {
        self.planner = self.planner.with_jobs(jobs);
        self
    }

    /// Replace the [`RetryPolicy`] of the count probe and page requests.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Draw a progress bar on stderr. Off by default.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Setting the returned flag stops the run before its next page.
    /// Downloads already running complete, the queued ones of the page are not started.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn index(&self) -> PostIndex<'_> {
        PostIndex::new(&self.client, &self.endpoint).with_retry(self.retry)
    }

    /// Only send the count probe.
    ///
    /// # Errors
    ///
    /// [`RunError::Config`] if `spec` is invalid, [`RunError::Api`] if the probe fails.
    pub async fn count(&self, spec: &QuerySpec) -> Result<u64, RunError> {
        spec.validate()?;
        Ok(self.index().count(spec).await?)
    }

    /// Run the query from `spec.page` on.
    ///
    /// # Errors
    ///
    /// [`RunError::Config`] if `spec` is invalid, in which case nothing is sent.
    /// [`RunError::Api`] if the count probe or a page request fails.
    /// [`RunError::Io`] if the download directory cannot be scanned.
    pub async fn run(&self, mut spec: QuerySpec) -> Result<RunSummary, RunError> {
        let mut state = DriverState::Init;
        tracing::debug!(?state, page = spec.page, limit = spec.limit);
        spec.validate()?;

        let limit = spec.effective_limit();
        if limit.clamped {
            tracing::warn!(
                "limit {} is out of range, using {} instead",
                spec.limit,
                limit.value
            );
        }

        let index = self.index();
        let mut summary = RunSummary::default();

        state = DriverState::Counting;
        tracing::debug!(?state);
        summary.reported_count = index.count(&spec).await?;

        state = DriverState::Capping;
        summary.effective_total =
            effective_total(summary.reported_count, limit.value, self.page_ceiling);
        tracing::debug!(
            ?state,
            reported_count = summary.reported_count,
            effective_total = summary.effective_total
        );

        let mut inventory = self.scan_inventory().await?;
        let progress = Arc::new(if self.show_progress {
            ProgressCounter::new(summary.effective_total)
        } else {
            ProgressCounter::hidden(summary.effective_total)
        });

        state = DriverState::PageLoop;
        let mut planned: u64 = 0;
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                tracing::info!(next_page = spec.page, "interrupted, not fetching more pages");
                summary.interrupted = true;
                break;
            }
            tracing::debug!(?state, page = spec.page);
            let page = index.fetch_page(&spec).await?;
            summary.pages_fetched += 1;
            summary.malformed += page.malformed as u64;

            let page_was_empty = page.posts.is_empty() && page.malformed == 0;
            let remaining = summary.effective_total.saturating_sub(planned);
            let mut posts = page.posts;
            posts.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
            planned += posts.len() as u64;

            let report = self.planner.run(posts, &mut inventory, &progress).await;
            summary.add(report);

            spec.page += 1;
            let more_pages = self
                .page_ceiling
                .is_some_and(|ceiling| spec.page <= ceiling);
            if !more_pages || page_was_empty || planned >= summary.effective_total {
                summary.interrupted = self.interrupted.load(Ordering::Acquire);
                break;
            }
        }
        progress.done();

        state = DriverState::Done;
        tracing::debug!(?state, ?summary);
        Ok(summary)
    }

    async fn scan_inventory(&self) -> Result<LocalInventory, RunError> {
        let root = self.download_dir.clone();
        tokio::task::spawn_blocking(move || LocalInventory::scan(root))
            .await
            .map_err(std::io::Error::other)
            .and_then(|scanned| scanned)
            .map_err(|source| RunError::Io {
                path: self.download_dir.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::query::Rating;

    #[test]
    fn test_effective_total() {
        assert_eq!(effective_total(5000, 1000, Some(2)), 3000);
        assert_eq!(effective_total(1500, 1000, Some(2)), 1500);
        assert_eq!(effective_total(5000, 100, None), 100);
        assert_eq!(effective_total(50, 100, None), 50);
        assert_eq!(effective_total(5000, 0, None), 0);
        assert_eq!(effective_total(5000, 0, Some(3)), 0);
        assert_eq!(effective_total(u64::MAX, 1000, Some(u64::MAX)), u64::MAX);
    }

    /// A fake booru serving `count` posts named `{n}.jpg`, `limit` per page.
    struct FakeBooru {
        server: MockServer,
    }

    impl FakeBooru {
        async fn start(count: u64, limit: u64, pages: u64) -> Self {
            let server = MockServer::start().await;
            let uri = server.uri();

            Mock::given(method("GET"))
                .and(path("/index.php"))
                .and(query_param("limit", "0"))
                .respond_with(ResponseTemplate::new(200).set_body_json(
                    json!({"@attributes": {"limit": 0, "offset": 0, "count": count}}),
                ))
                .mount(&server)
                .await;

            for pid in 0..pages {
                let posts: Vec<_> = (pid * limit..(pid + 1) * limit)
                    .filter(|n| *n < count)
                    .map(|n| json!({"id": n, "file_url": format!("{uri}/images/{n}.jpg")}))
                    .collect();
                let mut body = json!({"@attributes": {"limit": limit, "offset": pid * limit, "count": count}});
                if !posts.is_empty() {
                    body["post"] = json!(posts);
                }
                Mock::given(method("GET"))
                    .and(path("/index.php"))
                    .and(query_param("limit", limit.to_string()))
                    .and(query_param("pid", pid.to_string()))
                    .respond_with(ResponseTemplate::new(200).set_body_json(body))
                    .mount(&server)
                    .await;
            }

            Mock::given(method("GET"))
                .and(wiremock::matchers::path_regex(r"^/images/\d+\.jpg$"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".as_slice()))
                .mount(&server)
                .await;

            Self { server }
        }

        fn endpoint(&self) -> Url {
            Url::parse(&format!("{}/index.php", self.server.uri())).unwrap()
        }

        async fn requests(&self, prefix: &str) -> usize {
            self.server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|request| request.url.path().starts_with(prefix))
                .count()
        }

        async fn page_requests(&self) -> Vec<String> {
            self.server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|request| {
                    request
                        .url
                        .query_pairs()
                        .any(|(k, v)| k == "limit" && v != "0")
                })
                .filter_map(|request| {
                    request
                        .url
                        .query_pairs()
                        .find(|(k, _)| k == "pid")
                        .map(|(_, v)| v.into_owned())
                })
                .collect()
        }
    }

    async fn driver(booru: &FakeBooru, dir: &TempDir, ceiling: Option<u64>) -> PaginationDriver {
        PaginationDriver::build(Client::new(), booru.endpoint(), dir.path(), false)
            .await
            .unwrap()
            .with_page_ceiling(ceiling)
            .with_retry(RetryPolicy {
                attempts: 1,
                base_delay: Duration::ZERO,
            })
    }

    fn spec(limit: i64) -> QuerySpec {
        QuerySpec {
            tags_include: vec!["cat".to_owned()],
            limit,
            ..QuerySpec::default()
        }
    }

    #[tokio::test]
    async fn test_pagination_cap() {
        let booru = FakeBooru::start(50, 10, 5).await;
        let dir = TempDir::new().unwrap();

        let summary = driver(&booru, &dir, Some(2))
            .await
            .run(spec(10))
            .await
            .unwrap();

        assert_eq!(summary.reported_count, 50);
        assert_eq!(summary.effective_total, 30);
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.fetched, 30);
        assert_eq!(booru.page_requests().await, ["0", "1", "2"]);
        assert_eq!(booru.requests("/images/").await, 30);
    }

    #[tokio::test]
    async fn test_single_page_without_ceiling() {
        let booru = FakeBooru::start(50, 10, 5).await;
        let dir = TempDir::new().unwrap();

        let summary = driver(&booru, &dir, None)
            .await
            .run(spec(10))
            .await
            .unwrap();

        assert_eq!(summary.effective_total, 10);
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.fetched, 10);
    }

    #[tokio::test]
    async fn test_stops_when_exhausted() {
        // only 25 posts: pages 0, 1 and a partial page 2
        let booru = FakeBooru::start(25, 10, 5).await;
        let dir = TempDir::new().unwrap();

        let summary = driver(&booru, &dir, Some(4))
            .await
            .run(spec(10))
            .await
            .unwrap();

        assert_eq!(summary.effective_total, 25);
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.fetched, 25);
    }

    #[tokio::test]
    async fn test_zero_limit_plans_nothing() {
        // the page endpoint ignores `limit=0` and returns posts anyway
        let booru = FakeBooru::start(50, 0, 0).await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("pid", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@attributes": {"count": 50},
                "post": [{"file_url": format!("{}/images/1.jpg", booru.server.uri())}],
            })))
            .with_priority(1)
            .mount(&booru.server)
            .await;
        let dir = TempDir::new().unwrap();

        let summary = driver(&booru, &dir, None)
            .await
            .run(spec(0))
            .await
            .unwrap();

        assert_eq!(summary.effective_total, 0);
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.fetched + summary.skipped + summary.failed, 0);
        assert_eq!(booru.requests("/images/").await, 0);
    }

    #[tokio::test]
    async fn test_multiple_ratings_send_nothing() {
        let booru = FakeBooru::start(50, 10, 1).await;
        let dir = TempDir::new().unwrap();

        let spec = QuerySpec {
            ratings: vec![Rating::Questionable, Rating::Explicit],
            ..spec(10)
        };
        let err = driver(&booru, &dir, None).await.run(spec).await.unwrap_err();

        assert!(matches!(
            err,
            RunError::Config(QueryError::MultipleRatingsSpecified(_))
        ));
        assert!(booru.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_count_probe_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let booru = FakeBooru { server };
        let dir = TempDir::new().unwrap();

        let err = driver(&booru, &dir, Some(3))
            .await
            .run(spec(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Api(ApiError::Status { .. })), "{err:?}");
        assert_eq!(booru.server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_page_is_fatal() {
        let booru = FakeBooru::start(30, 10, 1).await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("pid", "1"))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&booru.server)
            .await;
        let dir = TempDir::new().unwrap();

        let err = driver(&booru, &dir, Some(2))
            .await
            .run(spec(10))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Api(ApiError::Status { .. })), "{err:?}");
        assert_eq!(booru.page_requests().await, ["0", "1"]);
        for n in 0..10 {
            assert!(dir.path().join(format!("{n}.jpg")).exists());
        }
    }

    #[tokio::test]
    async fn test_interrupt_before_run_fetches_no_page() {
        let booru = FakeBooru::start(50, 10, 5).await;
        let dir = TempDir::new().unwrap();

        let driver = driver(&booru, &dir, Some(4)).await;
        driver.interrupt_handle().store(true, Ordering::Release);
        let summary = driver.run(spec(10)).await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.reported_count, 50);
        assert_eq!(summary.pages_fetched, 0);
        assert_eq!(summary.fetched, 0);
        assert!(booru.page_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_during_downloads() {
        let booru = FakeBooru::start(6, 6, 1).await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(r"^/images/\d+\.jpg$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"img".as_slice())
                    .set_delay(Duration::from_millis(400)),
            )
            .with_priority(1)
            .mount(&booru.server)
            .await;
        let dir = TempDir::new().unwrap();

        // one download at a time, interrupted while the second one is running
        let driver = driver(&booru, &dir, None)
            .await
            .with_jobs(NonZeroUsize::new(1).unwrap());
        let interrupted = driver.interrupt_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            interrupted.store(true, Ordering::Release);
        });
        let summary = driver.run(spec(6)).await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.not_started, 4);
        assert_eq!(booru.requests("/images/").await, 2);
    }

    #[tokio::test]
    async fn test_zero_limit_with_ceiling_fetches_one_page() {
        let booru = FakeBooru::start(50, 0, 0).await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("limit", "0"))
            .and(query_param("pid", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@attributes": {"count": 50},
                "post": [{"file_url": format!("{}/images/1.jpg", booru.server.uri())}],
            })))
            .with_priority(1)
            .mount(&booru.server)
            .await;
        let dir = TempDir::new().unwrap();

        let summary = driver(&booru, &dir, Some(3))
            .await
            .run(spec(0))
            .await
            .unwrap();

        // the budget is spent before the first page, so the ceiling is never reached
        assert_eq!(summary.effective_total, 0);
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(booru.requests("/images/").await, 0);
        // the count probe and page 0
        assert_eq!(booru.requests("/index.php").await, 2);
    }

    #[tokio::test]
    async fn test_second_run_fetches_nothing() {
        let booru = FakeBooru::start(30, 10, 3).await;
        let dir = TempDir::new().unwrap();
        let driver = driver(&booru, &dir, Some(2)).await;

        let first = driver.run(spec(10)).await.unwrap();
        assert_eq!(first.fetched, 30);

        let second = driver.run(spec(10)).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.skipped, 30);
        assert_eq!(booru.requests("/images/").await, 30);
    }
}
