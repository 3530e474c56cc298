//! A core module for interacting with the booru API.
//!
//! Usually, you prefer to use the [`PostIndex`] struct to get the [`data`] from the API:
//! [`PostIndex::count`] for the total number of matching posts,
//! and [`PostIndex::fetch_page`] for one page of [`Post`]s.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::{QueryError, QuerySpec};
use crate::tool::file_name_from_url;

/// The URLs for the Gelbooru API.
pub mod url {
    use super::*;

    /// The base URL of the Gelbooru.
    pub const BASE_URL: &str = "https://gelbooru.com/index.php";

    /// The endpoint every API request is built against, see [`crate::query::QuerySpec::build`].
    pub static ENDPOINT: LazyLock<Url> = LazyLock::new(|| Url::parse(BASE_URL).unwrap());
}

/// Errors raised by [`PostIndex`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ApiError {
    /// The query was rejected before anything was sent.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// The request could not be sent, or the response body could not be read.
    #[error("failed to fetch {url}")]
    Fetch {
        /// The requested url.
        url: Url,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{url} answered with {status}")]
    Status {
        /// The requested url.
        url: Url,
        /// The status code.
        status: StatusCode,
    },
    /// The response is not the document we expect.
    #[error("unexpected response from {url}")]
    Parse {
        /// The requested url.
        url: Url,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    fn is_transient(&self) -> bool {
        match self {
            ApiError::Fetch { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            ApiError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Query(_) | ApiError::Parse { .. } => false,
        }
    }
}

/// The data structure for the JSON response from the API.
pub mod data {
    use super::*;

    /// The fields of the [`Json`] response.
    pub mod field {
        use super::*;

        /// The attributes field of the JSON response.
        #[non_exhaustive]
        #[derive(Debug, Deserialize, Serialize)]
        pub struct Attributes {
            /// The page size the server applied.
            #[serde(default)]
            pub limit: u64,
            /// The index of the first post in this response.
            #[serde(default)]
            pub offset: u64,
            /// The total number of posts matching the query.
            pub count: u64,
        }

        /// One entry of the `post` field.
        ///
        /// Only `file_url` is read. It is optional here so that a single broken entry
        /// can be skipped without rejecting the whole page.
        #[non_exhaustive]
        #[derive(Debug, Deserialize, Serialize)]
        pub struct RawPost {
            /// The URL of the media file.
            #[serde(default)]
            pub file_url: Option<String>,
        }
    }

    /// Some servers send a lone object instead of a one element array.
    #[derive(Debug, Deserialize, Serialize)]
    #[serde(untagged)]
    pub enum OneOrMany<T> {
        // `Many` must come first, a derived struct also accepts a (short) array
        /// Zero or more entries.
        Many(Vec<T>),
        /// A single entry.
        One(T),
    }

    impl<T> From<OneOrMany<T>> for Vec<T> {
        fn from(value: OneOrMany<T>) -> Self {
            match value {
                OneOrMany::One(one) => vec![one],
                OneOrMany::Many(many) => many,
            }
        }
    }

    /// The JSON structure response from the API.
    #[non_exhaustive]
    #[derive(Debug, Deserialize, Serialize)]
    pub struct Json {
        #[serde(rename = "@attributes")]
        /// The attributes of the JSON response.
        pub attributes: field::Attributes,
        /// The posts of the JSON response.
        /// if `attributes.count` is `0`, or the page is out of range,
        /// this field will be `None`.
        pub post: Option<OneOrMany<field::RawPost>>,
    }
}

/// A post we are able to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// The URL of the media file.
    pub file_url: String,
    /// The final path segment of `file_url`. We save the file under this name.
    pub file_name: String,
}

impl Post {
    /// Returns `None` if `file_url` has no final path segment to name the file after.
    pub fn from_file_url(file_url: impl Into<String>) -> Option<Self> {
        let file_url = file_url.into();
        let file_name = file_name_from_url(&file_url)?;
        Some(Self {
            file_url,
            file_name,
        })
    }
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageResult {
    /// The total count reported with this page.
    /// Only the count probe's value is used for planning.
    pub total_count: u64,
    /// The usable posts, in document order.
    pub posts: Vec<Post>,
    /// The number of entries skipped because they had no usable `file_url`.
    pub malformed: usize,
}

/// How many times a probe is attempted, and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `0` is treated as `1`.
    pub attempts: u32,
    /// The delay before the second attempt; it doubles for each attempt after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Issues the count probe and the page requests of a query.
///
/// # Example
///
/// ```no_run
/// use reqwest::Client;
/// use booru_mirror::api::{url::ENDPOINT, PostIndex};
/// use booru_mirror::query::QuerySpec;
///
/// #[tokio::main]
/// async fn main() -> Result<(), booru_mirror::api::ApiError> {
///     let client = Client::new();
///     let spec = QuerySpec {
///         tags_include: vec!["cat".to_owned()],
///         limit: 10,
///         ..QuerySpec::default()
///     };
///
///     let index = PostIndex::new(&client, &ENDPOINT);
///     let total = index.count(&spec).await?;
///     let page = index.fetch_page(&spec).await?;
///     println!("{total} posts, {} on the first page", page.posts.len());
///
///     Ok(())
/// }
/// ```
pub struct PostIndex<'a> {
    client: &'a Client,
    endpoint: &'a Url,
    retry: RetryPolicy,
}

impl<'a> PostIndex<'a> {
    /// `endpoint` is the `index.php` of the booru, usually [`url::ENDPOINT`].
    pub fn new(client: &'a Client, endpoint: &'a Url) -> Self {
        Self {
            client,
            endpoint,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the default [`RetryPolicy`].
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ask the API how many posts match `spec`, with `limit=0`.
    ///
    /// # Errors
    ///
    /// [`ApiError::Query`] if `spec` is invalid, in which case nothing is sent.
    /// [`ApiError::Fetch`] or [`ApiError::Status`] if the request fails,
    /// [`ApiError::Parse`] if the response has no `count`.
    pub async fn count(&self, spec: &QuerySpec) -> Result<u64, ApiError> {
        let url = spec.build(self.endpoint, true)?;
        let json = self.get_json(url).await?;
        Ok(json.attributes.count)
    }

    /// Fetch the page `spec.page` of the query.
    ///
    /// Entries without a usable `file_url` are skipped with a warning
    /// and counted in [`PageResult::malformed`].
    ///
    /// # Errors
    ///
    /// See [`Self::count`].
    pub async fn fetch_page(&self, spec: &QuerySpec) -> Result<PageResult, ApiError> {
        let url = spec.build(self.endpoint, false)?;
        let json = self.get_json(url).await?;

        let entries: Vec<data::field::RawPost> = json.post.map(Vec::from).unwrap_or_default();
        let mut posts = Vec::with_capacity(entries.len());
        let mut malformed = 0;
        for (index, entry) in entries.into_iter().enumerate() {
            match entry.file_url.and_then(Post::from_file_url) {
                Some(post) => posts.push(post),
                None => {
                    malformed += 1;
                    tracing::warn!(page = spec.page, index, "skipping post without a usable file_url");
                }
            }
        }

        Ok(PageResult {
            total_count: json.attributes.count,
            posts,
            malformed,
        })
    }

    /// Send a GET to `url` and parse the body, retrying transient failures.
    async fn get_json(&self, url: Url) -> Result<data::Json, ApiError> {
        let attempts = self.retry.attempts.max(1);
        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match self.get_json_once(url.clone()).await {
                Err(err) if attempt < attempts && err.is_transient() => {
                    tracing::debug!(%url, attempt, error = %err, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn get_json_once(&self, url: Url) -> Result<data::Json, ApiError> {
        tracing::debug!(%url, "GET");
        let fetch_err = |source| ApiError::Fetch {
            url: url.clone(),
            source,
        };

        let response = self.client.get(url.clone()).send().await.map_err(fetch_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { url, status });
        }
        let body = response.text().await.map_err(fetch_err)?;

        serde_json::from_str(&body).map_err(|source| ApiError::Parse { url, source })
    }
}
