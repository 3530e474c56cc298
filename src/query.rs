//! Build request urls for the booru API from a [`QuerySpec`].
//!
//! The tags parameter is NOT form-urlencoded. The API expects tokens joined by `+`,
//! with `:` written as `%3a`, and every other character passed through as is.
//! See [`QuerySpec::tags_param`] and [`escape_tag`].

use std::fmt;

use reqwest::Url;
use thiserror::Error;

/// The largest `limit` the API accepts; out of range requests are replaced by this value.
pub const MAX_LIMIT: u64 = 1000;

/// Errors raised while validating a [`QuerySpec`].
///
/// These are always raised before any request is sent.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// More than one of `safe`, `questionable` and `explicit` was requested.
    #[error("only one rating can be specified, got: {}", join_ratings(.0))]
    MultipleRatingsSpecified(Vec<Rating>),
}

fn join_ratings(ratings: &[Rating]) -> String {
    ratings
        .iter()
        .map(Rating::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The content rating used as a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rating {
    /// `rating:safe`
    Safe,
    /// `rating:questionable`
    Questionable,
    /// `rating:explicit`
    Explicit,
}

impl Rating {
    /// The name of the rating, as the API spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Safe => "safe",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rating:{}", self.as_str())
    }
}

/// The outcome of clamping a requested limit, see [`QuerySpec::effective_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// The limit sent to the API, in `0..=MAX_LIMIT`.
    pub value: u64,
    /// Whether the requested value was out of range and replaced.
    /// Callers should surface a warning when this is `true`.
    pub clamped: bool,
}

impl Limit {
    /// Clamp a raw requested limit into `0..=MAX_LIMIT`.
    ///
    /// Out of range values are replaced by [`MAX_LIMIT`], not saturated:
    /// `-5` becomes `1000`, same as `1500`.
    pub fn clamp(requested: i64) -> Self {
        match u64::try_from(requested) {
            Ok(value) if value <= MAX_LIMIT => Limit {
                value,
                clamped: false,
            },
            _ => Limit {
                value: MAX_LIMIT,
                clamped: true,
            },
        }
    }
}

/// A query against the booru API.
///
/// Only `page` changes while paginating, everything else is fixed for a run.
///
/// # Example
///
/// ```rust
/// use booru_mirror::query::{QuerySpec, Rating};
///
/// let spec = QuerySpec {
///     tags_include: vec!["izumi_konata 1girl".to_owned()],
///     tags_exclude: vec!["feet".to_owned()],
///     ratings: vec![Rating::Safe],
///     ..QuerySpec::default()
/// };
/// assert_eq!(spec.tags_param().unwrap(), "rating%3asafe+izumi_konata+1girl+-feet");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    /// Tags the posts must have. Each string may hold several space separated tags.
    pub tags_include: Vec<String>,
    /// Tags the posts must not have. Each string may hold several space separated tags.
    pub tags_exclude: Vec<String>,
    /// The requested ratings. At most one is allowed, see [`Self::rating`].
    pub ratings: Vec<Rating>,
    /// The requested page size, before clamping. See [`Self::effective_limit`].
    pub limit: i64,
    /// Zero based page index.
    pub page: u64,
    /// Sent as `api_key` when non-empty.
    pub api_key: Option<String>,
    /// Sent as `user_id` when non-empty.
    pub user_id: Option<String>,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            tags_include: Vec::new(),
            tags_exclude: Vec::new(),
            ratings: Vec::new(),
            limit: 100,
            page: 0,
            api_key: None,
            user_id: None,
        }
    }
}

impl QuerySpec {
    /// The single requested rating, if any.
    ///
    /// # Errors
    ///
    /// [`QueryError::MultipleRatingsSpecified`] if more than one distinct rating was requested.
    pub fn rating(&self) -> Result<Option<Rating>, QueryError> {
        let mut distinct: Vec<Rating> = Vec::with_capacity(self.ratings.len());
        for rating in &self.ratings {
            if !distinct.contains(rating) {
                distinct.push(*rating);
            }
        }
        match distinct.len() {
            0 => Ok(None),
            1 => Ok(Some(distinct[0])),
            _ => Err(QueryError::MultipleRatingsSpecified(distinct)),
        }
    }

    /// The clamped page size. See [`Limit::clamp`].
    pub fn effective_limit(&self) -> Limit {
        Limit::clamp(self.limit)
    }

    /// Validate the query without building anything.
    ///
    /// # Errors
    ///
    /// See [`Self::rating`].
    pub fn validate(&self) -> Result<(), QueryError> {
        self.rating().map(|_| ())
    }

    /// Compose the value of the `tags` parameter.
    ///
    /// Tokens are the rating first, then the positive tags, then the exclusions
    /// (each prefixed with `-`), joined by `+`.
    ///
    /// # Errors
    ///
    /// See [`Self::rating`].
    pub fn tags_param(&self) -> Result<String, QueryError> {
        let rating = self.rating()?;

        let rating = rating.map(|rating| rating.to_string());
        let include = self.tags_include.iter().flat_map(|tags| tags.split_whitespace());
        let exclude = self
            .tags_exclude
            .iter()
            .flat_map(|tags| tags.split_whitespace())
            .map(|tag| format!("-{tag}"));

        let tokens: Vec<String> = rating
            .into_iter()
            .chain(include.map(str::to_owned))
            .chain(exclude)
            .map(|token| escape_tag(&token))
            .collect();

        Ok(tokens.join("+"))
    }

    /// Build the request url against `endpoint`.
    ///
    /// If `count_only` is `true`, `limit=0` is sent regardless of [`Self::limit`],
    /// so the response carries the total count and (almost) nothing else.
    ///
    /// `endpoint` is the `index.php` of the booru, e.g. [`crate::api::url::BASE_URL`].
    /// Any query it already has is discarded.
    ///
    /// # Errors
    ///
    /// See [`Self::rating`]. Nothing is sent before this check passes.
    pub fn build(&self, endpoint: &Url, count_only: bool) -> Result<Url, QueryError> {
        let tags = self.tags_param()?;
        let limit = if count_only {
            0
        } else {
            self.effective_limit().value
        };

        // `tags` is already escaped the way the API wants it,
        // `Url::set_query` keeps `%3a` and `+` untouched.
        let query = format!(
            "page=dapi&s=post&q=index&json=1&tags={tags}&limit={limit}&pid={}",
            self.page
        );

        let mut url = endpoint.clone();
        url.set_query(Some(&query));

        // appended pairs are form-urlencoded, the existing query is left as is
        for (key, value) in [("api_key", &self.api_key), ("user_id", &self.user_id)] {
            match value.as_deref() {
                Some(value) if !value.is_empty() => {
                    url.query_pairs_mut().append_pair(key, value);
                }
                _ => {}
            }
        }

        Ok(url)
    }
}

/// Escape a single tag token: `:` becomes `%3a` and a space becomes `+`.
///
/// Nothing else is touched, the API parses its own tag syntax.
pub fn escape_tag(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for c in token.chars() {
        match c {
            ':' => escaped.push_str("%3a"),
            ' ' => escaped.push('+'),
            c => escaped.push(c),
        }
    }
    escaped
}
