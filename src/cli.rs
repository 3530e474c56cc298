//! A core module for command line interface.
//!
//! See [`Cli`] for more information.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::builder::NonEmptyStringValueParser;
pub use clap::{CommandFactory, Parser};
use reqwest::Url;

use crate::api::url::BASE_URL;
use crate::config::{Config, ConfigFileError, Credentials};
use crate::query::{QuerySpec, Rating};

/// [`clap`] command line interface.
///
/// Use [`Self::query_spec`] to turn the parsed flags into a [`QuerySpec`].
///
/// # Example
///
/// ```no_run
/// use booru_mirror::cli::{Cli, Parser as _};
///
/// let cli = Cli::parse();
/// ```
#[non_exhaustive]
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Tags the posts must have. Can be given several times, each may hold several tags.
    #[arg(short, long, value_name = "TAGS")]
    pub tags: Vec<String>,

    /// Tags the posts must not have. Can be given several times, each may hold several tags.
    #[arg(short, long, value_name = "TAGS")]
    pub exclude: Vec<String>,

    /// Only posts rated safe.
    #[arg(short, long)]
    pub safe: bool,

    /// Only posts rated questionable.
    #[arg(short, long)]
    pub questionable: bool,

    /// Only posts rated explicit.
    #[arg(short = 'x', long)]
    pub explicit: bool,

    /// Posts per page, `0..=1000`. Out of range values are replaced by 1000.
    /// `0` fetches nothing.
    #[arg(short, long, default_value_t = 100, allow_negative_numbers = true)]
    pub limit: i64,

    /// The (zero based) page to start from.
    #[arg(short, long, default_value_t = 0)]
    pub page: u64,

    /// Keep fetching pages up to and including this page index.
    #[arg(short = 'P', long, value_name = "PAGE")]
    pub pages: Option<u64>,

    /// Overrides `api_key` of the config file. An empty value disables it.
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,

    /// Overrides `user_id` of the config file. An empty value disables it.
    #[arg(long, value_name = "ID")]
    pub user_id: Option<String>,

    /// Only print the number of matching posts.
    #[arg(short, long)]
    pub count: bool,

    /// Download files even if a file with the same name is already present.
    #[arg(short, long)]
    pub overwrite: bool,

    /// Print nothing but errors.
    #[arg(long)]
    pub quiet: bool,

    /// The directory to download into.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// The config file to use, instead of `~/.booru-mirror.toml`.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// The `index.php` of the booru.
    #[arg(long, value_name = "URL", default_value = BASE_URL)]
    pub endpoint: Url,

    /// Request timeout in seconds, `0` to disable.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Maximum number of concurrent downloads. Defaults to the number of CPUs, at most 8.
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<NonZeroUsize>,

    /// Log filter, e.g. `debug` or `booru_mirror=trace`. `RUST_LOG` takes precedence.
    #[arg(long, value_name = "FILTER", value_parser = NonEmptyStringValueParser::new())]
    pub log_level: Option<String>,
}

impl Cli {
    /// The ratings selected by the rating flags, in flag order.
    pub fn ratings(&self) -> Vec<Rating> {
        [
            (self.safe, Rating::Safe),
            (self.questionable, Rating::Questionable),
            (self.explicit, Rating::Explicit),
        ]
        .into_iter()
        .filter_map(|(set, rating)| set.then_some(rating))
        .collect()
    }

    /// Load the config file given by `--config`, or the default one if it exists.
    ///
    /// # Errors
    ///
    /// See [`Config::load`]. A missing `--config` file is an error, a missing default file is not.
    pub fn load_config(&self) -> Result<Option<Config>, ConfigFileError> {
        match &self.config {
            Some(path) => Config::load(path, true),
            None => match Config::default_path() {
                Some(path) => Config::load(path, false),
                None => Ok(None),
            },
        }
    }

    /// Resolve the credentials from the flags and `config`.
    pub fn credentials(&self, config: Option<&Config>) -> Credentials {
        Credentials::resolve(config, self.api_key.clone(), self.user_id.clone())
    }

    /// Build the [`QuerySpec`] of the run. The ratings are not validated here,
    /// see [`QuerySpec::validate`].
    pub fn query_spec(&self, credentials: Credentials) -> QuerySpec {
        QuerySpec {
            tags_include: self.tags.clone(),
            tags_exclude: self.exclude.clone(),
            ratings: self.ratings(),
            limit: self.limit,
            page: self.page,
            api_key: credentials.api_key,
            user_id: credentials.user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_spec() {
        let cli = Cli::try_parse_from([
            "booru-mirror",
            "-t",
            "izumi_konata 1girl",
            "-e",
            "feet",
            "-s",
            "-l",
            "-5",
            "-P",
            "2",
            "--api-key",
            "abc",
            "--user-id",
            "",
        ])
        .unwrap();

        let credentials = cli.credentials(None);
        assert!(!credentials.unset);
        let spec = cli.query_spec(credentials);
        assert_eq!(spec.tags_param().unwrap(), "rating%3asafe+izumi_konata+1girl+-feet");
        assert_eq!(spec.limit, -5);
        assert_eq!(spec.effective_limit().value, 1000);
        assert_eq!(spec.api_key.as_deref(), Some("abc"));
        assert_eq!(spec.user_id, None);
        assert_eq!(cli.pages, Some(2));
        assert_eq!(cli.endpoint.as_str(), BASE_URL);
    }

    #[test]
    fn test_multiple_rating_flags_are_accepted_by_clap() {
        let cli = Cli::try_parse_from(["booru-mirror", "-s", "-x"]).unwrap();
        assert_eq!(cli.ratings(), [Rating::Safe, Rating::Explicit]);
        let spec = cli.query_spec(Credentials::default());
        assert!(spec.validate().is_err());
    }
}
