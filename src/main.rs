use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use reqwest::Client;
use tokio::runtime::Runtime;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use booru_mirror::cli::{Cli, Parser};
use booru_mirror::config::{Config, CONFIG_FILE_NAME, DEFAULT_CONFIG_STR};
use booru_mirror::driver::{PaginationDriver, RunSummary};

const SPINNER_FINISH_MODE: ProgressFinish = ProgressFinish::AndClear;
const SPINNER_TICK_SECS: f32 = 0.1;

#[inline]
fn build_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    ProgressBar::new_spinner()
        .with_finish(SPINNER_FINISH_MODE)
        .with_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap()
                // For more spinners check out the cli-spinners project:
                // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
                // NOTE: use `ascii` only, because cmd/powershell maybe not support unicode.
                .tick_strings(&[".  ", ".. ", "...", " ..", "  .", "   "]),
        )
}

/// `timeout` bounds connecting and each read, not a whole transfer,
/// so large files on slow links still complete.
#[inline]
fn build_client(timeout: u64) -> reqwest::Result<Client> {
    let client_builder = Client::builder();
    let client_builder = if timeout > 0 {
        let timeout = Duration::from_secs(timeout);
        client_builder
            .connect_timeout(timeout)
            .read_timeout(timeout)
    } else {
        client_builder
    };
    client_builder.build()
}

fn init_tracing(cli: &Cli) {
    let default_filter = match (&cli.log_level, cli.quiet) {
        (Some(filter), _) => filter.as_str(),
        (None, true) => "error",
        (None, false) => "warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn print_config_hint() {
    let path = Config::default_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| format!("~/{CONFIG_FILE_NAME}"));
    eprintln!(
        "hint: no API credentials configured. Create {path} with:\n\n{DEFAULT_CONFIG_STR}\n\
        (use --quiet to hide this message)\n"
    );
}

fn print_summary(summary: &RunSummary) {
    let RunSummary {
        reported_count,
        effective_total,
        pages_fetched,
        fetched,
        skipped,
        failed,
        not_started,
        malformed,
        interrupted,
    } = summary;
    println!(
        "{reported_count} posts found, {effective_total} planned over {pages_fetched} page(s): \
        [done:{fetched}\texisted:{skipped}\tfailed:{failed}]"
    );
    if *malformed > 0 {
        println!("{malformed} post(s) without a usable file_url were ignored");
    }
    if *interrupted {
        println!("Interrupted, {not_started} queued download(s) and the remaining pages were skipped");
    }
}

#[inline]
async fn async_main(cli: Cli) -> anyhow::Result<RunSummary> {
    let config = cli.load_config()?;
    let credentials = cli.credentials(config.as_ref());
    if credentials.unset && !cli.quiet {
        print_config_hint();
    }
    let spec = cli.query_spec(credentials);
    // fail on contradictory flags before touching the network or the disk
    spec.validate()?;

    let client = build_client(cli.timeout).context("failed to build reqwest client")?;
    let mut driver = PaginationDriver::build(client, cli.endpoint.clone(), &cli.output, cli.overwrite)
        .await
        .context("Unable to ensure the existence of the download directory")?
        .with_page_ceiling(cli.pages)
        .with_progress(!cli.quiet);
    if let Some(jobs) = cli.jobs {
        driver = driver.with_jobs(jobs);
    }

    if cli.count {
        let spinner = build_spinner(cli.quiet);
        spinner.set_message("Counting posts...");
        spinner.enable_steady_tick(Duration::from_secs_f32(SPINNER_TICK_SECS));
        let count = driver.count(&spec).await.context("failed to count posts")?;
        spinner.finish();
        println!("{count}");
        return Ok(RunSummary {
            reported_count: count,
            ..RunSummary::default()
        });
    }

    let interrupted = driver.interrupt_handle();
    let quiet = cli.quiet;
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            if !quiet {
                eprintln!("Ctrl-C received, finishing the current page...");
            }
            interrupted.store(true, Ordering::Release);
            // a second Ctrl-C exits right away
            if signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let summary = driver.run(spec).await.context("failed to mirror posts")?;
    if !cli.quiet {
        print_summary(&summary);
    }
    Ok(summary)
}

fn main() -> anyhow::Result<ExitCode> {
    // here, if parse fails, the program will be `abort`ed, and no `Drop` will be called,
    // but it's okay, because we don't need to clean up anything.
    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = Runtime::new().context("failed to build tokio runtime")?;
    match runtime.block_on(async_main(cli)) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        // why `{:#}`: https://docs.rs/anyhow/1.0.86/anyhow/struct.Error.html#display-representations
        Err(err) => {
            eprintln!("error: {err:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}
