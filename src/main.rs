use jobgrid::cli::{Cli, Commands};
use jobgrid::dedup::Deduplicator;
use jobgrid::incremental::IncrementalProcessor;
use jobgrid::orchestrator::{CoreContext, CrawlError, Crawler, RunReport};
use jobgrid::settings::Settings;
use jobgrid::{logging, SearchCriteria};
use std::collections::HashSet;
use std::time::Duration;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_IO_UNAVAILABLE: i32 = 3;
const EXIT_CANCELLED: i32 = 4;
const EXIT_ALL_CIRCUITS_TRIPPED: i32 = 5;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse_args();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("configuration invalid: {error}");
            return EXIT_CONFIG_INVALID;
        }
    };

    if let Commands::Crawl {
        seed_url,
        max_pages,
        forced,
        format,
    } = &cli.command
    {
        if !seed_url.is_empty() {
            settings.scraping.seed_urls = seed_url.clone();
        }
        if let Some(max_pages) = max_pages {
            settings.scraping.max_pages = *max_pages;
        }
        if *forced {
            settings.scraping.forced = true;
        }
        if !format.is_empty() {
            settings.output.formats = format.clone();
        }
        if let Err(error) = settings.validate() {
            eprintln!("configuration invalid: {error}");
            return EXIT_CONFIG_INVALID;
        }
        if settings.scraping.seed_urls.is_empty() {
            eprintln!("configuration invalid: no seed URLs given (settings file or --seed-url)");
            return EXIT_CONFIG_INVALID;
        }
    }

    if let Err(error) = logging::ensure_writable(&settings.logging.dir) {
        eprintln!("log directory unwritable: {error}");
        return EXIT_IO_UNAVAILABLE;
    }
    let _log_guards = match logging::init(&settings.logging) {
        Ok(guards) => guards,
        Err(error) => {
            eprintln!("failed to initialize logging: {error}");
            return EXIT_IO_UNAVAILABLE;
        }
    };

    match cli.command {
        Commands::Crawl { .. } => crawl(settings).await,
        Commands::Search {
            company,
            tech,
            location,
            level,
            min_jobs,
            date_from,
            date_to,
        } => {
            let criteria = SearchCriteria {
                companies: company,
                technologies: tech,
                locations: location,
                levels: level,
                min_jobs,
                date_from,
                date_to,
            };
            with_context(settings, |ctx| async move {
                let entries = ctx.index.search(&criteria);
                print_json(&entries);
                EXIT_OK
            })
            .await
        }
        Commands::TopCompanies { k } => {
            with_context(settings, |ctx| async move {
                print_json(&ctx.index.top_companies(k));
                EXIT_OK
            })
            .await
        }
        Commands::TopTechnologies { k } => {
            with_context(settings, |ctx| async move {
                print_json(&ctx.index.top_technologies(k));
                EXIT_OK
            })
            .await
        }
        Commands::DedupeFile { path } => {
            let mut dedup = Deduplicator::default();
            match dedup.clean_file(&path) {
                Ok(report) => {
                    print_json(&report);
                    EXIT_OK
                }
                Err(error) => {
                    eprintln!("dedupe failed: {error}");
                    EXIT_IO_UNAVAILABLE
                }
            }
        }
        Commands::PruneCache { max_age_hours } => {
            with_context(settings, |ctx| async move {
                match ctx
                    .index
                    .prune(Duration::from_secs(max_age_hours * 3600))
                    .await
                {
                    Ok(report) => {
                        print_json(&report);
                        EXIT_OK
                    }
                    Err(error) => {
                        eprintln!("prune failed: {error}");
                        EXIT_IO_UNAVAILABLE
                    }
                }
            })
            .await
        }
        Commands::ResetCheckpoint => {
            let path = settings.checkpoint_dir.join("incremental_checkpoint.json");
            match IncrementalProcessor::reset(&path) {
                Ok(()) => {
                    eprintln!("checkpoint reset: {}", path.display());
                    EXIT_OK
                }
                Err(error) => {
                    eprintln!("reset failed: {error}");
                    EXIT_IO_UNAVAILABLE
                }
            }
        }
    }
}

async fn crawl(settings: Settings) -> i32 {
    let seeds = settings.scraping.seed_urls.clone();
    let ctx = match CoreContext::initialize(settings).await {
        Ok(ctx) => ctx,
        Err(error) => {
            eprintln!("startup failed: {error}");
            return EXIT_IO_UNAVAILABLE;
        }
    };

    // Ctrl-C cancels cooperatively; partial results stay valid
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let crawler = Crawler::new(ctx);
    match crawler.run().await {
        Ok(report) => {
            print_json(&report);
            crawl_exit_code(&report, &seeds)
        }
        Err(CrawlError::Cancelled) => EXIT_CANCELLED,
        Err(CrawlError::Storage(error)) => {
            eprintln!("storage failure: {error}");
            EXIT_IO_UNAVAILABLE
        }
    }
}

/// Exit 5 only when every seed's host tripped its circuit before anything
/// was ingested; a tripped circuit with partial progress is a warning.
fn crawl_exit_code(report: &RunReport, seeds: &[String]) -> i32 {
    if report.jobs_ingested > 0 {
        return EXIT_OK;
    }
    let seed_hosts: HashSet<String> = seeds
        .iter()
        .filter_map(|s| jobgrid::url_utils::extract_host(s))
        .collect();
    let tripped: HashSet<String> = report.circuit_tripped.iter().cloned().collect();
    if !seed_hosts.is_empty() && seed_hosts.iter().all(|h| tripped.contains(h)) {
        EXIT_ALL_CIRCUITS_TRIPPED
    } else {
        EXIT_OK
    }
}

async fn with_context<F, Fut>(settings: Settings, f: F) -> i32
where
    F: FnOnce(CoreContext) -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    match CoreContext::initialize(settings).await {
        Ok(ctx) => f(ctx).await,
        Err(error) => {
            eprintln!("startup failed: {error}");
            EXIT_IO_UNAVAILABLE
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(body) => println!("{body}"),
        Err(error) => eprintln!("failed to render output: {error}"),
    }
}
