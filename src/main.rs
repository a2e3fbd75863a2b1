use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use dotenv::dotenv;

use inat_scraper::{
    api::{ApiClient, HttpClient},
    config::{
        base_url, Config, OutputTarget, S3Config, DEFAULT_API_URL, DEFAULT_REQUEST_DELAY_MS,
        DEFAULT_RESULTS_PER_PAGE, DEFAULT_WEB_URL,
    },
    download::{Downloader, HttpFetcher},
    ledger::Ledger,
    logging,
    progress::{Checkpoint, RunState, StopConditions, StopReason},
    scraper::{survey, Scraper},
    store,
};

/// Downloads the photos of every iNaturalist observation of a taxon, page by
/// page, into a local directory or an S3-compatible bucket.
#[derive(Parser, Debug)]
#[command(version, about = "iNaturalist taxon photo scraper", long_about = None)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase debug level (use -d for info, -dd for debug, etc.)")]
    debug: u8,

    /// Taxon id
    #[arg(short, long, env = "TAXON_ID")]
    taxon_id: u64,

    /// Output directory, defaults to downloaded_images_<taxon id>
    #[arg(short, long, conflicts_with = "upload_to_s3")]
    output_dir: Option<PathBuf>,

    /// Page to resume from
    #[arg(short = 'p', long, default_value_t = 1)]
    resume_from_page: u32,

    /// Page to stop at; this page is not processed. When walking years it
    /// applies to every year, so it may be below the resume page
    #[arg(short = 'e', long)]
    stop_at_page: Option<u32>,

    /// UUID index to resume from, within the first page
    #[arg(short = 'u', long, default_value_t = 0)]
    resume_from_uuid_index: usize,

    /// Upload to an S3-compatible bucket configured by S3_* variables
    #[arg(long)]
    upload_to_s3: bool,

    /// Terminate after completing a single page
    #[arg(long)]
    one_page_only: bool,

    /// Terminate after completing a single year
    #[arg(long)]
    one_year_only: bool,

    /// Results per page
    #[arg(short, long, default_value_t = DEFAULT_RESULTS_PER_PAGE)]
    results_per_page: u32,

    /// First year to walk; also the year the resume page refers to
    #[arg(long)]
    start_year: Option<i32>,

    /// Last year to walk, inclusive
    #[arg(long)]
    end_year: Option<i32>,

    /// Print observation and page counts (and ledger progress) and exit
    #[arg(long)]
    get_current_progress: bool,

    /// JSON file recording the status of every page
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Minimum delay between HTTP requests
    #[arg(long, default_value_t = DEFAULT_REQUEST_DELAY_MS)]
    request_delay_ms: u64,

    /// Also append log records to this file, e.g. logs/<taxon id>.log
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, env = "INAT_API_URL", default_value = DEFAULT_API_URL, hide = true)]
    api_url: String,

    #[arg(long, env = "INAT_WEB_URL", default_value = DEFAULT_WEB_URL, hide = true)]
    web_url: String,
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let output = if self.upload_to_s3 {
            OutputTarget::S3(S3Config::from_env()?)
        } else {
            match &self.output_dir {
                Some(dir) => OutputTarget::Local(dir.clone()),
                None => OutputTarget::default_local(self.taxon_id),
            }
        };

        let mut config = Config::new(self.taxon_id, output)?;
        config.results_per_page = self.results_per_page;
        config.resume = Checkpoint {
            year: self.start_year,
            page: self.resume_from_page,
            uuid_index: self.resume_from_uuid_index,
        };
        config.stops = StopConditions {
            stop_at_page: self.stop_at_page,
            one_page_only: self.one_page_only,
            one_year_only: self.one_year_only,
        };
        config.start_year = self.start_year;
        config.end_year = self.end_year;
        config.api_url = base_url(&self.api_url)?;
        config.web_url = base_url(&self.web_url)?;
        config.request_delay = Duration::from_millis(self.request_delay_ms);
        config.progress_file = self.progress_file.clone();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, cli.log_file.as_deref()) {
        eprintln!("error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = cli.config()?;
    let http = HttpClient::new(config.request_delay)?;
    let api = ApiClient::new(http.clone(), config.api_url.clone(), config.web_url.clone());
    let ledger = config
        .progress_file
        .as_ref()
        .map(|path| Ledger::open(path, config.taxon_id))
        .transpose()?;

    if cli.get_current_progress {
        let report = survey(&api, &config, ledger.as_ref()).await?;
        print!("{}", report);
        return Ok(ExitCode::SUCCESS);
    }

    let store = store::new(&config.output)?;
    log::info!("Writing photos to {}", store);
    let downloader = Downloader::new(HttpFetcher::new(http));
    let mut scraper = Scraper::new(&config, api, downloader, store, ledger);

    let outcome = tokio::select! {
        result = scraper.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(Ok(summary)) => {
            log::warn!("Done: {}", summary);
            match summary.state {
                RunState::Stopped(StopReason::Exhausted) => {
                    log::info!("Next checkpoint: {}", summary.checkpoint)
                }
                _ => {
                    log::warn!("Next checkpoint: {}", summary.checkpoint);
                    log::warn!("Resume with: {}", config.resume_args(&summary.checkpoint));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Err(e)) => {
            log::error!("error: {:#}", e);
            report_checkpoint(&config, scraper.tracker().checkpoint());
            Ok(ExitCode::FAILURE)
        }
        None => {
            scraper.interrupt();
            log::warn!("Interrupted: {}", scraper.summary());
            report_checkpoint(&config, scraper.tracker().checkpoint());
            log::warn!("Terminating the session gracefully...");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report_checkpoint(config: &Config, checkpoint: Checkpoint) {
    log::warn!("Latest checkpoint: {}", checkpoint);
    log::warn!("Resume with: {}", config.resume_args(&checkpoint));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &str) -> Cli {
        Cli::try_parse_from(std::iter::once("inat-scraper").chain(args.split_whitespace()))
            .unwrap()
    }

    #[test]
    fn resume_args_parse_back_to_the_same_walk() {
        let cli = parse("-t 47219 -r 50 -o out --end-year 2020 -e 9 --one-year-only");
        let config = cli.config().unwrap();
        let checkpoint = Checkpoint {
            year: Some(2018),
            page: 7,
            uuid_index: 3,
        };

        let resumed = parse(&config.resume_args(&checkpoint)).config().unwrap();
        assert_eq!(resumed.taxon_id, 47219);
        assert_eq!(resumed.results_per_page, 50);
        assert_eq!(resumed.resume, checkpoint);
        assert_eq!(resumed.start_year, Some(2018));
        assert_eq!(resumed.end_year, Some(2020));
        assert_eq!(resumed.stops, config.stops);
        assert!(matches!(resumed.output, OutputTarget::Local(ref dir) if dir == &PathBuf::from("out")));
    }

    #[test]
    fn stop_page_below_resume_needs_year_mode() {
        let cli = parse("-t 1 -p 6 -e 3");
        assert!(cli.config().is_err());

        let cli = parse("-t 1 -p 6 -e 3 --start-year 2015");
        assert!(cli.config().is_ok());
    }
}
