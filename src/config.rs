use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use url::Url;

use crate::progress::{Checkpoint, StopConditions};

pub const DEFAULT_API_URL: &str = "https://api.inaturalist.org/v2/";
pub const DEFAULT_WEB_URL: &str = "https://www.inaturalist.org/";
pub const DEFAULT_RESULTS_PER_PAGE: u32 = 200;
pub const MAX_RESULTS_PER_PAGE: u32 = 200;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1000;
pub const DEFAULT_S3_REGION: &str = "us-east-1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("invalid URL '{0}': {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("results per page must be between 1 and {max}, got {0}", max = MAX_RESULTS_PER_PAGE)]
    ResultsPerPage(u32),
    #[error("pages start at 1")]
    ZeroPage,
    #[error("start year {start} is after end year {end}")]
    YearRange { start: i32, end: i32 },
    #[error("stop page {stop} must be after resume page {resume}")]
    StopBeforeResume { stop: u32, resume: u32 },
}

/// Where downloaded photos end up.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    Local(PathBuf),
    S3(S3Config),
}

impl OutputTarget {
    pub fn default_local(taxon_id: u64) -> Self {
        OutputTarget::Local(PathBuf::from(format!("downloaded_images_{}", taxon_id)))
    }
}

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
}

// keep the secret out of logs
impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the bucket settings through `lookup`, so callers can supply
    /// something other than the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(name).ok_or(ConfigError::MissingVar(name));

        Ok(S3Config {
            endpoint: normalize_endpoint(&var("S3_ENDPOINT")?),
            bucket: var("S3_BUCKET_NAME")?,
            access_key: var("S3_ACCESS_KEY")?,
            secret_key: var("S3_SECRET_KEY")?,
            region: lookup("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            prefix: lookup("S3_PREFIX").filter(|p| !p.trim_matches('/').is_empty()),
        })
    }
}

/// Endpoints are often given as a bare `host:port`; the object store client
/// wants a full URL.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// Parses a base URL, forcing a trailing slash so relative joins keep the
/// last path segment (`.../v2/` + `observations`).
pub fn base_url(raw: &str) -> Result<Url, ConfigError> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&with_slash).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub taxon_id: u64,
    pub output: OutputTarget,
    pub results_per_page: u32,
    pub resume: Checkpoint,
    pub stops: StopConditions,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub api_url: Url,
    pub web_url: Url,
    pub request_delay: Duration,
    pub progress_file: Option<PathBuf>,
}

impl Config {
    /// A configuration with the public iNaturalist endpoints and every
    /// optional setting left at its default.
    pub fn new(taxon_id: u64, output: OutputTarget) -> Result<Self, ConfigError> {
        Ok(Config {
            taxon_id,
            output,
            results_per_page: DEFAULT_RESULTS_PER_PAGE,
            resume: Checkpoint::default(),
            stops: StopConditions::default(),
            start_year: None,
            end_year: None,
            api_url: base_url(DEFAULT_API_URL)?,
            web_url: base_url(DEFAULT_WEB_URL)?,
            request_delay: Duration::from_millis(DEFAULT_REQUEST_DELAY_MS),
            progress_file: None,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.results_per_page == 0 || self.results_per_page > MAX_RESULTS_PER_PAGE {
            return Err(ConfigError::ResultsPerPage(self.results_per_page));
        }
        if self.resume.page == 0 || self.stops.stop_at_page == Some(0) {
            return Err(ConfigError::ZeroPage);
        }
        if let (Some(start), Some(end)) = (self.start_year, self.end_year) {
            if start > end {
                return Err(ConfigError::YearRange { start, end });
            }
        }
        // later years restart at page 1, where a lower stop page still applies
        if let Some(stop) = self.stops.stop_at_page.filter(|_| !self.wants_year_partition()) {
            if stop <= self.resume.page {
                return Err(ConfigError::StopBeforeResume {
                    stop,
                    resume: self.resume.page,
                });
            }
        }
        Ok(())
    }

    /// Year flags force a year-by-year walk even for small result sets.
    pub fn wants_year_partition(&self) -> bool {
        self.start_year.is_some() || self.end_year.is_some() || self.stops.one_year_only
    }

    /// Command-line flags that continue this run from `checkpoint`.
    ///
    /// A page number only means something at a given page size and within
    /// the same year range, so every setting that shapes the walk is
    /// repeated alongside the checkpoint itself.
    pub fn resume_args(&self, checkpoint: &Checkpoint) -> String {
        let mut args = vec![
            format!("--taxon-id {}", self.taxon_id),
            format!("--results-per-page {}", self.results_per_page),
        ];
        match &self.output {
            OutputTarget::Local(dir) => args.push(format!("--output-dir {}", dir.display())),
            OutputTarget::S3(_) => args.push("--upload-to-s3".to_string()),
        }
        if let Some(year) = checkpoint.year {
            args.push(format!("--start-year {}", year));
        }
        if let Some(year) = self.end_year {
            args.push(format!("--end-year {}", year));
        }
        args.push(format!("--resume-from-page {}", checkpoint.page));
        args.push(format!("--resume-from-uuid-index {}", checkpoint.uuid_index));
        if let Some(stop) = self.stops.stop_at_page {
            // a flat walk that reached its stop page has nothing left below it
            if checkpoint.year.is_some() || checkpoint.page < stop {
                args.push(format!("--stop-at-page {}", stop));
            }
        }
        if self.stops.one_page_only {
            args.push("--one-page-only".to_string());
        }
        if self.stops.one_year_only {
            args.push("--one-year-only".to_string());
        }
        if let Some(path) = &self.progress_file {
            args.push(format!("--progress-file {}", path.display()));
        }
        args.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn s3_config_reads_all_variables() {
        let vars = env(&[
            ("S3_ENDPOINT", "minio.local:9000"),
            ("S3_BUCKET_NAME", "photos"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
        ]);
        let s3 = S3Config::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(s3.endpoint, "https://minio.local:9000");
        assert_eq!(s3.bucket, "photos");
        assert_eq!(s3.region, DEFAULT_S3_REGION);
        assert_eq!(s3.prefix, None);
        assert!(!format!("{:?}", s3).contains("secret"));
    }

    #[test]
    fn s3_config_keeps_explicit_scheme() {
        let vars = env(&[
            ("S3_ENDPOINT", "http://localhost:9000/"),
            ("S3_BUCKET_NAME", "photos"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
            ("S3_REGION", "eu-west-1"),
            ("S3_PREFIX", "inat/47219"),
        ]);
        let s3 = S3Config::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(s3.endpoint, "http://localhost:9000");
        assert_eq!(s3.region, "eu-west-1");
        assert_eq!(s3.prefix.as_deref(), Some("inat/47219"));
    }

    #[test]
    fn s3_config_reports_missing_variable() {
        let vars = env(&[("S3_ENDPOINT", "localhost:9000")]);
        let err = S3Config::from_lookup(|k| vars.get(k).cloned()).unwrap_err();

        assert!(matches!(err, ConfigError::MissingVar("S3_BUCKET_NAME")));
    }

    #[test]
    fn base_url_appends_slash() {
        let url = base_url("https://api.inaturalist.org/v2").unwrap();
        assert_eq!(
            url.join("observations").unwrap().as_str(),
            "https://api.inaturalist.org/v2/observations"
        );
    }

    #[test]
    fn validate_rejects_bad_bounds() {
        let mut config = Config::new(1, OutputTarget::default_local(1)).unwrap();
        assert!(config.validate().is_ok());

        config.results_per_page = 201;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ResultsPerPage(201))
        ));
        config.results_per_page = 50;

        config.start_year = Some(2020);
        config.end_year = Some(2019);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::YearRange { .. })
        ));
        config.end_year = None;

        config.resume.page = 4;
        config.stops.stop_at_page = Some(4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StopBeforeResume { stop: 4, resume: 4 })
        ));
    }

    #[test]
    fn stop_page_below_resume_is_allowed_when_walking_years() {
        let mut config = Config::new(1, OutputTarget::default_local(1)).unwrap();
        config.resume.page = 6;
        config.stops.stop_at_page = Some(3);
        assert!(config.validate().is_err());

        config.start_year = Some(2015);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resume_args_repeat_the_walk_settings() {
        let mut config = Config::new(47219, OutputTarget::Local(PathBuf::from("out"))).unwrap();
        config.results_per_page = 50;
        config.end_year = Some(2020);
        config.stops.stop_at_page = Some(9);
        config.stops.one_year_only = true;
        config.progress_file = Some(PathBuf::from("progress.json"));

        let checkpoint = Checkpoint {
            year: Some(2018),
            page: 7,
            uuid_index: 3,
        };
        assert_eq!(
            config.resume_args(&checkpoint),
            "--taxon-id 47219 --results-per-page 50 --output-dir out --start-year 2018 \
             --end-year 2020 --resume-from-page 7 --resume-from-uuid-index 3 --stop-at-page 9 \
             --one-year-only --progress-file progress.json"
        );
    }

    #[test]
    fn resume_args_drop_a_reached_stop_page_outside_year_mode() {
        let mut config = Config::new(3, OutputTarget::Local(PathBuf::from("out"))).unwrap();
        config.stops.stop_at_page = Some(4);

        let reached = Checkpoint {
            year: None,
            page: 4,
            uuid_index: 0,
        };
        assert!(!config.resume_args(&reached).contains("--stop-at-page"));

        let short = Checkpoint { page: 2, ..reached };
        assert!(config.resume_args(&short).ends_with("--stop-at-page 4"));
    }

    #[test]
    fn bucket_output_resumes_with_upload_flag() {
        let vars = env(&[
            ("S3_ENDPOINT", "localhost:9000"),
            ("S3_BUCKET_NAME", "photos"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
        ]);
        let s3 = S3Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let config = Config::new(5, OutputTarget::S3(s3)).unwrap();

        let args = config.resume_args(&Checkpoint::default());
        assert_eq!(
            args,
            "--taxon-id 5 --results-per-page 200 --upload-to-s3 --resume-from-page 1 \
             --resume-from-uuid-index 0"
        );
    }

    #[test]
    fn default_output_dir_names_taxon() {
        match OutputTarget::default_local(47219) {
            OutputTarget::Local(path) => {
                assert_eq!(path, PathBuf::from("downloaded_images_47219"))
            }
            OutputTarget::S3(_) => panic!("expected local target"),
        }
    }
}
