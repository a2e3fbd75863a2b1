use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::{header::ACCEPT, Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

const USER_AGENT: &str = concat!("inat-scraper/", env!("CARGO_PKG_VERSION"));

/// The API refuses to page past this many results for a single query.
pub const MAX_RESULT_WINDOW: u64 = 10_000;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Filters shared by every search request for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub taxon_id: u64,
    pub per_page: u32,
    pub year: Option<i32>,
}

impl SearchQuery {
    pub fn new(taxon_id: u64, per_page: u32) -> Self {
        SearchQuery {
            taxon_id,
            per_page,
            year: None,
        }
    }

    pub fn for_year(&self, year: i32) -> Self {
        SearchQuery {
            year: Some(year),
            ..self.clone()
        }
    }

    fn with_per_page(&self, per_page: u32) -> Self {
        SearchQuery {
            per_page,
            ..self.clone()
        }
    }

    fn params(&self, page: u32, order: SortOrder) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("taxon_id", self.taxon_id.to_string()),
            ("photos", "true".to_string()),
            ("page", page.to_string()),
            ("per_page", self.per_page.to_string()),
            ("order", order.as_str().to_string()),
            ("order_by", "observed_on".to_string()),
            ("fields", "uuid,observed_on".to_string()),
        ];
        if let Some(year) = self.year {
            params.push(("year", year.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsPage {
    pub total_results: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub results: Vec<ObservationSummary>,
}

impl ResultsPage {
    pub fn uuids(&self) -> Vec<String> {
        self.results.iter().map(|r| r.uuid.clone()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationSummary {
    pub uuid: String,
    pub observed_on: Option<String>,
}

impl ObservationSummary {
    pub fn observed_year(&self) -> Option<i32> {
        let date = self.observed_on.as_deref()?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()
            .map(|d| d.year())
    }
}

/// The full observation record, as served by the website's JSON view.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservationDetail {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub observation_photos: Option<Vec<ObservationPhoto>>,
}

impl ObservationDetail {
    pub fn observation_photos(&self) -> &[ObservationPhoto] {
        self.observation_photos.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationPhoto {
    pub photo: Option<Photo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Photo {
    pub uuid: Option<String>,
    pub large_url: Option<String>,
}

#[async_trait]
pub trait ObservationApi: Send + Sync {
    async fn search_sorted(
        &self,
        query: &SearchQuery,
        page: u32,
        order: SortOrder,
    ) -> Result<ResultsPage, ApiError>;

    async fn observation(&self, uuid: &str) -> Result<ObservationDetail, ApiError>;

    /// One page of results, oldest observation first.
    async fn search(&self, query: &SearchQuery, page: u32) -> Result<ResultsPage, ApiError> {
        self.search_sorted(query, page, SortOrder::Asc).await
    }

    async fn count(&self, query: &SearchQuery) -> Result<u64, ApiError> {
        let page = self
            .search_sorted(&query.with_per_page(1), 1, SortOrder::Asc)
            .await?;
        Ok(page.total_results)
    }

    /// Year of the earliest (`Asc`) or latest (`Desc`) dated observation.
    async fn observed_on_bound(
        &self,
        query: &SearchQuery,
        order: SortOrder,
    ) -> Result<Option<i32>, ApiError> {
        let page = self
            .search_sorted(&query.with_per_page(1), 1, order)
            .await?;
        Ok(page.results.first().and_then(|r| r.observed_year()))
    }
}

/// Keeps a minimum gap between consecutive requests.
#[derive(Debug)]
struct Throttle {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Throttle {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                log::trace!("throttling for {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A reqwest client plus the throttle shared by everything talking to
/// iNaturalist. Cloning shares both.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    throttle: Arc<Throttle>,
}

impl HttpClient {
    pub fn new(request_delay: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(ApiError::Client)?;

        Ok(HttpClient {
            client,
            throttle: Arc::new(Throttle::new(request_delay)),
        })
    }

    /// Plain GET; non-success statuses become [`ApiError::Status`].
    pub async fn get(&self, url: Url, query: &[(&str, String)]) -> Result<Response, ApiError> {
        self.send(url, query, None).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self.send(url, query, Some("application/json")).await?;
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }

    async fn send(
        &self,
        url: Url,
        query: &[(&str, String)],
        accept: Option<&str>,
    ) -> Result<Response, ApiError> {
        self.throttle.wait().await;

        let mut request = self.client.get(url.clone()).query(query);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = request.send().await.map_err(|source| ApiError::Network {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url: response.url().to_string(),
                status,
            });
        }
        Ok(response)
    }
}

/// Client for the iNaturalist observation API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: HttpClient,
    api_url: Url,
    web_url: Url,
}

impl ApiClient {
    pub fn new(http: HttpClient, api_url: Url, web_url: Url) -> Self {
        ApiClient {
            http,
            api_url,
            web_url,
        }
    }
}

#[async_trait]
impl ObservationApi for ApiClient {
    async fn search_sorted(
        &self,
        query: &SearchQuery,
        page: u32,
        order: SortOrder,
    ) -> Result<ResultsPage, ApiError> {
        let url = self.api_url.join("observations")?;
        log::debug!(
            "searching taxon {} page {} ({:?})",
            query.taxon_id,
            page,
            query.year
        );
        self.http.get_json(url, &query.params(page, order)).await
    }

    async fn observation(&self, uuid: &str) -> Result<ObservationDetail, ApiError> {
        let url = self.web_url.join(&format!("observations/{}.json", uuid))?;
        log::debug!("({}) requesting observation", uuid);
        self.http.get_json(url, &[]).await
    }
}
