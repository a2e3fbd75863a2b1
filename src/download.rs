use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::api::{ApiError, HttpClient, ObservationDetail};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("invalid photo URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Request(#[from] ApiError),
    #[error("failed to read photo body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Retrieves raw image bytes for a photo URL.
#[async_trait]
pub trait PhotoFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}

pub struct HttpFetcher {
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new(http: HttpClient) -> Self {
        HttpFetcher { http }
    }
}

#[async_trait]
impl PhotoFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let parsed = Url::parse(url).map_err(|source| DownloadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let response = self.http.get(parsed, &[]).await?;
        response.bytes().await.map_err(|source| DownloadError::Body {
            url: url.to_string(),
            source,
        })
    }
}

/// A photo of an observation that has something to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRef {
    pub uuid: Option<String>,
    pub url: String,
}

impl PhotoRef {
    /// Label for log lines.
    pub fn label(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedPhoto {
    pub photo: PhotoRef,
    pub key: String,
    pub bytes: Bytes,
}

/// Photos of `observation` that carry a URL. Entries without a photo or
/// without `large_url` are skipped.
pub fn photo_refs(observation: &ObservationDetail) -> Vec<PhotoRef> {
    observation
        .observation_photos()
        .iter()
        .filter_map(|p| p.photo.as_ref())
        .filter_map(|photo| {
            let url = photo.large_url.as_ref()?;
            Some(PhotoRef {
                uuid: photo.uuid.clone(),
                url: url.clone(),
            })
        })
        .collect()
}

/// Lowercased extension of the URL path, with `.jpeg` and missing
/// extensions mapped to `.jpg`.
pub fn photo_suffix(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url).to_string(),
    };

    match Path::new(&path).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() && !ext.eq_ignore_ascii_case("jpeg") => {
            format!(".{}", ext.to_lowercase())
        }
        _ => ".jpg".to_string(),
    }
}

/// Content-addressed key: same bytes, same key.
pub fn object_key(bytes: &[u8], suffix: &str) -> String {
    format!("{:x}{}", Sha256::digest(bytes), suffix)
}

pub struct Downloader<F> {
    fetcher: F,
}

impl<F: PhotoFetcher> Downloader<F> {
    pub fn new(fetcher: F) -> Self {
        Downloader { fetcher }
    }

    pub async fn download(&self, photo: &PhotoRef) -> Result<DownloadedPhoto, DownloadError> {
        log::debug!("({}) downloading {}", photo.label(), photo.url);
        let bytes = self.fetcher.fetch(&photo.url).await?;
        let key = object_key(&bytes, &photo_suffix(&photo.url));

        Ok(DownloadedPhoto {
            photo: photo.clone(),
            key,
            bytes,
        })
    }
}
