use std::{collections::HashSet, fmt};

use anyhow::Context;
use chrono::Datelike;

use crate::{
    api::{ObservationApi, SearchQuery, SortOrder, MAX_RESULT_WINDOW},
    config::Config,
    download::{photo_refs, Downloader, PhotoFetcher},
    ledger::{Ledger, PageCounts, PageStatus},
    progress::{Checkpoint, ProgressTracker, RunState},
    store::{PutOutcome, Store},
    utils::{max_reachable_page, page_count},
};

#[derive(Debug, Clone, Copy, Default)]
struct Stats {
    observations: u64,
    observations_without_photos: u64,
    photos_stored: u64,
    photos_present: u64,
}

/// What a run did, and where the next one should start.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub pages_processed: u32,
    pub observations: u64,
    pub observations_without_photos: u64,
    pub photos_stored: u64,
    pub photos_present: u64,
    pub state: RunState,
    pub checkpoint: Checkpoint,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pages, {} observations ({} without photos), {} photos stored, {} already present",
            self.pages_processed,
            self.observations,
            self.observations_without_photos,
            self.photos_stored,
            self.photos_present
        )
    }
}

/// Observation and page totals for the whole taxon or a single year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSurvey {
    pub year: Option<i32>,
    pub observations: u64,
    pub pages: u32,
    pub progress: Option<PageCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Survey {
    pub taxon_id: u64,
    pub total: PartitionSurvey,
    pub years: Vec<PartitionSurvey>,
}

impl fmt::Display for Survey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "taxon {}", self.taxon_id)?;
        for partition in std::iter::once(&self.total).chain(self.years.iter()) {
            let label = partition
                .year
                .map(|y| y.to_string())
                .unwrap_or_else(|| "all".to_string());
            write!(
                f,
                "{:>6}  {:>8} observations  {:>5} pages",
                label, partition.observations, partition.pages
            )?;
            if let Some(progress) = partition.progress {
                write!(
                    f,
                    "  {} complete, {} in progress",
                    progress.complete, progress.in_progress
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Walks the result pages for one taxon, downloading every photo into the
/// store until the tracker stops.
pub struct Scraper<A, F> {
    api: A,
    downloader: Downloader<F>,
    store: Store,
    ledger: Option<Ledger>,
    tracker: ProgressTracker,
    taxon_id: u64,
    results_per_page: u32,
    start_year: Option<i32>,
    end_year: Option<i32>,
    partition_by_year: bool,
    seen: HashSet<String>,
    stats: Stats,
}

impl<A: ObservationApi, F: PhotoFetcher> Scraper<A, F> {
    pub fn new(
        config: &Config,
        api: A,
        downloader: Downloader<F>,
        store: Store,
        ledger: Option<Ledger>,
    ) -> Self {
        Scraper {
            api,
            downloader,
            store,
            ledger,
            tracker: ProgressTracker::new(config.resume, config.stops),
            taxon_id: config.taxon_id,
            results_per_page: config.results_per_page,
            start_year: config.start_year,
            end_year: config.end_year,
            partition_by_year: config.wants_year_partition(),
            seen: HashSet::new(),
            stats: Stats::default(),
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Marks the run as paused; the checkpoint stays where it was.
    pub fn interrupt(&mut self) {
        self.tracker.pause();
    }

    pub fn summary(&self) -> Summary {
        Summary {
            pages_processed: self.tracker.pages_done(),
            observations: self.stats.observations,
            observations_without_photos: self.stats.observations_without_photos,
            photos_stored: self.stats.photos_stored,
            photos_present: self.stats.photos_present,
            state: self.tracker.state(),
            checkpoint: self.tracker.checkpoint(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<Summary> {
        match self.scrape().await {
            Ok(()) => {
                self.tracker.finish();
                Ok(self.summary())
            }
            Err(e) => {
                self.tracker.pause();
                Err(e)
            }
        }
    }

    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.taxon_id, self.results_per_page)
    }

    async fn scrape(&mut self) -> anyhow::Result<()> {
        let query = self.query();
        let total = self
            .api
            .count(&query)
            .await
            .with_context(|| format!("count observations of taxon {}", self.taxon_id))?;
        let pages = page_count(total, self.results_per_page);
        log::info!("Number of pages: {}", pages);
        log::info!("Number of observations: {}", total);

        if total <= MAX_RESULT_WINDOW && !self.partition_by_year {
            return self.scrape_partition(&query, None, pages).await;
        }

        let Some((start, end)) = year_bounds(&self.api, &query, self.start_year, self.end_year).await?
        else {
            log::warn!("No dated observations for taxon {}", self.taxon_id);
            return Ok(());
        };
        if total > MAX_RESULT_WINDOW {
            log::warn!(
                "More than {} results! Will iterate year by year starting from {}",
                MAX_RESULT_WINDOW,
                start
            );
        }

        for year in start..=end {
            let year_query = query.for_year(year);
            let total = self
                .api
                .count(&year_query)
                .await
                .with_context(|| format!("count observations in {}", year))?;
            let pages = page_count(total, self.results_per_page);
            log::info!("Number of pages for {}: {}", year, pages);
            log::info!("Number of observations in {}: {}", year, total);

            self.scrape_partition(&year_query, Some(year), pages).await?;
            if !self.tracker.is_running() {
                break;
            }
            if self.tracker.finish_partition() != RunState::Running {
                break;
            }
        }
        Ok(())
    }

    async fn scrape_partition(
        &mut self,
        query: &SearchQuery,
        year: Option<i32>,
        pages: u32,
    ) -> anyhow::Result<()> {
        let first_page = self.tracker.begin_partition(year);
        let reachable = max_reachable_page(self.results_per_page);
        let last_page = if pages > reachable {
            log::warn!(
                "{} pages exceed the API window; only the first {} are reachable",
                pages,
                reachable
            );
            reachable
        } else {
            pages
        };

        for page in first_page..=last_page {
            if !self.tracker.enter_page(page) {
                if let RunState::Stopped(reason) = self.tracker.state() {
                    log::warn!("Stopped: {}", reason);
                }
                break;
            }

            if let Some(ledger) = self.ledger.as_mut() {
                match ledger.status(year, page) {
                    PageStatus::Complete => {
                        log::warn!("Page {} is already complete! Skipping...", page);
                        self.tracker.skip_page();
                        continue;
                    }
                    PageStatus::InProgress => {
                        log::warn!("Page {} was left in progress; processing again", page)
                    }
                    PageStatus::Pending => {}
                }
                ledger.mark(year, page, PageStatus::InProgress)?;
            }

            log::info!("Current page: {}", page);
            let results = self
                .api
                .search(query, page)
                .await
                .with_context(|| format!("fetch page {}", page))?;
            let uuids = results.uuids();

            if uuids.is_empty() {
                log::warn!("Page {} returned no observations", page);
                self.finish_page(year, page)?;
                break;
            }

            if uuids.iter().all(|uuid| self.seen.contains(uuid)) {
                log::warn!("Duplicate response in page {}! Skipping...", page);
                self.mark_ledger(year, page, PageStatus::Complete)?;
                self.tracker.skip_page();
                continue;
            }
            self.seen.extend(uuids.iter().cloned());

            let offset = self.tracker.uuid_offset();
            for (index, uuid) in uuids.iter().enumerate().skip(offset) {
                self.tracker.record_uuid(index);
                log::debug!("Page: {}, UUID index: {}", page, index);
                self.scrape_observation(uuid).await?;
            }

            if self.finish_page(year, page)? != RunState::Running {
                if let RunState::Stopped(reason) = self.tracker.state() {
                    log::warn!("Stopped: {}", reason);
                }
                break;
            }
        }
        Ok(())
    }

    fn finish_page(&mut self, year: Option<i32>, page: u32) -> anyhow::Result<RunState> {
        self.mark_ledger(year, page, PageStatus::Complete)?;
        Ok(self.tracker.finish_page())
    }

    fn mark_ledger(
        &mut self,
        year: Option<i32>,
        page: u32,
        status: PageStatus,
    ) -> anyhow::Result<()> {
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.mark(year, page, status)?;
            if status == PageStatus::Complete {
                log::info!("Marking page {} as complete!", page);
            }
        }
        Ok(())
    }

    async fn scrape_observation(&mut self, uuid: &str) -> anyhow::Result<()> {
        let observation = self
            .api
            .observation(uuid)
            .await
            .with_context(|| format!("fetch observation {}", uuid))?;
        self.stats.observations += 1;

        let photos = photo_refs(&observation);
        if photos.is_empty() {
            log::debug!("({}) No photos... Skipping...", uuid);
            self.stats.observations_without_photos += 1;
            return Ok(());
        }

        for photo in &photos {
            let downloaded = self.downloader.download(photo).await.with_context(|| {
                format!("download photo {} of observation {}", photo.label(), uuid)
            })?;

            let outcome = self
                .store
                .put_if_absent(&downloaded.key, downloaded.bytes)
                .await
                .with_context(|| format!("store {} in {}", downloaded.key, self.store))?;
            match outcome {
                PutOutcome::Stored => {
                    self.stats.photos_stored += 1;
                    log::debug!("({}) Downloaded as {}", photo.label(), downloaded.key);
                }
                PutOutcome::AlreadyPresent => {
                    self.stats.photos_present += 1;
                    log::warn!("{} already exists in {}! Skipping...", downloaded.key, self.store);
                }
            }
        }
        Ok(())
    }
}

/// Year range to walk: the configured bounds, falling back to the earliest
/// and latest observation dates. `None` when nothing is dated.
async fn year_bounds<A: ObservationApi>(
    api: &A,
    query: &SearchQuery,
    start_year: Option<i32>,
    end_year: Option<i32>,
) -> anyhow::Result<Option<(i32, i32)>> {
    let start = match start_year {
        Some(year) => Some(year),
        None => api
            .observed_on_bound(query, SortOrder::Asc)
            .await
            .context("find earliest observation")?,
    };
    let Some(start) = start else {
        return Ok(None);
    };

    let end = match end_year {
        Some(year) => year,
        None => api
            .observed_on_bound(query, SortOrder::Desc)
            .await
            .context("find latest observation")?
            .unwrap_or_else(|| chrono::Utc::now().year()),
    };
    Ok(Some((start, end)))
}

/// Counts observations and pages for the taxon and for every year in range,
/// with ledger progress when a ledger is given.
pub async fn survey<A: ObservationApi>(
    api: &A,
    config: &Config,
    ledger: Option<&Ledger>,
) -> anyhow::Result<Survey> {
    let query = SearchQuery::new(config.taxon_id, config.results_per_page);
    let observations = api.count(&query).await.context("count observations")?;
    let total = PartitionSurvey {
        year: None,
        observations,
        pages: page_count(observations, config.results_per_page),
        progress: ledger.map(|l| l.counts(None)),
    };

    let mut years = Vec::new();
    if let Some((start, end)) = year_bounds(api, &query, config.start_year, config.end_year).await? {
        for year in start..=end {
            let observations = api
                .count(&query.for_year(year))
                .await
                .with_context(|| format!("count observations in {}", year))?;
            years.push(PartitionSurvey {
                year: Some(year),
                observations,
                pages: page_count(observations, config.results_per_page),
                progress: ledger.map(|l| l.counts(Some(year))),
            });
        }
    }

    Ok(Survey {
        taxon_id: config.taxon_id,
        total,
        years,
    })
}
