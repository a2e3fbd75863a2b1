use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ALL_YEARS: &str = "all";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("progress file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress file {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("progress file belongs to taxon {found}, not {expected}")]
    TaxonMismatch { expected: u64, found: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub complete: u32,
    pub in_progress: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    taxon_id: u64,
    #[serde(default)]
    partitions: BTreeMap<String, BTreeMap<u32, PageStatus>>,
}

/// Per-page status for one taxon, persisted as JSON after every change.
/// Partitions are keyed by year, or `all` when the run is not split by year.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: LedgerFile,
}

fn partition_key(year: Option<i32>) -> String {
    year.map(|y| y.to_string())
        .unwrap_or_else(|| ALL_YEARS.to_string())
}

impl Ledger {
    /// Loads the ledger at `path`, or starts an empty one if the file does
    /// not exist yet.
    pub fn open<P: AsRef<Path>>(path: P, taxon_id: u64) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<LedgerFile>(&raw).map_err(|source| {
                LedgerError::Json {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerFile {
                taxon_id,
                partitions: BTreeMap::new(),
            },
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        if file.taxon_id != taxon_id {
            return Err(LedgerError::TaxonMismatch {
                expected: taxon_id,
                found: file.taxon_id,
            });
        }
        Ok(Ledger { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self, year: Option<i32>, page: u32) -> PageStatus {
        self.file
            .partitions
            .get(&partition_key(year))
            .and_then(|pages| pages.get(&page))
            .copied()
            .unwrap_or_default()
    }

    pub fn mark(
        &mut self,
        year: Option<i32>,
        page: u32,
        status: PageStatus,
    ) -> Result<(), LedgerError> {
        self.file
            .partitions
            .entry(partition_key(year))
            .or_default()
            .insert(page, status);
        self.save()
    }

    pub fn counts(&self, year: Option<i32>) -> PageCounts {
        let mut counts = PageCounts::default();
        if let Some(pages) = self.file.partitions.get(&partition_key(year)) {
            for status in pages.values() {
                match status {
                    PageStatus::Complete => counts.complete += 1,
                    PageStatus::InProgress => counts.in_progress += 1,
                    PageStatus::Pending => {}
                }
            }
        }
        counts
    }

    fn save(&self) -> Result<(), LedgerError> {
        let raw = serde_json::to_vec_pretty(&self.file).map_err(|source| LedgerError::Json {
            path: self.path.clone(),
            source,
        })?;

        // a partial write must never replace the ledger
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })
    }
}
