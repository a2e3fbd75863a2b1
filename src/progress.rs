use std::fmt;

/// Where a run is, or where the next run should pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub year: Option<i32>,
    pub page: u32,
    pub uuid_index: usize,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Checkpoint {
            year: None,
            page: 1,
            uuid_index: 0,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(year) = self.year {
            write!(f, "year {}, ", year)?;
        }
        write!(f, "page {}, UUID index {}", self.page, self.uuid_index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopConditions {
    /// This page is never fetched.
    pub stop_at_page: Option<u32>,
    pub one_page_only: bool,
    pub one_year_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StopPage(u32),
    OnePageOnly,
    OneYearOnly,
    Exhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopPage(page) => write!(f, "reached stop page {}", page),
            StopReason::OnePageOnly => write!(f, "`one_page_only` is set"),
            StopReason::OneYearOnly => write!(f, "`one_year_only` is set"),
            StopReason::Exhausted => write!(f, "no pages left"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Interrupted or failed; the checkpoint says where to resume.
    Paused,
    Stopped(StopReason),
}

/// Tracks the current checkpoint and decides when iteration halts.
///
/// The resume page and UUID index apply to the first partition and first
/// page only. Later years start from page 1 and later pages from index 0.
#[derive(Debug)]
pub struct ProgressTracker {
    resume: Checkpoint,
    stops: StopConditions,
    checkpoint: Checkpoint,
    state: RunState,
    partitions_started: u32,
    pages_entered: u32,
    pages_done: u32,
}

impl ProgressTracker {
    pub fn new(resume: Checkpoint, stops: StopConditions) -> Self {
        ProgressTracker {
            resume,
            stops,
            checkpoint: resume,
            state: RunState::Running,
            partitions_started: 0,
            pages_entered: 0,
            pages_done: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn pages_done(&self) -> u32 {
        self.pages_done
    }

    /// Starts a partition (a year, or `None` for the whole result set) and
    /// returns the first page to fetch in it.
    pub fn begin_partition(&mut self, year: Option<i32>) -> u32 {
        self.partitions_started += 1;
        let first_page = if self.partitions_started == 1 {
            self.resume.page
        } else {
            1
        };
        self.checkpoint = Checkpoint {
            year,
            page: first_page,
            uuid_index: 0,
        };
        first_page
    }

    /// Returns `false`, and stops the run, when `page` is the stop page.
    pub fn enter_page(&mut self, page: u32) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.stops.stop_at_page == Some(page) {
            self.state = RunState::Stopped(StopReason::StopPage(page));
            return false;
        }
        self.pages_entered += 1;
        self.checkpoint.page = page;
        self.checkpoint.uuid_index = self.uuid_offset();
        true
    }

    /// Index of the first UUID to process on the current page.
    pub fn uuid_offset(&self) -> usize {
        if self.pages_entered <= 1 {
            self.resume.uuid_index
        } else {
            0
        }
    }

    pub fn record_uuid(&mut self, index: usize) {
        self.checkpoint.uuid_index = index;
    }

    /// Marks the current page as processed.
    pub fn finish_page(&mut self) -> RunState {
        self.pages_done += 1;
        self.advance_page();
        if self.stops.one_page_only && self.is_running() {
            self.state = RunState::Stopped(StopReason::OnePageOnly);
        }
        self.state
    }

    /// Moves past the current page without counting it as processed.
    pub fn skip_page(&mut self) {
        self.advance_page();
    }

    fn advance_page(&mut self) {
        self.checkpoint.page += 1;
        self.checkpoint.uuid_index = 0;
    }

    pub fn finish_partition(&mut self) -> RunState {
        if let Some(year) = self.checkpoint.year {
            self.checkpoint = Checkpoint {
                year: Some(year + 1),
                page: 1,
                uuid_index: 0,
            };
        }
        if self.stops.one_year_only && self.is_running() {
            self.state = RunState::Stopped(StopReason::OneYearOnly);
        }
        self.state
    }

    /// Ends the run; a tracker still running has exhausted its pages.
    pub fn finish(&mut self) -> RunState {
        if self.is_running() {
            self.state = RunState::Stopped(StopReason::Exhausted);
        }
        self.state
    }

    pub fn pause(&mut self) {
        if self.is_running() {
            self.state = RunState::Paused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(page: u32, uuid_index: usize, stops: StopConditions) -> ProgressTracker {
        ProgressTracker::new(
            Checkpoint {
                year: None,
                page,
                uuid_index,
            },
            stops,
        )
    }

    #[test]
    fn resume_offsets_apply_to_first_page_only() {
        let mut t = tracker(3, 7, StopConditions::default());

        assert_eq!(t.begin_partition(None), 3);
        assert!(t.enter_page(3));
        assert_eq!(t.uuid_offset(), 7);
        assert_eq!(t.checkpoint().uuid_index, 7);
        t.finish_page();

        assert!(t.enter_page(4));
        assert_eq!(t.uuid_offset(), 0);
        assert_eq!(t.checkpoint().page, 4);
    }

    #[test]
    fn later_partitions_start_at_page_one() {
        let mut t = tracker(5, 0, StopConditions::default());

        assert_eq!(t.begin_partition(Some(2019)), 5);
        t.finish_partition();
        assert_eq!(t.checkpoint().year, Some(2020));
        assert_eq!(t.begin_partition(Some(2020)), 1);
    }

    #[test]
    fn stop_page_is_not_entered() {
        let mut t = tracker(
            1,
            0,
            StopConditions {
                stop_at_page: Some(2),
                ..Default::default()
            },
        );
        t.begin_partition(None);

        assert!(t.enter_page(1));
        assert_eq!(t.finish_page(), RunState::Running);
        assert!(!t.enter_page(2));
        assert_eq!(t.state(), RunState::Stopped(StopReason::StopPage(2)));
        assert_eq!(t.checkpoint().page, 2);
    }

    #[test]
    fn one_page_only_stops_after_first_processed_page() {
        let mut t = tracker(
            1,
            0,
            StopConditions {
                one_page_only: true,
                ..Default::default()
            },
        );
        t.begin_partition(None);

        assert!(t.enter_page(1));
        t.skip_page();
        assert!(t.is_running());

        assert!(t.enter_page(2));
        assert_eq!(
            t.finish_page(),
            RunState::Stopped(StopReason::OnePageOnly)
        );
        assert!(!t.enter_page(3));
        assert_eq!(t.pages_done(), 1);
    }

    #[test]
    fn one_year_only_stops_after_partition() {
        let mut t = tracker(
            1,
            0,
            StopConditions {
                one_year_only: true,
                ..Default::default()
            },
        );
        t.begin_partition(Some(2010));
        assert!(t.enter_page(1));
        t.finish_page();

        assert_eq!(
            t.finish_partition(),
            RunState::Stopped(StopReason::OneYearOnly)
        );
        assert_eq!(t.checkpoint().year, Some(2011));
    }

    #[test]
    fn pause_and_finish_only_leave_running() {
        let mut t = tracker(1, 0, StopConditions::default());
        t.pause();
        assert_eq!(t.state(), RunState::Paused);
        assert_eq!(t.finish(), RunState::Paused);

        let mut t = tracker(1, 0, StopConditions::default());
        assert_eq!(t.finish(), RunState::Stopped(StopReason::Exhausted));
        t.pause();
        assert_eq!(t.state(), RunState::Stopped(StopReason::Exhausted));
    }

    #[test]
    fn checkpoint_display_names_year_when_set() {
        let checkpoint = Checkpoint {
            year: Some(2015),
            page: 4,
            uuid_index: 12,
        };
        assert_eq!(checkpoint.to_string(), "year 2015, page 4, UUID index 12");
        assert_eq!(
            Checkpoint::default().to_string(),
            "page 1, UUID index 0"
        );
    }
}
