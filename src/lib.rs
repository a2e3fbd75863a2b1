pub mod api;
pub mod config;
pub mod download;
pub mod ledger;
pub mod logging;
pub mod progress;
pub mod scraper;
pub mod store;
pub mod utils;
