pub mod anomaly;
pub mod cache;
pub mod candles;
pub mod config;
pub mod confluence;
pub mod data;
pub mod error;
pub mod features;
pub mod indicators;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod paper;
pub mod pause;
pub mod regime;
pub mod reporting;
pub mod risk;
pub mod scanner;
pub mod scoring;
pub mod store;
pub mod universe;

pub use error::{ScanError, ScanResult};
pub use models::*;
