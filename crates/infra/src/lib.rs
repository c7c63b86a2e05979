//! Infrastructure layer: stores, object storage, background workers, config.

pub mod config;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod materializer;
pub mod notifier;
pub mod orchestrator;
pub mod pagination;
pub mod storage;
