//! Provider adapters: one uniform submit/poll contract over every third-party
//! generation backend.
//!
//! ## Components
//!
//! - `ProviderAdapter`: the two-operation contract (`submit`, `poll`)
//! - `normalize_result_payload`: reduces any provider result shape to one URL
//! - `ReplicateAdapter`, `FalAdapter`, `TaskApiAdapter`: HTTP implementations
//! - `ProviderRegistry`: provider tag -> adapter lookup

pub mod adapter;
pub mod fal;
mod http;
pub mod normalize;
pub mod registry;
pub mod replicate;
pub mod settings;
pub mod taskapi;

pub use adapter::{PollError, PollOutcome, ProviderAdapter, ProviderTaskId, SubmissionError};
pub use fal::FalAdapter;
pub use normalize::normalize_result_payload;
pub use registry::ProviderRegistry;
pub use replicate::ReplicateAdapter;
pub use settings::{ApiCredentials, ProviderSettings};
pub use taskapi::TaskApiAdapter;
