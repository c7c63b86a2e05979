//! Generation job domain: job state machine, request parameters, failure
//! taxonomy, the model catalog and the pricing catalog.
//!
//! Pure domain logic only. Provider IO lives in `genforge-providers`,
//! persistence and scheduling in `genforge-infra`.

pub mod error_kind;
pub mod job;
pub mod kind;
pub mod models;
pub mod params;
pub mod pricing;

pub use error_kind::{ErrorKind, classify_failure};
pub use job::{GenerationJob, JobStatus, TransitionError};
pub use kind::{MediaKind, ProviderId};
pub use models::{ModelError, select_model};
pub use params::{GenerationParams, Quality, Resolution};
pub use pricing::{PricingError, cost};
