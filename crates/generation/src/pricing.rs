//! Credit pricing catalog.
//!
//! `cost` is pure and offline: the submitter sizes the reservation with it
//! before any provider call.

use thiserror::Error;

use genforge_credits::Credits;

use crate::kind::{MediaKind, ProviderId};
use crate::models::{ModelError, select_model};
use crate::params::{GenerationParams, Quality, Resolution};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("{provider} does not offer {kind}")]
    Unsupported { provider: ProviderId, kind: MediaKind },

    #[error("{provider} cannot price {kind}: {reason}")]
    UnsupportedOption {
        provider: ProviderId,
        kind: MediaKind,
        reason: String,
    },
}

mod replicate {
    pub const IMAGE_STANDARD: i64 = 4;
    pub const IMAGE_HD: i64 = 8;
    pub const UPSCALE_2X: i64 = 2;
    pub const UPSCALE_4X: i64 = 5;
    pub const LOGO: i64 = 5;
}

mod fal {
    pub const IMAGE: i64 = 3;
    pub const VIDEO_PER_SEC_480P: i64 = 4;
    pub const VIDEO_PER_SEC_720P: i64 = 6;
    pub const VIDEO_PER_SEC_1080P: i64 = 10;
}

mod taskapi {
    pub const IMAGE: i64 = 4;
    /// Price of one started 5-second block at 720p.
    pub const VIDEO_BLOCK: i64 = 30;
    pub const VIDEO_BLOCK_SECS: u32 = 5;
    pub const PER_ANGLE: i64 = 4;
}

/// Credits charged for `kind` on `provider` with `params`.
pub fn cost(
    provider: ProviderId,
    kind: MediaKind,
    params: &GenerationParams,
) -> Result<Credits, PricingError> {
    let count = Credits::from(params.effective_count(kind));
    let unsupported = || PricingError::Unsupported { provider, kind };
    let option = |reason: String| PricingError::UnsupportedOption {
        provider,
        kind,
        reason,
    };

    // every model a route offers is billed at the route's price
    select_model(provider, kind, params).map_err(|e| match e {
        ModelError::NoRoute { .. } => unsupported(),
        ModelError::NotOffered { model, .. } => option(format!("model {model}")),
    })?;

    match provider {
        ProviderId::Replicate => match kind {
            MediaKind::Image => {
                let unit = match params.effective_quality() {
                    Quality::Standard => replicate::IMAGE_STANDARD,
                    Quality::Hd => replicate::IMAGE_HD,
                };
                Ok(unit * count)
            }
            MediaKind::Upscale => match params.upscale_factor.unwrap_or(2) {
                2 => Ok(replicate::UPSCALE_2X),
                4 => Ok(replicate::UPSCALE_4X),
                f => Err(option(format!("upscale factor {f}"))),
            },
            MediaKind::Logo => Ok(replicate::LOGO * count),
            MediaKind::Video | MediaKind::MultiAngleSet => Err(unsupported()),
        },

        ProviderId::Fal => match kind {
            MediaKind::Image => Ok(fal::IMAGE * count),
            MediaKind::Video => {
                let per_sec = match params.resolution.unwrap_or(Resolution::P720) {
                    Resolution::P480 => fal::VIDEO_PER_SEC_480P,
                    Resolution::P720 => fal::VIDEO_PER_SEC_720P,
                    Resolution::P1080 => fal::VIDEO_PER_SEC_1080P,
                    Resolution::K4 => return Err(option("4k video".to_string())),
                };
                let base = per_sec * Credits::from(params.effective_duration());
                // audio track adds 50%, rounded up
                Ok(if params.audio { (base * 3 + 1) / 2 } else { base })
            }
            MediaKind::Upscale | MediaKind::Logo | MediaKind::MultiAngleSet => Err(unsupported()),
        },

        ProviderId::TaskApi => match kind {
            MediaKind::Image => Ok(taskapi::IMAGE * count),
            MediaKind::Video => {
                let multiplier = match params.resolution.unwrap_or(Resolution::P720) {
                    Resolution::P480 | Resolution::P720 => 1,
                    Resolution::P1080 => 2,
                    Resolution::K4 => return Err(option("4k video".to_string())),
                };
                let blocks = params.effective_duration().div_ceil(taskapi::VIDEO_BLOCK_SECS);
                Ok(taskapi::VIDEO_BLOCK * Credits::from(blocks) * multiplier)
            }
            MediaKind::MultiAngleSet => Ok(taskapi::PER_ANGLE * count),
            MediaKind::Upscale | MediaKind::Logo => Err(unsupported()),
        },
    }
}
