//! Provider model catalog.
//!
//! Each (provider, kind) route lists the models a caller may pick through
//! `GenerationParams::model`. Every model on a route is billed at the route's
//! price, so an override can never buy a dearer model at a cheaper rate. The
//! first entry is the default.

use thiserror::Error;

use crate::kind::{MediaKind, ProviderId};
use crate::params::{GenerationParams, Quality};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{provider} has no model for {kind}")]
    NoRoute { provider: ProviderId, kind: MediaKind },

    #[error("{provider} does not offer model {model} for {kind}")]
    NotOffered {
        provider: ProviderId,
        kind: MediaKind,
        model: String,
    },
}

const REPLICATE_IMAGE: &[&str] = &["black-forest-labs/flux-schnell", "black-forest-labs/flux-dev"];
const REPLICATE_IMAGE_HD: &[&str] = &["black-forest-labs/flux-1.1-pro", "black-forest-labs/flux-pro"];
const REPLICATE_UPSCALE: &[&str] = &["nightmareai/real-esrgan"];
const REPLICATE_LOGO: &[&str] = &["ideogram-ai/ideogram-v2", "ideogram-ai/ideogram-v2-turbo"];

const FAL_IMAGE: &[&str] = &["fal-ai/flux/dev", "fal-ai/flux/schnell"];
const FAL_TEXT_TO_VIDEO: &[&str] = &["fal-ai/kling-video/v2/master/text-to-video"];
const FAL_IMAGE_TO_VIDEO: &[&str] = &["fal-ai/kling-video/v2/master/image-to-video"];

const TASKAPI_IMAGE: &[&str] = &["image-standard"];
const TASKAPI_VIDEO: &[&str] = &["video-standard"];
const TASKAPI_MULTI_ANGLE: &[&str] = &["multi-angle"];

/// Models offered for this request shape, default first. Empty when the
/// provider has no route for `kind`.
pub fn offered(provider: ProviderId, kind: MediaKind, params: &GenerationParams) -> &'static [&'static str] {
    match (provider, kind) {
        (ProviderId::Replicate, MediaKind::Image) => match params.effective_quality() {
            Quality::Standard => REPLICATE_IMAGE,
            Quality::Hd => REPLICATE_IMAGE_HD,
        },
        (ProviderId::Replicate, MediaKind::Upscale) => REPLICATE_UPSCALE,
        (ProviderId::Replicate, MediaKind::Logo) => REPLICATE_LOGO,

        (ProviderId::Fal, MediaKind::Image) => FAL_IMAGE,
        (ProviderId::Fal, MediaKind::Video) if params.reference_urls.is_empty() => FAL_TEXT_TO_VIDEO,
        (ProviderId::Fal, MediaKind::Video) => FAL_IMAGE_TO_VIDEO,

        (ProviderId::TaskApi, MediaKind::Image) => TASKAPI_IMAGE,
        (ProviderId::TaskApi, MediaKind::Video) => TASKAPI_VIDEO,
        (ProviderId::TaskApi, MediaKind::MultiAngleSet) => TASKAPI_MULTI_ANGLE,

        _ => &[],
    }
}

/// The model a request runs on: the caller's pick if the route offers it,
/// otherwise the route default.
pub fn select_model<'a>(
    provider: ProviderId,
    kind: MediaKind,
    params: &'a GenerationParams,
) -> Result<&'a str, ModelError> {
    let offered = offered(provider, kind, params);
    let Some(default) = offered.first() else {
        return Err(ModelError::NoRoute { provider, kind });
    };
    match params.model.as_deref() {
        None => Ok(*default),
        Some(model) if offered.iter().any(|m| *m == model) => Ok(model),
        Some(model) => Err(ModelError::NotOffered {
            provider,
            kind,
            model: model.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_model(model: &str) -> GenerationParams {
        let mut p = GenerationParams::with_prompt("x");
        p.model = Some(model.to_string());
        p
    }

    #[test]
    fn default_follows_quality_and_references() {
        let p = GenerationParams::with_prompt("x");
        assert_eq!(
            select_model(ProviderId::Replicate, MediaKind::Image, &p),
            Ok("black-forest-labs/flux-schnell")
        );
        assert_eq!(
            select_model(ProviderId::Replicate, MediaKind::Image, &p.clone().quality(Quality::Hd)),
            Ok("black-forest-labs/flux-1.1-pro")
        );
        assert_eq!(
            select_model(ProviderId::Fal, MediaKind::Video, &p.reference("https://x/y.png")),
            Ok("fal-ai/kling-video/v2/master/image-to-video")
        );
    }

    #[test]
    fn override_must_be_offered_at_the_same_price() {
        let p = with_model("black-forest-labs/flux-dev");
        assert_eq!(
            select_model(ProviderId::Replicate, MediaKind::Image, &p),
            Ok("black-forest-labs/flux-dev")
        );

        // an HD model at standard quality would be billed at the standard rate
        let p = with_model("black-forest-labs/flux-1.1-pro");
        assert_eq!(
            select_model(ProviderId::Replicate, MediaKind::Image, &p),
            Err(ModelError::NotOffered {
                provider: ProviderId::Replicate,
                kind: MediaKind::Image,
                model: "black-forest-labs/flux-1.1-pro".into(),
            })
        );
        assert!(select_model(ProviderId::Replicate, MediaKind::Image, &p.quality(Quality::Hd)).is_ok());

        assert!(matches!(
            select_model(ProviderId::TaskApi, MediaKind::Video, &with_model("video-premium")),
            Err(ModelError::NotOffered { .. })
        ));
    }

    #[test]
    fn missing_route_is_reported() {
        assert_eq!(
            select_model(ProviderId::Replicate, MediaKind::Video, &GenerationParams::default()),
            Err(ModelError::NoRoute {
                provider: ProviderId::Replicate,
                kind: MediaKind::Video
            })
        );
    }
}
