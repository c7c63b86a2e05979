use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use genforge_core::{DomainError, DomainResult};

use crate::kind::MediaKind;

pub const MAX_COUNT: u32 = 8;
pub const MAX_DURATION_SECS: u32 = 60;
pub const DEFAULT_VIDEO_DURATION_SECS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "4k")]
    K4,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::K4 => "4k",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Standard,
    Hd,
}

/// Normalized request payload handed to a provider adapter.
///
/// Stored verbatim on the job. `extra` is passed through untouched so callers
/// can reach provider-specific knobs without widening this struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub audio: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale_factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl GenerationParams {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn reference(mut self, url: impl Into<String>) -> Self {
        self.reference_urls.push(url.into());
        self
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.audio = true;
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn upscale_factor(mut self, factor: u32) -> Self {
        self.upscale_factor = Some(factor);
        self
    }

    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }

    /// Number of outputs requested (images, angles). Defaults per kind.
    pub fn effective_count(&self, kind: MediaKind) -> u32 {
        match (self.count, kind) {
            (Some(n), _) => n,
            (None, MediaKind::MultiAngleSet) => 4,
            (None, _) => 1,
        }
    }

    pub fn effective_duration(&self) -> u32 {
        self.duration_secs.unwrap_or(DEFAULT_VIDEO_DURATION_SECS)
    }

    pub fn effective_quality(&self) -> Quality {
        self.quality.unwrap_or_default()
    }

    /// Reject requests no provider could fulfil.
    pub fn validate(&self, kind: MediaKind) -> DomainResult<()> {
        match kind {
            MediaKind::Upscale => {
                if self.reference_urls.is_empty() {
                    return Err(DomainError::validation("upscale requires a reference image"));
                }
                if let Some(f) = self.upscale_factor {
                    if f != 2 && f != 4 {
                        return Err(DomainError::validation(format!(
                            "upscale factor must be 2 or 4, got {f}"
                        )));
                    }
                }
            }
            _ => {
                if self.prompt.trim().is_empty() {
                    return Err(DomainError::validation("prompt must not be empty"));
                }
            }
        }

        if let Some(n) = self.count {
            if n == 0 || n > MAX_COUNT {
                return Err(DomainError::validation(format!(
                    "count must be between 1 and {MAX_COUNT}, got {n}"
                )));
            }
        }

        if let Some(d) = self.duration_secs {
            if d == 0 || d > MAX_DURATION_SECS {
                return Err(DomainError::validation(format!(
                    "duration must be between 1 and {MAX_DURATION_SECS}s, got {d}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_prompt_is_rejected() {
        let err = GenerationParams::with_prompt("   ").validate(MediaKind::Image).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn upscale_needs_reference_not_prompt() {
        assert!(GenerationParams::default().validate(MediaKind::Upscale).is_err());
        let ok = GenerationParams::default().reference("https://cdn.example/a.png");
        assert!(ok.validate(MediaKind::Upscale).is_ok());
        assert!(ok.clone().upscale_factor(3).validate(MediaKind::Upscale).is_err());
    }

    #[test]
    fn count_and_duration_bounds() {
        let p = GenerationParams::with_prompt("cat");
        assert!(p.clone().count(0).validate(MediaKind::Image).is_err());
        assert!(p.clone().count(MAX_COUNT + 1).validate(MediaKind::Image).is_err());
        assert!(p.clone().duration(0).validate(MediaKind::Video).is_err());
        assert!(p.clone().duration(61).validate(MediaKind::Video).is_err());
        assert!(p.duration(10).validate(MediaKind::Video).is_ok());
    }

    #[test]
    fn defaults_depend_on_kind() {
        let p = GenerationParams::with_prompt("shoe");
        assert_eq!(p.effective_count(MediaKind::MultiAngleSet), 4);
        assert_eq!(p.effective_count(MediaKind::Image), 1);
        assert_eq!(p.effective_duration(), DEFAULT_VIDEO_DURATION_SECS);
    }

    #[test]
    fn deserializes_sparse_payload() {
        let p: GenerationParams = serde_json::from_value(serde_json::json!({
            "prompt": "a fox",
            "resolution": "1080p",
            "quality": "hd",
            "seed": 7
        }))
        .unwrap();
        assert_eq!(p.resolution, Some(Resolution::P1080));
        assert_eq!(p.quality, Some(Quality::Hd));
        // unknown top-level fields are ignored, not captured
        assert!(p.extra.is_empty());
    }
}
