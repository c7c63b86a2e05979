use serde::{Deserialize, Serialize};

use genforge_core::DomainError;

/// What a job produces. Drives pricing and post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Upscale,
    Logo,
    MultiAngleSet,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Upscale => "upscale",
            MediaKind::Logo => "logo",
            MediaKind::MultiAngleSet => "multi_angle_set",
        }
    }

    /// File extension used when the materialized asset is stored.
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Video => "mp4",
            _ => "png",
        }
    }

    /// Content type assumed when the asset host does not send one.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            MediaKind::Video => "video/mp4",
            _ => "image/png",
        }
    }
}

impl core::str::FromStr for MediaKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "upscale" => Ok(MediaKind::Upscale),
            "logo" => Ok(MediaKind::Logo),
            "multi_angle_set" => Ok(MediaKind::MultiAngleSet),
            other => Err(DomainError::validation(format!("unknown media kind: {other}"))),
        }
    }
}

impl core::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag of the third-party backend handling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Replicate,
    Fal,
    TaskApi,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Replicate, ProviderId::Fal, ProviderId::TaskApi];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Replicate => "replicate",
            ProviderId::Fal => "fal",
            ProviderId::TaskApi => "taskapi",
        }
    }
}

impl core::str::FromStr for ProviderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replicate" => Ok(ProviderId::Replicate),
            "fal" => Ok(ProviderId::Fal),
            "taskapi" => Ok(ProviderId::TaskApi),
            other => Err(DomainError::validation(format!("unknown provider: {other}"))),
        }
    }
}

impl core::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_back() {
        for p in ProviderId::ALL {
            assert_eq!(p.as_str().parse::<ProviderId>().unwrap(), p);
        }
        assert_eq!("multi_angle_set".parse::<MediaKind>().unwrap(), MediaKind::MultiAngleSet);
        assert!("gif".parse::<MediaKind>().is_err());
    }

    #[test]
    fn serde_uses_column_values() {
        assert_eq!(serde_json::to_string(&MediaKind::MultiAngleSet).unwrap(), "\"multi_angle_set\"");
        assert_eq!(serde_json::to_string(&ProviderId::TaskApi).unwrap(), "\"taskapi\"");
    }
}
