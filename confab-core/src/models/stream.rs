use serde::{Deserialize, Serialize};

/// Underlying media kind as the SFU understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Semantic category of a track.
///
/// The set is closed: downstream consumer maps are keyed by this enum, never
/// by free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Audio,
    Video,
    Screen,
    ScreenAudio,
    ScreenVideo,
    Ar,
    Drawing,
    Detection,
}

impl StreamKind {
    /// Map the semantic kind onto the SFU media kind.
    #[must_use]
    pub const fn media_kind(self) -> MediaKind {
        match self {
            Self::Audio | Self::ScreenAudio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    /// Kinds that participate in active-speaker ranking.
    #[must_use]
    pub const fn is_speaker_audio(self) -> bool {
        matches!(self, Self::Audio | Self::ScreenAudio)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
            Self::ScreenAudio => "screenAudio",
            Self::ScreenVideo => "screenVideo",
            Self::Ar => "ar",
            Self::Drawing => "drawing",
            Self::Detection => "detection",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
