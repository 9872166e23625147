use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatType {
    #[serde(rename = "mp4")]
    Video,
    #[serde(rename = "mp3")]
    AudioMp3,
    #[serde(rename = "wav")]
    AudioWav,
}

impl FormatType {
    pub const ALL: [FormatType; 3] = [
        FormatType::Video,
        FormatType::AudioMp3,
        FormatType::AudioWav,
    ];

    /// Accepts the form tokens `mp4`, `mp3` and `wav`, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Video),
            "mp3" => Some(Self::AudioMp3),
            "wav" => Some(Self::AudioWav),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::AudioMp3 => "mp3",
            Self::AudioWav => "wav",
        }
    }

    pub fn extension(self) -> &'static str {
        self.as_str()
    }
}

/// Quality hints are plain numbers with an optional `p` suffix (`720p`, `320`).
pub fn parse_quality(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    let digits = trimmed.strip_suffix(['p', 'P']).unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().filter(|value| *value > 0)
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
