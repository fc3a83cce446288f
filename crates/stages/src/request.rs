//! Job request model
//!
//! The immutable input a client submits: a free-text prompt plus the video
//! settings. Every setting is a closed enumeration; unknown values are
//! rejected when the request is parsed, never later in the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use docmaker_common::{Error, Result};

/// Longest accepted prompt, in characters
pub const MAX_PROMPT_CHARS: usize = 4000;

/// A setting value outside its enumerated domain
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidSetting(String);

impl From<InvalidSetting> for Error {
    fn from(e: InvalidSetting) -> Self {
        Error::Validation(e.0)
    }
}

/// Target video length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum VideoDuration {
    Seconds30,
    #[default]
    Seconds60,
    Seconds180,
    Seconds300,
    Seconds600,
}

impl VideoDuration {
    pub const ALL: [VideoDuration; 5] = [
        Self::Seconds30,
        Self::Seconds60,
        Self::Seconds180,
        Self::Seconds300,
        Self::Seconds600,
    ];

    pub fn as_secs(&self) -> u32 {
        match self {
            Self::Seconds30 => 30,
            Self::Seconds60 => 60,
            Self::Seconds180 => 180,
            Self::Seconds300 => 300,
            Self::Seconds600 => 600,
        }
    }
}

impl TryFrom<u32> for VideoDuration {
    type Error = InvalidSetting;

    fn try_from(secs: u32) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_secs() == secs)
            .ok_or_else(|| {
                InvalidSetting(format!(
                    "Unsupported duration {}. Valid values: 30, 60, 180, 300, 600",
                    secs
                ))
            })
    }
}

impl From<VideoDuration> for u32 {
    fn from(d: VideoDuration) -> Self {
        d.as_secs()
    }
}

impl fmt::Display for VideoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.as_secs())
    }
}

/// Declares a string-valued settings enum with its wire names.
macro_rules! settings_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal, default = $default:ident,
        { $($variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = InvalidSetting;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(InvalidSetting(format!(
                        "Unknown {} '{}'. Valid values: {}",
                        $label,
                        other,
                        [$($wire),+].join(", ")
                    ))),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidSetting;

            fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> Self {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

settings_enum! {
    /// Visual treatment applied by the visual stage
    VisualStyle, "style", default = Cinematic,
    {
        Cinematic => "cinematic",
        Documentary => "documentary",
        Modern => "modern",
        Vintage => "vintage",
        Animated => "animated",
    }
}

settings_enum! {
    /// Background music category; `none` drops the audio mix stage
    MusicTrack, "music", default = Dramatic,
    {
        Dramatic => "dramatic",
        Uplifting => "uplifting",
        Ambient => "ambient",
        Epic => "epic",
        None => "none",
    }
}

settings_enum! {
    /// Narration voice
    VoiceProfile, "voice", default = Professional,
    {
        Professional => "professional",
        ProfessionalFemale => "professional-female",
        Narrator => "narrator",
        Young => "young",
        None => "none",
    }
}

/// Video settings chosen alongside the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoSettings {
    #[serde(default)]
    pub duration: VideoDuration,
    #[serde(default)]
    pub style: VisualStyle,
    #[serde(default)]
    pub music: MusicTrack,
    #[serde(default)]
    pub voice: VoiceProfile,
}

impl VideoSettings {
    pub fn has_music(&self) -> bool {
        self.music != MusicTrack::None
    }

    pub fn has_voice(&self) -> bool {
        self.voice != VoiceProfile::None
    }
}

/// Immutable job input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub prompt: String,
    pub settings: VideoSettings,
}

impl JobRequest {
    /// Create a validated request
    pub fn new(prompt: impl Into<String>, settings: VideoSettings) -> Result<Self> {
        let request = Self {
            prompt: prompt.into(),
            settings,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the prompt invariants
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::Validation("Prompt must not be empty".to_string()));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(Error::Validation(format!(
                "Prompt must be at most {} characters",
                MAX_PROMPT_CHARS
            )));
        }
        Ok(())
    }
}
