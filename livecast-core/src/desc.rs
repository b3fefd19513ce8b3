//! Session description model.
//!
//! A [`Session`] is an ordered list of [`Media`]s, each carrying one or more
//! codec [`Format`]s. Streams on the bus are described by a `Session`;
//! readers register callbacks against (media, format) pairs by index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Codec format carried by a media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    H264 {
        payload_type: u8,
        sps: Vec<u8>,
        pps: Vec<u8>,
        packetization_mode: u8,
    },
    H265 {
        payload_type: u8,
        vps: Vec<u8>,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    Opus {
        payload_type: u8,
        channels: u8,
    },
    Aac {
        payload_type: u8,
        sample_rate: u32,
        channels: u8,
    },
}

impl Format {
    #[must_use]
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::H264 { payload_type, .. }
            | Self::H265 { payload_type, .. }
            | Self::Opus { payload_type, .. }
            | Self::Aac { payload_type, .. } => *payload_type,
        }
    }

    /// RTP clock rate in Hz.
    #[must_use]
    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::H264 { .. } | Self::H265 { .. } => 90_000,
            Self::Opus { .. } => 48_000,
            Self::Aac { sample_rate, .. } => *sample_rate,
        }
    }

    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::H264 { .. } => "video/H264",
            Self::H265 { .. } => "video/H265",
            Self::Opus { .. } => "audio/opus",
            Self::Aac { .. } => "audio/mpeg4-generic",
        }
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        matches!(self, Self::H264 { .. } | Self::H265 { .. })
    }
}

/// A single media section: one kind, one or more formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub media_type: MediaType,
    pub formats: Vec<Format>,
}

/// Ordered list of medias describing a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub medias: Vec<Media>,
}

impl Session {
    /// First media of the given kind, with its index.
    #[must_use]
    pub fn find_media(&self, kind: MediaType) -> Option<(usize, &Media)> {
        self.medias
            .iter()
            .enumerate()
            .find(|(_, m)| m.media_type == kind)
    }

    /// First H.264 format in the first video media.
    #[must_use]
    pub fn first_h264(&self) -> Option<(usize, usize, &Format)> {
        self.find_format(MediaType::Video, |f| matches!(f, Format::H264 { .. }))
    }

    /// First Opus format in the first audio media.
    #[must_use]
    pub fn first_opus(&self) -> Option<(usize, usize, &Format)> {
        self.find_format(MediaType::Audio, |f| matches!(f, Format::Opus { .. }))
    }

    fn find_format(
        &self,
        kind: MediaType,
        pred: impl Fn(&Format) -> bool,
    ) -> Option<(usize, usize, &Format)> {
        let (mi, media) = self.find_media(kind)?;
        media
            .formats
            .iter()
            .enumerate()
            .find(|(_, f)| pred(f))
            .map(|(fi, f)| (mi, fi, f))
    }

    /// Short human-readable summary, e.g. `video/H264, audio/opus`.
    #[must_use]
    pub fn medias_info(&self) -> String {
        self.medias
            .iter()
            .flat_map(|m| m.formats.iter().map(Format::mime_type))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264() -> Format {
        Format::H264 {
            payload_type: 96,
            sps: vec![0x67, 0x42],
            pps: vec![0x68],
            packetization_mode: 1,
        }
    }

    #[test]
    fn test_find_first_formats() {
        let desc = Session {
            medias: vec![
                Media {
                    media_type: MediaType::Video,
                    formats: vec![h264()],
                },
                Media {
                    media_type: MediaType::Audio,
                    formats: vec![Format::Opus {
                        payload_type: 97,
                        channels: 2,
                    }],
                },
            ],
        };

        let (mi, fi, f) = desc.first_h264().unwrap();
        assert_eq!((mi, fi), (0, 0));
        assert_eq!(f.clock_rate(), 90_000);

        let (mi, fi, f) = desc.first_opus().unwrap();
        assert_eq!((mi, fi), (1, 0));
        assert_eq!(f.clock_rate(), 48_000);
    }

    #[test]
    fn test_missing_media() {
        let desc = Session {
            medias: vec![Media {
                media_type: MediaType::Video,
                formats: vec![h264()],
            }],
        };
        assert!(desc.first_opus().is_none());
        assert_eq!(desc.medias_info(), "video/H264");
    }
}
