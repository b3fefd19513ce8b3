//! Per-path configuration records and validation.
//!
//! Loaded by the host's configuration layer; every record here is plain
//! serde data with defaults, validated once at path initialisation. The
//! literal token `$MTX_PATH` inside any target URL is replaced with the
//! owning path name before connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token replaced with the owning path name in target URLs.
pub const PATH_VAR: &str = "$MTX_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("target URL is empty")]
    EmptyUrl,

    #[error("invalid SRT URL '{url}': {reason}")]
    InvalidSrtUrl { url: String, reason: String },

    #[error("invalid WHIP URL '{url}': {reason}")]
    InvalidWhipUrl { url: String, reason: String },

    #[error("reconnect enabled but reconnect delay is zero for '{0}'")]
    ZeroReconnectDelay(String),

    #[error("simulcast input '{0}' missing a path")]
    EmptyInputPath(String),

    #[error("transcoding output '{path}': {reason}")]
    InvalidOutput { path: String, reason: String },
}

/// Replace `$MTX_PATH` in a URL with the owning path name.
#[must_use]
pub fn expand_path_vars(url: &str, path_name: &str) -> String {
    url.replace(PATH_VAR, path_name)
}

/// SRT forward target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtForwardTarget {
    pub url: String,
    pub enable: bool,
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    /// Total reconnect window in milliseconds; 0 = unbounded.
    pub max_reconnect_time_ms: u64,
    pub passphrase: Option<String>,
    /// SRT receiver latency in milliseconds; 0 = default (120 ms).
    pub latency_ms: u64,
    /// UDP payload size in octets; 0 = default (1316).
    pub packet_size: usize,
}

impl Default for SrtForwardTarget {
    fn default() -> Self {
        Self {
            url: String::new(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 2000,
            max_reconnect_time_ms: 0,
            passphrase: None,
            latency_ms: 0,
            packet_size: 0,
        }
    }
}

impl SrtForwardTarget {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidSrtUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "srt" {
            return Err(ConfigError::InvalidSrtUrl {
                url: self.url.clone(),
                reason: format!("scheme must be srt, got {}", parsed.scheme()),
            });
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidSrtUrl {
                url: self.url.clone(),
                reason: "missing host".into(),
            });
        }
        if self.reconnect && self.reconnect_delay_ms == 0 {
            return Err(ConfigError::ZeroReconnectDelay(self.url.clone()));
        }
        Ok(())
    }
}

/// WHIP (WebRTC) forward target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcForwardTarget {
    pub url: String,
    pub enable: bool,
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    /// Optional TLS certificate fingerprint pin (hex SHA-256).
    pub fingerprint: Option<String>,
}

impl Default for WebRtcForwardTarget {
    fn default() -> Self {
        Self {
            url: String::new(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 2000,
            fingerprint: None,
        }
    }
}

impl WebRtcForwardTarget {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidWhipUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::InvalidWhipUrl {
                url: self.url.clone(),
                reason: format!("scheme must be http or https, got {}", parsed.scheme()),
            });
        }
        if !parsed.path().ends_with("/whip") {
            return Err(ConfigError::InvalidWhipUrl {
                url: self.url.clone(),
                reason: "path must end with /whip".into(),
            });
        }
        if self.reconnect && self.reconnect_delay_ms == 0 {
            return Err(ConfigError::ZeroReconnectDelay(self.url.clone()));
        }
        Ok(())
    }
}

/// Simulcast quality layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    High,
    Medium,
    Low,
}

impl Layer {
    /// RID (restriction identifier) advertised for this layer.
    #[must_use]
    pub const fn rid(&self) -> &'static str {
        match self {
            Self::High => "h",
            Self::Medium => "m",
            Self::Low => "l",
        }
    }
}

/// One simulcast input path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulcastInput {
    pub path: String,
    pub layer: Layer,
    #[serde(default)]
    pub resolution: String,
    /// Bitrate hint in bps.
    #[serde(default)]
    pub bitrate: u64,
    #[serde(rename = "type")]
    pub media_type: crate::desc::MediaType,
}

/// Simulcast aggregation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulcastConfig {
    pub enable: bool,
    /// Rewrite audio SSRCs like video ones. Off by default; receivers have
    /// not been shown to require it.
    pub rewrite_audio_ssrc: bool,
    pub inputs: Vec<SimulcastInput>,
}

impl SimulcastConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for input in &self.inputs {
            if input.path.is_empty() {
                return Err(ConfigError::EmptyInputPath(format!("{:?}", input.layer)));
            }
        }
        Ok(())
    }
}

/// Transcoding output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingVideoParams {
    /// `WIDTHxHEIGHT`, e.g. `854x480`.
    pub resolution: String,
    /// Bitrate in bps.
    pub bitrate: u64,
    pub framerate: u32,
    /// x264 preset, e.g. `veryfast`.
    pub preset: String,
}

impl Default for TranscodingVideoParams {
    fn default() -> Self {
        Self {
            resolution: "1280x720".into(),
            bitrate: 1_500_000,
            framerate: 30,
            preset: "veryfast".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingAudioParams {
    /// Bitrate in bps.
    pub bitrate: u64,
    pub samplerate: u32,
    pub channels: u8,
}

impl Default for TranscodingAudioParams {
    fn default() -> Self {
        Self {
            bitrate: 64_000,
            samplerate: 48_000,
            channels: 2,
        }
    }
}

/// One transcoding output, republished as a sibling path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingOutput {
    /// Sibling path name the output is published on.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub video: Option<TranscodingVideoParams>,
    #[serde(default)]
    pub audio: Option<TranscodingAudioParams>,
}

impl TranscodingOutput {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.is_empty() {
            return Err(ConfigError::InvalidOutput {
                path: "<empty>".into(),
                reason: "output path is empty".into(),
            });
        }
        match self.kind {
            OutputKind::Video if self.video.is_none() => Err(ConfigError::InvalidOutput {
                path: self.path.clone(),
                reason: "video output requires video parameters".into(),
            }),
            OutputKind::Audio if self.audio.is_none() => Err(ConfigError::InvalidOutput {
                path: self.path.clone(),
                reason: "audio output requires audio parameters".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Transcoding configuration for a path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    pub enable: bool,
    pub outputs: Vec<TranscodingOutput>,
}

impl TranscodingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for output in &self.outputs {
            output.validate()?;
        }
        Ok(())
    }
}

/// Extension configuration attached to a host path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub srt_forward_targets: Vec<SrtForwardTarget>,
    pub webrtc_forward_targets: Vec<WebRtcForwardTarget>,
    pub simulcast: SimulcastConfig,
    pub transcoding: TranscodingConfig,
}

impl PathConfig {
    /// Validate every record; called once at path initialisation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for t in &self.srt_forward_targets {
            t.validate()?;
        }
        for t in &self.webrtc_forward_targets {
            t.validate()?;
        }
        self.simulcast.validate()?;
        self.transcoding.validate()?;
        Ok(())
    }
}

/// Logging configuration (host-wide).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file_path: None,
        }
    }
}

/// Host-wide settings this extension consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Write deadline applied to outbound network writes, in milliseconds.
    pub write_timeout_ms: u64,
    /// Maximum UDP payload used to size MPEG-TS bursts.
    pub udp_max_payload_size: usize,
    /// Per-reader dispatch queue depth.
    pub write_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            write_timeout_ms: 10_000,
            udp_max_payload_size: 1472,
            write_queue_size: 256,
        }
    }
}

impl Config {
    /// Load from an optional YAML file plus `LIVECAST_*` environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::with_name(p));
        }
        builder
            .add_source(config::Environment::with_prefix("LIVECAST").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_vars() {
        assert_eq!(
            expand_path_vars("srt://sink:8890?streamid=publish:$MTX_PATH", "live/foo"),
            "srt://sink:8890?streamid=publish:live/foo"
        );
        assert_eq!(expand_path_vars("srt://sink:8890", "live/foo"), "srt://sink:8890");
    }

    #[test]
    fn test_srt_target_validation() {
        let mut t = SrtForwardTarget {
            url: "srt://sink:8890?streamid=publish:live/s".into(),
            ..Default::default()
        };
        assert!(t.validate().is_ok());

        t.url = String::new();
        assert!(matches!(t.validate(), Err(ConfigError::EmptyUrl)));

        t.url = "rtmp://sink/app".into();
        assert!(matches!(t.validate(), Err(ConfigError::InvalidSrtUrl { .. })));

        t.url = "srt://sink:8890".into();
        t.reconnect = true;
        t.reconnect_delay_ms = 0;
        assert!(matches!(t.validate(), Err(ConfigError::ZeroReconnectDelay(_))));
    }

    #[test]
    fn test_whip_target_validation() {
        let mut t = WebRtcForwardTarget {
            url: "https://sink/live/whip".into(),
            ..Default::default()
        };
        assert!(t.validate().is_ok());

        t.url = "https://sink/live/whep".into();
        assert!(matches!(t.validate(), Err(ConfigError::InvalidWhipUrl { .. })));

        t.url = "ftp://sink/whip".into();
        assert!(matches!(t.validate(), Err(ConfigError::InvalidWhipUrl { .. })));
    }

    #[test]
    fn test_transcoding_output_validation() {
        let out = TranscodingOutput {
            path: "live/in-480p".into(),
            kind: OutputKind::Video,
            video: Some(TranscodingVideoParams::default()),
            audio: None,
        };
        assert!(out.validate().is_ok());

        let out = TranscodingOutput {
            path: "live/in-480p".into(),
            kind: OutputKind::Video,
            video: None,
            audio: None,
        };
        assert!(out.validate().is_err());
    }

    #[test]
    fn test_layer_rid() {
        assert_eq!(Layer::High.rid(), "h");
        assert_eq!(Layer::Medium.rid(), "m");
        assert_eq!(Layer::Low.rid(), "l");
    }
}
