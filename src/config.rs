//! Configuration
//!
//! Statically typed configuration for both ends of the protocol. All structs deserialize from TOML
//! with per-field defaults, and must pass `validate()` before use.

use std::fs;
use std::net;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::frame::serial::{CHUNK_SIZE_MIN, DATAGRAM_SIZE_MAX};

const CHUNK_SIZE_DEFAULT: u32 = 30_000;
const TOTAL_FRAMES_DEFAULT: u32 = 300;
const QUALITY_LADDER_DEFAULT: [u32; 6] = [100_001, 150_001, 200_001, 230_001, 250_001, 300_001];
const LOOKAHEAD_WINDOW_SECS_DEFAULT: u32 = 5;

const FRAME_RATE_DEFAULT: u32 = 5;
const PLAYBACK_SPEED_DEFAULT: f64 = 1.8;
const REBUFFER_THRESHOLD_DEFAULT: u32 = 1;
const INITIAL_DELAY_MS_DEFAULT: u64 = 1_000;
const TICK_INTERVAL_MS_DEFAULT: u64 = 1_000;

const SESSION_COUNT_MAX_DEFAULT: usize = 1024;

const LINK_DELAY_MS_DEFAULT: u64 = 5;
const LINK_QUEUE_LIMIT_MS_DEFAULT: u64 = 100;

const SERVER_PORT_DEFAULT: u16 = 5000;

fn invalid<T>(msg: String) -> Result<T> {
    Err(Error::Config(msg))
}

/// Stream parameters both ends must agree on.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Size of every datagram, and the unit frames are split into.
    ///
    /// Minimum value: 64 \
    /// Maximum value: 65,507 \
    /// Default value: 30,000
    pub chunk_size: u32,

    /// Number of frames in the stream.
    ///
    /// Default value: 300
    pub total_frames: u32,

    /// Per-frame byte size of each quality level, lowest first. Must be strictly increasing.
    pub quality_ladder: Vec<u32>,

    /// Length of the server's send window, in playback ticks.
    ///
    /// Default value: 5
    pub lookahead_window_secs: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE_DEFAULT,
            total_frames: TOTAL_FRAMES_DEFAULT,
            quality_ladder: QUALITY_LADDER_DEFAULT.to_vec(),
            lookahead_window_secs: LOOKAHEAD_WINDOW_SECS_DEFAULT,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        let chunk_size = self.chunk_size as usize;

        if chunk_size < CHUNK_SIZE_MIN || chunk_size > DATAGRAM_SIZE_MAX {
            return invalid(format!(
                "chunk_size {} outside [{}, {}]",
                chunk_size, CHUNK_SIZE_MIN, DATAGRAM_SIZE_MAX
            ));
        }
        if self.total_frames == 0 {
            return invalid("total_frames == 0".into());
        }
        if self.lookahead_window_secs == 0 {
            return invalid("lookahead_window_secs == 0".into());
        }
        if self.quality_ladder.is_empty() {
            return invalid("quality_ladder is empty".into());
        }
        if self.quality_ladder[0] == 0 {
            return invalid("quality_ladder contains a zero-sized level".into());
        }
        if self.quality_ladder.windows(2).any(|pair| pair[0] >= pair[1]) {
            return invalid("quality_ladder is not strictly increasing".into());
        }

        Ok(())
    }
}

/// Client playback parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Ladder level to start at.
    ///
    /// Default value: 0
    pub initial_level: usize,

    /// Nominal frames per second of the video.
    ///
    /// Default value: 5
    pub frame_rate: u32,

    /// Playback speed multiplier. Frames consumed per tick are `frame_rate * playback_speed`,
    /// truncated.
    ///
    /// Default value: 1.8
    pub playback_speed: f64,

    /// Consecutive underrun ticks before the level is stepped down.
    ///
    /// Minimum value: 1 \
    /// Default value: 1
    pub rebuffer_threshold: u32,

    /// Delay before the first playback tick, in milliseconds.
    ///
    /// Default value: 1,000
    pub initial_delay_ms: u64,

    /// Length of one playback tick, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub tick_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_level: 0,
            frame_rate: FRAME_RATE_DEFAULT,
            playback_speed: PLAYBACK_SPEED_DEFAULT,
            rebuffer_threshold: REBUFFER_THRESHOLD_DEFAULT,
            initial_delay_ms: INITIAL_DELAY_MS_DEFAULT,
            tick_interval_ms: TICK_INTERVAL_MS_DEFAULT,
        }
    }
}

impl PlaybackConfig {
    /// Frames consumed per playback tick.
    pub fn consumption_rate(&self) -> u32 {
        (self.frame_rate as f64 * self.playback_speed) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.playback_speed > 0.0) || !self.playback_speed.is_finite() {
            return invalid(format!("playback_speed {} is not positive", self.playback_speed));
        }
        if self.consumption_rate() == 0 {
            return invalid("frame_rate * playback_speed < 1".into());
        }
        if self.rebuffer_threshold == 0 {
            return invalid("rebuffer_threshold == 0".into());
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms == 0".into());
        }

        Ok(())
    }
}

/// Configuration for a [`Client`](crate::Client) or a simulated client.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub stream: StreamConfig,
    pub playback: PlaybackConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        self.playback.validate()?;

        if self.playback.initial_level >= self.stream.quality_ladder.len() {
            return invalid(format!(
                "initial_level {} outside ladder of {} levels",
                self.playback.initial_level,
                self.stream.quality_ladder.len()
            ));
        }

        Ok(())
    }
}

/// Configuration for a [`Server`](crate::Server) or a simulated server.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub stream: StreamConfig,

    /// Maximum number of client sessions tracked at any given time.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,024
    pub session_count_max: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            session_count_max: SESSION_COUNT_MAX_DEFAULT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;

        if self.session_count_max == 0 {
            return invalid("session_count_max == 0".into());
        }

        Ok(())
    }
}

/// Characteristics of a simulated link. Applies independently to each direction.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// One-way propagation delay, in milliseconds.
    ///
    /// Default value: 5
    pub delay_ms: u64,

    /// Maximum extra random delay per datagram, in milliseconds. Non-zero values reorder.
    ///
    /// Default value: 0
    pub jitter_ms: u64,

    /// Probability that a datagram is dropped.
    ///
    /// Default value: 0.0
    pub loss_rate: f64,

    /// Serialization rate in bits per second. Unlimited when absent.
    pub bandwidth_bps: Option<u64>,

    /// Drop-tail limit on the transmit backlog, in milliseconds. Only applies with a bandwidth.
    ///
    /// Default value: 100
    pub queue_limit_ms: u64,

    /// Seed for loss and jitter decisions.
    ///
    /// Default value: 0
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            delay_ms: LINK_DELAY_MS_DEFAULT,
            jitter_ms: 0,
            loss_rate: 0.0,
            bandwidth_bps: None,
            queue_limit_ms: LINK_QUEUE_LIMIT_MS_DEFAULT,
            seed: 0,
        }
    }
}

impl LinkConfig {
    /// A link which delivers everything after a fixed delay.
    pub fn ideal(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return invalid(format!("loss_rate {} outside [0, 1]", self.loss_rate));
        }
        if self.bandwidth_bps == Some(0) {
            return invalid("bandwidth_bps == 0".into());
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: net::SocketAddr,
    pub session_count_max: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: (net::Ipv4Addr::UNSPECIFIED, SERVER_PORT_DEFAULT).into(),
            session_count_max: SESSION_COUNT_MAX_DEFAULT,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_addr: net::SocketAddr,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_addr: (net::Ipv4Addr::LOCALHOST, SERVER_PORT_DEFAULT).into(),
        }
    }
}

/// Whole-file settings, as read by the binaries.
///
/// ```toml
/// [stream]
/// chunk_size = 30000
/// total_frames = 300
/// quality_ladder = [100001, 150001, 200001, 230001, 250001, 300001]
///
/// [playback]
/// rebuffer_threshold = 2
///
/// [server]
/// bind_addr = "0.0.0.0:5000"
///
/// [link]
/// bandwidth_bps = 10000000
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stream: StreamConfig,
    pub playback: PlaybackConfig,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub link: LinkConfig,
}

impl Settings {
    /// Reads settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let data = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;

        Self::parse(&data)
    }

    /// Parses and validates settings from TOML text.
    pub fn parse(data: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(data).map_err(|e| Error::Config(format!("invalid settings: {}", e)))?;

        settings.client_config().validate()?;
        settings.server_config().validate()?;
        settings.link.validate()?;

        Ok(settings)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            stream: self.stream.clone(),
            playback: self.playback.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            stream: self.stream.clone(),
            session_count_max: self.server.session_count_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
        LinkConfig::default().validate().unwrap();

        assert_eq!(PlaybackConfig::default().consumption_rate(), 9);
    }

    #[test]
    fn rejects_bad_ladder() {
        let mut config = StreamConfig::default();

        config.quality_ladder = vec![];
        assert!(config.validate().is_err());

        config.quality_ladder = vec![200, 100];
        assert!(config.validate().is_err());

        config.quality_ladder = vec![100, 100];
        assert!(config.validate().is_err());

        config.quality_ladder = vec![0, 100];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let mut config = StreamConfig::default();

        config.chunk_size = 16;
        assert!(config.validate().is_err());

        config.chunk_size = 65_508;
        assert!(config.validate().is_err());

        config.chunk_size = 65_507;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_initial_level_outside_ladder() {
        let mut config = ClientConfig::default();
        config.playback.initial_level = 6;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_consumption() {
        let mut config = PlaybackConfig::default();
        config.frame_rate = 1;
        config.playback_speed = 0.5;

        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_partial_settings() {
        let settings = Settings::parse(
            r#"
            [stream]
            chunk_size = 1000
            total_frames = 60
            quality_ladder = [2000, 4000]

            [playback]
            rebuffer_threshold = 3
            tick_interval_ms = 100

            [server]
            bind_addr = "127.0.0.1:6000"

            [link]
            bandwidth_bps = 10000000
            loss_rate = 0.01
            "#,
        )
        .unwrap();

        assert_eq!(settings.stream.chunk_size, 1000);
        assert_eq!(settings.stream.lookahead_window_secs, 5);
        assert_eq!(settings.playback.rebuffer_threshold, 3);
        assert_eq!(settings.playback.consumption_rate(), 9);
        assert_eq!(settings.server.bind_addr.port(), 6000);
        assert_eq!(settings.client.server_addr.port(), 5000);
        assert_eq!(settings.link.bandwidth_bps, Some(10_000_000));
        assert_eq!(settings.server_config().stream.total_frames, 60);
    }

    #[test]
    fn parse_rejects_invalid_values() {
        assert!(Settings::parse("[stream]\ntotal_frames = 0\n").is_err());
        assert!(Settings::parse("[link]\nloss_rate = 1.5\n").is_err());
        assert!(Settings::parse("[stream]\nchunk_size = \"big\"\n").is_err());
    }
}
