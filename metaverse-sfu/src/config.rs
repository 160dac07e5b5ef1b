//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::{RtpCodecCapability, TransportOptions};
use crate::types::MediaKind;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Number of media workers (0 = one per CPU core)
    pub num_workers: usize,
    /// Maximum routers hosted by a single worker (0 = unlimited)
    pub max_routers_per_worker: usize,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Bound on every media engine call and on the create -> connect exchange
    pub negotiation_timeout_secs: u64,
    /// Silence on the signaling channel after which a peer is treated as departed
    pub peer_timeout_secs: u64,
    /// Interval between server pings on the signaling channel
    pub heartbeat_interval_secs: u64,
    /// Codecs offered by every router
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_routers_per_worker: 0,
            max_rooms: 0,
            max_peers_per_room: 50,
            negotiation_timeout_secs: 30,
            peer_timeout_secs: 60,
            heartbeat_interval_secs: 20,
            media_codecs: default_media_codecs(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Worker pool size, resolving 0 to the number of CPU cores
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        }
    }

    /// Collect every configuration problem at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.negotiation_timeout_secs == 0 {
            errors.push("sfu.negotiation_timeout_secs must be greater than 0".to_string());
        }
        if self.peer_timeout_secs == 0 {
            errors.push("sfu.peer_timeout_secs must be greater than 0".to_string());
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_interval_secs >= self.peer_timeout_secs {
            errors.push(
                "sfu.heartbeat_interval_secs must be greater than 0 and below sfu.peer_timeout_secs"
                    .to_string(),
            );
        }
        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must list at least one codec".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Network settings handed to the media engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local address transports listen on
    pub listen_ip: String,
    /// Public address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Bits per second
    pub max_incoming_bitrate: u32,
    /// Bits per second
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 20000,
            rtc_max_port: 20200,
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl MediaConfig {
    /// Settings every WebRTC transport is created with
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            max_incoming_bitrate: self.max_incoming_bitrate,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.listen_ip.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("media.listen_ip is not an IP address: {}", self.listen_ip));
        }
        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "media RTC port range is invalid: {}-{}",
                self.rtc_min_port, self.rtc_max_port
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        MediaConfig::default().transport_options()
    }
}

/// Opus audio and VP8 video
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
            preferred_payload_type: None,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Map::new(),
            preferred_payload_type: None,
        },
    ]
}
