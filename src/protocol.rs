//! Wire protocol of the music WebSocket.
//!
//! Messages are JSON objects of the form `{"type": ..., "data": ...}` in
//! both directions. Inbound messages are parsed into [`InboundMessage`] and
//! dispatched through a single exhaustive match; outbound user intent is
//! serialized from [`OutboundMessage`].
//!
//! `STATE_UPDATE` payloads are partial by design: any of `current`, `queue`
//! and `controls` may be absent, in which case the existing state is kept.
//! An explicit `"current": null` means "nothing playing" and clears the
//! now-playing track, which is why [`StateUpdate::current`] is a doubled
//! `Option`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{formats::Flexible, serde_as, DurationMilliSeconds};
use url::Url;

/// Messages received from the playback service.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InboundMessage {
    /// Handshake acknowledgment carrying the heartbeat cadence.
    #[serde(rename = "HELLO")]
    Hello(Hello),

    /// Authoritative player state, merged into the local snapshot.
    #[serde(rename = "STATE_UPDATE")]
    StateUpdate(StateUpdate),

    /// Server-side failure surfaced to the session as a connection error.
    #[serde(rename = "ERROR")]
    ServerError(ServerError),
}

/// Messages sent to the playback service.
///
/// Command variants carry no local effect; the authoritative state only
/// changes when the next `STATE_UPDATE` arrives.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboundMessage {
    /// Client handshake, sent immediately after the transport opens.
    #[serde(rename = "HELLO")]
    Hello {},

    /// Heartbeat, sent at the cadence advertised by [`Hello`].
    #[serde(rename = "PING")]
    Ping {},

    #[serde(rename = "PLAY")]
    Play {},

    #[serde(rename = "PAUSE")]
    Pause {},

    #[serde(rename = "SKIP")]
    Skip {},

    #[serde(rename = "SEEK")]
    Seek {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        position: Duration,
    },

    #[serde(rename = "VOLUME")]
    Volume { volume: u8 },

    #[serde(rename = "SHUFFLE")]
    Shuffle {},

    #[serde(rename = "REPEAT")]
    Repeat { mode: RepeatMode },
}

/// Handshake acknowledgment data.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Hello {
    /// Interval at which the client must send `PING` messages.
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    pub heartbeat_interval: Duration,
}

/// Server-side error data.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerError {
    pub message: String,
}

/// Partial player state pushed by the service.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StateUpdate {
    /// Now-playing track. Absent: keep the existing track. `null`: nothing
    /// is playing, clear it.
    #[serde(default, deserialize_with = "some_if_present")]
    pub current: Option<Option<TrackUpdate>>,

    /// Upcoming tracks in play order, replacing the queue wholesale.
    #[serde(default)]
    pub queue: Option<Vec<QueueEntry>>,

    /// Playback controls; fields not present are kept.
    #[serde(default)]
    pub controls: Option<ControlsUpdate>,
}

/// Now-playing track as sent on the wire. Times are in milliseconds.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct TrackUpdate {
    pub title: String,
    pub artist: String,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    #[serde(default)]
    pub duration: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    #[serde(default)]
    pub position: Duration,
    #[serde(default)]
    pub thumbnail: Option<Url>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub is_playing: bool,
}

/// Queued track as sent on the wire.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct QueueEntry {
    pub title: String,
    pub artist: String,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    #[serde(default)]
    pub duration: Duration,
    #[serde(default)]
    pub thumbnail: Option<Url>,
    #[serde(default)]
    pub uri: Option<String>,
}

/// Playback controls as sent on the wire.
///
/// Unlike the track fields, these are camelCase on the wire.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlsUpdate {
    pub volume: Option<u8>,
    pub is_playing: Option<bool>,
    pub repeat: Option<RepeatMode>,
    pub shuffle: Option<bool>,
}

/// Repeat mode of the player.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Deserializes a present-but-possibly-null field into `Some(Option<T>)`,
/// letting `#[serde(default)]` supply `None` when the field is absent.
fn some_if_present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}
