//! Events emitted while a guild music session is running.
//!
//! These let headless consumers react to connection and playback changes
//! without polling the state snapshot. They are emitted by the session
//! driver in the order the underlying changes were observed.

/// Events that can be emitted by a running session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The WebSocket connection to the playback service is established.
    Connected,

    /// The connection was lost or closed. A reconnect may follow; watch the
    /// connection status for the terminal outcome.
    Disconnected,

    /// The now-playing track changed.
    TrackChanged {
        title: String,
        artist: String,
    },

    /// Playback resumed.
    Play,

    /// Playback paused.
    Pause,
}
