//! Canonical player state for one guild session.
//!
//! [`PlayerState`] is the merged, UI-consumable view of the remote player.
//! It is owned and mutated exclusively by the
//! [`reconciler`](crate::reconciler); everything else receives clones
//! through the session's watch channel.

use std::time::Duration;

use url::Url;

use crate::protocol::RepeatMode;

/// Snapshot of the remote player for one guild.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerState {
    /// Now-playing track, `None` when nothing is playing.
    pub current: Option<TrackSnapshot>,

    /// Upcoming tracks in play order. Never contains the current track.
    pub queue: Vec<QueuedTrack>,

    /// Playback controls.
    pub controls: Controls,
}

/// The currently playing track.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackSnapshot {
    pub title: String,
    pub artist: String,

    /// Total track length.
    pub duration: Duration,

    /// Playback position, always within `[0, duration]`.
    pub position: Duration,

    /// Cover art, either server-supplied or locally enriched.
    pub artwork: Option<Url>,

    /// Source link of the track, when the service knows one.
    pub uri: Option<String>,

    pub is_playing: bool,
}

/// A track waiting in the queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedTrack {
    pub title: String,
    pub artist: String,
    pub duration: Duration,
    pub artwork: Option<Url>,
    pub uri: Option<String>,
}

/// Playback controls of the remote player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Controls {
    /// Volume in percent, `0..=100`.
    pub volume: u8,
    pub is_playing: bool,
    pub repeat: RepeatMode,
    pub shuffle: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            volume: 100,
            is_playing: false,
            repeat: RepeatMode::Off,
            shuffle: false,
        }
    }
}

impl TrackSnapshot {
    /// Remaining playback time of the track.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_idle() {
        let state = PlayerState::default();
        assert!(state.current.is_none());
        assert!(state.queue.is_empty());
        assert!(!state.controls.is_playing);
        assert_eq!(state.controls.volume, 100);
        assert_eq!(state.controls.repeat, RepeatMode::Off);
    }

    #[test]
    fn test_remaining_saturates() {
        let track = TrackSnapshot {
            title: "Song".to_owned(),
            artist: "Artist".to_owned(),
            duration: Duration::from_secs(100),
            position: Duration::from_secs(100),
            artwork: None,
            uri: None,
            is_playing: true,
        };
        assert_eq!(track.remaining(), Duration::ZERO);
    }
}
