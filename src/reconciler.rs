//! Merges inbound `STATE_UPDATE`s into the canonical [`PlayerState`].
//!
//! The reconciler is the single writer of the player state. It never trusts
//! local guesses over the server: command methods elsewhere do not mutate
//! state optimistically, and an authoritative update always wins over the
//! local position interpolation because both run on the session driver's
//! single task.

use std::time::Duration;

use url::Url;

use crate::{
    events::Event,
    player::{Controls, PlayerState, QueuedTrack, TrackSnapshot},
    protocol::StateUpdate,
    resolver::track_key,
};

/// Result of applying one state update.
#[derive(Debug, Default)]
pub(crate) struct UpdateOutcome {
    /// Set when the now-playing track identity changed; the driver kicks off
    /// artwork resolution for it.
    pub track_change: Option<TrackChange>,

    /// Playback transitions observed in this update, in order.
    pub events: Vec<Event>,
}

/// Identity of a newly observed track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TrackChange {
    /// Normalized `"title::artist"` key, also the stale-response guard.
    pub key: String,
    pub title: String,
    pub artist: String,
}

/// The single writer of [`PlayerState`].
#[derive(Debug, Default)]
pub struct Reconciler {
    state: PlayerState,

    /// Key of the last track that triggered enrichment. Kept across a
    /// `current: null` so a track paused into nothing and resumed does not
    /// re-trigger.
    last_key: Option<String>,
}

impl Reconciler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Read-only view of the canonical state.
    #[must_use]
    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    /// Merges an authoritative update into the state.
    ///
    /// Only fields present in the update are touched; `current: null`
    /// explicitly clears the now-playing track. Never fails: a partial or
    /// odd update merges what it can.
    pub(crate) fn apply_update(&mut self, update: StateUpdate) -> UpdateOutcome {
        let was_playing = self.state.controls.is_playing;

        match update.current {
            None => {}
            Some(None) => {
                self.state.current = None;
                self.state.controls.is_playing = false;
            }
            Some(Some(track)) => {
                let key = track_key(&track.title, &track.artist);
                let previous_key = self
                    .state
                    .current
                    .as_ref()
                    .map(|current| track_key(&current.title, &current.artist));

                // Keep locally-resolved artwork over the server default on
                // updates for the same track, so enrichment does not flicker
                // away on the next push.
                let artwork = if previous_key.as_deref() == Some(key.as_str()) {
                    self.state
                        .current
                        .as_ref()
                        .and_then(|current| current.artwork.clone())
                        .or(track.thumbnail)
                } else {
                    track.thumbnail
                };

                self.state.controls.is_playing = track.is_playing;
                self.state.current = Some(TrackSnapshot {
                    title: track.title,
                    artist: track.artist,
                    duration: track.duration,
                    position: track.position.min(track.duration),
                    artwork,
                    uri: track.uri,
                    is_playing: track.is_playing,
                });
            }
        }

        if let Some(queue) = update.queue {
            let current_key = self
                .state
                .current
                .as_ref()
                .map(|current| track_key(&current.title, &current.artist));
            self.state.queue = queue
                .into_iter()
                .filter(|entry| {
                    current_key.as_deref() != Some(track_key(&entry.title, &entry.artist).as_str())
                })
                .map(|entry| QueuedTrack {
                    title: entry.title,
                    artist: entry.artist,
                    duration: entry.duration,
                    artwork: entry.thumbnail,
                    uri: entry.uri,
                })
                .collect();
        }

        if let Some(controls) = update.controls {
            let Controls {
                volume,
                is_playing,
                repeat,
                shuffle,
            } = self.state.controls;
            self.state.controls = Controls {
                volume: controls.volume.map_or(volume, |v| v.min(100)),
                is_playing: controls.is_playing.unwrap_or(is_playing),
                repeat: controls.repeat.unwrap_or(repeat),
                shuffle: controls.shuffle.unwrap_or(shuffle),
            };
        }

        // The wire carries the playing flag in two places; controls win when
        // both are present, and the track mirrors the result.
        if let Some(current) = &mut self.state.current {
            current.is_playing = self.state.controls.is_playing;
        }

        let mut outcome = UpdateOutcome::default();
        if let Some(current) = &self.state.current {
            let key = track_key(&current.title, &current.artist);
            if self.last_key.as_deref() != Some(key.as_str()) {
                self.last_key = Some(key.clone());
                outcome.track_change = Some(TrackChange {
                    key,
                    title: current.title.clone(),
                    artist: current.artist.clone(),
                });
                outcome.events.push(Event::TrackChanged {
                    title: current.title.clone(),
                    artist: current.artist.clone(),
                });
            }
        }

        let is_playing = self.state.controls.is_playing;
        if is_playing != was_playing {
            outcome
                .events
                .push(if is_playing { Event::Play } else { Event::Pause });
        }

        outcome
    }

    /// Advances the local playback position by `elapsed`.
    ///
    /// Keeps the progress display moving between server pushes. Clamped to
    /// the track duration; the next authoritative update may set any
    /// position, including an earlier one.
    pub(crate) fn tick(&mut self, elapsed: Duration) {
        if !self.state.controls.is_playing {
            return;
        }

        if let Some(current) = &mut self.state.current {
            current.position = current.position.saturating_add(elapsed).min(current.duration);
        }
    }

    /// Applies a resolved artwork URL if the track it was resolved for is
    /// still the current one.
    ///
    /// Returns whether the state changed. `None` results leave the
    /// server-supplied thumbnail in place.
    pub(crate) fn apply_artwork(&mut self, key: &str, artwork: Option<Url>) -> bool {
        let Some(artwork) = artwork else {
            return false;
        };

        match &mut self.state.current {
            Some(current) if track_key(&current.title, &current.artist) == key => {
                current.artwork = Some(artwork);
                true
            }
            _ => {
                debug!("discarding stale artwork for {key}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlsUpdate, QueueEntry, RepeatMode, TrackUpdate};

    fn track(title: &str, artist: &str, playing: bool) -> TrackUpdate {
        TrackUpdate {
            title: title.to_owned(),
            artist: artist.to_owned(),
            duration: Duration::from_secs(200),
            position: Duration::ZERO,
            thumbnail: None,
            uri: None,
            is_playing: playing,
        }
    }

    fn update_with_current(track: TrackUpdate) -> StateUpdate {
        StateUpdate {
            current: Some(Some(track)),
            ..StateUpdate::default()
        }
    }

    #[test]
    fn test_track_change_triggers_enrichment_once() {
        let mut reconciler = Reconciler::new();

        let outcome = reconciler.apply_update(update_with_current(track("A", "X", true)));
        let change = outcome.track_change.expect("first update changes track");
        assert_eq!(change.key, "a::x");

        // Same track again: no new enrichment.
        let outcome = reconciler.apply_update(update_with_current(track("A", "X", true)));
        assert!(outcome.track_change.is_none());

        let outcome = reconciler.apply_update(update_with_current(track("B", "Y", true)));
        assert_eq!(outcome.track_change.unwrap().key, "b::y");
    }

    #[test]
    fn test_missing_controls_are_preserved() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(StateUpdate {
            controls: Some(ControlsUpdate {
                volume: Some(42),
                is_playing: Some(true),
                repeat: Some(RepeatMode::Track),
                shuffle: Some(true),
            }),
            ..StateUpdate::default()
        });

        // An update without controls must not reset them.
        reconciler.apply_update(update_with_current(track("A", "X", true)));

        let controls = reconciler.state().controls;
        assert_eq!(controls.volume, 42);
        assert_eq!(controls.repeat, RepeatMode::Track);
        assert!(controls.shuffle);
    }

    #[test]
    fn test_null_current_clears_track() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(update_with_current(track("A", "X", true)));
        assert!(reconciler.state().current.is_some());

        reconciler.apply_update(StateUpdate {
            current: Some(None),
            ..StateUpdate::default()
        });
        assert!(reconciler.state().current.is_none());
        assert!(!reconciler.state().controls.is_playing);
    }

    #[test]
    fn test_position_ticks_monotonically_and_clamps() {
        let mut reconciler = Reconciler::new();
        let mut update = track("A", "X", true);
        update.duration = Duration::from_secs(3);
        reconciler.apply_update(update_with_current(update));

        let mut last = Duration::ZERO;
        for _ in 0..5 {
            reconciler.tick(Duration::from_secs(1));
            let position = reconciler.state().current.as_ref().unwrap().position;
            assert!(position >= last);
            assert!(position <= Duration::from_secs(3));
            last = position;
        }
        assert_eq!(last, Duration::from_secs(3));
    }

    #[test]
    fn test_tick_only_advances_while_playing() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(update_with_current(track("A", "X", false)));

        reconciler.tick(Duration::from_secs(1));
        assert_eq!(
            reconciler.state().current.as_ref().unwrap().position,
            Duration::ZERO
        );
    }

    #[test]
    fn test_server_update_may_rewind_position() {
        let mut reconciler = Reconciler::new();
        let mut first = track("A", "X", true);
        first.position = Duration::from_secs(100);
        reconciler.apply_update(update_with_current(first));

        let mut seeked = track("A", "X", true);
        seeked.position = Duration::from_secs(10);
        reconciler.apply_update(update_with_current(seeked));

        assert_eq!(
            reconciler.state().current.as_ref().unwrap().position,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_position_is_clamped_to_duration_on_merge() {
        let mut reconciler = Reconciler::new();
        let mut update = track("A", "X", true);
        update.duration = Duration::from_secs(100);
        update.position = Duration::from_secs(500);
        reconciler.apply_update(update_with_current(update));

        assert_eq!(
            reconciler.state().current.as_ref().unwrap().position,
            Duration::from_secs(100)
        );
    }

    #[test]
    fn test_stale_artwork_is_discarded() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(update_with_current(track("A", "X", true)));
        reconciler.apply_update(update_with_current(track("B", "Y", true)));

        // Track A's enrichment resolves after the move to track B.
        let stale = Url::parse("https://cdn.example.com/a.jpg").unwrap();
        assert!(!reconciler.apply_artwork("a::x", Some(stale)));
        assert!(reconciler.state().current.as_ref().unwrap().artwork.is_none());

        let fresh = Url::parse("https://cdn.example.com/b.jpg").unwrap();
        assert!(reconciler.apply_artwork("b::y", Some(fresh.clone())));
        assert_eq!(
            reconciler.state().current.as_ref().unwrap().artwork,
            Some(fresh)
        );
    }

    #[test]
    fn test_resolved_artwork_survives_same_track_updates() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(update_with_current(track("A", "X", true)));

        let resolved = Url::parse("https://cdn.example.com/a.jpg").unwrap();
        assert!(reconciler.apply_artwork("a::x", Some(resolved.clone())));

        // The next server push carries its default thumbnail again.
        let mut same = track("A", "X", true);
        same.thumbnail = Some(Url::parse("https://img.example.com/default.jpg").unwrap());
        reconciler.apply_update(update_with_current(same));

        assert_eq!(
            reconciler.state().current.as_ref().unwrap().artwork,
            Some(resolved)
        );
    }

    #[test]
    fn test_queue_never_contains_current_track() {
        let mut reconciler = Reconciler::new();
        let update = StateUpdate {
            current: Some(Some(track("A", "X", true))),
            queue: Some(vec![
                QueueEntry {
                    title: "A".to_owned(),
                    artist: "X".to_owned(),
                    duration: Duration::from_secs(200),
                    thumbnail: None,
                    uri: None,
                },
                QueueEntry {
                    title: "B".to_owned(),
                    artist: "Y".to_owned(),
                    duration: Duration::from_secs(180),
                    thumbnail: None,
                    uri: None,
                },
            ]),
            controls: None,
        };
        reconciler.apply_update(update);

        let queue = &reconciler.state().queue;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].title, "B");
    }

    #[test]
    fn test_play_pause_events() {
        let mut reconciler = Reconciler::new();

        let outcome = reconciler.apply_update(update_with_current(track("A", "X", true)));
        assert!(outcome.events.contains(&Event::Play));

        let outcome = reconciler.apply_update(StateUpdate {
            controls: Some(ControlsUpdate {
                is_playing: Some(false),
                ..ControlsUpdate::default()
            }),
            ..StateUpdate::default()
        });
        assert_eq!(outcome.events, vec![Event::Pause]);

        // No transition, no event.
        let outcome = reconciler.apply_update(StateUpdate::default());
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(StateUpdate {
            controls: Some(ControlsUpdate {
                volume: Some(150),
                ..ControlsUpdate::default()
            }),
            ..StateUpdate::default()
        });

        assert_eq!(reconciler.state().controls.volume, 100);
    }

    #[test]
    fn test_empty_update_is_a_no_op() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_update(update_with_current(track("A", "X", true)));
        let before = reconciler.state().clone();

        reconciler.apply_update(StateUpdate::default());
        assert_eq!(reconciler.state(), &before);
    }
}
