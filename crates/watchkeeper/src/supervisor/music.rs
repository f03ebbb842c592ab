//! Music now-playing sampler.
//!
//! The external player drops status files into a directory; this loop
//! publishes `music.*` state and emits transition events: play/pause edges
//! and track changes while playing.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use watchkeeper_db::{EventContext, StateWrite};
use watchkeeper_protocol::types::NewEvent;

use super::{tick, Shutdown};
use crate::runtime::Runtime;

pub const EVENT_MUSIC_STARTED: &str = "MUSIC_STARTED";
pub const EVENT_MUSIC_STOPPED: &str = "MUSIC_STOPPED";
pub const EVENT_TRACK_CHANGED: &str = "TRACK_CHANGED";

const SOURCE: &str = "music_supervisor";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NowPlaying {
    pub title: String,
    pub artist: String,
    pub playing: bool,
}

#[derive(Default)]
struct MusicState {
    previous: Option<NowPlaying>,
}

pub async fn run(rt: Arc<Runtime>, mut shutdown: Shutdown) {
    let mut state = MusicState::default();
    loop {
        if let Err(err) = cycle(&rt, &mut state).await {
            warn!(error = %err, "music cycle failed");
        }
        let cadence = if state
            .previous
            .as_ref()
            .map(|p| p.playing)
            .unwrap_or(false)
        {
            rt.config.music_active
        } else {
            rt.config.music_idle
        };
        if !tick(&mut shutdown, cadence).await {
            break;
        }
    }
}

/// Read the player's status directory.
pub fn sample(dir: &Path) -> NowPlaying {
    let read = |name: &str| -> String {
        std::fs::read_to_string(dir.join(name))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let title = read("title.txt");
    let artist = read("artist.txt");
    let playing_raw = read("playing.txt").to_ascii_lowercase();
    let mut playing = matches!(playing_raw.as_str(), "1" | "true" | "yes" | "on" | "playing");
    // A visible track implies playback even when the flag file lags.
    if !playing && (!title.is_empty() || !artist.is_empty()) {
        playing = true;
    }
    NowPlaying {
        title,
        artist,
        playing,
    }
}

fn now_playing_text(now: &NowPlaying) -> String {
    [now.title.as_str(), now.artist.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" - ")
}

async fn cycle(rt: &Arc<Runtime>, state: &mut MusicState) -> anyhow::Result<()> {
    let now = sample(&rt.config.music_dir);
    let correlation = Uuid::new_v4().to_string();

    rt.db
        .batch_set_state(
            vec![
                StateWrite::new("music.track.title", json!(now.title), SOURCE),
                StateWrite::new("music.track.artist", json!(now.artist), SOURCE),
                StateWrite::new("music.playing", json!(now.playing), SOURCE),
                StateWrite::new("music.now_playing", json!(now_playing_text(&now)), SOURCE),
            ],
            EventContext {
                correlation_id: Some(correlation.clone()),
                source: Some(SOURCE.to_string()),
                ..Default::default()
            },
        )
        .await?;

    if let Some(previous) = &state.previous {
        if previous.playing != now.playing {
            rt.db
                .append_event(
                    NewEvent::new(
                        if now.playing { EVENT_MUSIC_STARTED } else { EVENT_MUSIC_STOPPED },
                        SOURCE,
                        json!({
                            "playing": now.playing,
                            "track_title": now.title,
                            "track_artist": now.artist,
                        }),
                    )
                    .correlation(correlation.clone())
                    .tags(["music"]),
                )
                .await?;
        }

        if now.playing && (previous.title != now.title || previous.artist != now.artist) {
            rt.db
                .append_event(
                    NewEvent::new(
                        EVENT_TRACK_CHANGED,
                        SOURCE,
                        json!({
                            "previous_title": previous.title,
                            "previous_artist": previous.artist,
                            "title": now.title,
                            "artist": now.artist,
                        }),
                    )
                    .correlation(correlation)
                    .tags(["music", "track"]),
                )
                .await?;
        }
    }

    state.previous = Some(now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sample_reads_status_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("title.txt"), "Cornfield Chase\n").unwrap();
        std::fs::write(tmp.path().join("artist.txt"), "Hans Zimmer").unwrap();
        std::fs::write(tmp.path().join("playing.txt"), "true").unwrap();

        let now = sample(tmp.path());
        assert_eq!(now.title, "Cornfield Chase");
        assert_eq!(now.artist, "Hans Zimmer");
        assert!(now.playing);
    }

    #[test]
    fn visible_track_implies_playing() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("title.txt"), "Interstellar").unwrap();
        let now = sample(tmp.path());
        assert!(now.playing);
    }

    #[test]
    fn empty_dir_reads_idle() {
        let tmp = TempDir::new().unwrap();
        let now = sample(tmp.path());
        assert!(!now.playing);
        assert!(now.title.is_empty());
    }
}
