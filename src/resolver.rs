//! Best-effort track enrichment: artwork, lyrics, and artist info.
//!
//! Playback titles come from the streaming source and carry labels like
//! `(Official Video)` or `[Remix]` that break lookups, so queries are
//! normalized through a fixed set of cleanup patterns first. Results are
//! cached process-wide under the normalized `"title::artist"` key, with a
//! `None` sentinel for failed lookups so a known-bad key is not retried for
//! the rest of the session. Concurrent lookups for one key share a single
//! in-flight request.
//!
//! Everything here is cosmetic: errors are logged and swallowed, and callers
//! fall back to whatever the playback service supplied.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use regex_lite::Regex;
use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationMilliSeconds};
use tokio::sync::OnceCell;
use url::Url;

use crate::{config::Config, error::Result, http};

/// Label patterns stripped from titles before lookups, so that trivially
/// different labels for the same track share a cache entry.
const CLEANUP_PATTERNS: &[&str] = &[
    r"\[.*?\]",
    r"\(from .*?\)",
    r"\(Official.*?\)",
    r"\(feat\..*?\)",
    r"\(ft\..*?\)",
    r"\(Explicit\)",
    r"\(Official Video\)",
    r"\(Audio\)",
    r"\(Lyrics\)",
];

fn cleanup_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CLEANUP_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("invalid cleanup pattern"))
            .collect()
    })
}

/// Strips label noise from a title/artist pair.
///
/// Titles of the form `"Artist - Title"` additionally override the artist,
/// matching what the lookup services expect.
#[must_use]
pub fn clean_query(title: &str, artist: &str) -> (String, String) {
    let mut clean_title = title.to_owned();
    for pattern in cleanup_patterns() {
        clean_title = pattern.replace_all(&clean_title, "").into_owned();
    }

    let mut clean_artist = artist.to_owned();
    let split = clean_title
        .split_once(" - ")
        .map(|(artist_part, title_part)| (artist_part.to_owned(), title_part.to_owned()));
    if let Some((artist_part, title_part)) = split {
        if !title_part.trim().is_empty() {
            clean_artist = artist_part;
            clean_title = title_part;
        }
    }

    (
        clean_title.trim().to_owned(),
        clean_artist.trim().to_owned(),
    )
}

/// Cache key identifying a track across cosmetic label differences.
#[must_use]
pub fn track_key(title: &str, artist: &str) -> String {
    let (title, artist) = clean_query(title, artist);
    format!("{}::{}", title.to_lowercase(), artist.to_lowercase())
}

/// Keyed cache where concurrent resolutions for one key share a single
/// in-flight future.
///
/// Entries never expire; negative results are stored like any other value.
#[derive(Clone, Default)]
pub(crate) struct Cache<T> {
    slots: Arc<Mutex<HashMap<String, Arc<OnceCell<T>>>>>,
}

impl<T: Clone> Cache<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the cached value for `key`, or resolves it with `fetch`.
    ///
    /// The lock guards only the slot map; `fetch` runs outside it. A second
    /// caller for the same key awaits the first caller's future instead of
    /// spawning its own.
    pub async fn get_or_resolve<F, Fut>(&self, key: &str, fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };

        cell.get_or_init(fetch).await.clone()
    }
}

fn shared_artwork_cache() -> Cache<Option<Url>> {
    static CACHE: OnceLock<Cache<Option<Url>>> = OnceLock::new();
    CACHE.get_or_init(Cache::new).clone()
}

fn shared_lyrics_cache() -> Cache<Option<Arc<LyricsResult>>> {
    static CACHE: OnceLock<Cache<Option<Arc<LyricsResult>>>> = OnceLock::new();
    CACHE.get_or_init(Cache::new).clone()
}

fn shared_artist_cache() -> Cache<Option<Arc<ArtistInfo>>> {
    static CACHE: OnceLock<Cache<Option<Arc<ArtistInfo>>>> = OnceLock::new();
    CACHE.get_or_init(Cache::new).clone()
}

/// Resolves track enrichment data from the Evict lookup endpoints.
///
/// Cheap to clone; clones share the HTTP client and the process-wide caches.
#[derive(Clone)]
pub struct Resolver {
    http: Arc<http::Client>,
    api_url: Url,
    artwork: Cache<Option<Url>>,
    lyrics: Cache<Option<Arc<LyricsResult>>>,
    artists: Cache<Option<Arc<ArtistInfo>>>,
}

impl Resolver {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: Arc::new(http::Client::new(config)?),
            api_url: config.api_url.clone(),
            artwork: shared_artwork_cache(),
            lyrics: shared_lyrics_cache(),
            artists: shared_artist_cache(),
        })
    }

    /// Best-effort cover art lookup.
    ///
    /// Returns `None` when the lookup fails or finds nothing; the caller
    /// keeps the server-supplied thumbnail in that case.
    pub async fn artwork(&self, title: &str, artist: &str) -> Option<Url> {
        let key = track_key(title, artist);
        self.artwork
            .get_or_resolve(&key, || self.fetch_artwork(title, artist))
            .await
    }

    /// Synchronized lyrics for a track, fetched on demand.
    pub async fn lyrics(&self, title: &str, artist: &str) -> Option<Arc<LyricsResult>> {
        let key = track_key(title, artist);
        self.lyrics
            .get_or_resolve(&key, || self.fetch_lyrics(title, artist))
            .await
    }

    /// Extended artist metadata for a track, fetched on demand.
    pub async fn artist_info(&self, title: &str, artist: &str) -> Option<Arc<ArtistInfo>> {
        let key = track_key(title, artist);
        self.artists
            .get_or_resolve(&key, || self.fetch_artist_info(title, artist))
            .await
    }

    fn lookup_url(&self, path: &str) -> Option<Url> {
        match self.api_url.join(path) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("invalid lookup url for {path}: {e}");
                None
            }
        }
    }

    async fn fetch_json<T>(&self, url: Url) -> Option<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let path = url.path().to_owned();
        let response = match self.http.get(url).await {
            Ok(response) => response,
            Err(e) => {
                debug!("lookup {path} failed: {e}");
                return None;
            }
        };

        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(e) => {
                debug!("lookup {path} failed: {e}");
                return None;
            }
        };

        match response.json::<T>().await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!("lookup {path} returned malformed body: {e}");
                None
            }
        }
    }

    async fn fetch_artwork(&self, title: &str, artist: &str) -> Option<Url> {
        let (clean_title, clean_artist) = clean_query(title, artist);

        let mut url = self.lookup_url("api/deezer/search")?;
        url.query_pairs_mut()
            .append_pair("q", &format!("{clean_title} {clean_artist}"));

        let results: DeezerSearchResponse = self.fetch_json(url).await?;
        let cover = results
            .data
            .into_iter()
            .next()
            .and_then(|track| track.album)
            .and_then(|album| album.cover_big);

        if cover.is_none() {
            debug!("no artwork found for {clean_title} by {clean_artist}");
        }
        cover
    }

    async fn fetch_lyrics(&self, title: &str, artist: &str) -> Option<Arc<LyricsResult>> {
        let (clean_title, clean_artist) = clean_query(title, artist);

        let mut url = self.lookup_url("api/listen/lyrics")?;
        url.query_pairs_mut()
            .append_pair("title", &clean_title)
            .append_pair("artist", &clean_artist);

        let response: LyricsResponse = self.fetch_json(url).await?;
        let entry = response.results.into_iter().next()?;
        if entry.lyrics.is_empty() {
            debug!("no lyrics found for {clean_title} by {clean_artist}");
            return None;
        }

        Some(Arc::new(LyricsResult {
            lines: entry
                .lyrics
                .into_iter()
                .map(|line| LyricLine {
                    text: line.line,
                    offset: line.milliseconds,
                })
                .collect(),
            rich_sync: entry.rich_sync.map(|lines| {
                lines
                    .into_iter()
                    .map(|line| RichSyncLine {
                        start: line.start_time,
                        end: line.end_time,
                        text: line.text,
                        words: line
                            .words
                            .into_iter()
                            .map(|word| RichSyncWord {
                                text: word.char,
                                offset: word.offset,
                            })
                            .collect(),
                    })
                    .collect()
            }),
            author: entry.author,
            source: entry.source,
        }))
    }

    async fn fetch_artist_info(&self, title: &str, artist: &str) -> Option<Arc<ArtistInfo>> {
        let (clean_title, clean_artist) = clean_query(title, artist);

        let mut url = self.lookup_url("api/song")?;
        url.query_pairs_mut()
            .append_pair("title", &clean_title)
            .append_pair("artist", &clean_artist);

        let response: SongResponse = self.fetch_json(url).await?;
        let artist = response.artist?;

        Some(Arc::new(ArtistInfo {
            name: artist.name,
            listeners: artist.listeners,
            tags: artist.tags,
            summary: artist.bio.and_then(|bio| bio.summary),
        }))
    }
}

/// Synchronized lyrics for one track. Immutable once fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LyricsResult {
    /// Lyric lines with their offsets from the start of the track.
    pub lines: Vec<LyricLine>,

    /// Word-level timing, when the lyrics provider has it.
    pub rich_sync: Option<Vec<RichSyncLine>>,

    pub author: Option<String>,
    pub source: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LyricLine {
    pub text: String,
    pub offset: Duration,
}

/// A lyric line with per-word timing for karaoke-style rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RichSyncLine {
    pub start: Duration,
    pub end: Duration,
    pub text: String,

    /// Words with offsets relative to the start of the line.
    pub words: Vec<RichSyncWord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RichSyncWord {
    pub text: String,
    pub offset: Duration,
}

impl LyricsResult {
    /// Index of the line active at `position`, or `None` before the first
    /// line starts.
    #[must_use]
    pub fn line_at(&self, position: Duration) -> Option<usize> {
        self.lines.iter().rposition(|line| line.offset <= position)
    }
}

/// Extended artist metadata. All fields are best-effort.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtistInfo {
    pub name: Option<String>,
    pub listeners: Option<u64>,
    pub tags: Vec<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerSearchResponse {
    #[serde(default)]
    data: Vec<DeezerTrack>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    album: Option<DeezerAlbum>,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    cover_big: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct LyricsResponse {
    #[serde(default)]
    results: Vec<LyricsEntry>,
}

#[derive(Debug, Deserialize)]
struct LyricsEntry {
    #[serde(default)]
    lyrics: Vec<WireLyricLine>,
    #[serde(rename = "richSync")]
    rich_sync: Option<Vec<WireRichSyncLine>>,
    author: Option<String>,
    source: Option<String>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct WireLyricLine {
    line: String,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    milliseconds: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRichSyncLine {
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    start_time: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    end_time: Duration,
    text: String,
    #[serde(default)]
    words: Vec<WireRichSyncWord>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct WireRichSyncWord {
    char: String,
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    offset: Duration,
}

#[derive(Debug, Deserialize)]
struct SongResponse {
    artist: Option<WireArtist>,
}

#[derive(Debug, Deserialize)]
struct WireArtist {
    name: Option<String>,
    listeners: Option<u64>,
    #[serde(default)]
    tags: Vec<String>,
    bio: Option<WireArtistBio>,
}

#[derive(Debug, Deserialize)]
struct WireArtistBio {
    summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_clean_query_strips_labels() {
        let (title, artist) = clean_query("Song (Official Video)", "Artist");
        assert_eq!(title, "Song");
        assert_eq!(artist, "Artist");

        let (title, _) = clean_query("Song [HD Remaster]", "Artist");
        assert_eq!(title, "Song");

        let (title, _) = clean_query("Song (feat. Guest)", "Artist");
        assert_eq!(title, "Song");

        let (title, _) = clean_query("Song (from the motion picture)", "Artist");
        assert_eq!(title, "Song");
    }

    #[test]
    fn test_clean_query_splits_artist_prefix() {
        let (title, artist) = clean_query("Some Artist - Some Song", "uploader");
        assert_eq!(title, "Some Song");
        assert_eq!(artist, "Some Artist");
    }

    #[test]
    fn test_track_key_is_normalized() {
        assert_eq!(track_key("A", "X"), "a::x");
        assert_eq!(
            track_key("Song (Official Video)", "Artist"),
            track_key("Song (Lyrics)", "Artist")
        );
    }

    #[tokio::test]
    async fn test_cache_deduplicates_inflight_lookups() {
        let cache: Cache<Option<String>> = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some("cover".to_owned())
            }
        };
        let fast = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("other".to_owned())
            }
        };

        let (first, second) = tokio::join!(
            cache.get_or_resolve("song::artist", slow),
            cache.get_or_resolve("song::artist", fast),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cache_keeps_negative_results() {
        let cache: Cache<Option<String>> = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                None
            }
        };
        assert_eq!(cache.get_or_resolve("bad::key", failing).await, None);

        // A later caller must not retry the lookup.
        let retry = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("cover".to_owned())
            }
        };
        assert_eq!(cache.get_or_resolve("bad::key", retry).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_separates_keys() {
        let cache: Cache<Option<String>> = Cache::new();

        let a = cache
            .get_or_resolve("a::x", || async { Some("a".to_owned()) })
            .await;
        let b = cache
            .get_or_resolve("b::y", || async { Some("b".to_owned()) })
            .await;

        assert_eq!(a.as_deref(), Some("a"));
        assert_eq!(b.as_deref(), Some("b"));
    }

    #[test]
    fn test_line_at_returns_active_line() {
        let lyrics = LyricsResult {
            lines: vec![
                LyricLine {
                    text: "first".to_owned(),
                    offset: Duration::from_secs(1),
                },
                LyricLine {
                    text: "second".to_owned(),
                    offset: Duration::from_secs(5),
                },
            ],
            rich_sync: None,
            author: None,
            source: None,
        };

        assert_eq!(lyrics.line_at(Duration::ZERO), None);
        assert_eq!(lyrics.line_at(Duration::from_secs(1)), Some(0));
        assert_eq!(lyrics.line_at(Duration::from_secs(4)), Some(0));
        assert_eq!(lyrics.line_at(Duration::from_secs(30)), Some(1));
    }
}
