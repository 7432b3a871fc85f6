//! Local and remote media descriptions
//!
//! Capture and rendering live outside this crate. A [`MediaSource`] only
//! names the outgoing tracks and their kinds; the peer connection
//! implementation binds them to whatever actually produces samples.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a local track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 12-character id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One outgoing track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    /// Human-readable origin, e.g. "camera" or "screen"
    pub label: String,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::generate(),
            kind,
            label: label.into(),
        }
    }

    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(MediaKind::Audio, label)
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self::new(MediaKind::Video, label)
    }
}

/// The set of tracks a participant is sending; at most one per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSource {
    tracks: Vec<LocalTrack>,
}

impl MediaSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track, replacing any existing track of the same kind
    #[must_use]
    pub fn with_track(mut self, track: LocalTrack) -> Self {
        self.tracks.retain(|t| t.kind != track.kind);
        self.tracks.push(track);
        self.tracks.sort_by_key(|t| t.kind);
        self
    }

    /// Microphone plus camera
    #[must_use]
    pub fn camera() -> Self {
        Self::new()
            .with_track(LocalTrack::audio("microphone"))
            .with_track(LocalTrack::video("camera"))
    }

    /// Screen capture plus microphone
    #[must_use]
    pub fn screen_share() -> Self {
        Self::new()
            .with_track(LocalTrack::audio("microphone"))
            .with_track(LocalTrack::video("screen"))
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    #[must_use]
    pub fn kinds(&self) -> BTreeSet<MediaKind> {
        self.tracks.iter().map(|t| t.kind).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// A track received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Everything received from the peer so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSource {
    tracks: Vec<RemoteTrack>,
}

impl RemoteSource {
    /// Record a track; a repeat of a known track id replaces the old entry
    pub fn insert(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn kinds(&self) -> BTreeSet<MediaKind> {
        self.tracks.iter().map(|t| t.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_track_keeps_one_per_kind() {
        let source = MediaSource::camera().with_track(LocalTrack::video("screen"));
        assert_eq!(source.tracks().len(), 2);
        assert_eq!(
            source.track(MediaKind::Video).map(|t| t.label.as_str()),
            Some("screen")
        );
    }

    #[test]
    fn test_kinds() {
        let audio_only = MediaSource::new().with_track(LocalTrack::audio("mic"));
        assert_eq!(
            audio_only.kinds().into_iter().collect::<Vec<_>>(),
            vec![MediaKind::Audio]
        );
        assert_eq!(MediaSource::camera().kinds().len(), 2);
        assert!(MediaSource::new().is_empty());
    }

    #[test]
    fn test_remote_source_insert_dedups() {
        let mut remote = RemoteSource::default();
        let track = RemoteTrack {
            id: "t1".into(),
            stream_id: "s1".into(),
            kind: MediaKind::Audio,
        };
        remote.insert(track.clone());
        remote.insert(track);
        assert_eq!(remote.tracks().len(), 1);
    }
}
