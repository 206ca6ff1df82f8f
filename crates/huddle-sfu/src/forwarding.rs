//! Forwarded track identity and the per-subscriber side-table.
//!
//! Every forwarded track knows exactly who published it. Cleanup selects
//! entries by comparing those fields, never by looking inside id strings.

use std::sync::Arc;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Identity of one forwarded copy of a publisher's remote track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardedTrackId {
    /// `<remote track id>-<publisher>`, as seen by subscribers in the SDP.
    pub track_id: String,
    /// `<remote stream id>-<publisher>`
    pub stream_id: String,
    pub publisher_id: String,
    /// Peer session of the publisher that produced the remote track.
    pub publisher_session: Uuid,
    pub remote_track_id: String,
}

impl ForwardedTrackId {
    pub fn new(
        publisher_id: &str,
        publisher_session: Uuid,
        remote_track_id: &str,
        remote_stream_id: &str,
    ) -> Self {
        Self {
            track_id: format!("{remote_track_id}-{publisher_id}"),
            stream_id: format!("{remote_stream_id}-{publisher_id}"),
            publisher_id: publisher_id.to_owned(),
            publisher_session,
            remote_track_id: remote_track_id.to_owned(),
        }
    }
}

/// A publisher's audio, re-served as a local track that any number of
/// subscribers can attach a sender to.
#[derive(Clone)]
pub struct ForwardedTrack {
    pub id: ForwardedTrackId,
    pub local: Arc<TrackLocalStaticRTP>,
}

impl std::fmt::Debug for ForwardedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedTrack").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub struct Subscription<S> {
    pub track: ForwardedTrackId,
    pub sender: S,
}

/// What one peer currently receives: forwarded track → the sender carrying it.
#[derive(Debug)]
pub struct Subscriptions<S> {
    entries: Vec<Subscription<S>>,
}

impl<S> Default for Subscriptions<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<S> Subscriptions<S> {
    pub fn contains(&self, track: &ForwardedTrackId) -> bool {
        self.entries.iter().any(|e| &e.track == track)
    }

    /// Returns `false` (and keeps the table unchanged) for a duplicate.
    pub fn insert(&mut self, track: ForwardedTrackId, sender: S) -> bool {
        if self.contains(&track) {
            return false;
        }
        self.entries.push(Subscription { track, sender });
        true
    }

    /// Take the sender of one specific forwarded track.
    pub fn remove_track(&mut self, track: &ForwardedTrackId) -> Vec<S> {
        self.remove_where(|t| t == track)
    }

    /// Take every sender carrying audio from one session of `publisher_id`.
    pub fn remove_publisher(&mut self, publisher_id: &str, session: Uuid) -> Vec<S> {
        self.remove_where(|t| t.publisher_id == publisher_id && t.publisher_session == session)
    }

    pub fn drain(&mut self) -> Vec<S> {
        self.entries.drain(..).map(|e| e.sender).collect()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &ForwardedTrackId> {
        self.entries.iter().map(|e| &e.track)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_where(&mut self, mut matches: impl FnMut(&ForwardedTrackId) -> bool) -> Vec<S> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if matches(&entry.track) {
                removed.push(entry.sender);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(publisher: &str, session: Uuid, remote: &str) -> ForwardedTrackId {
        ForwardedTrackId::new(publisher, session, remote, "stream")
    }

    #[test]
    fn ids_embed_the_publisher() {
        let id = track("alice", Uuid::nil(), "mic");
        assert_eq!(id.track_id, "mic-alice");
        assert_eq!(id.stream_id, "stream-alice");
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut subs = Subscriptions::default();
        let id = track("a", Uuid::nil(), "mic");
        assert!(subs.insert(id.clone(), 1));
        assert!(!subs.insert(id, 2));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn publisher_cleanup_does_not_touch_lookalike_ids() {
        // "mic-a" is a suffix of "mic-ba" and "a" is a prefix of "ab".
        let mut subs = Subscriptions::default();
        subs.insert(track("a", Uuid::nil(), "mic"), "from-a");
        subs.insert(track("ab", Uuid::nil(), "mic"), "from-ab");
        subs.insert(track("ba", Uuid::nil(), "mic"), "from-ba");

        assert_eq!(subs.remove_publisher("a", Uuid::nil()), vec!["from-a"]);
        let left: Vec<&str> = subs.tracks().map(|t| t.publisher_id.as_str()).collect();
        assert_eq!(left, vec!["ab", "ba"]);
    }

    #[test]
    fn track_cleanup_is_scoped_to_the_publishing_session() {
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let mut subs = Subscriptions::default();
        subs.insert(track("a", new, "mic"), "current");

        // Same remote track id, but from the session that was replaced.
        assert!(subs.remove_track(&track("a", old, "mic")).is_empty());
        assert_eq!(subs.remove_track(&track("a", new, "mic")), vec!["current"]);
        assert!(subs.is_empty());
    }
}
