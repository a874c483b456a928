/// A typed engagement fact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngagementKind {
    Like,
    Repost,
    Play,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Repost => "repost",
            Self::Play => "play",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "repost" => Some(Self::Repost),
            "play" => Some(Self::Play),
            _ => None,
        }
    }
}

/// Kind of a derived artist-to-artist relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtistRelationKind {
    /// Tracks by both artists appear in the same playlist.
    Collaboration,
    /// Tracks by both artists appear in the same user's liked library.
    CoLibrary,
}

impl ArtistRelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collaboration => "collaboration",
            Self::CoLibrary => "co_library",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collaboration" => Some(Self::Collaboration),
            "co_library" => Some(Self::CoLibrary),
            _ => None,
        }
    }
}

/// Data for inserting or updating a track (harvest phase).
#[derive(Debug, Clone, Default)]
pub struct NewTrack {
    pub track_id: i64,
    pub title: String,
    pub artist_id: Option<i64>,
    pub artist_name: Option<String>,
    pub genre: Option<String>,
    pub tag_list: Option<String>,
    pub description: Option<String>,
    pub label_name: Option<String>,
    pub duration_ms: Option<i64>,
    pub playback_count: Option<i64>,
    pub like_count: Option<i64>,
    pub repost_count: Option<i64>,
    pub permalink_url: Option<String>,
    /// Opaque provenance: the raw API payload as serialized JSON.
    pub raw_json: Option<String>,
}

/// A track row read from the store.
#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub track_id: i64,
    pub title: String,
    pub artist_id: Option<i64>,
    pub artist_name: Option<String>,
    pub genre: Option<String>,
    pub description: Option<String>,
    pub label_name: Option<String>,
    pub playback_count: Option<i64>,
    pub like_count: Option<i64>,
    pub permalink_url: Option<String>,
}

/// Data for inserting or updating a user (harvest phase).
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub user_id: i64,
    pub username: String,
    pub permalink_url: Option<String>,
    pub followers_count: Option<i64>,
    pub followings_count: Option<i64>,
    pub verified: Option<bool>,
    pub raw_json: Option<String>,
}

/// A user row read from the store.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    pub followers_count: Option<i64>,
    pub verified: bool,
}

/// Data for inserting or updating a playlist (harvest phase).
#[derive(Debug, Clone, Default)]
pub struct NewPlaylist {
    pub playlist_id: i64,
    pub title: String,
    pub creator_user_id: Option<i64>,
    pub track_count: Option<i64>,
    pub tag_list: Option<String>,
    pub permalink_url: Option<String>,
    pub raw_json: Option<String>,
}

/// A user who engaged with a track.
#[derive(Debug, Clone, Copy)]
pub struct Engager {
    pub user_id: i64,
    pub kind: EngagementKind,
}

/// One side of a derived user-similarity row, seen from a given user.
#[derive(Debug, Clone)]
pub struct SimilarUser {
    pub user_id: i64,
    pub metric: String,
    pub score: f64,
    pub evidence_count: i64,
}

/// One side of a derived artist relationship, seen from a given artist.
#[derive(Debug, Clone)]
pub struct RelatedArtist {
    pub artist_id: i64,
    pub kind: ArtistRelationKind,
    pub strength: f64,
    pub evidence_count: i64,
}

/// One side of a derived co-occurrence row, seen from a given track.
#[derive(Debug, Clone, Copy)]
pub struct CooccurringTrack {
    pub track_id: i64,
    pub together_count: i64,
    pub weight: f64,
}

/// Row counts across the store, for the `stats` command.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub tracks: i64,
    pub users: i64,
    pub playlists: i64,
    pub memberships: i64,
    pub engagements: i64,
    pub follows: i64,
    pub user_similarities: i64,
    pub artist_relationships: i64,
    pub track_cooccurrences: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engagement_kind_round_trip() {
        for kind in [
            EngagementKind::Like,
            EngagementKind::Repost,
            EngagementKind::Play,
        ] {
            assert_eq!(EngagementKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EngagementKind::parse("dislike"), None);
    }

    #[test]
    fn test_artist_relation_kind_round_trip() {
        for kind in [
            ArtistRelationKind::Collaboration,
            ArtistRelationKind::CoLibrary,
        ] {
            assert_eq!(ArtistRelationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ArtistRelationKind::parse("remix"), None);
    }
}
