use std::collections::HashMap;

use rusqlite::{OptionalExtension, params};

use super::models::{
    ArtistRelationKind, CooccurringTrack, Engager, EngagementKind, NewPlaylist, NewTrack, NewUser,
    RelatedArtist, SimilarUser, StoreStats, TrackRecord, UserRecord,
};
use super::{DbError, Result, Store, canonical_pair};

impl Store {
    /// Insert or update a track. `fetched` marks the track itself as the
    /// subject of a successful fetch (bumps `fetched_at`); an embedded
    /// observation leaves the freshness timestamp alone.
    pub fn upsert_track(&self, t: &NewTrack, fetched: bool) -> Result<()> {
        if t.track_id <= 0 {
            return Err(DbError::MalformedKey(format!(
                "non-positive track id {}",
                t.track_id
            )));
        }
        self.lock().execute(
            "INSERT INTO tracks (
                track_id, title, artist_id, artist_name, genre, tag_list,
                description, label_name, duration_ms, playback_count,
                like_count, repost_count, permalink_url, raw_json, fetched_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                CASE WHEN ?15 THEN datetime('now') END
            )
            ON CONFLICT(track_id) DO UPDATE SET
                title = excluded.title,
                artist_id = COALESCE(excluded.artist_id, tracks.artist_id),
                artist_name = COALESCE(excluded.artist_name, tracks.artist_name),
                genre = COALESCE(excluded.genre, tracks.genre),
                tag_list = COALESCE(excluded.tag_list, tracks.tag_list),
                description = COALESCE(excluded.description, tracks.description),
                label_name = COALESCE(excluded.label_name, tracks.label_name),
                duration_ms = COALESCE(excluded.duration_ms, tracks.duration_ms),
                playback_count = COALESCE(excluded.playback_count, tracks.playback_count),
                like_count = COALESCE(excluded.like_count, tracks.like_count),
                repost_count = COALESCE(excluded.repost_count, tracks.repost_count),
                permalink_url = COALESCE(excluded.permalink_url, tracks.permalink_url),
                raw_json = COALESCE(excluded.raw_json, tracks.raw_json),
                fetched_at = CASE WHEN ?15 THEN datetime('now')
                             ELSE tracks.fetched_at END
            ",
            params![
                t.track_id,
                t.title,
                t.artist_id,
                t.artist_name,
                t.genre,
                t.tag_list,
                t.description,
                t.label_name,
                t.duration_ms,
                t.playback_count,
                t.like_count,
                t.repost_count,
                t.permalink_url,
                t.raw_json,
                fetched,
            ],
        )?;
        Ok(())
    }

    /// Insert or update a user. See [`Store::upsert_track`] for `fetched`.
    pub fn upsert_user(&self, u: &NewUser, fetched: bool) -> Result<()> {
        if u.user_id <= 0 {
            return Err(DbError::MalformedKey(format!(
                "non-positive user id {}",
                u.user_id
            )));
        }
        self.lock().execute(
            "INSERT INTO users (
                user_id, username, permalink_url, followers_count,
                followings_count, verified, raw_json, fetched_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                CASE WHEN ?8 THEN datetime('now') END
            )
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                permalink_url = COALESCE(excluded.permalink_url, users.permalink_url),
                followers_count = COALESCE(excluded.followers_count, users.followers_count),
                followings_count = COALESCE(excluded.followings_count, users.followings_count),
                verified = COALESCE(excluded.verified, users.verified),
                raw_json = COALESCE(excluded.raw_json, users.raw_json),
                fetched_at = CASE WHEN ?8 THEN datetime('now')
                             ELSE users.fetched_at END
            ",
            params![
                u.user_id,
                u.username,
                u.permalink_url,
                u.followers_count,
                u.followings_count,
                u.verified,
                u.raw_json,
                fetched,
            ],
        )?;
        Ok(())
    }

    /// Insert or update a playlist. See [`Store::upsert_track`] for `fetched`.
    pub fn upsert_playlist(&self, p: &NewPlaylist, fetched: bool) -> Result<()> {
        if p.playlist_id <= 0 {
            return Err(DbError::MalformedKey(format!(
                "non-positive playlist id {}",
                p.playlist_id
            )));
        }
        self.lock().execute(
            "INSERT INTO playlists (
                playlist_id, title, creator_user_id, track_count, tag_list,
                permalink_url, raw_json, fetched_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                CASE WHEN ?8 THEN datetime('now') END
            )
            ON CONFLICT(playlist_id) DO UPDATE SET
                title = excluded.title,
                creator_user_id = COALESCE(excluded.creator_user_id, playlists.creator_user_id),
                track_count = COALESCE(excluded.track_count, playlists.track_count),
                tag_list = COALESCE(excluded.tag_list, playlists.tag_list),
                permalink_url = COALESCE(excluded.permalink_url, playlists.permalink_url),
                raw_json = COALESCE(excluded.raw_json, playlists.raw_json),
                fetched_at = CASE WHEN ?8 THEN datetime('now')
                             ELSE playlists.fetched_at END
            ",
            params![
                p.playlist_id,
                p.title,
                p.creator_user_id,
                p.track_count,
                p.tag_list,
                p.permalink_url,
                p.raw_json,
                fetched,
            ],
        )?;
        Ok(())
    }

    /// Mark a user's library crawl as completed now.
    pub fn mark_user_fetched(&self, user_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE users SET fetched_at = datetime('now') WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Record an engagement fact, deduplicated on (user, track, kind).
    /// Returns true if the row is new.
    pub fn record_engagement(
        &self,
        user_id: i64,
        track_id: i64,
        kind: EngagementKind,
    ) -> Result<bool> {
        let n = self.lock().execute(
            "INSERT OR IGNORE INTO engagements (user_id, track_id, kind)
             VALUES (?1, ?2, ?3)",
            params![user_id, track_id, kind.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Record a directed follow fact, deduplicated on the ordered pair.
    pub fn record_follow(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        let n = self.lock().execute(
            "INSERT OR IGNORE INTO follows (follower_id, followee_id)
             VALUES (?1, ?2)",
            params![follower_id, followee_id],
        )?;
        Ok(n > 0)
    }

    /// Record playlist membership; re-observation refreshes the position.
    pub fn record_membership(&self, playlist_id: i64, track_id: i64, position: i64) -> Result<bool> {
        let n = self.lock().execute(
            "INSERT INTO playlist_tracks (playlist_id, track_id, position)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(playlist_id, track_id) DO UPDATE SET
                 position = excluded.position
                 WHERE playlist_tracks.position != excluded.position",
            params![playlist_id, track_id, position],
        )?;
        Ok(n > 0)
    }

    // ---- freshness ----

    pub fn is_track_fresh(&self, track_id: i64, ttl_hours: i64) -> Result<bool> {
        self.is_fresh("tracks", "track_id", track_id, ttl_hours)
    }

    pub fn is_user_fresh(&self, user_id: i64, ttl_hours: i64) -> Result<bool> {
        self.is_fresh("users", "user_id", user_id, ttl_hours)
    }

    pub fn is_playlist_fresh(&self, playlist_id: i64, ttl_hours: i64) -> Result<bool> {
        self.is_fresh("playlists", "playlist_id", playlist_id, ttl_hours)
    }

    fn is_fresh(&self, table: &str, key: &str, id: i64, ttl_hours: i64) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {table}
             WHERE {key} = ?1
               AND fetched_at IS NOT NULL
               AND datetime(fetched_at) > datetime('now', '-' || ?2 || ' hours')"
        );
        let found = self
            .lock()
            .query_row(&sql, params![id, ttl_hours], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    // ---- raw readers ----

    pub fn get_track(&self, track_id: i64) -> Result<Option<TrackRecord>> {
        let row = self
            .lock()
            .query_row(
                "SELECT track_id, title, artist_id, artist_name, genre,
                        description, label_name, playback_count, like_count,
                        permalink_url
                 FROM tracks WHERE track_id = ?1",
                params![track_id],
                |row| {
                    Ok(TrackRecord {
                        track_id: row.get(0)?,
                        title: row.get(1)?,
                        artist_id: row.get(2)?,
                        artist_name: row.get(3)?,
                        genre: row.get(4)?,
                        description: row.get(5)?,
                        label_name: row.get(6)?,
                        playback_count: row.get(7)?,
                        like_count: row.get(8)?,
                        permalink_url: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let row = self
            .lock()
            .query_row(
                "SELECT user_id, username, followers_count, COALESCE(verified, 0)
                 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        followers_count: row.get(2)?,
                        verified: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Users who engaged with a track, optionally filtered by kind,
    /// ordered by user id for determinism.
    pub fn query_engagers(
        &self,
        track_id: i64,
        kind: Option<EngagementKind>,
        limit: usize,
    ) -> Result<Vec<Engager>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, kind FROM engagements
             WHERE track_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY user_id, kind
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![track_id, kind.map(|k| k.as_str()), limit as i64],
                |row| {
                    let kind_str: String = row.get(1)?;
                    let kind = EngagementKind::parse(&kind_str).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            format!("unknown engagement kind {kind_str}").into(),
                        )
                    })?;
                    Ok(Engager {
                        user_id: row.get(0)?,
                        kind,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Track ids a user has liked, ordered by track id.
    pub fn query_user_library(&self, user_id: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT track_id FROM engagements
             WHERE user_id = ?1 AND kind = 'like'
             ORDER BY track_id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All (user, track) engagement pairs for the given kinds, for the
    /// similarity pass.
    pub fn engagement_pairs(&self, kinds: &[EngagementKind]) -> Result<Vec<(i64, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, track_id FROM engagements WHERE kind = ?1
             ORDER BY user_id, track_id",
        )?;
        let mut pairs = Vec::new();
        for kind in kinds {
            let rows = stmt
                .query_map(params![kind.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;
            pairs.extend(rows);
        }
        pairs.sort_unstable();
        pairs.dedup();
        Ok(pairs)
    }

    /// All playlists with their member track ids, ordered by position.
    pub fn playlist_memberships(&self) -> Result<Vec<(i64, Vec<i64>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT playlist_id, track_id FROM playlist_tracks
             ORDER BY playlist_id, position, track_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;

        let mut grouped: Vec<(i64, Vec<i64>)> = Vec::new();
        for (playlist_id, track_id) in rows {
            match grouped.last_mut() {
                Some((last_id, members)) if *last_id == playlist_id => members.push(track_id),
                _ => grouped.push((playlist_id, vec![track_id])),
            }
        }
        Ok(grouped)
    }

    /// track → owning artist, for every track with a known artist.
    pub fn track_artists(&self) -> Result<HashMap<i64, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT track_id, artist_id FROM tracks WHERE artist_id IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;
        Ok(rows.into_iter().collect())
    }

    /// Stored track counts per artist.
    pub fn artist_track_counts(&self) -> Result<HashMap<i64, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT artist_id, COUNT(*) FROM tracks
             WHERE artist_id IS NOT NULL GROUP BY artist_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn tracks_by_artist(&self, artist_id: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT track_id FROM tracks WHERE artist_id = ?1
             ORDER BY track_id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![artist_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- derived writers (canonical pair ordering enforced here) ----

    /// Write a user-similarity score; update-in-place on the canonical pair.
    pub fn upsert_user_similarity(
        &self,
        user_a: i64,
        user_b: i64,
        metric: &str,
        score: f64,
        evidence_count: i64,
    ) -> Result<()> {
        let (a, b) = canonical_pair(user_a, user_b)?;
        self.lock().execute(
            "INSERT INTO user_similarity (user_a, user_b, metric, score, evidence_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_a, user_b, metric) DO UPDATE SET
                 score = excluded.score,
                 evidence_count = excluded.evidence_count,
                 updated_at = datetime('now')",
            params![a, b, metric, score, evidence_count],
        )?;
        Ok(())
    }

    /// Write an artist relationship; update-in-place on the canonical pair.
    pub fn upsert_artist_relationship(
        &self,
        artist_a: i64,
        artist_b: i64,
        kind: ArtistRelationKind,
        strength: f64,
        evidence_count: i64,
    ) -> Result<()> {
        let (a, b) = canonical_pair(artist_a, artist_b)?;
        self.lock().execute(
            "INSERT INTO artist_relationships (artist_a, artist_b, kind, strength, evidence_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(artist_a, artist_b, kind) DO UPDATE SET
                 strength = excluded.strength,
                 evidence_count = excluded.evidence_count,
                 updated_at = datetime('now')",
            params![a, b, kind.as_str(), strength, evidence_count],
        )?;
        Ok(())
    }

    /// Write a co-occurrence row; update-in-place on the canonical pair.
    pub fn upsert_cooccurrence(
        &self,
        track_a: i64,
        track_b: i64,
        together_count: i64,
        weight: f64,
    ) -> Result<()> {
        let (a, b) = canonical_pair(track_a, track_b)?;
        self.lock().execute(
            "INSERT INTO track_cooccurrence (track_a, track_b, together_count, weight)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(track_a, track_b) DO UPDATE SET
                 together_count = excluded.together_count,
                 weight = excluded.weight,
                 updated_at = datetime('now')",
            params![a, b, together_count, weight],
        )?;
        Ok(())
    }

    /// Drop all similarity rows for one metric before a rebuild.
    pub fn clear_user_similarity(&self, metric: &str) -> Result<usize> {
        let n = self.lock().execute(
            "DELETE FROM user_similarity WHERE metric = ?1",
            params![metric],
        )?;
        Ok(n)
    }

    pub fn clear_artist_relationships(&self) -> Result<usize> {
        let n = self.lock().execute("DELETE FROM artist_relationships", [])?;
        Ok(n)
    }

    pub fn clear_cooccurrence(&self) -> Result<usize> {
        let n = self.lock().execute("DELETE FROM track_cooccurrence", [])?;
        Ok(n)
    }

    // ---- derived readers ----

    /// Tracks co-occurring with the given track, weight-descending, ties by
    /// the other track's id.
    pub fn cooccurrences_for(&self, track_id: i64, limit: usize) -> Result<Vec<CooccurringTrack>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT CASE WHEN track_a = ?1 THEN track_b ELSE track_a END AS other,
                    together_count, weight
             FROM track_cooccurrence
             WHERE track_a = ?1 OR track_b = ?1
             ORDER BY weight DESC, other
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![track_id, limit as i64], |row| {
                Ok(CooccurringTrack {
                    track_id: row.get(0)?,
                    together_count: row.get(1)?,
                    weight: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Users similar to the given user, score-descending.
    pub fn similar_users_for(
        &self,
        user_id: i64,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<SimilarUser>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT CASE WHEN user_a = ?1 THEN user_b ELSE user_a END AS other,
                    metric, score, evidence_count
             FROM user_similarity
             WHERE (user_a = ?1 OR user_b = ?1) AND score >= ?2
             ORDER BY score DESC, other
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, min_score, limit as i64], |row| {
                Ok(SimilarUser {
                    user_id: row.get(0)?,
                    metric: row.get(1)?,
                    score: row.get(2)?,
                    evidence_count: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Artists related to the given artist, strength-descending.
    pub fn related_artists_for(&self, artist_id: i64, limit: usize) -> Result<Vec<RelatedArtist>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT CASE WHEN artist_a = ?1 THEN artist_b ELSE artist_a END AS other,
                    kind, strength, evidence_count
             FROM artist_relationships
             WHERE artist_a = ?1 OR artist_b = ?1
             ORDER BY strength DESC, other
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![artist_id, limit as i64], |row| {
                let kind_str: String = row.get(1)?;
                let kind = ArtistRelationKind::parse(&kind_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown artist relation kind {kind_str}").into(),
                    )
                })?;
                Ok(RelatedArtist {
                    artist_id: row.get(0)?,
                    kind,
                    strength: row.get(2)?,
                    evidence_count: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Row counts across the store.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(StoreStats {
            tracks: count("SELECT COUNT(*) FROM tracks")?,
            users: count("SELECT COUNT(*) FROM users")?,
            playlists: count("SELECT COUNT(*) FROM playlists")?,
            memberships: count("SELECT COUNT(*) FROM playlist_tracks")?,
            engagements: count("SELECT COUNT(*) FROM engagements")?,
            follows: count("SELECT COUNT(*) FROM follows")?,
            user_similarities: count("SELECT COUNT(*) FROM user_similarity")?,
            artist_relationships: count("SELECT COUNT(*) FROM artist_relationships")?,
            track_cooccurrences: count("SELECT COUNT(*) FROM track_cooccurrence")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_track(id: i64) -> NewTrack {
        NewTrack {
            track_id: id,
            title: format!("Track {id}"),
            artist_id: Some(900 + id),
            artist_name: Some("Some Artist".to_string()),
            genre: Some("ambient".to_string()),
            ..Default::default()
        }
    }

    fn test_user(id: i64) -> NewUser {
        NewUser {
            user_id: id,
            username: format!("user{id}"),
            followers_count: Some(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_track_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_track(&test_track(1), true).unwrap();
        store.upsert_track(&test_track(1), true).unwrap();
        assert_eq!(store.stats().unwrap().tracks, 1);
    }

    #[test]
    fn test_upsert_rejects_bad_key() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.upsert_track(&test_track(0), true),
            Err(DbError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_observed_upsert_does_not_clobber_fields() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_track(&test_track(1), true).unwrap();

        // Sparse re-observation (e.g. embedded in another payload)
        let sparse = NewTrack {
            track_id: 1,
            title: "Track 1".to_string(),
            ..Default::default()
        };
        store.upsert_track(&sparse, false).unwrap();

        let rec = store.get_track(1).unwrap().unwrap();
        assert_eq!(rec.artist_id, Some(901));
        assert_eq!(rec.genre.as_deref(), Some("ambient"));
    }

    #[test]
    fn test_freshness_requires_fetch() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_track(&test_track(1), false).unwrap();
        assert!(!store.is_track_fresh(1, 24).unwrap());

        store.upsert_track(&test_track(1), true).unwrap();
        assert!(store.is_track_fresh(1, 24).unwrap());

        // TTL of zero hours means nothing is ever fresh
        assert!(!store.is_track_fresh(1, 0).unwrap());
        // Unknown id is never fresh
        assert!(!store.is_track_fresh(999, 24).unwrap());
    }

    #[test]
    fn test_derived_writes_leave_freshness_alone() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&test_user(3), false).unwrap();
        store.upsert_user(&test_user(7), false).unwrap();
        store
            .upsert_user_similarity(3, 7, "jaccard_likes", 0.5, 4)
            .unwrap();
        assert!(!store.is_user_fresh(3, 24).unwrap());
    }

    #[test]
    fn test_mark_user_fetched() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(&test_user(5), false).unwrap();
        assert!(!store.is_user_fresh(5, 24).unwrap());
        store.mark_user_fetched(5).unwrap();
        assert!(store.is_user_fresh(5, 24).unwrap());
    }

    #[test]
    fn test_engagement_dedup() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_engagement(1, 10, EngagementKind::Like).unwrap());
        assert!(!store.record_engagement(1, 10, EngagementKind::Like).unwrap());
        // Different kind is a distinct fact
        assert!(store.record_engagement(1, 10, EngagementKind::Repost).unwrap());
        assert_eq!(store.stats().unwrap().engagements, 2);
    }

    #[test]
    fn test_follow_dedup_is_directional() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_follow(1, 2).unwrap());
        assert!(!store.record_follow(1, 2).unwrap());
        // Reverse direction is a distinct fact
        assert!(store.record_follow(2, 1).unwrap());
        assert_eq!(store.stats().unwrap().follows, 2);
    }

    #[test]
    fn test_membership_dedup() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_membership(1, 10, 0).unwrap());
        assert!(!store.record_membership(1, 10, 0).unwrap());
        assert_eq!(store.stats().unwrap().memberships, 1);
    }

    #[test]
    fn test_similarity_swapped_order_updates_same_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_user_similarity(7, 3, "jaccard_likes", 0.4, 3)
            .unwrap();
        store
            .upsert_user_similarity(3, 7, "jaccard_likes", 0.6, 5)
            .unwrap();

        assert_eq!(store.stats().unwrap().user_similarities, 1);
        let similar = store.similar_users_for(3, 0.0, 10).unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].user_id, 7);
        assert!((similar[0].score - 0.6).abs() < 1e-12);
        assert_eq!(similar[0].evidence_count, 5);
    }

    #[test]
    fn test_cooccurrence_swapped_order_updates_same_row() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_cooccurrence(20, 10, 1, 0.5).unwrap();
        store.upsert_cooccurrence(10, 20, 2, 0.6).unwrap();

        assert_eq!(store.stats().unwrap().track_cooccurrences, 1);
        let rows = store.cooccurrences_for(10, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].track_id, 20);
        assert_eq!(rows[0].together_count, 2);
    }

    #[test]
    fn test_artist_relationship_kinds_are_distinct_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_artist_relationship(2, 1, ArtistRelationKind::Collaboration, 0.5, 2)
            .unwrap();
        store
            .upsert_artist_relationship(1, 2, ArtistRelationKind::CoLibrary, 0.3, 3)
            .unwrap();
        assert_eq!(store.stats().unwrap().artist_relationships, 2);

        let related = store.related_artists_for(1, 10).unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].kind, ArtistRelationKind::Collaboration);
    }

    #[test]
    fn test_query_engagers_ordering_and_filter() {
        let store = Store::open_in_memory().unwrap();
        store.record_engagement(5, 100, EngagementKind::Repost).unwrap();
        store.record_engagement(2, 100, EngagementKind::Like).unwrap();
        store.record_engagement(9, 100, EngagementKind::Like).unwrap();
        store.record_engagement(2, 200, EngagementKind::Like).unwrap();

        let all = store.query_engagers(100, None, 10).unwrap();
        let ids: Vec<i64> = all.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);

        let likes = store
            .query_engagers(100, Some(EngagementKind::Like), 10)
            .unwrap();
        assert_eq!(likes.len(), 2);
        assert!(likes.iter().all(|e| e.kind == EngagementKind::Like));
    }

    #[test]
    fn test_query_user_library() {
        let store = Store::open_in_memory().unwrap();
        store.record_engagement(1, 30, EngagementKind::Like).unwrap();
        store.record_engagement(1, 10, EngagementKind::Like).unwrap();
        store.record_engagement(1, 20, EngagementKind::Repost).unwrap();

        let library = store.query_user_library(1, 10).unwrap();
        assert_eq!(library, vec![10, 30]);
    }

    #[test]
    fn test_playlist_memberships_grouping() {
        let store = Store::open_in_memory().unwrap();
        store.record_membership(1, 10, 0).unwrap();
        store.record_membership(1, 20, 1).unwrap();
        store.record_membership(2, 30, 0).unwrap();

        let grouped = store.playlist_memberships().unwrap();
        assert_eq!(grouped, vec![(1, vec![10, 20]), (2, vec![30])]);
    }

    #[test]
    fn test_clear_user_similarity_scoped_to_metric() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_user_similarity(1, 2, "jaccard_likes", 0.5, 3)
            .unwrap();
        store
            .upsert_user_similarity(1, 2, "jaccard_likes_reposts", 0.4, 3)
            .unwrap();

        assert_eq!(store.clear_user_similarity("jaccard_likes").unwrap(), 1);
        assert_eq!(store.stats().unwrap().user_similarities, 1);
    }
}
