pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    /// Programmer error (self-pair, non-positive id). Fatal, never retried.
    #[error("Malformed key: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Durable entity store. All writes commit before the call returns, so the
/// set of fresh entities is exactly the resumable harvest state.
///
/// The connection sits behind a mutex because the user-depth harvest phase
/// writes from a worker pool; the mutex is the store's write path, which
/// also serializes canonical-pair upserts.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-write; nothing sane to resume.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&conn)?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            Self::migrate_v1(conn)?;
        }

        conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// V1: raw entities, raw facts, derived pair tables.
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                track_id        INTEGER PRIMARY KEY,
                title           TEXT NOT NULL,
                artist_id       INTEGER,
                artist_name     TEXT,
                genre           TEXT,
                tag_list        TEXT,
                description     TEXT,
                label_name      TEXT,
                duration_ms     INTEGER,
                playback_count  INTEGER,
                like_count      INTEGER,
                repost_count    INTEGER,
                permalink_url   TEXT,
                raw_json        TEXT,
                first_seen_at   TEXT NOT NULL DEFAULT (datetime('now')),
                -- Set only when the track itself was the subject of a
                -- successful fetch; NULL is never fresh.
                fetched_at      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(artist_id);

            CREATE TABLE IF NOT EXISTS users (
                user_id          INTEGER PRIMARY KEY,
                username         TEXT NOT NULL,
                permalink_url    TEXT,
                followers_count  INTEGER,
                followings_count INTEGER,
                verified         INTEGER,
                raw_json         TEXT,
                first_seen_at    TEXT NOT NULL DEFAULT (datetime('now')),
                fetched_at       TEXT
            );

            CREATE TABLE IF NOT EXISTS playlists (
                playlist_id     INTEGER PRIMARY KEY,
                title           TEXT NOT NULL,
                creator_user_id INTEGER,
                track_count     INTEGER,
                tag_list        TEXT,
                permalink_url   TEXT,
                raw_json        TEXT,
                first_seen_at   TEXT NOT NULL DEFAULT (datetime('now')),
                fetched_at      TEXT
            );

            CREATE TABLE IF NOT EXISTS playlist_tracks (
                playlist_id INTEGER NOT NULL,
                track_id    INTEGER NOT NULL,
                position    INTEGER NOT NULL,
                PRIMARY KEY (playlist_id, track_id)
            );
            CREATE INDEX IF NOT EXISTS idx_playlist_tracks_track
                ON playlist_tracks(track_id);

            CREATE TABLE IF NOT EXISTS engagements (
                user_id    INTEGER NOT NULL,
                track_id   INTEGER NOT NULL,
                kind       TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, track_id, kind)
            );
            CREATE INDEX IF NOT EXISTS idx_engagements_track
                ON engagements(track_id);

            CREATE TABLE IF NOT EXISTS follows (
                follower_id INTEGER NOT NULL,
                followee_id INTEGER NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (follower_id, followee_id)
            );

            -- Derived tables: canonical ordering (smaller id first) is
            -- enforced in the write path and double-checked here.
            CREATE TABLE IF NOT EXISTS user_similarity (
                user_a         INTEGER NOT NULL,
                user_b         INTEGER NOT NULL,
                metric         TEXT NOT NULL,
                score          REAL NOT NULL,
                evidence_count INTEGER NOT NULL,
                updated_at     TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_a, user_b, metric),
                CHECK (user_a < user_b)
            );

            CREATE TABLE IF NOT EXISTS artist_relationships (
                artist_a       INTEGER NOT NULL,
                artist_b       INTEGER NOT NULL,
                kind           TEXT NOT NULL,
                strength       REAL NOT NULL,
                evidence_count INTEGER NOT NULL,
                updated_at     TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (artist_a, artist_b, kind),
                CHECK (artist_a < artist_b)
            );

            CREATE TABLE IF NOT EXISTS track_cooccurrence (
                track_a        INTEGER NOT NULL,
                track_b        INTEGER NOT NULL,
                together_count INTEGER NOT NULL,
                weight         REAL NOT NULL,
                updated_at     TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (track_a, track_b),
                CHECK (track_a < track_b)
            );
            CREATE INDEX IF NOT EXISTS idx_cooccur_b
                ON track_cooccurrence(track_b);
            ",
        )?;
        Ok(())
    }
}

/// Reorder an unordered id pair into canonical form (smaller id first).
/// Self-pairs and non-positive ids are programmer errors.
pub fn canonical_pair(a: i64, b: i64) -> Result<(i64, i64)> {
    if a <= 0 || b <= 0 {
        return Err(DbError::MalformedKey(format!(
            "non-positive id in pair ({a}, {b})"
        )));
    }
    if a == b {
        return Err(DbError::MalformedKey(format!("self-pair ({a}, {b})")));
    }
    Ok(if a < b { (a, b) } else { (b, a) })
}
