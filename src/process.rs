use std::collections::{BTreeMap, BTreeSet};

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::ProcessConfig;
use crate::store::models::{ArtistRelationKind, EngagementKind};
use crate::store::{DbError, Store};

/// Row counts written by one processor run.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub user_similarities: usize,
    pub track_cooccurrences: usize,
    pub artist_relationships: usize,
}

/// Derives weighted relationships from the raw data accumulated by the
/// harvest. Each pass rebuilds its derived table wholesale, so re-running
/// replaces prior values and never accumulates duplicates.
pub struct RelationshipProcessor<'a> {
    store: &'a Store,
    config: &'a ProcessConfig,
}

impl<'a> RelationshipProcessor<'a> {
    pub fn new(store: &'a Store, config: &'a ProcessConfig) -> Self {
        Self { store, config }
    }

    pub fn run(&self) -> Result<ProcessReport, DbError> {
        let mut report = ProcessReport::default();
        report.user_similarities = self.compute_user_similarity()?;
        report.track_cooccurrences = self.compute_track_cooccurrence()?;
        report.artist_relationships = self.compute_artist_relationships()?;
        Ok(report)
    }

    /// Jaccard similarity over per-user engaged-track sets.
    ///
    /// All-pairs comparison is quadratic in users, so candidate pairs come
    /// from an inverted index (track → engaging users): users sharing no
    /// track are never compared.
    fn compute_user_similarity(&self) -> Result<usize, DbError> {
        let kinds = self.config.kinds();
        let metric = self.config.metric_name();
        let pairs = self.store.engagement_pairs(&kinds)?;

        let mut user_tracks: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        let mut track_users: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (user_id, track_id) in pairs {
            user_tracks.entry(user_id).or_default().insert(track_id);
            track_users.entry(track_id).or_default().push(user_id);
        }

        let mut candidates: BTreeSet<(i64, i64)> = BTreeSet::new();
        for users in track_users.values() {
            for (i, &a) in users.iter().enumerate() {
                for &b in &users[i + 1..] {
                    if a != b {
                        candidates.insert((a.min(b), a.max(b)));
                    }
                }
            }
        }

        println!(
            "Scoring {} candidate user pairs from {} users...",
            candidates.len(),
            user_tracks.len()
        );
        let pb = ProgressBar::new(candidates.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} pairs")
                .unwrap()
                .progress_chars("=>-"),
        );

        self.store.clear_user_similarity(&metric)?;

        let mut written = 0usize;
        for (a, b) in candidates {
            pb.inc(1);
            let (Some(set_a), Some(set_b)) = (user_tracks.get(&a), user_tracks.get(&b)) else {
                continue;
            };
            let common = set_a.intersection(set_b).count();
            if common < self.config.min_common_tracks {
                continue;
            }
            let union = set_a.union(set_b).count();
            if union == 0 {
                continue;
            }
            let jaccard = common as f64 / union as f64;
            if jaccard < self.config.min_similarity_score {
                continue;
            }
            self.store
                .upsert_user_similarity(a, b, &metric, jaccard, common as i64)?;
            written += 1;
        }
        pb.finish_and_clear();

        log::info!("user similarity: {written} pairs ({metric})");
        Ok(written)
    }

    /// Playlist co-occurrence: per playlist, every unordered member pair
    /// gains one count and `1/playlist_size` weight, so mega-playlists are
    /// down-weighted.
    fn compute_track_cooccurrence(&self) -> Result<usize, DbError> {
        let playlists = self.store.playlist_memberships()?;

        let mut accum: BTreeMap<(i64, i64), (i64, f64)> = BTreeMap::new();
        for (_, members) in &playlists {
            let size = members.len();
            if size < 2 {
                continue;
            }
            let per_pair = 1.0 / size as f64;
            for (i, &a) in members.iter().enumerate() {
                for &b in &members[i + 1..] {
                    if a == b {
                        continue;
                    }
                    let entry = accum.entry((a.min(b), a.max(b))).or_insert((0, 0.0));
                    entry.0 += 1;
                    entry.1 += per_pair;
                }
            }
        }

        self.store.clear_cooccurrence()?;
        for (&(a, b), &(count, weight)) in &accum {
            self.store.upsert_cooccurrence(a, b, count, weight)?;
        }

        log::info!(
            "track co-occurrence: {} pairs from {} playlists",
            accum.len(),
            playlists.len()
        );
        Ok(accum.len())
    }

    /// Artist evidence from two signals: artists whose tracks share a
    /// playlist (`collaboration`) and artists whose tracks share a user's
    /// liked library (`co_library`). A pair is materialized once its
    /// evidence count reaches the configured minimum; strength is evidence
    /// normalized by the smaller artist's stored track count.
    fn compute_artist_relationships(&self) -> Result<usize, DbError> {
        let track_artists = self.store.track_artists()?;
        let artist_tracks = self.store.artist_track_counts()?;

        // Signal (a): playlist co-occurrence.
        let mut collab: BTreeMap<(i64, i64), i64> = BTreeMap::new();
        for (_, members) in self.store.playlist_memberships()? {
            let artists: BTreeSet<i64> = members
                .iter()
                .filter_map(|t| track_artists.get(t).copied())
                .collect();
            accumulate_pairs(&mut collab, &artists);
        }

        // Signal (b): liked-library co-occurrence.
        let mut co_library: BTreeMap<(i64, i64), i64> = BTreeMap::new();
        let mut user_artists: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (user_id, track_id) in self.store.engagement_pairs(&[EngagementKind::Like])? {
            if let Some(&artist_id) = track_artists.get(&track_id) {
                user_artists.entry(user_id).or_default().insert(artist_id);
            }
        }
        for artists in user_artists.values() {
            accumulate_pairs(&mut co_library, artists);
        }

        self.store.clear_artist_relationships()?;

        let mut written = 0usize;
        for (kind, evidence) in [
            (ArtistRelationKind::Collaboration, &collab),
            (ArtistRelationKind::CoLibrary, &co_library),
        ] {
            for (&(a, b), &count) in evidence {
                if count < self.config.min_artist_evidence {
                    continue;
                }
                let smaller_catalog = artist_tracks
                    .get(&a)
                    .copied()
                    .unwrap_or(1)
                    .min(artist_tracks.get(&b).copied().unwrap_or(1))
                    .max(1);
                let strength = (count as f64 / smaller_catalog as f64).clamp(0.0, 1.0);
                self.store
                    .upsert_artist_relationship(a, b, kind, strength, count)?;
                written += 1;
            }
        }

        log::info!("artist relationships: {written} pairs");
        Ok(written)
    }
}

/// Count every unordered pair in `set` once.
fn accumulate_pairs(accum: &mut BTreeMap<(i64, i64), i64>, set: &BTreeSet<i64>) {
    let items: Vec<i64> = set.iter().copied().collect();
    for (i, &a) in items.iter().enumerate() {
        for &b in &items[i + 1..] {
            *accum.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }
}
