use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;

use crate::client::{ApiPlaylist, ApiTrack, ApiUser, FetchError};
use crate::config::HarvestConfig;
use crate::extract;
use crate::fetcher::Fetcher;
use crate::store::models::{EngagementKind, TrackRecord};
use crate::store::{DbError, Store};

/// Engagers whose playlists are checked in the playlist-depth phase.
const TOP_ENGAGERS_FOR_PLAYLISTS: usize = 10;

/// Contextual secondary seeds never expand past this depth.
const MAX_CONTEXT_DEPTH: u8 = 1;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    /// The seed itself could not be resolved; without it there is nothing
    /// to harvest, so this aborts the run.
    #[error("Seed unavailable: {0}")]
    SeedUnavailable(String),
}

/// Cooperative cancellation flag. In-flight page fetches finish; already
/// written entities stay valid and the run reports partial completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The seed argument: a platform track id or a permalink URL.
#[derive(Debug, Clone)]
pub enum SeedRef {
    Id(i64),
    Url(String),
}

impl SeedRef {
    pub fn parse(input: &str) -> Self {
        match input.trim().parse::<i64>() {
            Ok(id) if id > 0 => Self::Id(id),
            _ => Self::Url(input.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Seed,
    SocialSpill,
    UserDepth,
    PlaylistDepth,
    ArtistDepth,
    SemanticDepth,
    Contextual,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::SocialSpill => "social spill",
            Self::UserDepth => "user depth",
            Self::PlaylistDepth => "playlist depth",
            Self::ArtistDepth => "artist depth",
            Self::SemanticDepth => "semantic depth",
            Self::Contextual => "contextual",
        }
    }
}

/// Per-phase result counts. Sub-fetch failures are logged and counted,
/// never escalated; the harvest always completes best-effort.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseOutcome {
    pub written: u64,
    pub failures: u64,
    pub skipped: u64,
}

impl PhaseOutcome {
    fn skipped_phase() -> Self {
        Self {
            skipped: 1,
            ..Default::default()
        }
    }

    fn merge(&mut self, other: PhaseOutcome) {
        self.written += other.written;
        self.failures += other.failures;
        self.skipped += other.skipped;
    }
}

/// Structured summary of one harvest run.
#[derive(Debug)]
pub struct HarvestReport {
    pub seed_track_id: i64,
    pub started_at: DateTime<Utc>,
    pub phases: Vec<(Phase, PhaseOutcome)>,
    pub cancelled: bool,
}

impl HarvestReport {
    pub fn total_written(&self) -> u64 {
        self.phases.iter().map(|(_, o)| o.written).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.phases.iter().map(|(_, o)| o.failures).sum()
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|(p, _)| *p == phase).map(|(_, o)| o)
    }
}

/// Seven-phase spill-first crawler. Every fetched fact is written to the
/// store before any relationship logic runs; every fetch is gated on
/// freshness, so re-invoking on the same seed is cheap and convergent.
pub struct HarvestEngine<'a> {
    fetcher: &'a Fetcher,
    store: &'a Store,
    config: &'a HarvestConfig,
    workers: usize,
    cancel: CancelToken,
}

impl<'a> HarvestEngine<'a> {
    pub fn new(
        fetcher: &'a Fetcher,
        store: &'a Store,
        config: &'a HarvestConfig,
        workers: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            fetcher,
            store,
            config,
            workers: workers.max(1),
            cancel,
        }
    }

    pub fn run(&self, seed: &SeedRef) -> Result<HarvestReport, HarvestError> {
        let started_at = Utc::now();
        let ttl = self.config.fresh_ttl_hours;
        let mut phases: Vec<(Phase, PhaseOutcome)> = Vec::new();

        // Phase 1: resolve the seed; its prior freshness gates the
        // seed-derived phases below.
        let (seed_record, seed_was_fresh, artist_was_fresh, seed_outcome) =
            self.phase_seed(seed)?;
        phases.push((Phase::Seed, seed_outcome));
        log::info!(
            "harvesting track {} ({:?})",
            seed_record.track_id,
            seed_record.title
        );

        'phases: {
            if self.cancel.is_cancelled() {
                break 'phases;
            }

            if self.config.social_spill {
                let outcome = if seed_was_fresh {
                    PhaseOutcome::skipped_phase()
                } else {
                    self.social_spill(seed_record.track_id, self.config.max_users_per_track)?
                };
                phases.push((Phase::SocialSpill, outcome));
                if self.cancel.is_cancelled() {
                    break 'phases;
                }
            }

            // Engager freshness is captured once, before user depth marks
            // anyone fetched; the playlist phase reuses the same snapshot.
            let mut stale_engagers: Vec<i64> = Vec::new();
            let mut fresh_engagers = 0u64;
            let mut seen: Vec<i64> = Vec::new();
            for engager in self.store.query_engagers(
                seed_record.track_id,
                None,
                self.config.max_users_per_track,
            )? {
                if seen.contains(&engager.user_id) {
                    continue;
                }
                seen.push(engager.user_id);
                if self.store.is_user_fresh(engager.user_id, ttl)? {
                    fresh_engagers += 1;
                } else {
                    stale_engagers.push(engager.user_id);
                }
            }

            if self.config.user_depth {
                let outcome = self.phase_user_depth(&stale_engagers, fresh_engagers)?;
                phases.push((Phase::UserDepth, outcome));
                if self.cancel.is_cancelled() {
                    break 'phases;
                }
            }

            if self.config.playlist_depth {
                let mut owners: Vec<i64> = Vec::new();
                if let Some(artist_id) = seed_record.artist_id {
                    if !artist_was_fresh {
                        owners.push(artist_id);
                    }
                }
                owners.extend(
                    stale_engagers
                        .iter()
                        .copied()
                        .filter(|id| Some(*id) != seed_record.artist_id)
                        .take(TOP_ENGAGERS_FOR_PLAYLISTS),
                );
                phases.push((Phase::PlaylistDepth, self.phase_playlist_depth(&owners)?));
                if self.cancel.is_cancelled() {
                    break 'phases;
                }
            }

            if self.config.artist_depth {
                let outcome = match seed_record.artist_id {
                    Some(artist_id) if !artist_was_fresh => self.phase_artist_depth(artist_id)?,
                    _ => PhaseOutcome::skipped_phase(),
                };
                phases.push((Phase::ArtistDepth, outcome));
                if self.cancel.is_cancelled() {
                    break 'phases;
                }
            }

            if self.config.semantic_depth {
                let outcome = if seed_was_fresh {
                    PhaseOutcome::skipped_phase()
                } else {
                    self.phase_semantic(&seed_record)?
                };
                phases.push((Phase::SemanticDepth, outcome));
                if self.cancel.is_cancelled() {
                    break 'phases;
                }
            }

            if self.config.contextual_depth {
                let outcome = if seed_was_fresh {
                    PhaseOutcome::skipped_phase()
                } else {
                    self.phase_contextual(&seed_record)?
                };
                phases.push((Phase::Contextual, outcome));
            }
        }

        Ok(HarvestReport {
            seed_track_id: seed_record.track_id,
            started_at,
            phases,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    /// Phase 1: resolve the seed to a stored track and artist.
    fn phase_seed(
        &self,
        seed: &SeedRef,
    ) -> Result<(TrackRecord, bool, bool, PhaseOutcome), HarvestError> {
        let ttl = self.config.fresh_ttl_hours;
        let mut outcome = PhaseOutcome::default();

        // A known-id seed that is still fresh needs no fetch at all.
        if let SeedRef::Id(id) = seed {
            if self.store.is_track_fresh(*id, ttl)? {
                let record = self.store.get_track(*id)?.ok_or_else(|| {
                    HarvestError::SeedUnavailable(format!("track {id} fresh but missing"))
                })?;
                let artist_fresh = match record.artist_id {
                    Some(artist_id) => self.store.is_user_fresh(artist_id, ttl)?,
                    None => false,
                };
                outcome.skipped += 1;
                return Ok((record, true, artist_fresh, outcome));
            }
        }

        let fetched = match seed {
            SeedRef::Id(id) => self.fetcher.call(|api| api.track(*id)),
            SeedRef::Url(url) => self.fetcher.call(|api| api.resolve(url)),
        };
        let track = match fetched {
            Ok(track) if track.id > 0 => track,
            Ok(_) => {
                return Err(HarvestError::SeedUnavailable(
                    "resolved payload carries no track id".to_string(),
                ));
            }
            Err(e) => return Err(HarvestError::SeedUnavailable(e.to_string())),
        };

        let seed_was_fresh = self.store.is_track_fresh(track.id, ttl)?;
        let artist_was_fresh = match track.user.as_ref() {
            Some(artist) if artist.id > 0 => self.store.is_user_fresh(artist.id, ttl)?,
            _ => false,
        };

        self.store.upsert_track(&track.to_new_track(), true)?;
        outcome.written += 1;
        if let Some(artist) = &track.user {
            if artist.id > 0 {
                self.store.upsert_user(&artist.to_new_user(), true)?;
                outcome.written += 1;
            }
        }

        let record = self.store.get_track(track.id)?.ok_or_else(|| {
            HarvestError::SeedUnavailable(format!("track {} vanished after upsert", track.id))
        })?;
        Ok((record, seed_was_fresh, artist_was_fresh, outcome))
    }

    /// Phase 2 (and the contextual sub-spill): users who liked or reposted
    /// a track, with engagement facts.
    fn social_spill(&self, track_id: i64, max_users: usize) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        for kind in [EngagementKind::Like, EngagementKind::Repost] {
            if self.cancel.is_cancelled() {
                break;
            }
            let page_outcome = self.fetcher.paginated(
                max_users,
                |api, limit, offset| match kind {
                    EngagementKind::Like => api.track_likers(track_id, limit, offset),
                    _ => api.track_reposters(track_id, limit, offset),
                },
                |page: &[ApiUser]| {
                    for user in page {
                        if user.id <= 0 {
                            continue;
                        }
                        self.store.upsert_user(&user.to_new_user(), false)?;
                        outcome.written += 1;
                        if self.store.record_engagement(user.id, track_id, kind)? {
                            outcome.written += 1;
                        }
                    }
                    Ok::<(), DbError>(())
                },
            )?;
            self.note_page_error("engager crawl", page_outcome.error, &mut outcome);
        }
        Ok(outcome)
    }

    /// Phase 3: liked libraries of every stale engager, in parallel under
    /// the shared rate limiter. A user is marked fetched only once their
    /// crawl completes, which is what makes interruption resumable.
    fn phase_user_depth(
        &self,
        stale_engagers: &[i64],
        already_fresh: u64,
    ) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome {
            skipped: already_fresh,
            ..Default::default()
        };
        if stale_engagers.is_empty() {
            return Ok(outcome);
        }

        let pb = ProgressBar::new(stale_engagers.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} users ({eta} remaining)")
                .unwrap()
                .progress_chars("=>-"),
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .unwrap();

        let results: Vec<Result<PhaseOutcome, DbError>> = pool.install(|| {
            stale_engagers
                .par_iter()
                .map(|&user_id| {
                    let result = if self.cancel.is_cancelled() {
                        Ok(PhaseOutcome::skipped_phase())
                    } else {
                        self.crawl_user_library(user_id)
                    };
                    pb.inc(1);
                    result
                })
                .collect()
        });
        pb.finish_and_clear();

        for result in results {
            outcome.merge(result?);
        }
        Ok(outcome)
    }

    fn crawl_user_library(&self, user_id: i64) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        let page_outcome = self.fetcher.paginated(
            self.config.max_tracks_per_user,
            |api, limit, offset| api.user_likes(user_id, limit, offset),
            |page: &[ApiTrack]| {
                for track in page {
                    if track.id <= 0 {
                        continue;
                    }
                    self.store.upsert_track(&track.to_new_track(), true)?;
                    outcome.written += 1;
                    if let Some(artist) = &track.user {
                        if artist.id > 0 {
                            self.store.upsert_user(&artist.to_new_user(), false)?;
                        }
                    }
                    if self
                        .store
                        .record_engagement(user_id, track.id, EngagementKind::Like)?
                    {
                        outcome.written += 1;
                    }
                }
                Ok::<(), DbError>(())
            },
        )?;

        match page_outcome.error {
            None => self.store.mark_user_fetched(user_id)?,
            Some(FetchError::NotFound) => {
                outcome.skipped += 1;
                log::debug!("user {user_id} gone or private, skipping library");
            }
            Some(e) => {
                outcome.failures += 1;
                log::warn!("user {user_id} library crawl failed: {e}");
            }
        }
        Ok(outcome)
    }

    /// Phase 4: playlists of the seed artist and top engagers, full
    /// membership per playlist, bounded by `max_playlists`.
    fn phase_playlist_depth(&self, owners: &[i64]) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        let budget = Cell::new(self.config.max_playlists);

        for &owner in owners {
            if self.cancel.is_cancelled() || budget.get() == 0 {
                break;
            }
            let page_outcome = self.fetcher.paginated(
                budget.get(),
                |api, limit, offset| api.user_playlists(owner, limit, offset),
                |page: &[ApiPlaylist]| {
                    for playlist in page {
                        if playlist.id <= 0 || budget.get() == 0 || self.cancel.is_cancelled() {
                            continue;
                        }
                        if self
                            .store
                            .is_playlist_fresh(playlist.id, self.config.fresh_ttl_hours)?
                        {
                            outcome.skipped += 1;
                            continue;
                        }
                        budget.set(budget.get() - 1);
                        self.harvest_playlist(playlist, &mut outcome)?;
                    }
                    Ok::<(), DbError>(())
                },
            )?;
            self.note_page_error("playlist listing", page_outcome.error, &mut outcome);
        }
        Ok(outcome)
    }

    fn harvest_playlist(
        &self,
        playlist: &ApiPlaylist,
        outcome: &mut PhaseOutcome,
    ) -> Result<(), DbError> {
        // Listing payloads may inline membership; otherwise fetch it.
        let full;
        let playlist = if playlist.tracks.is_some() {
            playlist
        } else {
            match self.fetcher.call(|api| api.playlist(playlist.id)) {
                Ok(fetched) => {
                    full = fetched;
                    &full
                }
                Err(FetchError::NotFound) => {
                    outcome.skipped += 1;
                    return Ok(());
                }
                Err(e) => {
                    outcome.failures += 1;
                    log::warn!("playlist {} fetch failed: {e}", playlist.id);
                    return Ok(());
                }
            }
        };

        self.store
            .upsert_playlist(&playlist.to_new_playlist(), true)?;
        outcome.written += 1;

        if let Some(tracks) = &playlist.tracks {
            for (position, track) in tracks.iter().enumerate() {
                if track.id <= 0 {
                    continue;
                }
                self.store.upsert_track(&track.to_new_track(), true)?;
                outcome.written += 1;
                if let Some(artist) = &track.user {
                    if artist.id > 0 {
                        self.store.upsert_user(&artist.to_new_user(), false)?;
                    }
                }
                if self
                    .store
                    .record_membership(playlist.id, track.id, position as i64)?
                {
                    outcome.written += 1;
                }
            }
        }
        Ok(())
    }

    /// Phase 5: the seed artist's catalog (complete discography proxy).
    fn phase_artist_depth(&self, artist_id: i64) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        let page_outcome = self.fetcher.paginated(
            self.config.max_artist_tracks,
            |api, limit, offset| api.user_tracks(artist_id, limit, offset),
            |page: &[ApiTrack]| {
                for track in page {
                    if track.id <= 0 {
                        continue;
                    }
                    self.store.upsert_track(&track.to_new_track(), true)?;
                    outcome.written += 1;
                }
                Ok::<(), DbError>(())
            },
        )?;
        self.note_page_error("artist catalog", page_outcome.error, &mut outcome);
        Ok(outcome)
    }

    /// Phase 6: search key terms from the seed title and keep name-similar
    /// tracks (remixes, covers, variations).
    fn phase_semantic(&self, seed: &TrackRecord) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        let terms = extract::key_terms(&seed.title);

        for term in terms.iter().take(self.config.search_terms) {
            if self.cancel.is_cancelled() {
                break;
            }
            let page_outcome = self.fetcher.paginated(
                self.config.fuzzy_search_limit,
                |api, limit, offset| api.search_tracks(term, limit, offset),
                |page: &[ApiTrack]| {
                    for track in page {
                        if track.id <= 0 || track.id == seed.track_id {
                            continue;
                        }
                        let similarity = extract::title_similarity(&seed.title, &track.title);
                        if similarity < self.config.name_similarity_threshold {
                            continue;
                        }
                        if self
                            .store
                            .is_track_fresh(track.id, self.config.fresh_ttl_hours)?
                        {
                            outcome.skipped += 1;
                            continue;
                        }
                        self.store.upsert_track(&track.to_new_track(), true)?;
                        outcome.written += 1;
                        if let Some(artist) = &track.user {
                            if artist.id > 0 {
                                self.store.upsert_user(&artist.to_new_user(), false)?;
                            }
                        }
                    }
                    Ok::<(), DbError>(())
                },
            )?;
            self.note_page_error("semantic search", page_outcome.error, &mut outcome);
        }
        Ok(outcome)
    }

    /// Phase 7: names mentioned in the seed's metadata become secondary
    /// seeds on a depth-bounded work queue; each gets a catalog search and
    /// a bounded social spill.
    fn phase_contextual(&self, seed: &TrackRecord) -> Result<PhaseOutcome, DbError> {
        let mut outcome = PhaseOutcome::default();
        let mentions = extract::extract_mentions(
            &seed.title,
            seed.description.as_deref().unwrap_or(""),
            seed.label_name.as_deref(),
        );
        if mentions.is_empty() {
            return Ok(outcome);
        }
        log::info!(
            "contextual entities from track {}: {:?}",
            seed.track_id,
            mentions.names()
        );

        let mut queue: VecDeque<(String, u8)> = mentions
            .names()
            .into_iter()
            .take(self.config.contextual_max_entities)
            .map(|name| (name.to_string(), 1))
            .collect();

        while let Some((name, depth)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                break;
            }
            if depth > MAX_CONTEXT_DEPTH {
                continue;
            }

            // Best match: the result whose artist name is closest to the
            // mentioned entity.
            let mut best: Option<(i64, f64)> = None;
            let page_outcome = self.fetcher.paginated(
                self.config.contextual_tracks,
                |api, limit, offset| api.search_tracks(&name, limit, offset),
                |page: &[ApiTrack]| {
                    for track in page {
                        if track.id <= 0 {
                            continue;
                        }
                        self.store.upsert_track(&track.to_new_track(), true)?;
                        outcome.written += 1;
                        if let Some(artist) = &track.user {
                            if artist.id > 0 {
                                self.store.upsert_user(&artist.to_new_user(), false)?;
                            }
                        }
                        let quality = track
                            .user
                            .as_ref()
                            .map(|u| extract::title_similarity(&name, &u.username))
                            .unwrap_or(0.0);
                        if best.is_none_or(|(_, q)| quality > q) {
                            best = Some((track.id, quality));
                        }
                    }
                    Ok::<(), DbError>(())
                },
            )?;
            self.note_page_error("contextual search", page_outcome.error, &mut outcome);

            if let Some((track_id, _)) = best {
                outcome.merge(self.social_spill(track_id, self.config.contextual_users)?);
            }
            // Mentions of the secondary seed would enqueue at depth + 1,
            // past MAX_CONTEXT_DEPTH; the frontier stops here.
        }
        Ok(outcome)
    }

    fn note_page_error(
        &self,
        what: &str,
        error: Option<FetchError>,
        outcome: &mut PhaseOutcome,
    ) {
        match error {
            None => {}
            Some(FetchError::NotFound) => {
                outcome.skipped += 1;
                log::debug!("{what}: entity gone or private, skipped");
            }
            Some(e) => {
                outcome.failures += 1;
                log::warn!("{what}: failed after retries: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PlatformApi;
    use crate::config::ApiConfig;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Canned platform responses with per-endpoint call counting.
    #[derive(Default)]
    struct StubApi {
        tracks: HashMap<i64, ApiTrack>,
        likers: HashMap<i64, Vec<ApiUser>>,
        reposters: HashMap<i64, Vec<ApiUser>>,
        user_likes: HashMap<i64, Vec<ApiTrack>>,
        user_playlists: HashMap<i64, Vec<ApiPlaylist>>,
        user_tracks: HashMap<i64, Vec<ApiTrack>>,
        search: HashMap<String, Vec<ApiTrack>>,
        /// Users whose library fetches fail with a server error.
        failing_libraries: Mutex<HashSet<i64>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl StubApi {
        fn bump(&self, key: String) {
            *self.calls.lock().unwrap().entry(key).or_insert(0) += 1;
        }

        fn call_count(&self, key: &str) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }

        fn fail_library(&self, user_id: i64) {
            self.failing_libraries.lock().unwrap().insert(user_id);
        }

        fn heal_library(&self, user_id: i64) {
            self.failing_libraries.lock().unwrap().remove(&user_id);
        }

        fn page<T: Clone>(items: Option<&Vec<T>>, limit: usize, offset: usize) -> Vec<T> {
            match items {
                Some(items) => items.iter().skip(offset).take(limit).cloned().collect(),
                None => Vec::new(),
            }
        }
    }

    impl PlatformApi for StubApi {
        fn resolve(&self, url: &str) -> Result<ApiTrack, FetchError> {
            self.bump(format!("resolve:{url}"));
            self.tracks
                .values()
                .find(|t| t.permalink_url.as_deref() == Some(url))
                .cloned()
                .ok_or(FetchError::NotFound)
        }

        fn track(&self, track_id: i64) -> Result<ApiTrack, FetchError> {
            self.bump(format!("track:{track_id}"));
            self.tracks.get(&track_id).cloned().ok_or(FetchError::NotFound)
        }

        fn track_likers(
            &self,
            track_id: i64,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiUser>, FetchError> {
            self.bump(format!("likers:{track_id}"));
            Ok(Self::page(self.likers.get(&track_id), limit, offset))
        }

        fn track_reposters(
            &self,
            track_id: i64,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiUser>, FetchError> {
            self.bump(format!("reposters:{track_id}"));
            Ok(Self::page(self.reposters.get(&track_id), limit, offset))
        }

        fn user_likes(
            &self,
            user_id: i64,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiTrack>, FetchError> {
            self.bump(format!("user_likes:{user_id}"));
            if self.failing_libraries.lock().unwrap().contains(&user_id) {
                return Err(FetchError::Server(503));
            }
            Ok(Self::page(self.user_likes.get(&user_id), limit, offset))
        }

        fn user_playlists(
            &self,
            user_id: i64,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiPlaylist>, FetchError> {
            self.bump(format!("user_playlists:{user_id}"));
            Ok(Self::page(self.user_playlists.get(&user_id), limit, offset))
        }

        fn playlist(&self, playlist_id: i64) -> Result<ApiPlaylist, FetchError> {
            self.bump(format!("playlist:{playlist_id}"));
            Err(FetchError::NotFound)
        }

        fn user_tracks(
            &self,
            user_id: i64,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiTrack>, FetchError> {
            self.bump(format!("user_tracks:{user_id}"));
            Ok(Self::page(self.user_tracks.get(&user_id), limit, offset))
        }

        fn search_tracks(
            &self,
            query: &str,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<ApiTrack>, FetchError> {
            self.bump(format!("search:{query}"));
            Ok(Self::page(self.search.get(query), limit, offset))
        }
    }

    fn api_user(id: i64, username: &str) -> ApiUser {
        ApiUser {
            id,
            username: username.to_string(),
            ..Default::default()
        }
    }

    fn api_track(id: i64, title: &str, artist: &ApiUser) -> ApiTrack {
        ApiTrack {
            id,
            title: title.to_string(),
            user: Some(artist.clone()),
            ..Default::default()
        }
    }

    /// A seed world: track 100 "Night Drive" by artist 900, two likers,
    /// one reposter, libraries, a playlist, a catalog, and search results
    /// for the semantic and contextual phases.
    fn seeded_stub() -> StubApi {
        let mut stub = StubApi::default();
        let artist = api_user(900, "neonsmith");
        let other_artist = api_user(901, "halcyon");
        let mara = api_user(950, "Mara");

        let mut seed = api_track(100, "Night Drive", &artist);
        seed.description = Some("out now. feat. Mara — thanks everyone".to_string());
        seed.permalink_url = Some("https://platform.test/neonsmith/night-drive".to_string());

        let side_track = api_track(10, "Glass Tides", &other_artist);
        stub.tracks.insert(100, seed.clone());

        stub.likers
            .insert(100, vec![api_user(1, "ada"), api_user(2, "ben")]);
        stub.reposters.insert(100, vec![api_user(3, "cleo")]);

        stub.user_likes.insert(1, vec![side_track.clone()]);
        stub.user_likes.insert(2, vec![side_track.clone()]);
        stub.user_likes.insert(3, vec![]);

        stub.user_playlists.insert(
            900,
            vec![ApiPlaylist {
                id: 70,
                title: "after hours".to_string(),
                user: Some(artist.clone()),
                tracks: Some(vec![seed.clone(), side_track.clone()]),
                ..Default::default()
            }],
        );

        stub.user_tracks
            .insert(900, vec![seed.clone(), api_track(120, "Daybreak", &artist)]);

        stub.search.insert(
            "night".to_string(),
            vec![
                api_track(130, "Night Drive (VIP)", &other_artist),
                api_track(131, "Completely Different Song", &other_artist),
            ],
        );
        stub.search
            .insert("Mara".to_string(), vec![api_track(140, "Undertow", &mara)]);
        stub.likers.insert(140, vec![api_user(4, "dia")]);

        stub
    }

    fn fast_api_config() -> ApiConfig {
        ApiConfig {
            request_delay_ms: 0,
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            page_size: 50,
            ..Default::default()
        }
    }

    fn run_harvest(
        api: Arc<StubApi>,
        store: &Store,
        config: &HarvestConfig,
        cancel: CancelToken,
    ) -> Result<HarvestReport, HarvestError> {
        let fetcher = Fetcher::new(api, &fast_api_config());
        HarvestEngine::new(&fetcher, store, config, 2, cancel).run(&SeedRef::Id(100))
    }

    #[test]
    fn test_seed_ref_parse() {
        assert!(matches!(SeedRef::parse("12345"), SeedRef::Id(12345)));
        assert!(matches!(
            SeedRef::parse("https://platform.test/a/b"),
            SeedRef::Url(_)
        ));
        assert!(matches!(SeedRef::parse("-3"), SeedRef::Url(_)));
    }

    #[test]
    fn test_full_harvest_spills_everything() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig::default();

        let report = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();

        assert_eq!(report.seed_track_id, 100);
        assert!(!report.cancelled);
        assert_eq!(report.total_failures(), 0);
        assert_eq!(report.phases.len(), 7);

        // Seed + artist
        assert!(store.get_track(100).unwrap().is_some());
        assert!(store.get_user(900).unwrap().is_some());
        // Social spill
        let engagers = store.query_engagers(100, None, 10).unwrap();
        let ids: Vec<i64> = engagers.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // User depth: libraries landed as tracks + engagement facts
        assert!(store.get_track(10).unwrap().is_some());
        // Library like (track 10) plus the phase-2 seed like (track 100)
        assert_eq!(store.query_user_library(1, 10).unwrap(), vec![10, 100]);
        assert!(store.is_user_fresh(1, 24).unwrap());
        assert!(store.is_user_fresh(3, 24).unwrap());
        // Playlist depth
        assert_eq!(
            store.playlist_memberships().unwrap(),
            vec![(70, vec![100, 10])]
        );
        assert!(store.is_playlist_fresh(70, 24).unwrap());
        // Artist depth
        assert!(store.get_track(120).unwrap().is_some());
        // Semantic depth keeps the near-duplicate, drops the unrelated hit
        assert!(store.get_track(130).unwrap().is_some());
        assert!(store.get_track(131).unwrap().is_none());
        // Contextual: "feat. Mara" → search, spill on the match
        assert!(store.get_track(140).unwrap().is_some());
        assert_eq!(
            store.query_engagers(140, None, 10).unwrap()[0].user_id,
            4
        );
    }

    #[test]
    fn test_second_run_is_free() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig::default();

        let first = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();
        assert!(first.total_written() > 0);
        let stats_before = store.stats().unwrap();
        let calls_before = api.total_calls();

        let second = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();

        // No new writes, no new fetches
        assert_eq!(second.total_written(), 0);
        assert_eq!(api.total_calls(), calls_before);

        let stats_after = store.stats().unwrap();
        assert_eq!(stats_after.tracks, stats_before.tracks);
        assert_eq!(stats_after.users, stats_before.users);
        assert_eq!(stats_after.engagements, stats_before.engagements);
        assert_eq!(stats_after.memberships, stats_before.memberships);
    }

    #[test]
    fn test_failed_library_crawl_resumes_without_duplicates() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig::default();

        api.fail_library(2);
        let first = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();
        assert_eq!(first.phase(Phase::UserDepth).unwrap().failures, 1);
        assert!(store.is_user_fresh(1, 24).unwrap());
        assert!(!store.is_user_fresh(2, 24).unwrap());

        let likes_1_before = api.call_count("user_likes:1");
        let engagements_before = store.stats().unwrap().engagements;

        api.heal_library(2);
        let second = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();
        assert_eq!(second.phase(Phase::UserDepth).unwrap().failures, 0);

        // Only the previously failed user was re-crawled
        assert_eq!(api.call_count("user_likes:1"), likes_1_before);
        assert!(store.is_user_fresh(2, 24).unwrap());
        // User 2's library added exactly one like fact (track 10 engagement)
        assert_eq!(store.stats().unwrap().engagements, engagements_before + 1);
        assert_eq!(store.query_user_library(2, 10).unwrap(), vec![10, 100]);
    }

    #[test]
    fn test_missing_seed_aborts() {
        let api = Arc::new(StubApi::default());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig::default();

        let result = run_harvest(api, &store, &config, CancelToken::new());
        assert!(matches!(result, Err(HarvestError::SeedUnavailable(_))));
    }

    #[test]
    fn test_cancellation_reports_partial_run() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig::default();

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run_harvest(api, &store, &config, cancel).unwrap();

        assert!(report.cancelled);
        // Seed phase ran; everything after was cut short
        assert_eq!(report.phases.len(), 1);
        assert!(store.get_track(100).unwrap().is_some());
    }

    #[test]
    fn test_disabled_phases_do_not_run() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig {
            social_spill: false,
            user_depth: false,
            playlist_depth: false,
            artist_depth: false,
            semantic_depth: false,
            contextual_depth: false,
            ..Default::default()
        };

        let report = run_harvest(api.clone(), &store, &config, CancelToken::new()).unwrap();
        assert_eq!(report.phases.len(), 1);
        assert_eq!(api.call_count("likers:100"), 0);
        assert!(store.get_track(100).unwrap().is_some());
    }

    #[test]
    fn test_url_seed_resolves() {
        let api = Arc::new(seeded_stub());
        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig {
            social_spill: false,
            user_depth: false,
            playlist_depth: false,
            artist_depth: false,
            semantic_depth: false,
            contextual_depth: false,
            ..Default::default()
        };

        let fetcher = Fetcher::new(api, &fast_api_config());
        let engine = HarvestEngine::new(&fetcher, &store, &config, 1, CancelToken::new());
        let report = engine
            .run(&SeedRef::Url(
                "https://platform.test/neonsmith/night-drive".to_string(),
            ))
            .unwrap();
        assert_eq!(report.seed_track_id, 100);
        assert!(store.get_track(100).unwrap().is_some());
    }

    #[test]
    fn test_user_cap_limits_social_spill() {
        let mut stub = seeded_stub();
        let likers: Vec<ApiUser> = (1..=40)
            .map(|i| api_user(i, &format!("user{i}")))
            .collect();
        stub.likers.insert(100, likers);

        let store = Store::open_in_memory().unwrap();
        let config = HarvestConfig {
            max_users_per_track: 10,
            user_depth: false,
            playlist_depth: false,
            artist_depth: false,
            semantic_depth: false,
            contextual_depth: false,
            ..Default::default()
        };

        run_harvest(Arc::new(stub), &store, &config, CancelToken::new()).unwrap();
        let engagers = store.query_engagers(100, None, 100).unwrap();
        // 10 likers + the reposter stream capped separately
        assert!(engagers.len() <= 11);
        assert!(
            engagers
                .iter()
                .filter(|e| e.kind == EngagementKind::Like)
                .count()
                <= 10
        );
    }
}
