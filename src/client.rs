use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::models::{NewPlaylist, NewTrack, NewUser};

/// Failure modes of a single platform-API call.
///
/// Transient variants are retried by the fetcher; the rest surface
/// immediately. `NotFound` covers deleted/private entities and is recorded
/// as skipped, never retried.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("rate limited by platform")]
    RateLimited,
    #[error("entity not found or private")]
    NotFound,
    #[error("unexpected response: HTTP {0}")]
    Unexpected(u16),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether the fetcher should retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Server(_) | Self::RateLimited
        )
    }

    /// Map an HTTP status code into the taxonomy.
    pub fn from_status(code: u16) -> Self {
        match code {
            404 | 410 => Self::NotFound,
            429 => Self::RateLimited,
            code if code >= 500 => Self::Server(code),
            code => Self::Unexpected(code),
        }
    }
}

impl From<ureq::Error> for FetchError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::from_status(code),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// A track payload from the platform. Typed fields cover what the store
/// needs; everything else rides along in `extra` so the raw payload can be
/// kept as opaque provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiTrack {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: Option<ApiUser>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub tag_list: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub label_name: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub playback_count: Option<i64>,
    #[serde(default, alias = "favoritings_count")]
    pub likes_count: Option<i64>,
    #[serde(default)]
    pub reposts_count: Option<i64>,
    #[serde(default)]
    pub permalink_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub permalink_url: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub followings_count: Option<i64>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiPlaylist {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: Option<ApiUser>,
    #[serde(default)]
    pub track_count: Option<i64>,
    #[serde(default)]
    pub tag_list: Option<String>,
    #[serde(default)]
    pub permalink_url: Option<String>,
    #[serde(default)]
    pub tracks: Option<Vec<ApiTrack>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ApiTrack {
    pub fn to_new_track(&self) -> NewTrack {
        NewTrack {
            track_id: self.id,
            title: if self.title.is_empty() {
                "Untitled".to_string()
            } else {
                self.title.clone()
            },
            artist_id: self.user.as_ref().map(|u| u.id),
            artist_name: self.user.as_ref().map(|u| u.username.clone()),
            genre: self.genre.clone(),
            tag_list: self.tag_list.clone(),
            description: self.description.clone(),
            label_name: self.label_name.clone(),
            duration_ms: self.duration,
            playback_count: self.playback_count,
            like_count: self.likes_count,
            repost_count: self.reposts_count,
            permalink_url: self.permalink_url.clone(),
            raw_json: serde_json::to_string(self).ok(),
        }
    }
}

impl ApiUser {
    pub fn to_new_user(&self) -> NewUser {
        NewUser {
            user_id: self.id,
            username: if self.username.is_empty() {
                "Unknown".to_string()
            } else {
                self.username.clone()
            },
            permalink_url: self.permalink_url.clone(),
            followers_count: self.followers_count,
            followings_count: self.followings_count,
            verified: self.verified,
            raw_json: serde_json::to_string(self).ok(),
        }
    }
}

impl ApiPlaylist {
    pub fn to_new_playlist(&self) -> NewPlaylist {
        NewPlaylist {
            playlist_id: self.id,
            title: if self.title.is_empty() {
                "Untitled".to_string()
            } else {
                self.title.clone()
            },
            creator_user_id: self.user.as_ref().map(|u| u.id),
            track_count: self.track_count,
            tag_list: self.tag_list.clone(),
            permalink_url: self.permalink_url.clone(),
            raw_json: serde_json::to_string(self).ok(),
        }
    }
}

/// The platform's read API, as a narrow collaborator interface.
/// Pagination is offset-based; the fetcher drives pages.
pub trait PlatformApi: Send + Sync {
    /// Resolve a permalink URL to a track payload.
    fn resolve(&self, url: &str) -> Result<ApiTrack, FetchError>;

    fn track(&self, track_id: i64) -> Result<ApiTrack, FetchError>;

    fn track_likers(
        &self,
        track_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiUser>, FetchError>;

    fn track_reposters(
        &self,
        track_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiUser>, FetchError>;

    fn user_likes(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError>;

    fn user_playlists(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiPlaylist>, FetchError>;

    /// Full playlist payload including ordered membership.
    fn playlist(&self, playlist_id: i64) -> Result<ApiPlaylist, FetchError>;

    fn user_tracks(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError>;

    fn search_tracks(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError>;
}

/// HTTP implementation over the public platform API.
///
/// Auth follows the platform's two modes: a bearer token when available,
/// otherwise a `client_id` query parameter.
pub struct HttpApi {
    base_url: String,
    client_id: Option<String>,
    oauth_token: Option<String>,
}

impl HttpApi {
    pub fn new(base_url: &str, client_id: Option<String>, oauth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            oauth_token,
        }
    }

    /// Build a client from `SOUNDGRAPH_OAUTH_TOKEN` / `SOUNDGRAPH_CLIENT_ID`.
    pub fn from_env(base_url: &str) -> Self {
        Self::new(
            base_url,
            std::env::var("SOUNDGRAPH_CLIENT_ID").ok(),
            std::env::var("SOUNDGRAPH_OAUTH_TOKEN").ok(),
        )
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = ureq::get(&url);
        for (k, v) in params {
            req = req.query(*k, v);
        }
        if let Some(token) = &self.oauth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        } else if let Some(client_id) = &self.client_id {
            req = req.query("client_id", client_id);
        }

        let mut resp = req.call().map_err(FetchError::from)?;
        resp.body_mut()
            .read_json::<T>()
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    fn page_params(limit: usize, offset: usize) -> [(&'static str, String); 2] {
        [
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]
    }
}

impl PlatformApi for HttpApi {
    fn resolve(&self, url: &str) -> Result<ApiTrack, FetchError> {
        self.get("/resolve", &[("url", url.to_string())])
    }

    fn track(&self, track_id: i64) -> Result<ApiTrack, FetchError> {
        self.get(&format!("/tracks/{track_id}"), &[])
    }

    fn track_likers(
        &self,
        track_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiUser>, FetchError> {
        self.get(
            &format!("/tracks/{track_id}/favoriters"),
            &Self::page_params(limit, offset),
        )
    }

    fn track_reposters(
        &self,
        track_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiUser>, FetchError> {
        self.get(
            &format!("/tracks/{track_id}/reposters"),
            &Self::page_params(limit, offset),
        )
    }

    fn user_likes(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError> {
        self.get(
            &format!("/users/{user_id}/favorites"),
            &Self::page_params(limit, offset),
        )
    }

    fn user_playlists(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiPlaylist>, FetchError> {
        self.get(
            &format!("/users/{user_id}/playlists"),
            &Self::page_params(limit, offset),
        )
    }

    fn playlist(&self, playlist_id: i64) -> Result<ApiPlaylist, FetchError> {
        self.get(&format!("/playlists/{playlist_id}"), &[])
    }

    fn user_tracks(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError> {
        self.get(
            &format!("/users/{user_id}/tracks"),
            &Self::page_params(limit, offset),
        )
    }

    fn search_tracks(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApiTrack>, FetchError> {
        self.get(
            "/tracks",
            &[
                ("q", query.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ],
        )
    }
}
