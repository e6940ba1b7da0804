/*
 * Cvassist - personal CV assistant backend
 * Copyright (C) 2025–2026 Pedro Monteiro <pedro@cvassist.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Client for the 42 intranet API: OAuth client-credentials token
//! acquisition with a TTL-bounded in-memory cache, profile fetch, and a
//! local-file fallback when the remote side is unreachable.
//!
//! The token cache is single-flight: one `tokio::sync::Mutex` slot per
//! client, held across the refresh, so concurrent callers queue on the
//! lock and reuse the stored result instead of racing their own fetches.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cvassist_config::IntraConfig;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tokens are never cached for less than this, even when the server
/// reports a lifetime shorter than the safety margin.
const MIN_TOKEN_LIFETIME_SECS: u64 = 30;

/// Substrings that identify a Cloudflare challenge interstitial in a 403
/// body from the token endpoint.
const CHALLENGE_MARKERS: [&str; 2] = ["cf-chl", "Just a moment"];

const SNIPPET_MAX_BYTES: usize = 200;

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why an upstream call failed. Logged for observability; callers of
/// [`IntraClient::profile`] only ever see the fallback outcome.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamFailure {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("blocked by upstream anti-automation challenge")]
    Blocked,
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("intra credentials not configured")]
    Unconfigured,
}

/// Errors surfaced to the caller of [`IntraClient::profile`].
#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    #[error("invalid login")]
    InvalidLogin,
    #[error("no profile data available for '{0}'")]
    NotFound(String),
    #[error("fallback data unreadable: {0}")]
    FallbackUnreadable(String),
}

// ---------------------------------------------------------------------------
// Cached token
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// How long to cache a token given the server-reported `expires_in` and
/// the configured safety margin. Clamped so the cached lifetime is never
/// shorter than [`MIN_TOKEN_LIFETIME_SECS`].
fn cache_lifetime(expires_in: u64, margin: Duration) -> Duration {
    let secs = expires_in
        .saturating_sub(margin.as_secs())
        .max(MIN_TOKEN_LIFETIME_SECS);
    Duration::from_secs(secs)
}

fn is_challenge_body(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| body.contains(m))
}

/// Classify a non-2xx response from the token or profile endpoint.
fn classify_rejection(status: u16, body: &str) -> UpstreamFailure {
    if status == 403 && is_challenge_body(body) {
        UpstreamFailure::Blocked
    } else {
        UpstreamFailure::Rejected { status }
    }
}

/// Truncate a body for logging without splitting a UTF-8 character.
fn snippet(body: &str) -> &str {
    if body.len() <= SNIPPET_MAX_BYTES {
        return body;
    }
    let mut end = SNIPPET_MAX_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

// ---------------------------------------------------------------------------
// Token response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Parse a 2xx token endpoint body into (token, cache lifetime).
/// `expires_in` defaults to 3600 when absent.
fn parse_token_body(body: &str, margin: Duration) -> Result<(String, Duration), UpstreamFailure> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| UpstreamFailure::Malformed(format!("token response: {e}")))?;

    let token = match parsed.access_token {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(UpstreamFailure::Malformed(
                "access_token missing from token response".to_string(),
            ))
        }
    };

    let lifetime = cache_lifetime(parsed.expires_in.unwrap_or(3600), margin);
    Ok((token, lifetime))
}

// ---------------------------------------------------------------------------
// Login validation
// ---------------------------------------------------------------------------

/// Logins are interpolated into an API path and a fallback file name, so
/// only the character set real intra logins use is accepted.
#[must_use]
pub fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login.len() <= 32
        && login
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Profile result
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileSource {
    Remote,
    Fallback,
}

impl ProfileSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Fallback => "fallback",
        }
    }
}

/// A profile document: verbatim JSON plus where it came from. The source
/// tag is for logging only and never appears in the payload.
#[derive(Debug)]
pub struct ProfileDocument {
    pub body: String,
    pub source: ProfileSource,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

pub struct IntraClient {
    http: reqwest::Client,
    token_url: String,
    api_base: String,
    credentials: Option<Credentials>,
    margin: Duration,
    fallback_dir: PathBuf,
    token: Mutex<Option<CachedToken>>,
}

impl IntraClient {
    /// Build a client from config. `credentials` being `None` means the
    /// client id/secret were not provisioned; profile requests then go
    /// straight to the fallback path.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamFailure::Transport` if the HTTP client cannot be
    /// constructed.
    pub fn new(
        config: &IntraConfig,
        credentials: Option<Credentials>,
    ) -> Result<Self, UpstreamFailure> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("cvassist/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamFailure::Transport(format!("http client: {e}")))?;

        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            credentials,
            margin: Duration::from_secs(config.token_margin_seconds),
            fallback_dir: PathBuf::from(&config.fallback_dir),
            token: Mutex::new(None),
        })
    }

    /// Return a bearer token, reusing the cached one while fresh.
    ///
    /// The cache slot lock is held across the refresh, so at most one
    /// fetch is in flight; concurrent callers await it and read the
    /// stored result.
    ///
    /// # Errors
    ///
    /// Returns the classified [`UpstreamFailure`]; the cache is left
    /// empty so the next caller retries.
    pub async fn bearer_token(&self) -> Result<String, UpstreamFailure> {
        let mut slot = self.token.lock().await;

        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(Instant::now()) {
                return Ok(cached.value.clone());
            }
        }
        *slot = None;

        let fetched = self.fetch_token().await?;
        let value = fetched.value.clone();
        *slot = Some(fetched);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<CachedToken, UpstreamFailure> {
        let Some(creds) = self.credentials.as_ref() else {
            return Err(UpstreamFailure::Unconfigured);
        };

        info!("fetching new intra access token");

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| UpstreamFailure::Transport(format!("token request: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| UpstreamFailure::Transport(format!("token body: {e}")))?;

        if !(200..300).contains(&status) {
            let failure = classify_rejection(status, &body);
            if matches!(failure, UpstreamFailure::Blocked) {
                warn!(status, body_snippet = snippet(&body), "token endpoint served a challenge interstitial");
            } else {
                warn!(status, "token request rejected");
            }
            return Err(failure);
        }

        let (token, lifetime) = parse_token_body(&body, self.margin)?;
        info!(cached_for_secs = lifetime.as_secs(), "access token cached");

        Ok(CachedToken {
            value: token,
            expires_at: Instant::now() + lifetime,
        })
    }

    /// Fetch a user profile, falling back to the local document on any
    /// upstream failure.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::InvalidLogin`] for logins outside the
    /// accepted character set, [`ProfileError::NotFound`] when neither the
    /// remote API nor the fallback directory has the profile.
    pub async fn profile(&self, login: &str) -> Result<ProfileDocument, ProfileError> {
        if !is_valid_login(login) {
            return Err(ProfileError::InvalidLogin);
        }

        let failure = match self.bearer_token().await {
            Ok(token) => match self.fetch_remote(login, &token).await {
                Ok(body) => {
                    return Ok(ProfileDocument {
                        body,
                        source: ProfileSource::Remote,
                    })
                }
                Err(f) => f,
            },
            Err(f) => f,
        };

        warn!(login, reason = %failure, "remote profile unavailable, trying fallback");
        self.fallback(login, &failure).await
    }

    async fn fetch_remote(&self, login: &str, token: &str) -> Result<String, UpstreamFailure> {
        let url = format!("{}/users/{login}", self.api_base);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UpstreamFailure::Transport(format!("profile request: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| UpstreamFailure::Transport(format!("profile body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_rejection(status, &body));
        }

        Ok(body)
    }

    async fn fallback(
        &self,
        login: &str,
        reason: &UpstreamFailure,
    ) -> Result<ProfileDocument, ProfileError> {
        let body = read_fallback(&self.fallback_dir, login).await?;
        info!(login, reason = %reason, "serving fallback profile");
        Ok(ProfileDocument {
            body,
            source: ProfileSource::Fallback,
        })
    }
}

/// Read `<dir>/<login>.json` verbatim. The login has already been
/// validated, so the join cannot escape the directory.
async fn read_fallback(dir: &Path, login: &str) -> Result<String, ProfileError> {
    let path = dir.join(format!("{login}.json"));
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ProfileError::NotFound(login.to_string()))
        }
        Err(e) => Err(ProfileError::FallbackUnreadable(format!("{login}: {e}"))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_lifetime_applies_margin() {
        let lifetime = cache_lifetime(3600, Duration::from_secs(30));
        assert_eq!(lifetime.as_secs(), 3570);
    }

    #[test]
    fn test_cache_lifetime_clamps_to_floor() {
        // A 20s lifetime minus a 30s margin must not go negative; the
        // floor keeps the token usable for at least 30s.
        let lifetime = cache_lifetime(20, Duration::from_secs(30));
        assert_eq!(lifetime.as_secs(), MIN_TOKEN_LIFETIME_SECS);

        let lifetime = cache_lifetime(0, Duration::from_secs(60));
        assert_eq!(lifetime.as_secs(), MIN_TOKEN_LIFETIME_SECS);
    }

    #[test]
    fn test_token_freshness_window() {
        let now = Instant::now();
        let token = CachedToken {
            value: "tok".to_string(),
            expires_at: now + cache_lifetime(3600, Duration::from_secs(30)),
        };

        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + Duration::from_secs(3569)));
        assert!(
            !token.is_fresh(now + Duration::from_secs(3570)),
            "token must count as absent once the margin-adjusted lifetime elapses"
        );
    }

    #[test]
    fn test_parse_token_body_defaults_expires_in() {
        let (token, lifetime) =
            parse_token_body(r#"{"access_token":"abc"}"#, Duration::from_secs(30)).unwrap();
        assert_eq!(token, "abc");
        assert_eq!(lifetime.as_secs(), 3600 - 30);
    }

    #[test]
    fn test_parse_token_body_missing_token_is_malformed() {
        let err =
            parse_token_body(r#"{"expires_in":7200}"#, Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, UpstreamFailure::Malformed(_)));

        let err = parse_token_body(r#"{"access_token":""}"#, Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, UpstreamFailure::Malformed(_)));
    }

    #[test]
    fn test_parse_token_body_bad_json_is_malformed() {
        let err = parse_token_body("<html>oops</html>", Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, UpstreamFailure::Malformed(_)));
    }

    #[test]
    fn test_classify_403_with_challenge_marker() {
        let body = "<html><div id=\"cf-chl-widget\">checking your browser</div></html>";
        assert!(matches!(classify_rejection(403, body), UpstreamFailure::Blocked));

        let body = "<title>Just a moment...</title>";
        assert!(matches!(classify_rejection(403, body), UpstreamFailure::Blocked));
    }

    #[test]
    fn test_classify_plain_rejections() {
        assert!(matches!(
            classify_rejection(403, "{\"error\":\"forbidden\"}"),
            UpstreamFailure::Rejected { status: 403 }
        ));
        assert!(matches!(
            classify_rejection(500, "cf-chl"),
            UpstreamFailure::Rejected { status: 500 },
        ));
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let body = "é".repeat(300);
        let s = snippet(&body);
        assert!(s.len() <= SNIPPET_MAX_BYTES);
        assert!(body.starts_with(s));

        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn test_login_validation() {
        assert!(is_valid_login("pedmonte"));
        assert!(is_valid_login("user-42_x"));
        assert!(!is_valid_login(""));
        assert!(!is_valid_login("PedMonte"), "intra logins are lowercase");
        assert!(!is_valid_login("../etc"));
        assert!(!is_valid_login("a/b"));
        assert!(!is_valid_login(&"a".repeat(33)));
    }

    #[tokio::test]
    async fn test_read_fallback_returns_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"{"login":"pedmonte","campus":"Porto"}"#;
        std::fs::write(dir.path().join("pedmonte.json"), content).unwrap();

        let body = read_fallback(dir.path(), "pedmonte").await.unwrap();
        assert_eq!(body, content);
    }

    #[tokio::test]
    async fn test_read_fallback_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_fallback(dir.path(), "nosuch").await.unwrap_err();
        assert!(matches!(err, ProfileError::NotFound(login) if login == "nosuch"));
    }

    #[tokio::test]
    async fn test_profile_rejects_invalid_login_before_any_io() {
        let config = IntraConfig {
            token_url: "http://127.0.0.1:1/oauth/token".to_string(),
            api_base: "http://127.0.0.1:1/v2".to_string(),
            client_id_key: "INTRA_CLIENT_ID".to_string(),
            client_secret_key: "INTRA_CLIENT_SECRET".to_string(),
            timeout_seconds: 1,
            token_margin_seconds: 30,
            fallback_dir: "/nonexistent".to_string(),
        };
        let client = IntraClient::new(&config, None).unwrap();

        let err = client.profile("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ProfileError::InvalidLogin));
    }

    #[tokio::test]
    async fn test_unconfigured_client_serves_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"{"login":"pedmonte"}"#;
        std::fs::write(dir.path().join("pedmonte.json"), content).unwrap();

        let config = IntraConfig {
            token_url: "http://127.0.0.1:1/oauth/token".to_string(),
            api_base: "http://127.0.0.1:1/v2".to_string(),
            client_id_key: "INTRA_CLIENT_ID".to_string(),
            client_secret_key: "INTRA_CLIENT_SECRET".to_string(),
            timeout_seconds: 1,
            token_margin_seconds: 30,
            fallback_dir: dir.path().to_string_lossy().to_string(),
        };
        let client = IntraClient::new(&config, None).unwrap();

        let doc = client.profile("pedmonte").await.unwrap();
        assert_eq!(doc.source, ProfileSource::Fallback);
        assert_eq!(doc.body, content);
    }
}
