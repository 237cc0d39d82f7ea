//! Update check against the relay's version endpoint.
//!
//! The check never fails the caller: network errors, bad responses and
//! missing fields all mean "no update available".

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Version of this build.
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Version request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Version endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

/// Body of `GET {relay}/api/version`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub download_url: Option<String>,
    pub github_url: Option<String>,
    /// This build is newer than the latest published release.
    pub is_prerelease: bool,
}

impl UpdateInfo {
    fn none(current: &str) -> Self {
        Self {
            update_available: false,
            current_version: current.to_string(),
            latest_version: None,
            download_url: None,
            github_url: None,
            is_prerelease: false,
        }
    }
}

/// Parse `1.2.3`, `v1.2.3` or a shortened `1.2`.
fn parse_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(v) = semver::Version::parse(raw) {
        return Some(v);
    }
    let mut parts = raw.split('.').map(str::parse::<u64>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() {
        return None;
    }
    Some(semver::Version::new(major, minor, patch))
}

/// Compare the running version with the latest release.
///
/// Returns `(update_available, is_prerelease)`. Unparseable versions compare
/// as equal.
pub fn compare_versions(current: &str, latest: &str) -> (bool, bool) {
    match (parse_version(current), parse_version(latest)) {
        (Some(current), Some(latest)) => (latest > current, current > latest),
        _ => (false, false),
    }
}

/// Build the update report from a version endpoint response. Without both a
/// latest version and a download URL there is nothing to offer.
pub fn evaluate(current: &str, response: VersionResponse) -> UpdateInfo {
    let (update_available, is_prerelease) = response
        .latest_version
        .as_deref()
        .map_or((false, false), |latest| compare_versions(current, latest));
    UpdateInfo {
        update_available: update_available && response.download_url.is_some(),
        current_version: current.to_string(),
        latest_version: response.latest_version,
        download_url: response.download_url,
        github_url: response.github_url,
        is_prerelease,
    }
}

async fn fetch_latest(
    http: &reqwest::Client,
    relay_url: &str,
) -> Result<VersionResponse, VersionError> {
    let url = format!("{}/api/version", relay_url.trim_end_matches('/'));
    debug!(url = %url, "Checking for updates");
    let resp = http
        .get(&url)
        .timeout(VERSION_CHECK_TIMEOUT)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(VersionError::HttpStatus(resp.status().as_u16()));
    }
    Ok(resp.json().await?)
}

/// Ask the relay whether a newer receiver release exists.
pub async fn check_for_updates(http: &reqwest::Client, relay_url: &str, current: &str) -> UpdateInfo {
    match fetch_latest(http, relay_url).await {
        Ok(response) => {
            let info = evaluate(current, response);
            if info.update_available {
                info!(
                    current = %info.current_version,
                    latest = ?info.latest_version,
                    download_url = ?info.download_url,
                    "Update available"
                );
            } else {
                debug!(current = %info.current_version, latest = ?info.latest_version, "No update available");
            }
            info
        }
        Err(e) => {
            warn!(error = %e, "Update check failed");
            UpdateInfo::none(current)
        }
    }
}
