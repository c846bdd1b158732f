//! Installs from the latest release of a GitHub repository.

use std::path::PathBuf;

use serde::Deserialize;

use super::archive::{self, ArchiveKind, MAX_SEARCH_DEPTH};
use super::{Installer, Platform};
use crate::error::InstallError;

/// Picks the release asset for a platform, given the asset's file name.
pub type AssetMatcher = fn(Platform, &str) -> bool;

/// Where a release-distributed server comes from.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseSpec {
    /// `owner/name` of the GitHub repository.
    pub repo: &'static str,
    /// Executable name inside the asset, without platform suffix.
    pub binary: &'static str,
    pub matcher: AssetMatcher,
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

impl Installer {
    /// Download the latest release asset for this platform and flatten its
    /// binary into the cache's `bin/`.
    pub async fn install_release(&self, spec: &ReleaseSpec) -> Result<PathBuf, InstallError> {
        self.install_release_for(spec, Platform::current()).await
    }

    pub(crate) async fn install_release_for(
        &self,
        spec: &ReleaseSpec,
        platform: Platform,
    ) -> Result<PathBuf, InstallError> {
        let target = self.bin_path(spec.binary);
        if target.exists() {
            return Ok(target);
        }

        let url = format!("{}/repos/{}/releases/latest", self.api_base, spec.repo);
        let release: Release = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|source| InstallError::Http {
                url: url.clone(),
                source,
            })?;

        let asset = release
            .assets
            .iter()
            .find(|asset| (spec.matcher)(platform, &asset.name))
            .ok_or_else(|| InstallError::NoMatchingAsset {
                repo: spec.repo.to_string(),
                platform: platform.to_string(),
            })?;

        tracing::info!(
            repo = spec.repo,
            tag = release.tag_name.as_deref().unwrap_or("latest"),
            asset = %asset.name,
            "Downloading language server release"
        );
        let bytes = self
            .get(&asset.browser_download_url)
            .await?
            .bytes()
            .await
            .map_err(|source| InstallError::Http {
                url: asset.browser_download_url.clone(),
                source,
            })?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(InstallError::io(format!("creating {}", self.root.display())))?;
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&self.root)
            .map_err(InstallError::io("creating download directory"))?;
        let download = staging.path().join(&asset.name);
        tokio::fs::write(&download, &bytes)
            .await
            .map_err(InstallError::io(format!("writing {}", download.display())))?;

        let unpacked = staging.path().join("unpacked");
        tokio::fs::create_dir_all(&unpacked)
            .await
            .map_err(InstallError::io("creating extraction directory"))?;
        archive::extract(
            &download,
            ArchiveKind::from_name(&asset.name),
            &unpacked,
            spec.binary,
        )
        .await?;

        let found = archive::find_binary(&unpacked, spec.binary, MAX_SEARCH_DEPTH)
            .ok_or_else(|| InstallError::BinaryMissing(spec.binary.to_string()))?;

        let bin_dir = self.bin_dir();
        tokio::fs::create_dir_all(&bin_dir)
            .await
            .map_err(InstallError::io(format!("creating {}", bin_dir.display())))?;
        // Staging lives under the cache root, so this stays on one filesystem.
        tokio::fs::rename(&found, &target)
            .await
            .map_err(InstallError::io(format!("moving {}", found.display())))?;
        archive::make_executable(&target)
            .map_err(InstallError::io(format!("marking {} executable", target.display())))?;

        Ok(target)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, InstallError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| InstallError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}
