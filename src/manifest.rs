use crate::config::ExportConfig;
use crate::error::StevedoreError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

// Shape produced by `docker manifest inspect --verbose` for a manifest list:
// a JSON array of entries, each carrying the tag reference, the per-platform
// content digest, and a platform descriptor. Unknown fields are ignored.

#[derive(Debug, Deserialize)]
struct RawPlatform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    digest: String,
    platform: RawPlatform,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "Ref")]
    reference: String,
    #[serde(rename = "Descriptor")]
    descriptor: RawDescriptor,
}

/// One accepted `(architecture, os)` variant of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry {
    /// Digest-pinned reference, `repository@digest`. The tag is discarded
    /// because every platform in a manifest list shares it while differing
    /// by digest.
    pub image: String,
    pub architecture: String,
    pub os: String,
}

impl PlatformEntry {
    pub fn platform(&self) -> String {
        format!("{}/{}", self.os, self.architecture)
    }
}

/// Parse a fetched manifest file into the accepted platform entries.
///
/// Entries with `os != "linux"` or an unsupported architecture are dropped.
/// A malformed document fails this manifest only, not the batch.
pub fn parse_manifest(
    path: &Path,
    config: &ExportConfig,
) -> Result<Vec<PlatformEntry>, StevedoreError> {
    let file = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| StevedoreError::ManifestParse {
        file: file.clone(),
        reason: e.to_string(),
    })?;
    parse_manifest_str(&text, config).map_err(|reason| StevedoreError::ManifestParse { file, reason })
}

fn parse_manifest_str(text: &str, config: &ExportConfig) -> Result<Vec<PlatformEntry>, String> {
    let entries: Vec<RawEntry> = serde_json::from_str(text).map_err(|e| e.to_string())?;

    Ok(entries
        .into_iter()
        .filter(|entry| {
            config.accepts(
                &entry.descriptor.platform.os,
                &entry.descriptor.platform.architecture,
            )
        })
        .map(|entry| {
            let repository = entry
                .reference
                .split('@')
                .next()
                .unwrap_or(&entry.reference)
                .to_string();
            PlatformEntry {
                image: format!("{}@{}", repository, entry.descriptor.digest),
                architecture: entry.descriptor.platform.architecture,
                os: entry.descriptor.platform.os,
            }
        })
        .collect())
}
