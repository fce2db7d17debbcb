use crate::config::ExportConfig;
use crate::engine::ContainerEngine;
use crate::error::StevedoreError;
use crate::fs_utils::clear_dir;
use crate::manifest::PlatformEntry;
use crate::reference::{compute_export_tag, normalize_image_name, strip_insecure_port};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Per-entry progress through the export pipeline. A failed transition
/// surfaces as a `StevedoreError` for that entry without affecting its
/// siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Pending,
    Pulled,
    Saved,
    Unpacked,
    Rewritten,
    Repacked,
    Done,
}

/// One final artifact: `destRoot/<architecture>/<normalizedImageName>.tar`.
#[derive(Debug, Clone)]
pub struct ExportedArchive {
    pub entry: PlatformEntry,
    pub archive: PathBuf,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub exported: Vec<ExportedArchive>,
    pub failures: Vec<StevedoreError>,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Exports one portable archive per accepted `(image, architecture)` pair,
/// with the embedded tag list rewritten to a normalized public name.
pub struct ImageExporter {
    engine: Arc<dyn ContainerEngine>,
    config: ExportConfig,
    dest: PathBuf,
}

impl ImageExporter {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ExportConfig, dest: PathBuf) -> Self {
        Self {
            engine,
            config,
            dest,
        }
    }

    /// Export all entries, one independent unit of work per entry.
    ///
    /// The destination root is cleared and the per-architecture
    /// subdirectories are created up front, so concurrent entries only ever
    /// touch disjoint paths and need no locking.
    pub async fn export(&self, entries: &[PlatformEntry]) -> Result<ExportReport> {
        clear_dir(&self.dest)?;
        for architecture in self.config.architectures() {
            fs::create_dir_all(self.dest.join(architecture))?;
        }

        let tasks = entries.iter().map(|entry| async move {
            let result = self.export_entry(entry).await;
            (entry, result)
        });

        let mut report = ExportReport::default();
        for (entry, result) in join_all(tasks).await {
            match result {
                Ok(archive) => {
                    tracing::info!(image = %entry.image, archive = %archive.display(), "Exported");
                    report.exported.push(ExportedArchive {
                        entry: entry.clone(),
                        archive,
                    });
                }
                Err(e) => {
                    tracing::error!(image = %entry.image, error = %e, "Export failed");
                    report.failures.push(e);
                }
            }
        }

        tracing::info!(
            exported = report.exported.len(),
            failed = report.failures.len(),
            "Export batch finished"
        );
        Ok(report)
    }

    async fn export_entry(&self, entry: &PlatformEntry) -> Result<PathBuf, StevedoreError> {
        let mut stage = ExportStage::Pending;
        let archive = self
            .dest
            .join(&entry.architecture)
            .join(format!("{}.tar", normalize_image_name(&entry.image)));
        let image = strip_insecure_port(&entry.image, &self.config);
        let platform = entry.platform();
        tracing::debug!(image = %image, ?stage, "Entry queued");

        // The engine's "save" uses whatever variant of a shared tag was
        // fetched last, so pulling immediately before saving is mandatory to
        // pin the correct architecture, even when the image is cached.
        self.engine
            .pull(&image, &platform)
            .await
            .map_err(|e| StevedoreError::ImagePull {
                image: image.clone(),
                platform: platform.clone(),
                reason: e.to_string(),
            })?;
        stage = ExportStage::Pulled;
        tracing::debug!(image = %image, ?stage, "Pulled platform variant");

        self.engine
            .save(&image, &archive)
            .await
            .map_err(|e| StevedoreError::ImageSave {
                image: image.clone(),
                reason: e.to_string(),
            })?;
        stage = ExportStage::Saved;
        tracing::debug!(image = %image, ?stage, "Saved archive");

        self.rewrite_archive(&archive, &image)
            .map_err(|e| StevedoreError::ImageRepack {
                image: image.clone(),
                reason: e.to_string(),
            })?;
        stage = ExportStage::Done;
        tracing::debug!(image = %image, ?stage, "Entry complete");

        Ok(archive)
    }

    /// Steps 3-5 of the per-entry pipeline: unpack the saved archive,
    /// rewrite its tag metadata, and repack it in place. The repacked
    /// archive is written to a temporary path and renamed over the final one
    /// so a failure never leaves a half-written artifact behind.
    fn rewrite_archive(&self, archive: &Path, image: &str) -> Result<()> {
        let unpacked = archive.with_extension("");
        unpack_archive(archive, &unpacked)?;
        fs::remove_file(archive)?;
        tracing::debug!(dir = %unpacked.display(), stage = ?ExportStage::Unpacked, "Unpacked");

        let tag = compute_export_tag(image, &self.config);
        rewrite_repo_tags(&unpacked.join("manifest.json"), &tag)?;
        tracing::debug!(tag = %tag, stage = ?ExportStage::Rewritten, "Rewrote tag list");

        let staging = archive.with_extension("tar.tmp");
        pack_dir(&unpacked, &staging)?;
        fs::rename(&staging, archive)?;
        tracing::debug!(archive = %archive.display(), stage = ?ExportStage::Repacked, "Repacked");

        fs::remove_dir_all(&unpacked)?;
        Ok(())
    }
}

/// Extract a saved image archive into a working directory.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    tar::Archive::new(file).unpack(dest)?;
    Ok(())
}

/// Replace the tag list of the single image configuration entry in the
/// archive's `manifest.json` with exactly one computed tag. The tag list is
/// fully replaced, never appended to; nothing else in the document changes.
pub fn rewrite_repo_tags(manifest: &Path, tag: &str) -> Result<()> {
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let mut root: serde_json::Value = serde_json::from_str(&text)?;

    let entries = root
        .as_array_mut()
        .context("archive manifest is not an array")?;
    let config = entries
        .iter_mut()
        .find(|entry| entry.is_object())
        .context("archive manifest has no image configuration entry")?;
    config["RepoTags"] = serde_json::json!([tag]);

    fs::write(manifest, serde_json::to_vec(&root)?)?;
    Ok(())
}

/// Re-archive an unpacked image directory.
///
/// Walks the tree top-down in sorted order (so repacking the same input is
/// reproducible), keeps empty directory entries, and relies on the GNU
/// header extensions for long path names and large sizes.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(file);

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }

    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn synthetic_image_dir(root: &Path) {
        fs::create_dir_all(root.join("aaa111")).unwrap();
        fs::write(root.join("aaa111").join("layer.tar"), b"layer-bytes").unwrap();
        fs::write(root.join("aaa111.json"), b"{\"config\":{}}").unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(
            root.join("manifest.json"),
            r#"[{"Config":"aaa111.json","RepoTags":["old:tag","stale:tag"],"Layers":["aaa111/layer.tar"]}]"#,
        )
        .unwrap();
    }

    #[test]
    fn test_rewrite_replaces_repo_tags_entirely() {
        let dir = tempdir().unwrap();
        synthetic_image_dir(dir.path());
        let manifest = dir.path().join("manifest.json");

        rewrite_repo_tags(&manifest, "sandbox/drupal:9").unwrap();

        let root: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&manifest).unwrap()).unwrap();
        let tags = root[0]["RepoTags"].as_array().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0], "sandbox/drupal:9");
        // The rest of the configuration entry is untouched.
        assert_eq!(root[0]["Config"], "aaa111.json");
        assert_eq!(root[0]["Layers"][0], "aaa111/layer.tar");
    }

    #[test]
    fn test_rewrite_rejects_non_array_manifest() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("manifest.json");
        fs::write(&manifest, r#"{"RepoTags": []}"#).unwrap();
        assert!(rewrite_repo_tags(&manifest, "sandbox/drupal:9").is_err());
    }

    #[test]
    fn test_pack_then_unpack_round_trips_layers() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("drupal");
        synthetic_image_dir(&src);

        let archive = dir.path().join("drupal.tar");
        pack_dir(&src, &archive).unwrap();

        let out = dir.path().join("out");
        unpack_archive(&archive, &out).unwrap();

        assert_eq!(
            fs::read(out.join("aaa111").join("layer.tar")).unwrap(),
            b"layer-bytes"
        );
        assert!(out.join("empty").is_dir());
        assert_eq!(
            fs::read(src.join("manifest.json")).unwrap(),
            fs::read(out.join("manifest.json")).unwrap()
        );
    }

    #[test]
    fn test_pack_is_reproducible() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("drupal");
        synthetic_image_dir(&src);

        let first = dir.path().join("first.tar");
        let second = dir.path().join("second.tar");
        pack_dir(&src, &first).unwrap();
        pack_dir(&src, &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }
}
