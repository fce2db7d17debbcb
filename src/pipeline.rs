use crate::config::ExportConfig;
use crate::constants::{DEFAULT_EXPORTS_DIR, DEFAULT_MANIFESTS_DIR};
use crate::engine::ContainerEngine;
use crate::error::StevedoreError;
use crate::export::{ExportedArchive, ImageExporter};
use crate::fetch::ManifestFetcher;
use crate::manifest::{parse_manifest, PlatformEntry};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a caller needs to judge a run: what was produced and which
/// entries failed. The pipeline never retries; a failed entry is reported
/// and its output regenerated on the next run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Normalized image name -> fetched manifest file.
    pub manifests: BTreeMap<String, PathBuf>,
    /// Platform entries accepted by the parser across all manifests.
    pub entries: Vec<PlatformEntry>,
    /// Final per-architecture archives.
    pub archives: Vec<ExportedArchive>,
    pub failures: Vec<StevedoreError>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The full fetch -> parse/filter -> export pipeline as a pure function from
/// an image set to an archive set, with all state on the filesystem under
/// one build directory.
pub struct Pipeline {
    engine: Arc<dyn ContainerEngine>,
    config: ExportConfig,
    build_dir: PathBuf,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ExportConfig, build_dir: PathBuf) -> Self {
        Self {
            engine,
            config,
            build_dir,
        }
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.build_dir.join(DEFAULT_MANIFESTS_DIR)
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.build_dir.join(DEFAULT_EXPORTS_DIR)
    }

    /// Run the three stages with a full barrier between each: every image is
    /// attempted in a stage before the next stage starts. Failures are
    /// scoped to their entry and collected; siblings keep going.
    pub async fn run(&self, images: &[String]) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        // Stage 1: fetch manifest lists, one unit of work per image.
        let fetcher = ManifestFetcher::new(self.engine.clone(), self.manifests_dir());
        let fetched = fetcher.fetch(images).await?;
        report.failures.extend(fetched.failures);
        report.manifests = fetched.manifests;

        // Stage 2: parse and filter. A malformed manifest drops only itself.
        let manifest_files: Vec<PathBuf> = report.manifests.values().cloned().collect();
        for file in &manifest_files {
            match parse_manifest(file, &self.config) {
                Ok(mut entries) => report.entries.append(&mut entries),
                Err(e) => {
                    tracing::error!(error = %e, "Skipping malformed manifest");
                    report.failures.push(e);
                }
            }
        }

        // Stage 3: export, one unit of work per (image, architecture).
        let exporter = ImageExporter::new(
            self.engine.clone(),
            self.config.clone(),
            self.exports_dir(),
        );
        let exported = exporter.export(&report.entries).await?;
        report.archives = exported.exported;
        report.failures.extend(exported.failures);

        Ok(report)
    }
}
