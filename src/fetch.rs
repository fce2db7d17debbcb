use crate::engine::ContainerEngine;
use crate::error::StevedoreError;
use crate::fs_utils::clear_dir;
use crate::reference::normalize_image_name;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of one fetch batch. Failed images do not prevent siblings from
/// being written, but any failure marks the batch as failed.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Normalized image name -> manifest file written.
    pub manifests: BTreeMap<String, PathBuf>,
    pub failures: Vec<StevedoreError>,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fetches the multi-architecture manifest list for each requested image and
/// persists the raw document as `<normalizedName>.json`.
pub struct ManifestFetcher {
    engine: Arc<dyn ContainerEngine>,
    dest: PathBuf,
}

impl ManifestFetcher {
    pub fn new(engine: Arc<dyn ContainerEngine>, dest: PathBuf) -> Self {
        Self { engine, dest }
    }

    /// Fetch manifests for the whole image set.
    ///
    /// The destination directory is cleared up front, so no file from a
    /// prior run survives. Each image is an independent unit of work with
    /// its own output file; two references that normalize to the same name
    /// overwrite each other, last write wins.
    pub async fn fetch(&self, images: &[String]) -> anyhow::Result<FetchReport> {
        clear_dir(&self.dest)?;

        let tasks = images.iter().map(|image| async move {
            let name = normalize_image_name(image);
            let file = self.dest.join(format!("{}.json", name));

            tracing::info!(image = %image, "Fetching manifest list");
            match self.engine.inspect_manifest(image).await {
                Ok(bytes) => match fs::write(&file, &bytes) {
                    Ok(()) => Ok((name, file)),
                    Err(e) => Err(StevedoreError::ManifestFetch {
                        image: image.clone(),
                        reason: e.to_string(),
                    }),
                },
                Err(e) => Err(StevedoreError::ManifestFetch {
                    image: image.clone(),
                    reason: e.to_string(),
                }),
            }
        });

        let mut report = FetchReport::default();
        for result in join_all(tasks).await {
            match result {
                Ok((name, file)) => {
                    report.manifests.insert(name, file);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Manifest fetch failed");
                    report.failures.push(e);
                }
            }
        }

        tracing::info!(
            fetched = report.manifests.len(),
            failed = report.failures.len(),
            "Manifest fetch batch finished"
        );
        Ok(report)
    }
}
