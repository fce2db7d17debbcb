use crate::error::StevedoreError;
use crate::fs_utils::{clear_dir, sha256_file};
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xz2::read::XzDecoder;

/// Declaration of one external artifact: where to get it, what it must hash
/// to, and the filename it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WayBill {
    pub url: String,
    pub sha256: String,
    pub filename: String,
}

/// Write each waybill as its own JSON file so the download stage can consume
/// them one unit of work at a time.
pub fn generate_waybills(waybills: &[WayBill], dest: &Path) -> Result<()> {
    clear_dir(dest)?;
    for bill in waybills {
        fs::write(dest.join(&bill.filename), serde_json::to_vec(bill)?)?;
    }
    Ok(())
}

/// Read every waybill file in a directory, in filename order.
pub fn read_waybills(src: &Path) -> Result<Vec<WayBill>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(src)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut waybills = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path)?;
        let bill: WayBill = serde_json::from_str(&text)
            .with_context(|| format!("invalid waybill {}", path.display()))?;
        waybills.push(bill);
    }
    Ok(waybills)
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<PathBuf>,
    pub failures: Vec<StevedoreError>,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Downloads declared artifacts and verifies them against their waybills.
/// Every verified file gets a `<name>.sha256` sidecar recording the hash and
/// the path relative to the project root.
pub struct Downloader {
    client: reqwest::Client,
    dest: PathBuf,
    root: PathBuf,
}

impl Downloader {
    pub fn new(dest: PathBuf, root: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            dest,
            root,
        }
    }

    pub async fn download(&self, waybills: &[WayBill]) -> Result<DownloadReport> {
        clear_dir(&self.dest)?;

        let tasks = waybills.iter().map(|bill| async move {
            tracing::info!(url = %bill.url, file = %bill.filename, "Downloading");
            self.download_one(bill).await
        });

        let mut report = DownloadReport::default();
        for result in join_all(tasks).await {
            match result {
                Ok(path) => report.downloaded.push(path),
                Err(e) => {
                    tracing::error!(error = %e, "Download failed");
                    report.failures.push(e);
                }
            }
        }
        Ok(report)
    }

    async fn download_one(&self, bill: &WayBill) -> Result<PathBuf, StevedoreError> {
        let target = self.dest.join(&bill.filename);

        let fetch = async {
            let response = self
                .client
                .get(&bill.url)
                .send()
                .await?
                .error_for_status()?;
            let bytes = response.bytes().await?;
            fs::write(&target, &bytes)?;
            anyhow::Ok(())
        };
        fetch
            .await
            .map_err(|e: anyhow::Error| StevedoreError::Other(e))?;

        let actual = verify(&target, bill)?;
        write_sidecar(&target, &actual, &self.root).map_err(StevedoreError::Other)?;
        Ok(target)
    }
}

/// Check a downloaded file against its waybill's declared digest and return
/// the calculated hash.
pub fn verify(path: &Path, bill: &WayBill) -> Result<String, StevedoreError> {
    let actual = sha256_file(path).map_err(StevedoreError::Other)?;
    if actual != bill.sha256 {
        return Err(StevedoreError::ChecksumMismatch {
            file: bill.filename.clone(),
            expected: bill.sha256.clone(),
            actual,
        });
    }
    Ok(actual)
}

/// Record a verified hash next to the file it belongs to, in the same
/// `<hash>\t<relative path>` format `sha256sum -c` understands.
pub fn write_sidecar(file: &Path, hash: &str, root: &Path) -> Result<()> {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let name = file
        .file_name()
        .context("sidecar target has no file name")?
        .to_string_lossy();
    fs::write(
        file.with_file_name(format!("{}.sha256", name)),
        format!("{}\t{}\n", hash, relative.display()),
    )?;
    Ok(())
}

/// Unpack every supported download into the destination directory, hashing
/// the unpacked results the same way the download stage hashes archives.
///
/// Single-file compression (`xz`, `gz`) decompresses to the filename minus
/// its extension; `zip` archives each extract into their own subdirectory so
/// multiple archives cannot collide. Files in other formats are left alone.
pub fn unpack_downloads(src: &Path, dest: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    clear_dir(dest)?;

    let supported = ["xz", "zip", "gz"];
    let mut archives: Vec<PathBuf> = fs::read_dir(src)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| supported.contains(&e))
                .unwrap_or(false)
        })
        .collect();
    archives.sort();

    let mut unpacked = Vec::with_capacity(archives.len());
    for archive in archives {
        let extension = archive
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let target = match extension {
            "zip" => unpack_zip(&archive, dest, root)?,
            "xz" => decompress_file(XzDecoder::new(File::open(&archive)?), &archive, dest, root)?,
            _ => decompress_file(GzDecoder::new(File::open(&archive)?), &archive, dest, root)?,
        };
        unpacked.push(target);
    }
    Ok(unpacked)
}

/// Stream-decompress a single-file archive and record its sidecar.
fn decompress_file<R: Read>(
    mut reader: R,
    archive: &Path,
    dest: &Path,
    root: &Path,
) -> Result<PathBuf> {
    let stem = archive.file_stem().context("archive has no file stem")?;
    let target = dest.join(stem);

    let mut output = File::create(&target)?;
    io::copy(&mut reader, &mut output)?;

    let hash = sha256_file(&target)?;
    write_sidecar(&target, &hash, root)?;
    Ok(target)
}

/// Extract a zip archive into `dest/<archive name>` with a sidecar per
/// extracted file.
fn unpack_zip(archive: &Path, dest: &Path, root: &Path) -> Result<PathBuf> {
    let name = archive.file_name().context("archive has no file name")?;
    let target_dir = dest.join(name);
    fs::create_dir_all(&target_dir)?;

    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        // Entries with unsafe paths are skipped rather than escaping dest.
        let out = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => continue,
        };
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out)?;
        io::copy(&mut entry, &mut output)?;
    }

    // Collect first so freshly written sidecars are not themselves hashed.
    let files: Vec<PathBuf> = WalkDir::new(&target_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect();
    for file in files {
        let hash = sha256_file(&file)?;
        write_sidecar(&file, &hash, root)?;
    }
    Ok(target_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_utils::sha256_bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_waybill_round_trip() {
        let dir = tempdir().unwrap();
        let bills = vec![
            WayBill {
                url: "https://example.org/composer.phar".to_string(),
                sha256: "abc".to_string(),
                filename: "composer.phar".to_string(),
            },
            WayBill {
                url: "https://example.org/tool.gz".to_string(),
                sha256: "def".to_string(),
                filename: "tool.gz".to_string(),
            },
        ];

        generate_waybills(&bills, dir.path()).unwrap();
        let read = read_waybills(dir.path()).unwrap();
        assert_eq!(read, bills);
    }

    #[test]
    fn test_generate_clears_previous_waybills() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stale.json"), "{}").unwrap();

        generate_waybills(&[], dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_verify_rejects_mismatched_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("composer.phar");
        fs::write(&path, b"tampered").unwrap();

        let bill = WayBill {
            url: "https://example.org/composer.phar".to_string(),
            sha256: sha256_bytes(b"original"),
            filename: "composer.phar".to_string(),
        };

        match verify(&path, &bill) {
            Err(StevedoreError::ChecksumMismatch {
                file,
                expected,
                actual,
            }) => {
                assert_eq!(file, "composer.phar");
                assert_eq!(expected, sha256_bytes(b"original"));
                assert_eq!(actual, sha256_bytes(b"tampered"));
            }
            other => panic!("expected checksum mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_verify_accepts_matching_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("composer.phar");
        fs::write(&path, b"original").unwrap();

        let bill = WayBill {
            url: "https://example.org/composer.phar".to_string(),
            sha256: sha256_bytes(b"original"),
            filename: "composer.phar".to_string(),
        };
        assert_eq!(verify(&path, &bill).unwrap(), sha256_bytes(b"original"));
    }

    #[test]
    fn test_sidecar_format() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("composer.phar");
        fs::write(&file, b"data").unwrap();

        write_sidecar(&file, "deadbeef", dir.path()).unwrap();

        let sidecar = fs::read_to_string(dir.path().join("composer.phar.sha256")).unwrap();
        assert_eq!(sidecar, "deadbeef\tcomposer.phar\n");
    }

    #[test]
    fn test_unpack_gzip_download() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let dest = dir.path().join("unpacked");
        fs::create_dir_all(&downloads).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"solr distribution").unwrap();
        fs::write(downloads.join("solr.tgz.gz"), encoder.finish().unwrap()).unwrap();
        // Files in unsupported formats are left alone.
        fs::write(downloads.join("composer.phar"), b"phar").unwrap();

        let unpacked = unpack_downloads(&downloads, &dest, dir.path()).unwrap();
        assert_eq!(unpacked.len(), 1);
        assert_eq!(fs::read(&unpacked[0]).unwrap(), b"solr distribution");

        let sidecar = fs::read_to_string(dest.join("solr.tgz.sha256")).unwrap();
        assert!(sidecar.starts_with(&sha256_bytes(b"solr distribution")));
    }

    #[test]
    fn test_unpack_xz_download() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let dest = dir.path().join("unpacked");
        fs::create_dir_all(&downloads).unwrap();

        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(b"virtual machine image").unwrap();
        fs::write(downloads.join("disk.img.xz"), encoder.finish().unwrap()).unwrap();

        let unpacked = unpack_downloads(&downloads, &dest, dir.path()).unwrap();
        assert_eq!(unpacked, vec![dest.join("disk.img")]);
        assert_eq!(
            fs::read(dest.join("disk.img")).unwrap(),
            b"virtual machine image"
        );

        let sidecar = fs::read_to_string(dest.join("disk.img.sha256")).unwrap();
        assert!(sidecar.starts_with(&sha256_bytes(b"virtual machine image")));
    }

    #[test]
    fn test_unpack_zip_into_its_own_directory() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let dest = dir.path().join("unpacked");
        fs::create_dir_all(&downloads).unwrap();

        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        let mut writer = zip::ZipWriter::new(File::create(downloads.join("tools.zip")).unwrap());
        writer.add_directory("bin", options).unwrap();
        writer.start_file("bin/tool", options).unwrap();
        writer.write_all(b"tool binary").unwrap();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"docs").unwrap();
        writer.finish().unwrap();

        let unpacked = unpack_downloads(&downloads, &dest, dir.path()).unwrap();
        // The archive extracts into a directory named after itself.
        assert_eq!(unpacked, vec![dest.join("tools.zip")]);
        assert_eq!(
            fs::read(dest.join("tools.zip").join("bin").join("tool")).unwrap(),
            b"tool binary"
        );

        // One sidecar per extracted file, and no sidecars of sidecars.
        let bin_sidecar =
            fs::read_to_string(dest.join("tools.zip").join("bin").join("tool.sha256")).unwrap();
        assert!(bin_sidecar.starts_with(&sha256_bytes(b"tool binary")));
        assert!(dest.join("tools.zip").join("readme.txt.sha256").is_file());
        assert!(!dest
            .join("tools.zip")
            .join("readme.txt.sha256.sha256")
            .exists());
    }
}
