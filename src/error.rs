/// Stevedore error types and handling utilities
/// Main error type for pipeline operations
#[derive(Debug)]
pub enum StevedoreError {
    /// Registry manifest inspect call failed for one image
    ManifestFetch { image: String, reason: String },
    /// Malformed manifest-list document
    ManifestParse { file: String, reason: String },
    /// Platform-pinned image pull failed
    ImagePull {
        image: String,
        platform: String,
        reason: String,
    },
    /// Exporting the pulled image to an archive failed
    ImageSave { image: String, reason: String },
    /// Unpacking, rewriting or repacking the archive failed
    ImageRepack { image: String, reason: String },
    /// Downloaded file did not match its declared digest
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    /// Wrapped anyhow error for compatibility
    Other(anyhow::Error),
}

impl std::fmt::Display for StevedoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManifestFetch { image, reason } => {
                write!(f, "Manifest fetch failed for {}: {}", image, reason)
            }
            Self::ManifestParse { file, reason } => {
                write!(f, "Malformed manifest {}: {}", file, reason)
            }
            Self::ImagePull {
                image,
                platform,
                reason,
            } => {
                write!(f, "Pull failed for {} ({}): {}", image, platform, reason)
            }
            Self::ImageSave { image, reason } => {
                write!(f, "Save failed for {}: {}", image, reason)
            }
            Self::ImageRepack { image, reason } => {
                write!(f, "Repack failed for {}: {}", image, reason)
            }
            Self::ChecksumMismatch {
                file,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Checksum does not match for {}. Expected: {}, Calculated: {}",
                    file, expected, actual
                )
            }
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StevedoreError {}

impl From<anyhow::Error> for StevedoreError {
    fn from(err: anyhow::Error) -> Self {
        StevedoreError::Other(err)
    }
}

impl From<std::io::Error> for StevedoreError {
    fn from(err: std::io::Error) -> Self {
        StevedoreError::Other(err.into())
    }
}

impl StevedoreError {
    /// The entry (image or download) an error is scoped to, for batch reporting.
    pub fn entry(&self) -> Option<&str> {
        match self {
            Self::ManifestFetch { image, .. }
            | Self::ImagePull { image, .. }
            | Self::ImageSave { image, .. }
            | Self::ImageRepack { image, .. } => Some(image),
            Self::ManifestParse { file, .. } | Self::ChecksumMismatch { file, .. } => Some(file),
            Self::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = StevedoreError::ManifestFetch {
            image: "registry.example.org/sandbox-drupal:9".to_string(),
            reason: "exit status 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sandbox-drupal:9"));
        assert!(msg.contains("exit status 1"));
    }

    #[test]
    fn test_checksum_error_display() {
        let err = StevedoreError::ChecksumMismatch {
            file: "composer.phar".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Expected: abc123"));
        assert!(msg.contains("Calculated: def456"));
    }

    #[test]
    fn test_entry_scoping() {
        let err = StevedoreError::ImagePull {
            image: "drupal@sha256:abc".to_string(),
            platform: "linux/arm64".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.entry(), Some("drupal@sha256:abc"));

        let other = StevedoreError::Other(anyhow::anyhow!("boom"));
        assert_eq!(other.entry(), None);
    }
}
