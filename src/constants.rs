// Centralized constants for the stevedore pipeline to avoid magic values

/// Platforms accepted from a manifest list. Everything else is filtered out.
pub const SUPPORTED_PLATFORMS: &[&str] = &["linux/amd64", "linux/arm64"];

/// Default timeout for a single container engine invocation in seconds (10 minutes)
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 600;

/// Default directory for fetched manifest-list documents
pub const DEFAULT_MANIFESTS_DIR: &str = "manifests";

/// Default directory for exported image archives
pub const DEFAULT_EXPORTS_DIR: &str = "exports";

/// Default directory for generated waybill files
pub const DEFAULT_WAYBILLS_DIR: &str = "waybills";

/// Default directory for verified downloads
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";

/// Default directory for unpacked downloads
pub const DEFAULT_UNPACKED_DIR: &str = "unpacked";

/// Architectures derived from the supported platform list
pub fn supported_architectures() -> Vec<&'static str> {
    SUPPORTED_PLATFORMS
        .iter()
        .copied()
        .map(|p| p.split('/').nth(1).unwrap_or(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architectures_follow_platforms() {
        assert_eq!(supported_architectures(), vec!["amd64", "arm64"]);
    }
}
