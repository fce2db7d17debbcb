use crate::constants::SUPPORTED_PLATFORMS;
use serde::{Deserialize, Serialize};

/// Settings for the export pipeline.
///
/// The registry alias substitution and origin prefix used to be hard-coded
/// string replacements; they are configuration here so a deployment with a
/// different local registry does not need a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Platforms (`os/architecture`) accepted from a manifest list.
    pub platforms: Vec<String>,
    /// Public registry origin stripped from the front of export tags.
    pub origin_prefix: String,
    /// Literal `host:port` of the local insecure registry.
    pub local_registry: String,
    /// Short alias substituted for `local_registry` in export tags.
    pub registry_alias: String,
    /// Port suffix removed from image references before pull/save. The local
    /// registry serves plain HTTP, so references may carry an explicit `:80`.
    pub insecure_port: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            platforms: SUPPORTED_PLATFORMS.iter().map(|p| p.to_string()).collect(),
            origin_prefix: "docker.io/".to_string(),
            local_registry: "registry.sandbox.dev:5000".to_string(),
            registry_alias: "sandbox".to_string(),
            insecure_port: ":80".to_string(),
        }
    }
}

impl ExportConfig {
    /// Architecture half of every supported platform, in declaration order.
    pub fn architectures(&self) -> Vec<String> {
        self.platforms
            .iter()
            .map(|p| p.split('/').nth(1).unwrap_or(p.as_str()).to_string())
            .collect()
    }

    /// Whether a manifest entry's platform descriptor is in the supported set.
    pub fn accepts(&self, os: &str, architecture: &str) -> bool {
        os == "linux" && self.architectures().iter().any(|a| a == architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_architectures() {
        let config = ExportConfig::default();
        assert_eq!(config.architectures(), vec!["amd64", "arm64"]);
    }

    #[test]
    fn test_accepts_only_linux() {
        let config = ExportConfig::default();
        assert!(config.accepts("linux", "amd64"));
        assert!(config.accepts("linux", "arm64"));
        assert!(!config.accepts("windows", "amd64"));
        assert!(!config.accepts("linux", "386"));
        assert!(!config.accepts("darwin", "arm64"));
    }
}
