use crate::config::ExportConfig;
use regex::Regex;
use std::sync::OnceLock;

/// Matches `[registry/]...[sandbox-]name:rest` and keeps only `name`.
const NORMALIZE_PATTERN: &str = r"(.*/)?(sandbox-)?([^:]*):.*";

fn normalize_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NORMALIZE_PATTERN).expect("static pattern compiles"))
}

/// Reduce an image reference to its short, filesystem-safe name.
///
/// Strips any leading registry path segments and a disposable `sandbox-`
/// marker, keeping the final path component before the tag separator:
/// `registry.example.org/sandbox-drupal:9` becomes `drupal`. References
/// without a tag separator pass through unchanged, which makes the
/// normalization idempotent.
pub fn normalize_image_name(image: &str) -> String {
    normalize_regex().replace(image, "$3").into_owned()
}

/// Remove the local registry's explicit insecure port from a reference.
/// Applied before the reference is handed to the container engine.
pub fn strip_insecure_port(image: &str, config: &ExportConfig) -> String {
    image.replace(&config.insecure_port, "")
}

/// Compute the single human-readable tag embedded in an exported archive.
///
/// Takes the reference up to the digest separator, strips the public
/// registry origin, and substitutes the local registry literal with its
/// short alias.
pub fn compute_export_tag(image: &str, config: &ExportConfig) -> String {
    let tag = image.split('@').next().unwrap_or(image);
    let tag = tag.strip_prefix(&config.origin_prefix).unwrap_or(tag);
    tag.replace(&config.local_registry, &config.registry_alias)
}
