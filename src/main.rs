use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stevedore::config::ExportConfig;
use stevedore::constants::{
    DEFAULT_DOWNLOADS_DIR, DEFAULT_ENGINE_TIMEOUT_SECS, DEFAULT_MANIFESTS_DIR,
    DEFAULT_UNPACKED_DIR, DEFAULT_WAYBILLS_DIR,
};
use stevedore::download::{read_waybills, unpack_downloads, Downloader};
use stevedore::engine::{ContainerEngine, DockerCli};
use stevedore::fetch::ManifestFetcher;
use stevedore::logging::init_logging;
use stevedore::pipeline::Pipeline;

#[derive(Parser)]
#[command(
    name = "stevedore",
    about = "Manifest-driven multi-architecture container image export pipeline"
)]
struct Cli {
    /// Emit logs as JSON instead of human-readable output
    #[arg(long, global = true)]
    json_logs: bool,

    /// Container engine binary to invoke
    #[arg(long, global = true, default_value = "docker")]
    docker_bin: String,

    /// Timeout in seconds for each engine invocation
    #[arg(long, global = true, default_value_t = DEFAULT_ENGINE_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Pass --insecure to manifest inspection (plain-HTTP local registries)
    #[arg(long, global = true, default_value_t = true, action = clap::ArgAction::Set)]
    insecure: bool,

    /// Directory all pipeline stages write under
    #[arg(long, global = true, default_value = ".stevedore")]
    build_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConfigArgs {
    /// Supported platforms, `os/architecture`
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// Public registry origin stripped from export tags
    #[arg(long)]
    origin_prefix: Option<String>,

    /// Local insecure registry `host:port`
    #[arg(long)]
    local_registry: Option<String>,

    /// Short alias substituted for the local registry in export tags
    #[arg(long)]
    registry_alias: Option<String>,
}

impl ConfigArgs {
    fn build(&self) -> ExportConfig {
        let mut config = ExportConfig::default();
        if !self.platforms.is_empty() {
            config.platforms = self.platforms.clone();
        }
        if let Some(prefix) = &self.origin_prefix {
            config.origin_prefix = prefix.clone();
        }
        if let Some(registry) = &self.local_registry {
            config.local_registry = registry.clone();
        }
        if let Some(alias) = &self.registry_alias {
            config.registry_alias = alias.clone();
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Fetch multi-architecture manifest lists for a set of images
    Fetch {
        /// Image references to inspect
        #[arg(long = "image", required = true)]
        images: Vec<String>,
    },
    /// Run the full pipeline: fetch, filter, and export per-architecture archives
    Export {
        /// Image references to export
        #[arg(long = "image", required = true)]
        images: Vec<String>,

        /// Registry username; password is read from STEVEDORE_REGISTRY_PASSWORD
        #[arg(long)]
        username: Option<String>,

        #[arg(long, env = "STEVEDORE_REGISTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Download and checksum-verify artifacts declared by waybill files
    Download {
        /// Directory of waybill JSON files
        #[arg(long)]
        waybills: Option<PathBuf>,

        /// Root directory sidecar paths are recorded relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Unpack verified downloads (gzip, xz, and zip)
    Unpack {
        /// Root directory sidecar paths are recorded relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.json_logs) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::new(
        cli.docker_bin.clone(),
        cli.insecure,
        Duration::from_secs(cli.timeout_secs),
    ));

    match cli.command {
        Command::Fetch { images } => {
            let fetcher =
                ManifestFetcher::new(engine, cli.build_dir.join(DEFAULT_MANIFESTS_DIR));
            let report = fetcher.fetch(&images).await?;
            println!(
                "Fetched {} manifest(s), {} failure(s)",
                report.manifests.len(),
                report.failures.len()
            );
            finish(&report.failures)
        }
        Command::Export {
            images,
            username,
            password,
            config,
        } => {
            if let (Some(username), Some(password)) = (username.as_deref(), password.as_deref()) {
                // Anonymous manifest inspection is rate limited, so sign in
                // up front when credentials are available.
                engine.login(username, password).await?;
            }

            let pipeline = Pipeline::new(engine, config.build(), cli.build_dir.clone());
            let report = pipeline.run(&images).await?;

            println!(
                "Exported {} archive(s) from {} platform entr(ies)",
                report.archives.len(),
                report.entries.len()
            );
            for archive in &report.archives {
                println!("  {}", archive.archive.display());
            }
            finish(&report.failures)
        }
        Command::Download { waybills, root } => {
            let src = waybills.unwrap_or_else(|| cli.build_dir.join(DEFAULT_WAYBILLS_DIR));
            let bills = read_waybills(&src)?;
            let downloader =
                Downloader::new(cli.build_dir.join(DEFAULT_DOWNLOADS_DIR), root);
            let report = downloader.download(&bills).await?;
            println!(
                "Downloaded {} file(s), {} failure(s)",
                report.downloaded.len(),
                report.failures.len()
            );
            finish(&report.failures)
        }
        Command::Unpack { root } => {
            let unpacked = unpack_downloads(
                &cli.build_dir.join(DEFAULT_DOWNLOADS_DIR),
                &cli.build_dir.join(DEFAULT_UNPACKED_DIR),
                &root,
            )?;
            println!("Unpacked {} file(s)", unpacked.len());
            Ok(())
        }
    }
}

/// Enumerate failed entries and terminate non-zero when any entry failed.
fn finish(failures: &[stevedore::error::StevedoreError]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    eprintln!("{} entr(ies) failed:", failures.len());
    for failure in failures {
        eprintln!("  - {}", failure);
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_defaults_to_true() {
        let cli = Cli::try_parse_from(["stevedore", "fetch", "--image", "drupal:9"]).unwrap();
        assert!(cli.insecure);
    }

    #[test]
    fn test_insecure_can_be_disabled() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "--insecure",
            "false",
            "fetch",
            "--image",
            "drupal:9",
        ])
        .unwrap();
        assert!(!cli.insecure);
    }
}
