//! pkgindex server
//!
//! Opens the keyfs store and the mirror stage described by the
//! configuration and runs one command against them.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pkgindex_common::config::Config;
use pkgindex_keyfs::KeyFs;
use pkgindex_mirror::{MirrorCaches, MirrorStage, NodeReplication, ReqwestClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pkgindex-server")]
#[command(about = "pkgindex mirroring package index")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/pkgindex/server.toml")]
    config: String,

    /// Directory holding the keyfs database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Upstream simple index URL
    #[arg(long)]
    mirror_url: Option<String>,

    /// Never contact upstream, serve cached data only
    #[arg(long)]
    offline: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the release links of a project
    Links { project: String },
    /// Print the versions of a project
    Versions { project: String },
    /// Print the names of all upstream projects
    Projects,
    /// Print the current keyfs serial
    Serial,
    /// Print the changelog entry committed at a serial as JSON
    Changelog { serial: u64 },
    /// Remove a project and its downloaded files from the mirror
    DeleteProject { project: String },
}

/// Config file, then `PKGINDEX__<SECTION>__<KEY>` variables, then flags
fn load_config(args: &Args) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(Path::new(&args.config)).required(false))
        .add_source(
            config::Environment::with_prefix("PKGINDEX")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load config {}", args.config))?;
    let mut config: Config = settings.try_deserialize()?;

    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(mirror_url) = &args.mirror_url {
        config.mirror.mirror_url.clone_from(mirror_url);
    }
    if args.offline {
        config.mirror.offline = true;
    }
    if config.node.role.is_replica() && config.node.replica_uuid.is_none() {
        config.node.replica_uuid = Some(uuid::Uuid::new_v4().simple().to_string());
    }
    Ok(config)
}

fn open_stage(config: &Config) -> Result<MirrorStage> {
    let keyfs = Arc::new(KeyFs::open(&config.storage, &config.node.data_dir)?);
    info!(
        "Opened keyfs in {} ({} backend)",
        config.node.data_dir.display(),
        keyfs.storage().backend_name()
    );
    let client = Arc::new(ReqwestClient::new(&config.mirror.user_agent)?);
    let replication = Arc::new(NodeReplication::new(
        Arc::clone(&keyfs),
        config.node.role.is_replica(),
    ));
    Ok(MirrorStage::new(
        keyfs,
        config,
        client,
        replication,
        MirrorCaches::new(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!("Starting pkgindex");
    info!("Config file: {}", args.config);
    info!(
        "Mirror {}/{} of {}",
        config.mirror.user, config.mirror.index, config.mirror.mirror_url
    );
    if let Some(uuid) = &config.node.replica_uuid {
        info!("Replica uuid: {}", uuid);
    }

    let stage = open_stage(&config)?;
    commands::run(&stage, args.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgindex_common::config::NodeRole;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["pkgindex-server"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let args = args(&["--config", path.to_str().unwrap(), "serial"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.mirror.mirror_url, "https://pypi.org/simple/");
        assert!(!config.mirror.offline);
        assert!(config.node.replica_uuid.is_none());
    }

    #[test]
    fn test_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[mirror]
mirror_url = "https://mirror.example/simple/"
cache_expiry_secs = 60

[node]
data_dir = "/srv/pkgindex"
role = {{ kind = "replica", primary_url = "http://primary:3141" }}
"#
        )
        .unwrap();

        let args = args(&[
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/tmp/override",
            "--offline",
            "links",
            "six",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.mirror.mirror_url, "https://mirror.example/simple/");
        assert_eq!(config.mirror.cache_expiry_secs, 60);
        assert!(config.mirror.offline);
        assert_eq!(config.node.data_dir, PathBuf::from("/tmp/override"));
        assert_eq!(
            config.node.role,
            NodeRole::Replica {
                primary_url: "http://primary:3141".into()
            }
        );
        assert!(config.node.replica_uuid.is_some());
        assert!(matches!(args.command, Command::Links { ref project } if project == "six"));
    }

    #[test]
    fn test_subcommand_names() {
        assert!(matches!(
            args(&["delete-project", "six"]).command,
            Command::DeleteProject { .. }
        ));
        assert!(matches!(
            args(&["changelog", "3"]).command,
            Command::Changelog { serial: 3 }
        ));
    }
}
