// tandem-loopback: host and guest in one process, connected by the loopback
// network. Shares one directory from the host and prints what the guest
// ended up with.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tandem_common::types::UserId;
use tandem_session::config::SessionConfig;
use tandem_session::lifecycle::SessionEndReason;
use tandem_session::manager::{SessionManager, SharedResource};
use tandem_session::negotiation::hooks::TransferType;
use tandem_session::resources::{FsResources, MemoryResources, ReferencePoint, ResourceAccess};
use tandem_session::transport::LoopbackNetwork;
use tracing::info;

#[derive(Parser)]
#[command(name = "tandem-loopback", about = "Share a directory between two local endpoints")]
struct Cli {
    /// Directory to share. A small in-memory project is used when omitted.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Base directory the guest materializes resources under. In memory
    /// when omitted.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Override the configured transfer type (`archive` or `instant`).
    #[arg(long)]
    transfer: Option<TransferType>,

    /// Config file; defaults to `~/.tandem/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SessionConfig::load(),
    };
    if let Some(transfer) = cli.transfer {
        config.transfer_type = transfer;
    }

    let (host_resources, reference_point) = match &cli.source {
        Some(source) => share_directory(source)?,
        None => demo_project()?,
    };
    let guest_resources: Arc<dyn ResourceAccess> = match &cli.target {
        Some(target) => Arc::new(FsResources::new(target)),
        None => Arc::new(MemoryResources::new()),
    };

    let network = LoopbackNetwork::new();
    let host = SessionManager::new(network.connect("host"), host_resources, config.clone());
    let guest = SessionManager::new(network.connect("guest"), guest_resources.clone(), config);

    let session = host
        .start_session(vec![SharedResource::complete(reference_point.clone())])
        .await
        .context("failed to start session")?;
    info!(session_id = %session.id(), reference_point = %reference_point, "hosting");

    let outcome = host
        .invite(UserId::new("guest"))
        .context("failed to invite guest")?
        .join()
        .await
        .context("guest could not join")?;
    outcome.resources.context("resource transfer failed")?;

    let manifest = guest_resources
        .read_manifest(&reference_point)?
        .ok_or_else(|| anyhow!("guest has no manifest for {reference_point}"))?;
    println!("guest received {} entries of {reference_point}:", manifest.len());
    for (path, checksum) in manifest.entries() {
        match checksum {
            Some(checksum) => println!("  {path}  {checksum}"),
            None => println!("  {path}"),
        }
    }

    host.stop_session(SessionEndReason::Stopped).await.context("failed to stop session")?;
    // Give the guest a moment to observe the host leaving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if guest.session().is_some() {
        guest.stop_session(SessionEndReason::Stopped).await?;
    }
    Ok(())
}

type SharedRoot = (Arc<dyn ResourceAccess>, ReferencePoint);

fn share_directory(source: &Path) -> anyhow::Result<SharedRoot> {
    let source = source
        .canonicalize()
        .with_context(|| format!("cannot share {}", source.display()))?;
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no usable directory name", source.display()))?;
    let reference_point = ReferencePoint::new(name)?;
    let base = source.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"));
    Ok((Arc::new(FsResources::new(base)), reference_point))
}

fn demo_project() -> anyhow::Result<SharedRoot> {
    let reference_point = ReferencePoint::new("demo")?;
    let resources = MemoryResources::new();
    resources.insert_file(&reference_point, "README.md", b"# demo\n")?;
    resources.insert_file(&reference_point, "src/main.rs", b"fn main() {}\n")?;
    resources.insert_file(&reference_point, "src/lib.rs", b"")?;
    Ok((Arc::new(resources), reference_point))
}
