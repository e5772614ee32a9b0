use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use weavefs::config::MountProfile;
use weavefs::manager::VfsManager;

#[derive(Parser, Debug)]
#[command(name = "weavefs", about = "Weave real files and directories into virtual mountpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount a profile and serve it until interrupted
    Mount(MountArgs),
    /// Mount a profile, run a command that sees it, then tear down
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct MountArgs {
    /// Mount profile (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Pass the debug option to the kernel bridge
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Mount profile (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Working directory for the spawned command
    #[arg(short, long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Pass the debug option to the kernel bridge
    #[arg(short, long)]
    debug: bool,

    /// Command to run under the composed namespace
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

async fn mount_profile(config: &PathBuf, debug: bool) -> Result<&'static VfsManager> {
    let profile = MountProfile::load(config)?;
    let manager = VfsManager::instance();
    manager.set_debug_mode(debug);
    profile.apply(manager)?;
    Ok(manager)
}

async fn cmd_mount(args: MountArgs) -> Result<()> {
    let manager = mount_profile(&args.config, args.debug).await?;
    manager.mount().await?;

    println!("mounted; press Ctrl+C to unmount and exit");
    tokio::signal::ctrl_c().await.context("signal error")?;

    if !manager.unmount().await {
        bail!("unmount failed");
    }
    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let manager = mount_profile(&args.config, args.debug).await?;

    let file = args.command[0].clone();
    let arg = args.command[1..].join(" ");
    let workdir = args.workdir.as_ref().map(|dir| dir.to_string_lossy().into_owned());

    let pid = manager
        .create_process_hooked(&file, &arg, workdir.as_deref(), None)
        .await?;

    let status = nix::sys::wait::waitpid(pid, None).context("waitpid failed")?;
    tracing::info!(?status, "hooked process finished");

    if !manager.unmount().await {
        bail!("unmount failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mount(args) => cmd_mount(args).await,
        Commands::Run(args) => cmd_run(args).await,
    }
}
