use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use libshoal::{Session, SessionOptions};
use rand::Rng;
use shoal_tracker::{Tracker, TrackerOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod shell;

#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// Log filter, e.g. "info" or "libshoal=debug,info".
    #[arg(long = "log", default_value = "info", env = "SHOAL_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous tracker.
    Tracker {
        /// UDP address to listen on.
        #[arg(long = "bind", default_value = "0.0.0.0:6881", env = "SHOAL_TRACKER_BIND")]
        bind: SocketAddr,
    },

    /// Run a file-sharing peer with an interactive shell.
    Peer {
        /// Folder with the files to share; downloads land here too.
        #[arg(long = "shared-folder", env = "SHOAL_SHARED_FOLDER")]
        shared_folder: PathBuf,

        /// TCP port to serve chunks on. A random port in 1000..2000 when
        /// not set.
        #[arg(long = "port", env = "SHOAL_PORT")]
        port: Option<u16>,

        /// The tracker to register with.
        #[arg(long = "tracker", default_value = "127.0.0.1:6881", env = "SHOAL_TRACKER")]
        tracker: SocketAddr,

        /// Name shown to other peers. Defaults to the peer id.
        #[arg(long = "name", env = "SHOAL_NAME")]
        name: Option<String>,

        /// Don't watch the shared folder for new files.
        #[arg(long = "no-watch", env = "SHOAL_NO_WATCH")]
        no_watch: bool,
    },
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts.log);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error creating tokio runtime")?;
    rt.block_on(async_main(opts.command))
}

async fn async_main(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Tracker { bind } => {
            let tracker = Tracker::start(TrackerOptions {
                bind_addr: bind,
                ..Default::default()
            })
            .await?;
            tokio::signal::ctrl_c()
                .await
                .context("error waiting for ctrl-c")?;
            info!("shutting down");
            tracker.stop();
            Ok(())
        }
        Command::Peer {
            shared_folder,
            port,
            tracker,
            name,
            no_watch,
        } => {
            let listen_port = port.unwrap_or_else(|| rand::rng().random_range(1000..2000));
            let session = Session::start(SessionOptions {
                shared_dir: shared_folder,
                tracker_addr: tracker,
                listen_port,
                bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                peer_name: name,
                watch: !no_watch,
            })
            .await?;
            shell::run(session.clone()).await?;
            session.stop().await;
            Ok(())
        }
    }
}
