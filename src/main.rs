use clap::Parser;
use dev_proxy::{Args, run_server};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (server_started, _) = oneshot::channel();
    run_server(args, server_started).await
}
