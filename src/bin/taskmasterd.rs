use clap::Parser;
use taskmaster::tm::{cli, daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::DaemonArgs::parse();
    daemon::main(args).await
}
