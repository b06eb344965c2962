use clap::Parser;
use taskmaster::tm::{cli, ctl};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::CtlArgs::parse();
    ctl::run_remote(args.socket).await
}
