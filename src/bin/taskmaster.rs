use clap::Parser;
use taskmaster::tm::{cli, ctl};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::ShellArgs::parse();
    ctl::run_local(args).await
}
