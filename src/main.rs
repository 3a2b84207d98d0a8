use clap::Parser;
use streamchat_lib::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamchat_lib::run(Cli::parse()).await
}
