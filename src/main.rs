use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = dialogue_sync::args::Cli::parse();
    dialogue_sync::run(cli).await
}
