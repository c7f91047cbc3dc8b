use clap::Parser;
use mailbowl_rs::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        eprintln!("mailbowl: {e}");
        std::process::exit(1);
    }
}
