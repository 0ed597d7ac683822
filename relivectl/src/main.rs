use clap::Parser;

#[tokio::main]
async fn main() {
    relivectl::init_tracing();
    let cli = relivectl::Cli::parse();
    if let Err(err) = relivectl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
