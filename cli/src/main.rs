use anyhow::Result;

async fn run() -> Result<()> {
    mkvmimage_utils::initialize_tracing();
    tracing::trace!("starting");
    mkvmimage_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
