use mpegts_proxy::{cli, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::parse();
    logging::init(args.quiet, args.log_level)?;

    mpegts_proxy::run(args).await
}
