use anyhow::Result;
use stepgraph::cli::App;

#[tokio::main]
async fn main() -> Result<()> {
    let mut app = App::from_args().await?;
    let args = stepgraph::cli::Args::parse_args();

    app.run(args).await?;

    Ok(())
}
