#[tokio::main]
async fn main() -> anyhow::Result<()> {
    blendfarm::run().await?;
    Ok(())
}
