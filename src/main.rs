use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    cartograph_lib::run().await
}
