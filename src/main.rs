#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tvs_client::run().await
}
