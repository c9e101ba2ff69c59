#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chilli_bin::run().await
}
