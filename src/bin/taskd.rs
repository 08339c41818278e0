#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskd::td::main().await
}
