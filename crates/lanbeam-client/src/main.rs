#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lanbeam_client_lib::run().await
}
