//! Atelier API server - entry point.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    atelier_api::run().await
}
