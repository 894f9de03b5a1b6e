use fact_inventory::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    fact_inventory::run().await
}
