#[tokio::main]
async fn main() {
    wanderer_kills::run().await;
}
