use feed_cache::test::sim_app::FeedSimApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FeedSimApp::run().await
}
