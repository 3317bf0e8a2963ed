#![cfg(feature = "simulation")]

use feed_cache::test::sim_app::FeedSimApp;
use feed_cache::types::CircuitState;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_simulation() -> Result<(), Box<dyn std::error::Error>> {
    // Small and short, just enough to see every part move.
    let app = FeedSimApp::builder()
        .cli_args(vec![
            "full_simulation_test",
            "--quiet",
            "--users=10",
            "--news=50",
            "--readers=2",
            "--duration-ms=200",
            "--latency-ms=1",
            "--like-probability=0.5",
        ])
        .build()?;

    let report = app.execute().await.expect("Simulation failed");

    assert!(report.reads > 0, "readers did not get a single page");
    assert_eq!(report.failures, 0);

    let performance = report.performance.expect("a finished run reports its stats");
    assert_eq!(performance.circuit_state, CircuitState::Closed);
    assert!(performance.cache.hits > 0);
    assert_eq!(performance.pool.builds, 1);

    Ok(())
}

#[tokio::test]
async fn invalid_arguments_are_reported() -> Result<(), Box<dyn std::error::Error>> {
    let app = FeedSimApp::builder()
        .cli_args(vec!["invalid_arguments_test", "--quiet", "--like-probability=2"])
        .build()?;

    assert!(app.execute().await.is_err());

    Ok(())
}
