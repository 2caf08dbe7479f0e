//! Scenario-suite binary: runs every reference scenario and reports.

use reference_tests::run_all_scenarios;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let results = run_all_scenarios();
    let mut failed = 0;
    for r in &results {
        if r.passed {
            tracing::info!("PASS {} -- {}", r.name, r.detail);
        } else {
            failed += 1;
            tracing::error!("FAIL {} -- {}", r.name, r.detail);
        }
    }
    tracing::info!("{}/{} scenarios passed", results.len() - failed, results.len());
    if failed > 0 {
        std::process::exit(1);
    }
}
