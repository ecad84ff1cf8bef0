//! Basic usage example for the Materials Master library.
//!
//! This example demonstrates how to run one federated search across every
//! configured provider and inspect the fused records and the audit trail.

use materials_master::config::{find_config_file, load_config};
use materials_master::models::{PropertyRange, SearchQuery};
use materials_master::search::SearchOrchestrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration file and MATERIALS_MASTER__* environment variables
    let config = load_config(find_config_file().as_deref())?;
    let orchestrator = SearchOrchestrator::from_config(&config)?;

    println!(
        "Configured providers: {}\n",
        orchestrator.registry().ids().collect::<Vec<_>>().join(", ")
    );

    // Iron oxides with a band gap above 1 eV
    let query = SearchQuery::builder()
        .elements(["Fe", "O"])
        .band_gap(PropertyRange::at_least(1.0)?)
        .limit(10)
        .build()?;

    let result = orchestrator.search(&query).await;

    for log in result.provider_logs() {
        println!(
            "{:<12} {:<12} {:>4} results in {:.0}ms",
            log.provider_id, log.status, log.result_count, log.latency_ms
        );
        println!("  sent: {}", log.query_sent);
    }

    println!("\n{} of {} materials:", result.materials().len(), result.total_count());
    for material in result.materials() {
        let gap = material
            .band_gap
            .as_ref()
            .and_then(|v| v.as_f64())
            .map(|v| format!("{:.2} eV", v))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<14} {:<10} {:<8} [{}]",
            material.id,
            material.formula,
            gap,
            material.sources.join(", ")
        );
    }

    for warning in result.warnings() {
        eprintln!("warning: {}", warning);
    }

    // The same query again is answered from the cache
    let again = orchestrator.search(&query).await;
    println!("\nSecond search served from cache: {}", again.cached());

    Ok(())
}
