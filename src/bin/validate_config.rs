//! Standalone binary to validate resilience config files.
//! Used by CI and deploy scripts before rolling out new limits.
//!
//! Usage: `validate-resilience-config [FILE...]` (falls back to `AI_RESILIENCE_CONFIG`).

use ai_lib_resilience::config::CONFIG_ENV_VAR;
use ai_lib_resilience::{ResilienceConfig, ShardedRateLimiter};
use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        let path = std::env::var(CONFIG_ENV_VAR)
            .with_context(|| format!("no files given and {} is not set", CONFIG_ENV_VAR))?;
        files.push(path);
    }

    let mut errors = Vec::new();
    println!("=== Validating Resilience Configs ===");
    for file in &files {
        print!("Validating {}... ", file);
        match ResilienceConfig::from_file(file) {
            Ok(config) => {
                println!("✅");
                let limiter = &config.rate_limiter;
                println!(
                    "  rate_limiter: capacity={} refill={}/s shards={} algorithm={:?}",
                    limiter.capacity,
                    limiter.refill_per_second,
                    limiter.shard_count(),
                    limiter.algorithm
                );
                println!(
                    "  circuit_breaker: failure_threshold={} recovery_timeout={}ms overrides={}",
                    config.circuit_breaker.default.failure_threshold,
                    config.circuit_breaker.default.recovery_timeout_ms,
                    config.circuit_breaker.services.len()
                );
                println!(
                    "  cache: max_entries={} compression={} l2={}",
                    config.cache.max_entries,
                    config.cache.compression.name(),
                    config
                        .cache
                        .l2_dir
                        .as_ref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_else(|| "memory".to_string())
                );
                // constructing the limiter checks the derived geometry as well
                if let Err(e) = ShardedRateLimiter::new(config.rate_limiter.clone()) {
                    errors.push(format!("  {}: {}", file, e));
                }
            }
            Err(e) => {
                println!("❌");
                errors.push(format!("  {}: {}", file, e));
            }
        }
    }

    if !errors.is_empty() {
        eprintln!("\n=== Validation Errors ===");
        for e in &errors {
            eprintln!("{}", e);
        }
        bail!("{} of {} config file(s) invalid", errors.len(), files.len());
    }
    println!("\nAll {} config file(s) valid.", files.len());
    Ok(())
}
