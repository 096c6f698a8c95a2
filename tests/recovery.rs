use ai_lib_resilience::cache::{CacheConfig, MultiTierCache};
use ai_lib_resilience::events::InMemoryEventSink;
use ai_lib_resilience::recovery::{
    ErrorCategory, ErrorRecoveryManager, RecoveryContext, RecoveryStrategy, RetryPolicy,
};
use ai_lib_resilience::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use ai_lib_resilience::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn storage_error() -> Error {
    Error::storage_with_context("disk full", Default::default())
}

fn registry(threshold: u32) -> Arc<CircuitBreakerRegistry> {
    Arc::new(
        CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(60)),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_system_error_reinvoked_through_breaker() {
    let sink = Arc::new(InMemoryEventSink::default());
    let breakers = registry(5);
    let manager = ErrorRecoveryManager::default()
        .with_breakers(breakers.clone())
        .with_sink(sink.clone());
    let calls = AtomicU32::new(0);

    let value = manager
        .execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(storage_error())
                    } else {
                        Ok("written".to_string())
                    }
                }
            },
            RecoveryContext::new().with_service("index"),
        )
        .await
        .unwrap();
    assert_eq!(value, "written");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breakers.breaker("index").snapshot().successes, 1);

    let records = sink.error_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].category, ErrorCategory::System);
    assert_eq!(records[0].strategy, RecoveryStrategy::CircuitBreak);
    assert!(records[0].recovered);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].context.get("service").map(String::as_str), Some("index"));
}

#[tokio::test]
async fn test_open_circuit_serves_stale_cache() {
    let breakers = registry(1);
    breakers
        .call("search", || async { Err::<(), _>(storage_error()) })
        .await
        .unwrap_err();
    assert_eq!(breakers.status("search"), CircuitState::Open);

    let cache = MultiTierCache::in_memory(CacheConfig::new()).unwrap();
    cache
        .set("q:rust", &vec!["old hit".to_string()], Duration::from_millis(10), &[])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let manager = ErrorRecoveryManager::default()
        .with_breakers(breakers.clone())
        .with_cache(cache);
    let calls = AtomicU32::new(0);
    let hits: Vec<String> = manager
        .execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(storage_error()) }
            },
            RecoveryContext::new()
                .with_service("search")
                .with_cache_key("q:rust")
                .with_fallback_value(vec!["unused".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(hits, vec!["old hit".to_string()]);
    // the breaker rejected the second call without running it
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_circuit_without_fallback_surfaces_rejection() {
    let breakers = registry(1);
    breakers
        .call("search", || async { Err::<(), _>(storage_error()) })
        .await
        .unwrap_err();
    let manager = ErrorRecoveryManager::default().with_breakers(breakers);
    let err = manager
        .execute(
            || async { Err::<u8, _>(storage_error()) },
            RecoveryContext::new().with_service("search"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_retry_honours_provider_hint() {
    let manager = ErrorRecoveryManager::new(
        RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(Duration::ZERO),
    );
    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let value = manager
        .execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::remote(429, "slow down").with_retry_after_ms(2_000))
                    } else {
                        Ok(n)
                    }
                }
            },
            RecoveryContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(value, 1);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(2_000) && waited < Duration::from_millis(2_010));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_skip_fallbacks() {
    let sink = Arc::new(InMemoryEventSink::default());
    let manager = ErrorRecoveryManager::new(
        RetryPolicy::new()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(Duration::ZERO),
    )
    .with_sink(sink.clone());
    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let err = manager
        .execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u8, _>(Error::remote(503, "overloaded")) }
            },
            RecoveryContext::new().with_fallback_value(9),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { status: 503, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 10 ms then 20 ms
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(30) && waited < Duration::from_millis(40));

    let records = sink.error_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 2);
    assert!(!records[0].recovered);
    assert!(records[0].recoverable);
}

#[tokio::test]
async fn test_identical_failures_share_fingerprint() {
    let sink = Arc::new(InMemoryEventSink::default());
    let manager = ErrorRecoveryManager::new(RetryPolicy::none()).with_sink(sink.clone());
    for _ in 0..2 {
        let _: Result<u8> = manager
            .execute(
                || async { Err(Error::remote(404, "no such model")) },
                RecoveryContext::new(),
            )
            .await;
    }
    let _: Result<u8> = manager
        .execute(
            || async { Err(Error::remote(404, "no such route")) },
            RecoveryContext::new(),
        )
        .await;

    let records = sink.error_records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].fingerprint, records[1].fingerprint);
    assert_ne!(records[0].fingerprint, records[2].fingerprint);
    assert_ne!(records[0].id, records[1].id);
    assert_eq!(records[0].status, Some(404));
    assert!(!records[0].recoverable);
}
