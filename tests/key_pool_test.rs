//! Integration tests for virtual key slots and their breakers

use std::sync::Arc;
use std::time::Duration;
use swarm_router::{CircuitBreakerConfig, CircuitBreakerRegistry, CoreError, ProviderCredential, VirtualKeyPool};
use tokio_test::{assert_ok, assert_pending, assert_ready_ok, task};

fn pool(slots: usize, threshold: u32) -> Arc<VirtualKeyPool> {
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(60),
    }));
    Arc::new(VirtualKeyPool::new(
        &[ProviderCredential {
            provider: "openai".to_string(),
            slot_count: slots,
            max_concurrent_per_slot: 1,
        }],
        breakers,
    ))
}

#[tokio::test]
async fn test_failing_slot_is_skipped_then_pool_reports_circuit_open() {
    let pool = pool(2, 1);

    let first = pool.try_acquire("openai", "a").unwrap().unwrap();
    assert_eq!(first.slot_id, 0);
    pool.report(&first, false);
    pool.release(&first);

    // Slot 0 is open, so the next lease lands on slot 1
    let second = pool.acquire("openai", "a", Duration::from_millis(50)).await.unwrap();
    assert_eq!(second.slot_id, 1);
    assert_eq!(pool.stats()[0].open_slots, 1);

    pool.report(&second, false);
    pool.release(&second);

    assert!(matches!(
        pool.acquire("openai", "a", Duration::from_millis(50)).await,
        Err(CoreError::ProviderCircuitOpen(p)) if p == "openai"
    ));
}

#[tokio::test]
async fn test_waiter_wakes_on_release() {
    let pool = pool(1, 5);
    let held = pool.acquire("openai", "first", Duration::from_millis(10)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire("openai", "second", Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats()[0].waiting, 1);
    assert!(pool.release(&held));
    assert!(!pool.release(&held));

    let handle = waiter.await.unwrap().unwrap();
    assert_eq!(handle.agent_id, "second");
    assert_eq!(pool.stats()[0].waiting, 0);
}

#[tokio::test]
async fn test_exhaustion_is_distinct_from_circuit_open() {
    let pool = pool(1, 5);
    let _held = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();

    assert!(matches!(
        pool.acquire("openai", "b", Duration::from_millis(30)).await,
        Err(CoreError::KeyExhausted { provider, .. }) if provider == "openai"
    ));
    assert!(matches!(
        pool.acquire("anthropic", "b", Duration::from_millis(30)).await,
        Err(CoreError::UnknownProvider(_))
    ));
}

#[tokio::test]
async fn test_parked_acquire_is_woken_by_release() {
    let pool = pool(1, 5);
    let held = assert_ok!(pool.try_acquire("openai", "a")).unwrap();

    let mut acquire = task::spawn(pool.acquire("openai", "b", Duration::from_secs(5)));
    assert_pending!(acquire.poll());
    assert!(!acquire.is_woken());
    assert_eq!(pool.stats()[0].waiting, 1);

    assert!(pool.release(&held));
    assert!(acquire.is_woken());

    let handle = assert_ready_ok!(acquire.poll());
    assert_eq!(handle.agent_id, "b");
    assert_eq!(pool.stats()[0].waiting, 0);
}
