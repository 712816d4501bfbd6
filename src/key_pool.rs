//! Virtual Key Pool
//!
//! Leases provider credential slots to agents. Each provider has a fixed set of
//! slots built from the credential configuration; each slot admits at most
//! `max_concurrent_per_slot` holders and has its own circuit breaker scope
//! (`provider/N`).
//!
//! `acquire` picks the least-recently-used slot with spare capacity whose
//! breaker is not open, and waits (up to a timeout) for a release when none is
//! free. Waiters are woken by `release`, or when the earliest open slot with
//! spare capacity reaches the end of its cooldown.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreakerRegistry, CircuitState};
use crate::config::ProviderCredential;
use crate::error::{CoreError, CoreResult};

/// A leased slot. Pass it back to `release` exactly once; extra releases are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle {
    pub provider: String,
    pub slot_id: usize,
    pub agent_id: String,
    pub acquired_at: Instant,
    lease_id: u64,
}

impl SlotHandle {
    /// Breaker scope of the leased slot
    pub fn scope(&self) -> String {
        slot_scope(&self.provider, self.slot_id)
    }
}

fn slot_scope(provider: &str, slot_id: usize) -> String {
    format!("{}/{}", provider, slot_id)
}

#[derive(Debug)]
struct Holder {
    agent_id: String,
    acquired_at: Instant,
}

#[derive(Debug)]
struct Slot {
    slot_id: usize,
    scope: String,
    max_concurrent: usize,
    holders: HashMap<u64, Holder>,
    /// Last time the slot was released (or created); drives LRU selection
    last_used: Instant,
    leases: u64,
}

/// Read-only view of one slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub slot_id: usize,
    pub holders: Vec<String>,
    pub max_concurrent: usize,
    pub circuit: CircuitState,
    pub leases: u64,
    /// Age of the oldest current lease
    pub oldest_lease: Option<Duration>,
}

/// Per-provider pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub provider: String,
    pub slots: usize,
    pub capacity: usize,
    pub held: usize,
    pub open_slots: usize,
    pub waiting: u64,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.held as f64 / self.capacity as f64
    }
}

/// Credential slot pool shared by every agent
pub struct VirtualKeyPool {
    providers: Mutex<HashMap<String, Vec<Slot>>>,
    breakers: Arc<CircuitBreakerRegistry>,
    released: Notify,
    next_lease: AtomicU64,
    waiting: Mutex<HashMap<String, u64>>,
}

/// Counts a waiter for as long as an `acquire` call is parked, even if the
/// call is dropped mid-wait
struct WaitGuard<'a> {
    waiting: &'a Mutex<HashMap<String, u64>>,
    provider: String,
}

impl<'a> WaitGuard<'a> {
    fn new(waiting: &'a Mutex<HashMap<String, u64>>, provider: &str) -> Self {
        *waiting.lock().entry(provider.to_string()).or_default() += 1;
        Self {
            waiting,
            provider: provider.to_string(),
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.waiting.lock().get_mut(&self.provider) {
            *n = n.saturating_sub(1);
        }
    }
}

impl VirtualKeyPool {
    pub fn new(credentials: &[ProviderCredential], breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let now = Instant::now();
        let mut providers = HashMap::new();

        for cred in credentials {
            let slots: Vec<Slot> = (0..cred.slot_count)
                .map(|slot_id| Slot {
                    slot_id,
                    scope: slot_scope(&cred.provider, slot_id),
                    max_concurrent: cred.max_concurrent_per_slot.max(1),
                    holders: HashMap::new(),
                    last_used: now,
                    leases: 0,
                })
                .collect();
            info!(
                "Key pool: {} with {} slots x {} holders",
                cred.provider, cred.slot_count, cred.max_concurrent_per_slot
            );
            providers.insert(cred.provider.clone(), slots);
        }

        Self {
            providers: Mutex::new(providers),
            breakers,
            released: Notify::new(),
            next_lease: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.lock().contains_key(provider)
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Lease a slot for `provider`, waiting up to `timeout` for one to free up
    ///
    /// Fails with `ProviderCircuitOpen` as soon as every slot of the provider
    /// is behind an open breaker, and with `KeyExhausted` when the timeout
    /// elapses with all usable slots still held.
    pub async fn acquire(&self, provider: &str, agent_id: &str, timeout: Duration) -> CoreResult<SlotHandle> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waiting: Option<WaitGuard<'_>> = None;

        loop {
            // Register for wakeups before checking, so a release between the
            // check and the wait is not lost
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.try_acquire(provider, agent_id)? {
                return Ok(handle);
            }

            if waiting.is_none() {
                waiting = Some(WaitGuard::new(&self.waiting, provider));
            }

            let wake_at = match self.next_reopen(provider) {
                Some(after) => deadline.min(tokio::time::Instant::now() + after),
                None => deadline,
            };
            let timed_out = tokio::time::timeout_at(wake_at, notified).await.is_err();
            if timed_out && tokio::time::Instant::now() >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!("Key pool exhausted for {} after {}ms ({})", provider, waited_ms, agent_id);
                return Err(CoreError::KeyExhausted {
                    provider: provider.to_string(),
                    waited_ms,
                });
            }
        }
    }

    /// Shortest wait until an open slot with spare capacity admits a call
    fn next_reopen(&self, provider: &str) -> Option<Duration> {
        let providers = self.providers.lock();
        providers
            .get(provider)?
            .iter()
            .filter(|slot| slot.holders.len() < slot.max_concurrent)
            .filter_map(|slot| self.breakers.retry_after(&slot.scope))
            .min()
    }

    /// Non-blocking acquire
    ///
    /// `Ok(None)` when every usable slot is at capacity.
    pub fn try_acquire(&self, provider: &str, agent_id: &str) -> CoreResult<Option<SlotHandle>> {
        let mut providers = self.providers.lock();
        let slots = providers
            .get_mut(provider)
            .ok_or_else(|| CoreError::UnknownProvider(provider.to_string()))?;

        let mut all_open = true;
        let mut candidates: Vec<usize> = Vec::new();
        for (i, slot) in slots.iter().enumerate() {
            if self.breakers.is_open(&slot.scope) {
                continue;
            }
            all_open = false;
            if slot.holders.len() < slot.max_concurrent {
                candidates.push(i);
            }
        }

        if all_open && !slots.is_empty() {
            return Err(CoreError::ProviderCircuitOpen(provider.to_string()));
        }

        // Unheld slots first, then least recently used
        candidates.sort_by_key(|&i| (slots[i].holders.len(), slots[i].last_used, slots[i].slot_id));

        for i in candidates {
            let slot = &mut slots[i];
            // Consumes the HalfOpen trial, if any
            if !self.breakers.allow(&slot.scope) {
                continue;
            }

            let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
            let acquired_at = Instant::now();
            slot.holders.insert(
                lease_id,
                Holder {
                    agent_id: agent_id.to_string(),
                    acquired_at,
                },
            );
            slot.leases += 1;

            debug!("Slot {} leased to {}", slot.scope, agent_id);
            return Ok(Some(SlotHandle {
                provider: provider.to_string(),
                slot_id: slot.slot_id,
                agent_id: agent_id.to_string(),
                acquired_at,
                lease_id,
            }));
        }

        Ok(None)
    }

    /// Return a slot. Returns false if the lease was already released.
    pub fn release(&self, handle: &SlotHandle) -> bool {
        let released = {
            let mut providers = self.providers.lock();
            match providers
                .get_mut(&handle.provider)
                .and_then(|slots| slots.get_mut(handle.slot_id))
            {
                Some(slot) => {
                    let removed = slot.holders.remove(&handle.lease_id).is_some();
                    if removed {
                        slot.last_used = Instant::now();
                    }
                    removed
                }
                None => false,
            }
        };

        if released {
            debug!("Slot {} released by {}", handle.scope(), handle.agent_id);
            self.released.notify_waiters();
        }
        released
    }

    /// Feed a provider call outcome into the slot's breaker
    pub fn report(&self, handle: &SlotHandle, success: bool) {
        let scope = handle.scope();
        if success {
            self.breakers.record_success(&scope);
        } else {
            self.breakers.record_failure(&scope);
            if self.breakers.is_open(&scope) {
                warn!("Slot {} circuit open", scope);
            }
        }
    }

    /// Drop every lease (shutdown). Returns how many were held.
    pub fn release_all(&self) -> usize {
        let mut count = 0;
        {
            let mut providers = self.providers.lock();
            for slot in providers.values_mut().flatten() {
                count += slot.holders.len();
                slot.holders.clear();
            }
        }
        if count > 0 {
            info!("Released {} outstanding key leases", count);
            self.released.notify_waiters();
        }
        count
    }

    pub fn slots(&self, provider: &str) -> Vec<SlotInfo> {
        let providers = self.providers.lock();
        providers
            .get(provider)
            .map(|slots| {
                slots
                    .iter()
                    .map(|slot| {
                        let mut holders: Vec<String> = slot.holders.values().map(|h| h.agent_id.clone()).collect();
                        holders.sort();
                        SlotInfo {
                            slot_id: slot.slot_id,
                            holders,
                            max_concurrent: slot.max_concurrent,
                            circuit: self.breakers.state(&slot.scope),
                            leases: slot.leases,
                            oldest_lease: slot.holders.values().map(|h| h.acquired_at.elapsed()).max(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let waiting = self.waiting.lock().clone();
        let providers = self.providers.lock();
        let mut stats: Vec<PoolStats> = providers
            .iter()
            .map(|(name, slots)| PoolStats {
                provider: name.clone(),
                slots: slots.len(),
                capacity: slots.iter().map(|s| s.max_concurrent).sum(),
                held: slots.iter().map(|s| s.holders.len()).sum(),
                open_slots: slots.iter().filter(|s| self.breakers.is_open(&s.scope)).count(),
                waiting: waiting.get(name).copied().unwrap_or(0),
            })
            .collect();
        stats.sort_by(|a, b| a.provider.cmp(&b.provider));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;

    fn pool(slots: usize, max: usize, threshold: u32) -> Arc<VirtualKeyPool> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
        }));
        Arc::new(VirtualKeyPool::new(
            &[ProviderCredential {
                provider: "openai".to_string(),
                slot_count: slots,
                max_concurrent_per_slot: max,
            }],
            breakers,
        ))
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = pool(2, 1, 5);

        let a = pool.acquire("openai", "a1", Duration::from_millis(10)).await.unwrap();
        let b = pool.acquire("openai", "a2", Duration::from_millis(10)).await.unwrap();
        assert_ne!(a.slot_id, b.slot_id);

        let err = pool.acquire("openai", "a3", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CoreError::KeyExhausted { .. }));

        assert!(pool.release(&a));
        assert!(!pool.release(&a));
        assert_eq!(pool.stats()[0].held, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let pool = pool(1, 1, 5);
        assert!(matches!(
            pool.acquire("mistral", "a", Duration::from_millis(5)).await,
            Err(CoreError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_least_recently_used_slot_chosen() {
        let pool = pool(3, 1, 5);

        let s0 = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();
        let s1 = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();
        pool.release(&s1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.release(&s0);

        // Slot 2 was never used, then slot 1 was released before slot 0
        let next = pool.acquire("openai", "b", Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.slot_id, 2);
        let next = pool.acquire("openai", "b", Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.slot_id, s1.slot_id);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let pool = pool(1, 1, 5);
        let held = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("openai", "b", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(&held);

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.agent_id, "b");
    }

    #[tokio::test]
    async fn test_open_slots_excluded_and_circuit_open_surfaced() {
        let pool = pool(2, 1, 1);

        let a = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();
        pool.report(&a, false);
        pool.release(&a);

        // Slot a is open, so the other slot is used
        let b = pool.acquire("openai", "b", Duration::from_millis(10)).await.unwrap();
        assert_ne!(b.slot_id, a.slot_id);
        pool.report(&b, false);
        pool.release(&b);

        let err = pool.acquire("openai", "c", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CoreError::ProviderCircuitOpen(_)));
        assert_eq!(pool.stats()[0].open_slots, 2);
    }

    #[tokio::test]
    async fn test_waiter_woken_when_open_slot_cools_down() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(100),
        }));
        let pool = VirtualKeyPool::new(
            &[ProviderCredential {
                provider: "openai".to_string(),
                slot_count: 2,
                max_concurrent_per_slot: 1,
            }],
            breakers,
        );

        let _held = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();
        let failing = pool.acquire("openai", "b", Duration::from_millis(10)).await.unwrap();
        pool.report(&failing, false);
        pool.release(&failing);

        // No release happens; the open slot's cooldown is what frees it
        let started = Instant::now();
        let handle = pool.acquire("openai", "c", Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.slot_id, failing.slot_id);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.stats()[0].waiting, 0);
    }

    #[tokio::test]
    async fn test_shared_slot_capacity() {
        let pool = pool(1, 2, 5);
        let a = pool.acquire("openai", "a", Duration::from_millis(10)).await.unwrap();
        let b = pool.acquire("openai", "b", Duration::from_millis(10)).await.unwrap();
        assert_eq!(a.slot_id, b.slot_id);
        assert!(pool.try_acquire("openai", "c").unwrap().is_none());
        assert_eq!(pool.slots("openai")[0].holders, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slot_exclusivity_under_random_load() {
        let pool = pool(3, 1, 1000);
        let in_use: Arc<Vec<AtomicUsize>> = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
        let violations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for agent in 0..12 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            let violations = violations.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..15 {
                    let handle = pool
                        .acquire("openai", &format!("agent-{}", agent), Duration::from_secs(10))
                        .await
                        .unwrap();
                    let holders = in_use[handle.slot_id].fetch_add(1, Ordering::SeqCst) + 1;
                    if holders > 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }

                    let hold_us = rand::thread_rng().gen_range(0..500u64);
                    tokio::time::sleep(Duration::from_micros(hold_us)).await;

                    in_use[handle.slot_id].fetch_sub(1, Ordering::SeqCst);
                    pool.report(&handle, rand::thread_rng().gen_bool(0.8));
                    assert!(pool.release(&handle));
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats()[0].held, 0);
    }
}
