//! Public key authorization.
//!
//! Every attempt computes a fresh [`PermissionMap`] across the global pool
//! and every tenant pool, and never answers faster than the configured floor
//! so that timing reveals neither the outcome nor the number of tenants.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use russh::keys::PublicKey;
use tokio::task::{JoinError, JoinHandle};

use crate::error::KeySourceError;
use crate::keysource::{key_one_of, KeySource};

use super::types::PermissionMap;

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `work` on its own task and return its output no earlier than `floor`
/// after the call, plus a random extra delay below `jitter`.
///
/// The floor is a minimum: slow work is never cut short. Dropping the
/// returned future aborts the work. A panic inside `work` is returned as a
/// [`JoinError`].
pub async fn slowdown<F>(floor: Duration, jitter: Duration, work: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut worker = AbortOnDrop(tokio::spawn(work));
    let (result, ()) = tokio::join!(&mut worker.0, tokio::time::sleep(floor));

    if !jitter.is_zero() {
        let extra = rand::rngs::OsRng.gen_range(0..jitter.as_micros().max(1) as u64);
        tokio::time::sleep(Duration::from_micros(extra)).await;
    }
    result
}

/// Build the permission map for `key`.
///
/// Failing to read the global pool or to list the instances is an error.
/// A tenant whose pool cannot be read contributes no keys.
pub async fn compute_permissions(
    keys: &KeySource,
    key: &PublicKey,
) -> Result<PermissionMap, KeySourceError> {
    let admin_keys = keys.admin_keys().await?;
    let mut permissions = PermissionMap::new(key_one_of(&admin_keys, key));

    for tenant in keys.tenants().await? {
        let access = match tenant.keys().await {
            Ok(tenant_keys) => key_one_of(&tenant_keys, key),
            Err(e) => {
                warn!("Skipping keys of instance '{}': {}", tenant.slug(), e);
                false
            }
        };
        permissions.record(tenant.slug(), access);
    }

    Ok(permissions)
}

/// Decides which instances a public key may reach.
#[derive(Clone)]
pub struct AuthorizationEngine {
    keys: KeySource,
    delay: Duration,
    jitter: Duration,
}

impl AuthorizationEngine {
    pub fn new(keys: KeySource, delay: Duration) -> Self {
        Self {
            keys,
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the permissions of `key`, taking at least the configured delay.
    ///
    /// Never fails: any error while fetching keys denies everything.
    pub async fn authorize(&self, key: &PublicKey) -> PermissionMap {
        let keys = self.keys.clone();
        let candidate = key.clone();
        let outcome = slowdown(self.delay, self.jitter, async move {
            compute_permissions(&keys, &candidate).await
        })
        .await;

        match outcome {
            Ok(Ok(permissions)) => {
                debug!("Computed {} permission entries", permissions.len());
                permissions
            }
            Ok(Err(e)) => {
                warn!("Denying key, key source unavailable: {}", e);
                PermissionMap::default()
            }
            Err(e) => {
                warn!("Denying key, authorization task failed: {}", e);
                PermissionMap::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::keysource::testing::*;
    use crate::keysource::GlobalKeys;
    use crate::instances::Instances;

    const FLOOR: Duration = Duration::from_millis(100);
    // Allowance above the floor for timer granularity and a busy test runner.
    // Spread between outcomes is checked separately against 10ms either way.
    const TOLERANCE: Duration = Duration::from_millis(25);
    const SPREAD: Duration = Duration::from_millis(20);

    fn engine(global: Vec<PublicKey>, instances: StaticInstances) -> AuthorizationEngine {
        AuthorizationEngine::new(key_source(global, instances), FLOOR)
    }

    #[tokio::test]
    async fn test_slowdown_waits_for_floor() {
        let start = Instant::now();
        let value = slowdown(Duration::from_millis(60), Duration::ZERO, async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_slowdown_never_shortens_slow_work() {
        let start = Instant::now();
        slowdown(Duration::from_millis(20), Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(120)).await;
        })
        .await
        .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_millis(120) + TOLERANCE);
    }

    #[tokio::test]
    async fn test_slowdown_jitter_stays_bounded() {
        let start = Instant::now();
        slowdown(Duration::from_millis(20), Duration::from_millis(30), async {})
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(50) + TOLERANCE);
    }

    #[tokio::test]
    async fn test_slowdown_reports_panics() {
        let result = slowdown(Duration::from_millis(1), Duration::ZERO, async {
            panic!("collaborator blew up");
        })
        .await;
        assert!(result.unwrap_err().is_panic());
    }

    #[tokio::test]
    async fn test_slowdown_aborts_work_when_dropped() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let attempt = slowdown(Duration::from_millis(10), Duration::ZERO, async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(tokio::time::timeout(Duration::from_millis(20), attempt)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_key_is_denied() {
        let engine = engine(
            vec![test_key(1)],
            StaticInstances::with(vec![("acme", vec![test_key(2)])]),
        );

        let permissions = engine.authorize(&test_key(9)).await;
        assert_eq!(permissions.get(""), Some(false));
        assert_eq!(permissions.get("acme"), Some(false));
        assert!(!permissions.any_access());
        assert!(!engine.authorize(&test_key(9)).await.any_access());
    }

    #[tokio::test]
    async fn test_tenant_key_grants_only_that_tenant() {
        let engine = engine(
            vec![test_key(1)],
            StaticInstances::with(vec![
                ("acme", vec![test_key(2)]),
                ("bravo", vec![test_key(3)]),
            ]),
        );

        let permissions = engine.authorize(&test_key(2)).await;
        assert_eq!(permissions.get(""), Some(false));
        assert_eq!(permissions.get("acme"), Some(true));
        assert_eq!(permissions.get("bravo"), Some(false));
        assert!(permissions.any_access());
    }

    #[tokio::test]
    async fn test_global_key_grants_every_tenant() {
        let engine = engine(
            vec![test_key(1)],
            StaticInstances::with(vec![("acme", vec![test_key(2)]), ("empty", vec![])]),
        );

        let permissions = engine.authorize(&test_key(1)).await;
        assert_eq!(permissions.get(""), Some(true));
        assert_eq!(permissions.get("acme"), Some(true));
        assert_eq!(permissions.get("empty"), Some(true));
    }

    #[tokio::test]
    async fn test_failing_tenant_is_skipped() {
        let mut instances = StaticInstances::with(vec![("acme", vec![test_key(2)])]);
        instances.tenants.insert(
            0,
            Arc::new(StaticTenant {
                slug: "broken".to_string(),
                keys: Err("database offline".to_string()),
            }),
        );
        let engine = engine(vec![], instances);

        let permissions = engine.authorize(&test_key(2)).await;
        assert_eq!(permissions.get("broken"), Some(false));
        assert_eq!(permissions.get("acme"), Some(true));
    }

    #[tokio::test]
    async fn test_global_pool_failure_fails_closed() {
        let keys = KeySource::new(
            Arc::new(StaticGlobalKeys(Err("file vanished".to_string()))),
            Arc::new(StaticInstances::with(vec![("acme", vec![test_key(2)])])),
        );
        let engine = AuthorizationEngine::new(keys, FLOOR);

        let start = Instant::now();
        let permissions = engine.authorize(&test_key(2)).await;
        assert!(permissions.is_empty());
        assert!(!permissions.any_access());
        assert!(start.elapsed() >= FLOOR);
    }

    struct PanickingGlobalKeys;

    #[async_trait::async_trait]
    impl GlobalKeys for PanickingGlobalKeys {
        async fn admin_keys(&self) -> Result<Vec<PublicKey>, KeySourceError> {
            panic!("registry bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_key_source_denies() {
        let keys = KeySource::new(
            Arc::new(PanickingGlobalKeys),
            Arc::new(StaticInstances::default()),
        );
        let engine = AuthorizationEngine::new(keys, Duration::from_millis(10));
        assert!(!engine.authorize(&test_key(1)).await.any_access());
    }

    #[tokio::test]
    async fn test_every_tenant_is_fetched_fresh() {
        let instances = Arc::new(StaticInstances::with(vec![("acme", vec![test_key(2)])]));
        let keys = KeySource::new(
            Arc::new(StaticGlobalKeys(Ok(vec![]))),
            instances.clone() as Arc<dyn Instances>,
        );
        let engine = AuthorizationEngine::new(keys, Duration::from_millis(1));

        engine.authorize(&test_key(2)).await;
        engine.authorize(&test_key(3)).await;
        assert_eq!(instances.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_latency_is_independent_of_outcome_and_tenant_count() {
        let mut timings = Vec::new();
        for tenant_count in [0usize, 1, 50] {
            let names: Vec<String> = (0..tenant_count).map(|i| format!("tenant-{i}")).collect();
            let tenants = names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), vec![test_key((i % 200) as u8 + 10)]))
                .collect();
            let engine = engine(vec![test_key(1)], StaticInstances::with(tenants));

            for candidate in [test_key(1), test_key(10), test_key(255)] {
                let start = Instant::now();
                engine.authorize(&candidate).await;
                let elapsed = start.elapsed();
                assert!(
                    elapsed >= FLOOR,
                    "{tenant_count} tenants answered after {elapsed:?}"
                );
                assert!(
                    elapsed < FLOOR + TOLERANCE,
                    "{tenant_count} tenants answered after {elapsed:?}"
                );
                timings.push(elapsed);
            }
        }

        let fastest = timings.iter().min().unwrap();
        let slowest = timings.iter().max().unwrap();
        assert!(
            *slowest - *fastest < SPREAD,
            "answers spread from {fastest:?} to {slowest:?}"
        );
    }
}
