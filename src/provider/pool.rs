//! Ordered provider fallback with health awareness and a circuit breaker.
//!
//! The pool owns every mutable provider counter; nothing outside this module
//! touches them. It is not shared across parallel callers — the engine is
//! single-threaded by contract — but all mutation goes through `&mut self`,
//! so the compiler enforces the serialisation point the design calls for.

use super::adapter::{PromptContext, ProviderAdapter};
use super::ParseResult;
use crate::cancel::CancelToken;
use crate::errors::{AllProvidersFailed, ProviderError};
use crate::plan::Task;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failures that trip a provider's circuit open.
pub const CIRCUIT_TRIP_THRESHOLD: u32 = 3;

/// How long an open circuit cools down before one half-open probe.
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(300);

/// Providers with fewer recorded attempts than this are not ranked by
/// success rate; early numbers are too noisy to order by.
pub const MIN_RANKED_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Mutable per-provider accounting. Lives for the process.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub circuit: CircuitState,
    /// Set when the provider failed its startup health probe; the circuit
    /// stays open with no cooldown until `reset_provider` is called.
    pub manual_reset_required: bool,
}

impl Default for PoolStats {
    fn default() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            circuit: CircuitState::Closed,
            manual_reset_required: false,
        }
    }
}

impl PoolStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

struct PoolEntry {
    adapter: ProviderAdapter,
    stats: PoolStats,
}

/// A provider produced a successful, parsed response.
#[derive(Debug)]
pub struct ProviderSuccess {
    pub provider: String,
    pub parsed: ParseResult,
    pub duration: Duration,
    /// Providers tried and failed before this one in the same call.
    pub fallbacks: Vec<(String, String)>,
}

pub struct ProviderPool {
    entries: Vec<PoolEntry>,
    cooldown: Duration,
}

impl ProviderPool {
    /// Build a pool without probing health. Every circuit starts closed.
    pub fn new(adapters: Vec<ProviderAdapter>) -> Self {
        Self {
            entries: adapters
                .into_iter()
                .map(|adapter| PoolEntry {
                    adapter,
                    stats: PoolStats::default(),
                })
                .collect(),
            cooldown: CIRCUIT_COOLDOWN,
        }
    }

    /// Override the open → half-open cooldown (tests simulate the five
    /// minutes this way).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Build a pool and probe each adapter's health. Providers failing the
    /// probe start with their circuit open and no cooldown expiry.
    pub async fn with_health_check(adapters: Vec<ProviderAdapter>) -> Self {
        let mut pool = Self::new(adapters);
        for entry in &mut pool.entries {
            if !entry.adapter.health().await {
                warn!(provider = entry.adapter.name(), "health probe failed; circuit opened");
                entry.stats.circuit = CircuitState::Open;
                entry.stats.manual_reset_required = true;
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.adapter.name()).collect()
    }

    pub fn stats(&self, provider: &str) -> Option<&PoolStats> {
        self.entries
            .iter()
            .find(|e| e.adapter.name() == provider)
            .map(|e| &e.stats)
    }

    /// Manually close a provider's circuit and clear its counters. The only
    /// way back in for a provider that failed its startup health probe.
    pub fn reset_provider(&mut self, provider: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.adapter.name() == provider) {
            Some(entry) => {
                entry.stats = PoolStats::default();
                info!(provider, "provider circuit manually reset");
                true
            }
            None => false,
        }
    }

    /// Try providers in configured order until one succeeds. Open circuits
    /// are skipped but never transitioned here.
    pub async fn execute_with_fallback(
        &mut self,
        task: &Task,
        ctx: &PromptContext,
        cancel: &CancelToken,
    ) -> Result<ProviderSuccess, AllProvidersFailed> {
        let order: Vec<usize> = (0..self.entries.len()).collect();
        self.execute_ordered(&order, false, task, ctx, cancel).await
    }

    /// Like [`execute_with_fallback`], but drives the breaker state machine:
    /// trip to open at [`CIRCUIT_TRIP_THRESHOLD`] consecutive failures,
    /// open → half-open after [`CIRCUIT_COOLDOWN`], half-open success closes,
    /// half-open failure re-opens and restarts the cooldown.
    ///
    /// [`execute_with_fallback`]: Self::execute_with_fallback
    pub async fn execute_with_circuit_breaker(
        &mut self,
        task: &Task,
        ctx: &PromptContext,
        cancel: &CancelToken,
    ) -> Result<ProviderSuccess, AllProvidersFailed> {
        let order: Vec<usize> = (0..self.entries.len()).collect();
        self.execute_ordered(&order, true, task, ctx, cancel).await
    }

    /// Reorder by descending success rate before falling back. Zero-attempt
    /// providers go first as exploratory; providers with fewer than
    /// [`MIN_RANKED_ATTEMPTS`] keep configured order between them; the rest
    /// are ranked, ties keeping configured order.
    pub async fn execute_with_best_provider(
        &mut self,
        task: &Task,
        ctx: &PromptContext,
        cancel: &CancelToken,
    ) -> Result<ProviderSuccess, AllProvidersFailed> {
        let order = self.best_provider_order();
        self.execute_ordered(&order, false, task, ctx, cancel).await
    }

    fn best_provider_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| {
            let stats = &self.entries[i].stats;
            if stats.attempts == 0 {
                (0u8, 0u64)
            } else if stats.attempts < MIN_RANKED_ATTEMPTS {
                (1, 0)
            } else {
                // Ascending key, so invert the rate; stable sort keeps
                // configured order on ties.
                (2, ((1.0 - stats.success_rate()) * 1_000_000.0) as u64)
            }
        });
        order
    }

    async fn execute_ordered(
        &mut self,
        order: &[usize],
        breaker: bool,
        task: &Task,
        ctx: &PromptContext,
        cancel: &CancelToken,
    ) -> Result<ProviderSuccess, AllProvidersFailed> {
        let mut provider_errors: Vec<(String, String)> = Vec::new();
        let no_overrides = BTreeMap::new();

        for &idx in order {
            let name = self.entries[idx].adapter.name().to_string();

            if !self.admit(idx, breaker) {
                debug!(provider = %name, "circuit open; provider skipped");
                provider_errors.push((name, "circuit open".to_string()));
                continue;
            }

            let prompt = self.entries[idx].adapter.prompt(task, ctx);
            let start = Instant::now();
            let attempt = self.entries[idx]
                .adapter
                .invoke(&prompt, &no_overrides, cancel)
                .await;

            match attempt {
                Ok(raw) => {
                    let parsed = self.entries[idx].adapter.parse(&raw);
                    if parsed.success {
                        self.record_success(idx);
                        return Ok(ProviderSuccess {
                            provider: name,
                            parsed,
                            duration: start.elapsed(),
                            fallbacks: provider_errors,
                        });
                    }
                    let detail = ProviderError::NonZeroExit {
                        provider: name.clone(),
                        exit_code: raw.exit_code,
                        stderr: parsed.error_text.clone(),
                    }
                    .detail();
                    self.record_failure(idx, breaker);
                    provider_errors.push((name, detail));
                }
                Err(err @ ProviderError::Cancelled { .. }) => {
                    // Treated as a timeout-class failure, but no further
                    // providers are tried for a cancelled run.
                    self.record_failure(idx, breaker);
                    provider_errors.push((name, err.detail()));
                    break;
                }
                Err(err) => {
                    self.record_failure(idx, breaker);
                    provider_errors.push((name, err.detail()));
                }
            }
        }

        let last_error = provider_errors
            .last()
            .map(|(_, e)| e.clone())
            .unwrap_or_else(|| "no providers available".to_string());
        Err(AllProvidersFailed {
            task_id: task.id.clone(),
            last_error,
            provider_errors,
        })
    }

    /// Whether the provider may be tried now, applying the open → half-open
    /// transition when running in breaker mode.
    fn admit(&mut self, idx: usize, breaker: bool) -> bool {
        let stats = &mut self.entries[idx].stats;
        match stats.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if !breaker || stats.manual_reset_required {
                    return false;
                }
                let cooldown = self.cooldown;
                let cooled = stats
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= cooldown);
                if cooled {
                    info!(
                        provider = self.entries[idx].adapter.name(),
                        "circuit cooldown elapsed; entering half-open"
                    );
                    let stats = &mut self.entries[idx].stats;
                    stats.circuit = CircuitState::HalfOpen;
                    stats.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self, idx: usize) {
        let name = self.entries[idx].adapter.name().to_string();
        let stats = &mut self.entries[idx].stats;
        stats.attempts += 1;
        stats.successes += 1;
        stats.consecutive_failures = 0;
        if stats.circuit == CircuitState::HalfOpen {
            info!(provider = %name, "half-open probe succeeded; circuit closed");
        }
        stats.circuit = CircuitState::Closed;
    }

    fn record_failure(&mut self, idx: usize, breaker: bool) {
        let name = self.entries[idx].adapter.name().to_string();
        let stats = &mut self.entries[idx].stats;
        stats.attempts += 1;
        stats.failures += 1;
        stats.consecutive_failures += 1;
        stats.last_failure_at = Some(Instant::now());

        if !breaker {
            return;
        }
        if stats.circuit == CircuitState::HalfOpen {
            warn!(provider = %name, "half-open probe failed; circuit re-opened");
            stats.circuit = CircuitState::Open;
        } else if stats.consecutive_failures >= CIRCUIT_TRIP_THRESHOLD {
            warn!(
                provider = %name,
                consecutive = stats.consecutive_failures,
                "circuit tripped open"
            );
            stats.circuit = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderSpec;
    use std::path::Path;

    fn create_stub_cli(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn adapter_for(name: &str, cli: &str) -> ProviderAdapter {
        let mut spec = ProviderSpec::new(name, cli);
        spec.timeout_secs = 10;
        ProviderAdapter::new(spec)
    }

    fn task() -> Task {
        Task::new("t1", "Demo task")
    }

    #[tokio::test]
    async fn fallback_returns_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let good = create_stub_cli(dir.path(), "good.sh", "echo done");
        let mut pool = ProviderPool::new(vec![adapter_for("primary", &good)]);

        let success = pool
            .execute_with_fallback(&task(), &PromptContext::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(success.provider, "primary");
        assert!(success.fallbacks.is_empty());
        assert_eq!(pool.stats("primary").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn fallback_moves_to_second_provider() {
        let dir = tempfile::tempdir().unwrap();
        let bad = create_stub_cli(dir.path(), "bad.sh", "echo 'Provider unavailable' >&2; exit 1");
        let good = create_stub_cli(dir.path(), "good.sh", "echo done");
        let mut pool = ProviderPool::new(vec![
            adapter_for("primary", &bad),
            adapter_for("secondary", &good),
        ]);

        let success = pool
            .execute_with_fallback(&task(), &PromptContext::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(success.provider, "secondary");
        assert_eq!(success.fallbacks.len(), 1);
        assert_eq!(success.fallbacks[0].0, "primary");
        assert!(success.fallbacks[0].1.contains("unavailable"));

        let primary = pool.stats("primary").unwrap();
        assert_eq!(primary.failures, 1);
        assert_eq!(primary.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn all_providers_failed_carries_ordered_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bad1 = create_stub_cli(dir.path(), "bad1.sh", "echo 'first error' >&2; exit 1");
        let bad2 = create_stub_cli(dir.path(), "bad2.sh", "echo 'second error' >&2; exit 1");
        let mut pool = ProviderPool::new(vec![
            adapter_for("one", &bad1),
            adapter_for("two", &bad2),
        ]);

        let err = pool
            .execute_with_fallback(&task(), &PromptContext::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.task_id, "t1");
        assert_eq!(err.provider_errors.len(), 2);
        assert_eq!(err.provider_errors[0].0, "one");
        assert_eq!(err.provider_errors[1].0, "two");
        assert!(err.last_error.contains("second error"));
    }

    #[tokio::test]
    async fn breaker_trips_after_three_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let bad = create_stub_cli(dir.path(), "bad.sh", "echo 'network error' >&2; exit 1");
        let mut pool = ProviderPool::new(vec![adapter_for("flaky", &bad)]);
        let ctx = PromptContext::default();
        let cancel = CancelToken::new();

        for _ in 0..3 {
            pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
                .await
                .unwrap_err();
        }
        assert_eq!(pool.stats("flaky").unwrap().circuit, CircuitState::Open);
        assert_eq!(pool.stats("flaky").unwrap().attempts, 3);

        // Open circuit: skipped without spawning, attempts unchanged.
        let err = pool
            .execute_with_circuit_breaker(&task(), &ctx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(pool.stats("flaky").unwrap().attempts, 3);
        assert!(err.provider_errors[0].1.contains("circuit open"));
    }

    #[tokio::test]
    async fn breaker_half_open_success_closes_circuit() {
        let dir = tempfile::tempdir().unwrap();
        // Fails while marker file exists, succeeds afterwards.
        let marker = dir.path().join("failing");
        std::fs::write(&marker, "x").unwrap();
        let body = format!(
            "if [ -f {m} ]; then echo 'network error' >&2; exit 1; else echo ok; fi",
            m = marker.display()
        );
        let cli = create_stub_cli(dir.path(), "flaky.sh", &body);
        let mut pool = ProviderPool::new(vec![adapter_for("flaky", &cli)])
            .with_cooldown(Duration::from_millis(200));
        let ctx = PromptContext::default();
        let cancel = CancelToken::new();

        for _ in 0..3 {
            pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
                .await
                .unwrap_err();
        }
        assert_eq!(pool.stats("flaky").unwrap().circuit, CircuitState::Open);

        // Let the (shortened) cooldown elapse, then let the probe succeed.
        std::fs::remove_file(&marker).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let success = pool
            .execute_with_circuit_breaker(&task(), &ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(success.provider, "flaky");
        assert_eq!(pool.stats("flaky").unwrap().circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn breaker_half_open_failure_reopens_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let bad = create_stub_cli(dir.path(), "bad.sh", "echo 'network error' >&2; exit 1");
        let mut pool = ProviderPool::new(vec![adapter_for("flaky", &bad)])
            .with_cooldown(Duration::from_millis(200));
        let ctx = PromptContext::default();
        let cancel = CancelToken::new();

        for _ in 0..3 {
            pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
                .await
                .unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Exactly one half-open probe runs and fails.
        pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
            .await
            .unwrap_err();
        let stats = pool.stats("flaky").unwrap();
        assert_eq!(stats.circuit, CircuitState::Open);
        assert_eq!(stats.attempts, 4);

        // Cooldown restarted: the next call skips again.
        pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(pool.stats("flaky").unwrap().attempts, 4);
    }

    #[tokio::test]
    async fn plain_fallback_skips_open_circuit_without_transition() {
        let dir = tempfile::tempdir().unwrap();
        let bad = create_stub_cli(dir.path(), "bad.sh", "echo 'network error' >&2; exit 1");
        let good = create_stub_cli(dir.path(), "good.sh", "echo ok");
        let mut pool = ProviderPool::new(vec![
            adapter_for("flaky", &bad),
            adapter_for("steady", &good),
        ])
        .with_cooldown(Duration::from_millis(200));
        let ctx = PromptContext::default();
        let cancel = CancelToken::new();

        for _ in 0..3 {
            pool.execute_with_circuit_breaker(&task(), &ctx, &cancel)
                .await
                .unwrap();
        }
        assert_eq!(pool.stats("flaky").unwrap().circuit, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Fallback mode never transitions to half-open, even after cooldown.
        let success = pool
            .execute_with_fallback(&task(), &ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(success.provider, "steady");
        assert_eq!(pool.stats("flaky").unwrap().circuit, CircuitState::Open);
        assert_eq!(pool.stats("flaky").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn health_failed_provider_is_never_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let good = create_stub_cli(dir.path(), "good.sh", "echo ok");
        let pool_adapters = vec![
            adapter_for("ghost", "/nonexistent/no-cli"),
            adapter_for("steady", &good),
        ];
        let mut pool = ProviderPool::with_health_check(pool_adapters).await;
        assert_eq!(pool.stats("ghost").unwrap().circuit, CircuitState::Open);
        assert!(pool.stats("ghost").unwrap().manual_reset_required);

        let success = pool
            .execute_with_circuit_breaker(&task(), &PromptContext::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(success.provider, "steady");
        assert_eq!(pool.stats("ghost").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn all_health_failed_reports_without_spawning() {
        let pool_adapters = vec![
            adapter_for("ghost1", "/nonexistent/no-cli"),
            adapter_for("ghost2", "/nonexistent/no-cli-either"),
        ];
        let mut pool = ProviderPool::with_health_check(pool_adapters).await;

        let err = pool
            .execute_with_fallback(&task(), &PromptContext::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.provider_errors.len(), 2);
        assert!(err.provider_errors.iter().all(|(_, e)| e == "circuit open"));
        assert_eq!(pool.stats("ghost1").unwrap().attempts, 0);
        assert_eq!(pool.stats("ghost2").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn reset_provider_closes_manual_circuit() {
        let mut pool = ProviderPool::with_health_check(vec![adapter_for(
            "ghost",
            "/nonexistent/no-cli",
        )])
        .await;
        assert!(pool.reset_provider("ghost"));
        assert_eq!(pool.stats("ghost").unwrap().circuit, CircuitState::Closed);
        assert!(!pool.reset_provider("unknown"));
    }

    #[test]
    fn best_provider_order_ranks_by_success_rate() {
        let mut pool = ProviderPool::new(vec![
            ProviderAdapter::new(ProviderSpec::new("weak", "weak")),
            ProviderAdapter::new(ProviderSpec::new("strong", "strong")),
            ProviderAdapter::new(ProviderSpec::new("fresh", "fresh")),
        ]);
        // weak: 1/4 successes; strong: 3/4; fresh: untouched.
        for entry in &mut pool.entries {
            match entry.adapter.name() {
                "weak" => {
                    entry.stats.attempts = 4;
                    entry.stats.successes = 1;
                    entry.stats.failures = 3;
                }
                "strong" => {
                    entry.stats.attempts = 4;
                    entry.stats.successes = 3;
                    entry.stats.failures = 1;
                }
                _ => {}
            }
        }

        let order = pool.best_provider_order();
        let names: Vec<&str> = order
            .iter()
            .map(|&i| pool.entries[i].adapter.name())
            .collect();
        assert_eq!(names, vec!["fresh", "strong", "weak"]);
    }

    #[test]
    fn best_provider_order_insufficient_data_keeps_configured_order() {
        let mut pool = ProviderPool::new(vec![
            ProviderAdapter::new(ProviderSpec::new("a", "a")),
            ProviderAdapter::new(ProviderSpec::new("b", "b")),
        ]);
        // Both below the ranking floor, b with a better rate; order is kept.
        pool.entries[0].stats.attempts = 2;
        pool.entries[0].stats.successes = 0;
        pool.entries[1].stats.attempts = 2;
        pool.entries[1].stats.successes = 2;

        let order = pool.best_provider_order();
        let names: Vec<&str> = order
            .iter()
            .map(|&i| pool.entries[i].adapter.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn best_provider_order_equal_rates_keep_configured_order() {
        let mut pool = ProviderPool::new(vec![
            ProviderAdapter::new(ProviderSpec::new("first", "first")),
            ProviderAdapter::new(ProviderSpec::new("second", "second")),
        ]);
        for entry in &mut pool.entries {
            entry.stats.attempts = 5;
            entry.stats.successes = 4;
            entry.stats.failures = 1;
        }

        let order = pool.best_provider_order();
        let names: Vec<&str> = order
            .iter()
            .map(|&i| pool.entries[i].adapter.name())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
