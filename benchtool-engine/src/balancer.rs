//! Client side load balancing across all addresses of an endpoint.
//!
//! A [`Balancer`] resolves its target through a [`Discovery`] provider and keeps one lazily
//! created client per address. Every request picks an address uniformly at random. The address
//! list is refreshed periodically by [`Balancer::run_resolver`]. When a refresh fails or yields
//! no addresses, the previous list stays in effect. Clients of addresses that disappear from the
//! list are dropped on the next successful refresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prometheus_client::metrics::gauge::Gauge;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::discovery::{Discovery, DiscoveryError};

/// Interval between two address refreshes.
pub const RESOLVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Timeout of a single address refresh.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors resolving the addresses of a balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// The discovery provider failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// The resolution did not complete in time.
    #[error("timed out resolving `{0}`")]
    Timeout(String),
    /// The target resolved to an empty address list.
    #[error("no addresses found for `{0}`")]
    NoAddresses(String),
}

/// Creates the client for a single address.
pub type ClientFactory<C> = Box<dyn Fn(&str) -> C + Send + Sync>;

struct State<C> {
    addresses: Vec<String>,
    clients: HashMap<String, Arc<C>>,
    rng: SmallRng,
}

/// Load balancer over the addresses of one endpoint target.
pub struct Balancer<C> {
    target: String,
    discovery: Arc<dyn Discovery>,
    make_client: ClientFactory<C>,
    resolved: Gauge,
    state: Mutex<State<C>>,
}

impl<C> fmt::Debug for Balancer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Balancer")
            .field("target", &self.target)
            .field("discovery", &self.discovery)
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

impl<C> Balancer<C> {
    /// Creates a balancer and resolves the target for the first time.
    ///
    /// Fails if the initial resolution fails or yields no addresses. The `resolved` gauge is
    /// kept at the current number of addresses.
    pub async fn new(
        target: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        make_client: ClientFactory<C>,
        resolved: Gauge,
    ) -> Result<Self, BalancerError> {
        let balancer = Self {
            target: target.into(),
            discovery,
            make_client,
            resolved,
            state: Mutex::new(State {
                addresses: Vec::new(),
                clients: HashMap::new(),
                rng: SmallRng::from_os_rng(),
            }),
        };

        balancer.resolve().await?;
        Ok(balancer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current list of addresses.
    pub fn addresses(&self) -> Vec<String> {
        self.lock().addresses.clone()
    }

    /// Resolves the target and replaces the address list.
    ///
    /// Returns the number of resolved addresses. On error, the previous addresses are kept.
    pub async fn resolve(&self) -> Result<usize, BalancerError> {
        let addresses = tokio::time::timeout(RESOLVE_TIMEOUT, self.discovery.resolve(&self.target))
            .await
            .map_err(|_| BalancerError::Timeout(self.target.clone()))??;

        if addresses.is_empty() {
            return Err(BalancerError::NoAddresses(self.target.clone()));
        }

        let count = addresses.len();
        {
            let mut state = self.lock();
            state
                .clients
                .retain(|address, _| addresses.contains(address));
            state.addresses = addresses;
        }

        self.resolved.set(count as i64);
        Ok(count)
    }

    /// Picks a random address and returns it along with its client.
    ///
    /// The client is created on first use of an address.
    pub fn pick(&self) -> Option<(String, Arc<C>)> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let address = state.addresses.choose(&mut state.rng)?.clone();
        let client = state
            .clients
            .entry(address.clone())
            .or_insert_with(|| Arc::new((self.make_client)(&address)))
            .clone();

        Some((address, client))
    }

    /// Refreshes the address list every [`RESOLVE_INTERVAL`] until cancelled.
    pub async fn run_resolver(&self, token: CancellationToken) {
        let start = tokio::time::Instant::now() + RESOLVE_INTERVAL;
        let mut interval = tokio::time::interval_at(start, RESOLVE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            match self.resolve().await {
                Ok(count) => tracing::debug!(endpoint = %self.target, count, "resolved addresses"),
                Err(error) => tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    endpoint = %self.target,
                    "failed to resolve addresses, keeping previous addresses"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Returns the configured address lists in order, repeating the last one.
    #[derive(Debug)]
    struct ScriptedDiscovery {
        results: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedDiscovery {
        fn new(results: &[&[&str]]) -> Arc<Self> {
            let results = results
                .iter()
                .rev()
                .map(|list| list.iter().map(|s| s.to_string()).collect())
                .collect();
            Arc::new(Self {
                results: Mutex::new(results),
            })
        }
    }

    #[async_trait]
    impl Discovery for ScriptedDiscovery {
        async fn resolve(&self, _target: &str) -> Result<Vec<String>, DiscoveryError> {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                Ok(results.pop().unwrap())
            } else {
                Ok(results[0].clone())
            }
        }
    }

    fn address_factory() -> ClientFactory<String> {
        Box::new(|address| address.to_owned())
    }

    #[tokio::test]
    async fn fails_without_initial_addresses() {
        let discovery = ScriptedDiscovery::new(&[&[]]);
        let err = Balancer::new("cortex", discovery, address_factory(), Gauge::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::NoAddresses(_)));
    }

    #[tokio::test]
    async fn keeps_previous_addresses_on_empty_resolution() {
        let discovery = ScriptedDiscovery::new(&[&["a:80", "b:80"], &[]]);
        let gauge = Gauge::default();
        let balancer = Balancer::new("cortex", discovery, address_factory(), gauge.clone())
            .await
            .unwrap();
        assert_eq!(gauge.get(), 2);

        let err = balancer.resolve().await.unwrap_err();
        assert!(matches!(err, BalancerError::NoAddresses(_)));
        assert_eq!(balancer.addresses(), ["a:80", "b:80"]);
        assert_eq!(gauge.get(), 2);
    }

    #[tokio::test]
    async fn picks_all_addresses_and_caches_clients() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory: ClientFactory<String> = {
            let created = created.clone();
            Box::new(move |address| {
                created.fetch_add(1, Ordering::Relaxed);
                address.to_owned()
            })
        };

        let discovery = ScriptedDiscovery::new(&[&["a:80", "b:80", "c:80"]]);
        let balancer = Balancer::new("cortex", discovery, factory, Gauge::default())
            .await
            .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..300 {
            let (address, client) = balancer.pick().unwrap();
            assert_eq!(&address, client.as_ref());
            seen.insert(address);
        }

        assert_eq!(seen.len(), 3);
        assert_eq!(created.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn drops_clients_of_removed_addresses() {
        let discovery = ScriptedDiscovery::new(&[&["a:80"], &["b:80"]]);
        let balancer = Balancer::new("cortex", discovery, address_factory(), Gauge::default())
            .await
            .unwrap();

        let (_, first) = balancer.pick().unwrap();
        balancer.resolve().await.unwrap();
        let (address, second) = balancer.pick().unwrap();

        assert_eq!(address, "b:80");
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(second.as_str(), "b:80");
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_refreshes_periodically() {
        let discovery = ScriptedDiscovery::new(&[&["a:80"], &["b:80"]]);
        let balancer = Arc::new(
            Balancer::new("cortex", discovery, address_factory(), Gauge::default())
                .await
                .unwrap(),
        );

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let balancer = balancer.clone();
            let token = token.clone();
            async move { balancer.run_resolver(token).await }
        });

        tokio::time::sleep(RESOLVE_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(balancer.addresses(), ["b:80"]);

        token.cancel();
        task.await.unwrap();
    }
}
