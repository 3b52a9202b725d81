use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use rand::Rng;

use crate::{
    config::LoadBalanceAlgorithm,
    core::{error::GatewayError, instance::ServiceInstance},
};

/// An instance eligible for selection, with its current in-flight request count.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub instance: &'a ServiceInstance,
    pub in_flight: u64,
}

/// Per-call inputs shared by all strategies.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub client_ip: Option<IpAddr>,
    /// Per-service monotonically advancing counter
    pub sequence: usize,
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Pick the index of one candidate; `None` only when `candidates` is empty
    fn select(&self, candidates: &[Candidate<'_>], ctx: &SelectionContext) -> Option<usize>;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
#[derive(Debug, Default)]
pub struct RoundRobinStrategy;

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[Candidate<'_>], ctx: &SelectionContext) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(ctx.sequence % candidates.len())
    }
}

/// Fewest in-flight requests wins; ties rotate with the sequence.
#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, candidates: &[Candidate<'_>], ctx: &SelectionContext) -> Option<usize> {
        let min = candidates.iter().map(|c| c.in_flight).min()?;
        let tied: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.in_flight == min)
            .map(|(i, _)| i)
            .collect();
        Some(tied[ctx.sequence % tied.len()])
    }
}

/// Draw in `[0, total_weight)` and scan the cumulative weights.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinStrategy;

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select(&self, candidates: &[Candidate<'_>], _ctx: &SelectionContext) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates
            .iter()
            .map(|c| u64::from(c.instance.weight.max(1)))
            .sum();
        let mut draw = rand::rng().random_range(0..total);
        for (i, candidate) in candidates.iter().enumerate() {
            let weight = u64::from(candidate.instance.weight.max(1));
            if draw < weight {
                return Some(i);
            }
            draw -= weight;
        }
        Some(candidates.len() - 1)
    }
}

/// Rendezvous hashing of (client ip, instance id).
///
/// The highest score wins, so a client keeps its instance while that instance
/// stays healthy and only its own clients move when it leaves.
#[derive(Debug, Default)]
pub struct IpHashStrategy;

impl IpHashStrategy {
    fn score(ip: &IpAddr, instance_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        instance_id.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancingStrategy for IpHashStrategy {
    fn select(&self, candidates: &[Candidate<'_>], ctx: &SelectionContext) -> Option<usize> {
        let Some(ip) = ctx.client_ip else {
            return RoundRobinStrategy.select(candidates, ctx);
        };
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| Self::score(&ip, &c.instance.id))
            .map(|(i, _)| i)
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(algorithm: LoadBalanceAlgorithm) -> Box<dyn LoadBalancingStrategy> {
        match algorithm {
            LoadBalanceAlgorithm::RoundRobin => RoundRobinStrategy.boxed(),
            LoadBalanceAlgorithm::LeastConnections => LeastConnectionsStrategy.boxed(),
            LoadBalanceAlgorithm::WeightedRoundRobin => WeightedRoundRobinStrategy.boxed(),
            LoadBalanceAlgorithm::IpHash => IpHashStrategy.boxed(),
        }
    }
}

/// Decrements the instance's in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Instance selector with per-service cursors and per-instance in-flight counts.
pub struct LoadBalancer {
    default_algorithm: LoadBalanceAlgorithm,
    strategies: HashMap<LoadBalanceAlgorithm, Box<dyn LoadBalancingStrategy>>,
    cursors: scc::HashMap<String, Arc<AtomicUsize>>,
    in_flight: scc::HashMap<String, Arc<AtomicU64>>,
}

impl LoadBalancer {
    pub fn new(default_algorithm: LoadBalanceAlgorithm) -> Self {
        let strategies = [
            LoadBalanceAlgorithm::RoundRobin,
            LoadBalanceAlgorithm::LeastConnections,
            LoadBalanceAlgorithm::WeightedRoundRobin,
            LoadBalanceAlgorithm::IpHash,
        ]
        .into_iter()
        .map(|algorithm| (algorithm, LoadBalancerFactory::create_strategy(algorithm)))
        .collect();

        Self {
            default_algorithm,
            strategies,
            cursors: scc::HashMap::new(),
            in_flight: scc::HashMap::new(),
        }
    }

    pub fn default_algorithm(&self) -> LoadBalanceAlgorithm {
        self.default_algorithm
    }

    /// Pick one of `instances`, skipping ids listed in `exclude`.
    pub async fn select(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        algorithm: Option<LoadBalanceAlgorithm>,
        client_ip: Option<IpAddr>,
        exclude: &[String],
    ) -> Result<ServiceInstance, GatewayError> {
        let eligible: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| !exclude.contains(&i.id))
            .collect();
        if eligible.is_empty() {
            return Err(GatewayError::NoHealthyInstance {
                service: service.to_string(),
            });
        }

        let mut candidates = Vec::with_capacity(eligible.len());
        for instance in eligible {
            let in_flight = self
                .in_flight
                .read_async(&instance.id, |_, c| c.load(Ordering::Acquire))
                .await
                .unwrap_or(0);
            candidates.push(Candidate {
                instance,
                in_flight,
            });
        }

        let sequence = self
            .cursors
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .get()
            .fetch_add(1, Ordering::Relaxed);

        let algorithm = algorithm.unwrap_or(self.default_algorithm);
        let ctx = SelectionContext {
            client_ip,
            sequence,
        };
        let index = self
            .strategies
            .get(&algorithm)
            .and_then(|strategy| strategy.select(&candidates, &ctx))
            .filter(|i| *i < candidates.len())
            .unwrap_or(0);

        let chosen = candidates[index].instance.clone();
        tracing::debug!(
            service = %service,
            instance_id = %chosen.id,
            algorithm = %algorithm,
            "Selected instance"
        );
        Ok(chosen)
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub async fn begin_request(&self, instance_id: &str) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry_async(instance_id.to_string())
            .await
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .get()
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    pub async fn in_flight(&self, instance_id: &str) -> u64 {
        self.in_flight
            .read_async(instance_id, |_, c| c.load(Ordering::Acquire))
            .await
            .unwrap_or(0)
    }

    /// Drop bookkeeping for an instance that left the registry.
    pub async fn forget_instance(&self, instance_id: &str) {
        let _ = self.in_flight.remove_async(instance_id).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use chrono::Utc;

    use super::*;
    use crate::core::instance::ServiceRegistration;

    fn instance(id: &str, weight: u32) -> ServiceInstance {
        ServiceRegistration::new("svc", format!("{id}.internal"), 8080)
            .with_weight(weight)
            .into_instance(id.to_string(), Utc::now())
    }

    fn pool(n: usize) -> Vec<ServiceInstance> {
        (0..n).map(|i| instance(&format!("i{i}"), 1)).collect()
    }

    #[tokio::test]
    async fn round_robin_is_fair_over_each_window() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::RoundRobin);
        let instances = pool(3);
        let mut counts: StdHashMap<String, usize> = StdHashMap::new();
        for _ in 0..300 {
            let chosen = lb.select("svc", &instances, None, None, &[]).await.unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c == 100));

        let first = lb.select("svc", &instances, None, None, &[]).await.unwrap();
        let second = lb.select("svc", &instances, None, None, &[]).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn weighted_selection_follows_weights() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::WeightedRoundRobin);
        let instances = vec![instance("light", 1), instance("heavy", 3)];
        let trials = 4_000;
        let mut light = 0;
        for _ in 0..trials {
            if lb.select("svc", &instances, None, None, &[]).await.unwrap().id == "light" {
                light += 1;
            }
        }
        let share = light as f64 / trials as f64;
        assert!((0.20..=0.30).contains(&share), "light share was {share}");
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_instance() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::LeastConnections);
        let instances = pool(2);
        let _busy = lb.begin_request("i0").await;
        for _ in 0..5 {
            let chosen = lb.select("svc", &instances, None, None, &[]).await.unwrap();
            assert_eq!(chosen.id, "i1");
        }
    }

    #[tokio::test]
    async fn in_flight_guard_decrements_on_drop() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::LeastConnections);
        {
            let _a = lb.begin_request("i0").await;
            let _b = lb.begin_request("i0").await;
            assert_eq!(lb.in_flight("i0").await, 2);
        }
        assert_eq!(lb.in_flight("i0").await, 0);
    }

    #[tokio::test]
    async fn ip_hash_is_sticky_and_remaps_only_lost_clients() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::IpHash);
        let instances = pool(4);
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        let first = lb.select("svc", &instances, None, Some(ip), &[]).await.unwrap();
        for _ in 0..10 {
            let again = lb.select("svc", &instances, None, Some(ip), &[]).await.unwrap();
            assert_eq!(again.id, first.id);
        }

        let survivors: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.id != first.id)
            .cloned()
            .collect();
        let moved = lb.select("svc", &survivors, None, Some(ip), &[]).await.unwrap();
        let moved_again = lb.select("svc", &survivors, None, Some(ip), &[]).await.unwrap();
        assert_eq!(moved.id, moved_again.id);

        let other: IpAddr = "198.51.100.1".parse().unwrap();
        let other_pick = lb.select("svc", &instances, None, Some(other), &[]).await.unwrap();
        if other_pick.id != first.id {
            let still = lb.select("svc", &survivors, None, Some(other), &[]).await.unwrap();
            assert_eq!(still.id, other_pick.id);
        }
    }

    #[tokio::test]
    async fn ip_hash_without_ip_falls_back_to_round_robin() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::IpHash);
        let instances = pool(2);
        let a = lb.select("svc", &instances, None, None, &[]).await.unwrap();
        let b = lb.select("svc", &instances, None, None, &[]).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn exclusions_and_empty_pools() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::RoundRobin);
        let instances = pool(2);
        for _ in 0..4 {
            let chosen = lb
                .select("svc", &instances, None, None, &["i0".to_string()])
                .await
                .unwrap();
            assert_eq!(chosen.id, "i1");
        }

        let err = lb
            .select("svc", &instances, None, None, &["i0".to_string(), "i1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstance { .. }));
        assert!(lb.select("svc", &[], None, None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn route_override_beats_default_algorithm() {
        let lb = LoadBalancer::new(LoadBalanceAlgorithm::RoundRobin);
        let instances = pool(2);
        let _busy = lb.begin_request("i1").await;
        for _ in 0..4 {
            let chosen = lb
                .select(
                    "svc",
                    &instances,
                    Some(LoadBalanceAlgorithm::LeastConnections),
                    None,
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(chosen.id, "i0");
        }
    }
}
