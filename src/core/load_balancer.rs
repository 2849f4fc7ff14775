use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::config::LoadBalanceStrategy;

/// Chooses where in a route's server list the next dispatch starts.
///
/// The dispatcher walks the list from that index, wrapping around, and moves
/// on only when a server refuses the connection.
pub trait LoadBalancingStrategy: Send + Sync + fmt::Debug + 'static {
    /// Index of the first server to try, `None` for an empty list.
    fn select_start(&self, server_count: usize) -> Option<usize>;

    /// Full attempt order starting at [`select_start`](Self::select_start).
    fn attempt_order(&self, server_count: usize) -> Vec<usize> {
        match self.select_start(server_count) {
            Some(start) => (0..server_count)
                .map(|offset| (start + offset) % server_count)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Round-robin load balancing strategy
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_start(&self, server_count: usize) -> Option<usize> {
        if server_count == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % server_count)
    }
}

/// Random selection load balancing strategy
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select_start(&self, server_count: usize) -> Option<usize> {
        if server_count == 0 {
            return None;
        }
        Some(rand::rng().random_range(0..server_count))
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobinStrategy::new()),
            LoadBalanceStrategy::Random => Box::new(RandomStrategy),
        }
    }
}
