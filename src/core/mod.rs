pub mod cache;
pub mod client_ip;
pub mod dispatcher;
pub mod gatekeeper;
pub mod gateway;
pub mod load_balancer;
pub mod log_record;
pub mod normalizer;
pub mod rate_limiter;
pub mod router;
pub mod user_agent;

pub use gateway::GatewayService;
pub use load_balancer::LoadBalancerFactory;
