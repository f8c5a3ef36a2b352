pub mod chain;

// Re-export common types
pub use chain::{connect_in_order, describe, ProxyChain, ProxyConfig};
