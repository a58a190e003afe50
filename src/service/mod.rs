pub mod adapter_registry;
pub mod chain_adapter;
pub mod chain_lookup;
pub mod connection_manager;
pub mod network_adapters;

pub use adapter_registry::AdapterRegistry;
pub use chain_adapter::{ChainAdapter, ChainFamily, FeeData, FeeModel};
pub use chain_lookup::{ChainLookupService, TokenMetadata};
pub use connection_manager::{ConnectionManager, StateListener, SubscriptionId};
