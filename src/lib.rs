//! IronConnect - 多链连接核心
//!
//! 钱包 / RPC 双模式连接管理、按网络的链适配器与带持久化的结果缓存

pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod error_map;
pub mod infrastructure;
pub mod service;
#[cfg(any(test, feature = "dev-tools"))]
pub mod testing;
pub mod utils;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{CoreError, CoreResult};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        config::Config,
        domain::{ConnectionState, ConnectionStatus, NetworkConfig, NetworkId, NetworkTable},
        error::{CoreError, CoreResult},
        infrastructure::{
            cache_key::CacheKey,
            result_cache::{CacheStats, ResultCache, SetOptions},
        },
        service::{AdapterRegistry, ChainAdapter, ConnectionManager},
    };
}
