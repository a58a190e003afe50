//! Domain 模块
//!
//! 网络配置与连接状态模型

pub mod chain_config;
pub mod connection_state;

// 重新导出常用类型
pub use chain_config::{NativeCurrency, NetworkConfig, NetworkId, NetworkTable};
pub use connection_state::{ConnectionMode, ConnectionState, ConnectionStatus};
