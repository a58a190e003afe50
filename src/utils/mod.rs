pub mod chain_normalizer;
pub mod string_utils;
pub mod time_utils;

// Re-export commonly used functions
pub use chain_normalizer::{chain_id_from_value, normalize_network};
pub use time_utils::*;
