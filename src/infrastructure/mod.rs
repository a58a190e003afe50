pub mod cache_key;
pub mod logging;
pub mod result_cache;
pub mod storage;
pub mod transport;
pub mod wallet;
