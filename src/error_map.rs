//! 原始传输层错误 → 用户可读消息

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::string_utils::truncate;

/// 未命中映射表时展示的最大长度
pub const MAX_DISPLAY_LEN: usize = 100;

/// 已知错误片段映射（按顺序匹配，先命中者生效）
pub fn error_map() -> &'static [(&'static str, &'static str)] {
    &[
        ("user rejected", "Request was rejected in the wallet"),
        ("user denied", "Request was rejected in the wallet"),
        ("no injected wallet", "No wallet detected, install a browser wallet"),
        ("insufficient funds", "Insufficient funds for gas and value"),
        ("nonce too low", "Transaction nonce is outdated, please retry"),
        ("replacement transaction underpriced", "A pending transaction needs a higher fee"),
        ("intrinsic gas too low", "Gas limit is too low for this transaction"),
        ("gas required exceeds", "Transaction would exceed the gas limit"),
        ("cannot estimate gas", "Unable to estimate gas, the transaction may fail"),
        ("execution reverted", "Contract call reverted"),
        ("timed out", "The network did not respond in time"),
        ("timeout", "The network did not respond in time"),
        ("unsupported network", "This network is not supported"),
        ("unrecognized chain", "This network is not configured in the wallet"),
        ("rate limit", "Too many requests, please slow down"),
        ("too many requests", "Too many requests, please slow down"),
        ("connection refused", "Network error, check your connection"),
        ("network error", "Network error, check your connection"),
        ("not connected", "Connect a wallet or network first"),
    ]
}

// 嵌入的调用载荷：(action="...", ...) / transaction={...} / data="0x..."
static PAYLOAD_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\s*\((?:action|reason|code|method)=[^)]*\)|\s*transaction=\{[^}]*\}|\s*data="?0x[0-9a-fA-F]*"?"#)
        .expect("payload regex is valid")
});

// 库内部前缀：Error: / ProviderError: / JsonRpcClientError(...) / (code: -32000)
static LIBRARY_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:Error|ProviderError|JsonRpcClientError|MiddlewareError|RpcError)\s*[:(]\s*)+|\(code:\s*-?\d+[^)]*\)")
        .expect("prefix regex is valid")
});

/// 清洗技术噪音（调用载荷、库前缀）
pub fn strip_noise(raw: &str) -> String {
    let without_payload = PAYLOAD_NOISE.replace_all(raw, "");
    let cleaned = LIBRARY_PREFIX.replace_all(without_payload.trim(), "");
    let mut cleaned = cleaned.trim().to_string();

    // 去掉前缀后残留的未配对右括号
    if cleaned.ends_with(')') && cleaned.matches(')').count() > cleaned.matches('(').count() {
        cleaned.pop();
    }
    cleaned.trim().to_string()
}

/// 将原始错误转换为简短、可读的消息
pub fn humanize_error(raw: &str) -> String {
    let cleaned = strip_noise(raw);
    let lower = cleaned.to_lowercase();

    for (needle, message) in error_map() {
        if lower.contains(needle) {
            return (*message).to_string();
        }
    }

    if cleaned.is_empty() {
        return "Unknown error".to_string();
    }
    truncate(&cleaned, MAX_DISPLAY_LEN)
}
