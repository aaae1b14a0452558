pub mod chat;
pub mod compare;
pub mod comparisons;
pub mod conversations;
pub mod health;
pub mod keys;
pub mod models;

use axum::Router;
use axum::http::HeaderMap;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(compare::router())
        .merge(comparisons::router())
        .merge(conversations::router())
        .merge(keys::router())
        .merge(models::router())
}

/// Caller identity from the `x-user-id` header; "local" when absent. There is
/// no authentication layer, identity only namespaces stored data.
pub fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "local".to_string())
}

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_MESSAGES: usize = 25;
pub const MAX_MODEL_CHARS: usize = 100;
pub const MAX_PROMPT_CHARS: usize = 2000;
pub const MAX_COMPARE_BRANCHES: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_defaults_to_local() {
        let headers = HeaderMap::new();
        assert_eq!(user_id(&headers), "local");
    }

    #[test]
    fn user_id_reads_header_and_trims() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", " alice ".parse().expect("header value"));
        assert_eq!(user_id(&headers), "alice");
    }

    #[test]
    fn blank_user_id_falls_back_to_local() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "   ".parse().expect("header value"));
        assert_eq!(user_id(&headers), "local");
    }
}
