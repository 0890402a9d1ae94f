/// Utility functions and helpers
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Generate an opaque affinity cookie token
pub fn generate_cookie_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id1 = generate_id("ep");
        let id2 = generate_id("ep");

        assert!(id1.starts_with("ep-"));
        assert!(id2.starts_with("ep-"));
        assert_ne!(id1, id2); // Should be unique
    }

    #[test]
    fn test_generate_cookie_token() {
        let token = generate_cookie_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
