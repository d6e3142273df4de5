//! Utility functions

use uuid::Uuid;

/// Generate a holder identity unique to this process: `<hostname>-<uuid>`
pub fn generate_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "fleetwatch".to_string());
    format!("{}-{}", host, Uuid::new_v4().simple())
}

/// Check that a cluster name is usable as a map key and a metric label
pub fn is_valid_cluster_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity_is_unique() {
        let a = generate_identity();
        let b = generate_identity();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn test_cluster_name_validation() {
        assert!(is_valid_cluster_name("prod"));
        assert!(is_valid_cluster_name("eu-west_1.a"));
        assert!(!is_valid_cluster_name(""));
        assert!(!is_valid_cluster_name("has space"));
        assert!(!is_valid_cluster_name(&"x".repeat(64)));
    }
}
