use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

/// Compact identifier stamped on daemon starts and background job runs so log
/// lines from one run can be pulled together.
pub fn new_run_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        // 16 bytes of uuid, unpadded base64.
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
