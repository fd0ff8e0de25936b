//! Idempotency keys for admission.

use sha2::{Digest, Sha256};

/// Lock key for one `(user, step, body)` triple.
///
/// The body is hashed in its serialized form; `serde_json` maps keep their
/// keys sorted, so two bodies with the same content hash alike regardless of
/// field order.
pub fn idempotency_key(user_id: &str, step: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0]);
    hasher.update(step.as_bytes());
    hasher.update([0]);
    hasher.update(body.to_string().as_bytes());
    format!("idem:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_content_same_key() {
        let a = idempotency_key("u1", "summary", &json!({"a": 1, "b": [1, 2]}));
        let b = idempotency_key("u1", "summary", &json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("idem:"));
        assert_eq!(a.len(), "idem:".len() + 64);
    }

    #[test]
    fn user_step_and_body_all_matter() {
        let base = idempotency_key("u1", "summary", &json!({"a": 1}));
        assert_ne!(base, idempotency_key("u2", "summary", &json!({"a": 1})));
        assert_ne!(base, idempotency_key("u1", "match", &json!({"a": 1})));
        assert_ne!(base, idempotency_key("u1", "summary", &json!({"a": 2})));
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        assert_ne!(
            idempotency_key("u1s", "ummary", &json!({})),
            idempotency_key("u1", "summary", &json!({}))
        );
    }
}
