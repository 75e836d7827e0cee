use sha2::{Digest, Sha256};

/// Stable hex fingerprint of `text`. Identical across processes and
/// platforms, so keys derived from it can be shared through an external store.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn differs_on_any_change() {
        assert_ne!(fingerprint("<% cached %>X<% end_cached %>"), fingerprint("<% cached %>Y<% end_cached %>"));
    }
}
