//! Identity and content fingerprints.
//!
//! Both digests are SHA-256 over the lowercased, trimmed UTF-8 input,
//! truncated to 128 bits and hex encoded (32 characters).

use sha2::{Digest, Sha256};

const DIGEST_BYTES: usize = 16;

fn digest_128(input: &str) -> String {
    let normalized = input.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..DIGEST_BYTES])
}

/// Dedup key of a posting.
///
/// Fields are concatenated without a separator, so ("AB", "C") and ("A", "BC")
/// collide. Existing stored fingerprints depend on this exact layout.
pub fn identity_fingerprint(company: &str, title: &str, normalized_location: &str) -> String {
    digest_128(&format!("{company}{title}{normalized_location}"))
}

/// Change-detection key of a description; `None` when there is no text.
pub fn content_fingerprint(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(digest_128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_case_insensitive() {
        let a = identity_fingerprint("Acme", "Analyst", "New York");
        let b = identity_fingerprint("ACME", "analyst", "new york");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(a, identity_fingerprint("Acme", "Analyst", "New York"));
    }

    #[test]
    fn identity_differs_for_different_postings() {
        let a = identity_fingerprint("Acme", "Analyst", "New York");
        assert_ne!(a, identity_fingerprint("Acme", "Analyst", "London"));
        assert_ne!(a, identity_fingerprint("Acme", "Associate", "New York"));
        assert_ne!(a, identity_fingerprint("Globex", "Analyst", "New York"));
    }

    #[test]
    fn identity_concatenation_collides_across_field_boundaries() {
        assert_eq!(
            identity_fingerprint("AB", "C", "X"),
            identity_fingerprint("A", "BC", "X")
        );
    }

    #[test]
    fn content_is_absent_for_blank_descriptions() {
        assert_eq!(content_fingerprint(None), None);
        assert_eq!(content_fingerprint(Some("   ")), None);
        let fp = content_fingerprint(Some("Build pricing models")).unwrap();
        assert_eq!(Some(fp.clone()), content_fingerprint(Some("  build PRICING models ")));
        assert_ne!(Some(fp), content_fingerprint(Some("Build risk models")));
    }
}
