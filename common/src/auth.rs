use subtle::ConstantTimeEq;

/// Check a caller-supplied shared token against the configured one.
///
/// An empty configured token disables the check entirely (open server).
/// Comparison is constant-time to avoid leaking prefix matches.
pub fn token_matches(required: &str, provided: &str) -> bool {
    if required.is_empty() {
        return true;
    }
    if required.len() != provided.len() {
        return false;
    }
    required.as_bytes().ct_eq(provided.as_bytes()).into()
}
