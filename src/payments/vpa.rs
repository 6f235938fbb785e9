//! UPI virtual payment address validation
//!
//! Purely syntactic: `localpart@handle`, no lookups against the PSP.

use regex::Regex;
use std::sync::OnceLock;

/// NPCI caps a VPA at 255 characters
const MAX_VPA_LEN: usize = 255;

fn vpa_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // handle: alphanumeric labels joined by single dots
        Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9]+(\.[A-Za-z0-9]+)*$")
            .unwrap_or_else(|e| panic!("invalid VPA pattern: {}", e))
    })
}

/// Returns true when `vpa` has the shape of a UPI address.
///
/// Never errors; callers reject the payment request on `false`.
pub fn validate_vpa(vpa: &str) -> bool {
    if vpa.is_empty() || vpa.len() > MAX_VPA_LEN {
        return false;
    }
    vpa_pattern().is_match(vpa)
}
