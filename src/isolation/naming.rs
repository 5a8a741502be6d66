//! Instance names
//!
//! `charms-builder-<charm>-<base>-<nonce>`: lowercase alphanumerics and
//! dashes, at most 63 characters, never ending in a dash. The 8-hex nonce
//! survives truncation so concurrent tasks never collide.

use rand::Rng;

pub const INSTANCE_PREFIX: &str = "charms-builder-";

/// Longest name the isolation runtime accepts
pub const MAX_INSTANCE_NAME: usize = 63;

/// Fresh 8-hex-digit nonce
pub fn new_nonce() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Lowercase, map anything outside `[a-z0-9]` to `-`, collapse runs of `-`
fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub fn instance_name(charm: &str, series: &str, nonce: &str) -> String {
    let nonce = sanitize(nonce);
    let label = sanitize(&format!("{}-{}", charm, series));

    let budget = MAX_INSTANCE_NAME - INSTANCE_PREFIX.len() - nonce.len() - 1;
    let label = label
        .get(..budget.min(label.len()))
        .unwrap_or(&label)
        .trim_end_matches('-');

    if label.is_empty() {
        format!("{}{}", INSTANCE_PREFIX, nonce)
    } else {
        format!("{}{}-{}", INSTANCE_PREFIX, label, nonce)
    }
}

/// True for names this tool creates
pub fn is_managed(name: &str) -> bool {
    name.starts_with(INSTANCE_PREFIX)
}
