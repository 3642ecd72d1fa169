//! Secret comparison and wiping helpers.

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Compare two secrets in time independent of their contents.
///
/// Length differences return `false` immediately; lengths are not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Overwrite a buffer with random bytes, then zero it.
pub fn secure_wipe(buf: &mut [u8]) {
    // Random fill is best-effort; the zeroize pass below is the guarantee.
    let _ = getrandom::getrandom(buf);
    buf.zeroize();
}
