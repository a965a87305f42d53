//! Fixed-stride padding for outgoing plaintext. Thin wrapper over the
//! general-purpose pad/unpad in `util::crypto` so the 160-byte stride this module
//! actually uses is independently named and testable.

use crate::error::Result;
use crate::util::crypto::{pad_message, unpad_message};

/// Outgoing content is padded to the next multiple of this many bytes, hiding
/// message length within fixed-size buckets.
pub const STRIDE: usize = 160;

pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    pad_message(plaintext, STRIDE)
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    unpad_message(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rounds_up_to_stride() {
        for len in [0usize, 1, 159, 160, 161, 319, 320] {
            let msg = vec![0x42u8; len];
            let padded = pad(&msg);
            assert_eq!(padded.len() % STRIDE, 0);
            assert_eq!(unpad(&padded).unwrap(), msg);
        }
    }

    #[test]
    fn unpad_rejects_all_zero_buffer() {
        let buf = vec![0u8; STRIDE];
        assert!(unpad(&buf).is_err());
    }
}
