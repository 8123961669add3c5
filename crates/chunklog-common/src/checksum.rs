//! Payload checksums
//!
//! Log entries optionally carry a CRC32C of their payload (never of the
//! header). Payloads that wrap around the end of the circular write buffer
//! are checksummed in two parts with [`extend_payload_crc`].

/// Size of the checksum field in a log entry header
pub const CRC_SIZE: usize = 4;

/// Compute the checksum of a payload
#[inline]
#[must_use]
pub fn compute_payload_crc(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Continue a checksum over the next part of a split payload
#[inline]
#[must_use]
pub fn extend_payload_crc(crc: u32, next: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, next)
}

/// Verify a payload against its stored checksum
#[inline]
#[must_use]
pub fn verify_payload_crc(payload: &[u8], expected: u32) -> bool {
    compute_payload_crc(payload) == expected
}
