//! Ticket-mask encoding and the bit-order helpers it depends on.
//!
//! BM13xx chips filter nonces in hardware against a 32-bit difficulty mask
//! written to the ticket-mask register. The register expects the mask value
//! big-endian, but with the bits of each byte mirrored — a quirk of the
//! chip's shift-register input path.

/// Ticket mask register address, fixed across the BM13xx family.
pub const TICKET_MASK_REG: u8 = 0x14;

/// Mirror the 8 bits of a byte. Self-inverse.
pub fn reverse_bits(b: u8) -> u8 {
    b.reverse_bits()
}

/// Greatest power of two less than or equal to `n`.
///
/// `n` must be at least 1; the result is undefined (panics in debug builds)
/// for zero.
pub fn largest_power_of_two(n: u32) -> u32 {
    debug_assert!(n >= 1);
    1 << (31 - n.leading_zeros())
}

/// Encode a pool difficulty as the 6-byte ticket-mask register write.
///
/// The difficulty is first collapsed to its enclosing power of two, then
/// `power - 1` forms the 32-bit hardware mask. Layout: one fixed zero byte,
/// the register tag, then the mask big-endian with every byte bit-mirrored.
pub fn difficulty_mask(difficulty: u32) -> [u8; 6] {
    let mask = largest_power_of_two(difficulty) - 1;
    let be = mask.to_be_bytes();
    [
        0x00,
        TICKET_MASK_REG,
        reverse_bits(be[0]),
        reverse_bits(be[1]),
        reverse_bits(be[2]),
        reverse_bits(be[3]),
    ]
}
