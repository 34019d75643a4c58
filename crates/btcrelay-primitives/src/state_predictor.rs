//! Local replica of the relay contract's header state machine.
//!
//! Every header accepted by the relay advances the previous [`StoredHeader`] commitment. The
//! synchronizer runs the same transition off-chain so that commitments for submitted headers are
//! known before the target chain confirms them.

use crate::{ChainWork, Header, PREV_TIMESTAMPS_LEN, StoredHeader};

/// Number of blocks between two difficulty retargets.
pub const DIFF_ADJUSTMENT_PERIOD: u32 = 2016;

/// Numerator of the work computation, `0xFFFF << 208` as 32 big-endian bytes.
const MAX_TARGET_NUMERATOR: [u8; 32] = {
    let mut bytes = [0u8; 32];
    bytes[4] = 0xff;
    bytes[5] = 0xff;
    bytes
};

/// Returns `true` if `a` is strictly greater than `b` when both are read as unsigned big-endian
/// 256-bit integers.
pub fn gt256(a: &[u8; 32], b: &[u8; 32]) -> bool {
    for (x, y) in a.iter().zip(b.iter()) {
        if x > y {
            return true;
        }
        if x < y {
            return false;
        }
    }
    false
}

/// Expands the compact `nbits` encoding into a 32-byte big-endian target.
///
/// The sign bit of the mantissa is masked off. Mantissa bytes falling outside the 32-byte range are
/// dropped.
pub fn nbits_to_target(nbits: u32) -> [u8; 32] {
    let size = (nbits >> 24) as i64;
    let word = [
        ((nbits >> 16) & 0x7f) as u8,
        ((nbits >> 8) & 0xff) as u8,
        (nbits & 0xff) as u8,
    ];

    let start = 32 - size;

    let mut target = [0u8; 32];
    for (i, byte) in word.into_iter().enumerate() {
        let pos = start + i as i64;
        if (0..32).contains(&pos) {
            target[pos as usize] = byte;
        }
    }
    target
}

/// Returns the work contributed by a block with the given `nbits`.
///
/// This is the difficulty relative to the genesis target, `floor(0xFFFF * 2^208 / target)`,
/// evaluated with the same byte-wise long division the relay contract performs. Only the three
/// most significant non-zero bytes of the target take part in the division, the quotient is then
/// shifted back into place.
pub fn work_from_nbits(nbits: u32) -> ChainWork {
    let target = nbits_to_target(nbits);

    let start = target.iter().position(|byte| *byte > 0).unwrap_or(0);

    let divisor = (0..3).fold(0u64, |acc, i| {
        let byte = target.get(start + i).copied().unwrap_or(0);
        (acc << 8) | byte as u64
    });

    if divisor == 0 {
        return ChainWork::zero();
    }

    let mut quotient = [0u8; 32];
    let mut remainder = 0u64;
    for (pos, byte) in MAX_TARGET_NUMERATOR.iter().enumerate() {
        let value = *byte as u64 + remainder;
        // `remainder < divisor < 2^24`, so `value / divisor` is at most 0xff.
        quotient[pos] = (value / divisor) as u8;
        remainder = (value % divisor) << 8;
    }

    let shift = 29 - start as i64;

    let mut work = [0u8; 32];
    for (pos, slot) in work.iter_mut().enumerate() {
        let src = pos as i64 - shift;
        if (0..32).contains(&src) {
            *slot = quotient[src as usize];
        }
    }

    ChainWork(work)
}

/// Applies `next` on top of `prev`, producing the commitment the relay contract will store for it.
pub fn compute_next_commitment(prev: &StoredHeader, next: &Header) -> StoredHeader {
    let blockheight = prev.blockheight + 1;

    let mut prev_block_timestamps = [0u32; PREV_TIMESTAMPS_LEN];
    prev_block_timestamps[..PREV_TIMESTAMPS_LEN - 1]
        .copy_from_slice(&prev.prev_block_timestamps[1..]);
    prev_block_timestamps[PREV_TIMESTAMPS_LEN - 1] = prev.header.timestamp;

    let last_diff_adjustment = if blockheight % DIFF_ADJUSTMENT_PERIOD == 0 {
        next.timestamp
    } else {
        prev.last_diff_adjustment
    };

    StoredHeader {
        chain_work: prev.chain_work + work_from_nbits(next.nbits),
        header: *next,
        last_diff_adjustment,
        blockheight,
        prev_block_timestamps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn header(timestamp: u32, nbits: u32) -> Header {
        Header {
            version: 0x20000000,
            reversed_prev_blockhash: [0u8; 32],
            merkle_root: [0u8; 32],
            timestamp,
            nbits,
            nonce: 0,
        }
    }

    fn stored_at(blockheight: u32, timestamp_of: impl Fn(u32) -> u32) -> StoredHeader {
        let mut prev_block_timestamps = [0u32; PREV_TIMESTAMPS_LEN];
        for (i, slot) in prev_block_timestamps.iter_mut().enumerate() {
            *slot = timestamp_of(blockheight - PREV_TIMESTAMPS_LEN as u32 + i as u32);
        }
        StoredHeader {
            chain_work: ChainWork::from(1_000_000u128),
            header: header(timestamp_of(blockheight), 0x1d00ffff),
            last_diff_adjustment: 42,
            blockheight,
            prev_block_timestamps,
        }
    }

    #[test]
    fn work_matches_integer_difficulty() {
        let cases: &[(u32, u128)] = &[
            (0x1d00ffff, 1),
            (0x1d00d86a, 1),
            (0x1c3fffc0, 4),
            (0x1b0404cb, 16307),
            (0x1b04864c, 14484),
            (0x1a05db8b, 2864140),
            (0x1903a30c, 1180923195),
            (0x18009645, 1873105475221),
            (0x17034219, 86388558925171),
            (0x170331db, 88104191118793),
            // Sign bit of the mantissa is ignored.
            (0x1d80ffff, 1),
        ];
        for (nbits, expected) in cases {
            assert_eq!(work_from_nbits(*nbits), ChainWork::from(*expected), "nbits {nbits:#x}");
        }
    }

    #[test]
    fn work_is_zero_for_degenerate_targets() {
        // Regtest target is above the genesis target.
        assert_eq!(work_from_nbits(0x207fffff), ChainWork::zero());
        // Mantissa shifted out of range entirely.
        assert_eq!(work_from_nbits(0x01003456), ChainWork::zero());
        assert_eq!(work_from_nbits(0x22000001), ChainWork::zero());
    }

    #[test]
    fn work_for_tiny_target_shifts_quotient_left() {
        assert_eq!(
            work_from_nbits(0x03123456),
            ChainWork(hex!(
                "0000000000000e0ff24d29a53f33e6c2b7d8ca01fc3a4d27023f226ee2441e9b"
            ))
        );
    }

    #[test]
    fn nbits_expands_to_target() {
        let target = nbits_to_target(0x1d00ffff);
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, expected);

        let target = nbits_to_target(0x17034219);
        assert_eq!(&target[9..12], &[0x03, 0x42, 0x19]);
        assert!(target[..9].iter().chain(target[12..].iter()).all(|b| *b == 0));
    }

    #[test]
    fn gt256_is_unsigned_big_endian_comparison() {
        let zero = [0u8; 32];
        assert!(!gt256(&zero, &zero));

        let mut low = [0u8; 32];
        low[31] = 1;
        let mut high = [0u8; 32];
        high[0] = 1;
        assert!(gt256(&high, &low));
        assert!(!gt256(&low, &high));
        assert!(!gt256(&high, &high));
        assert!(gt256(&low, &zero));

        // Compare against u128 ordering for values fitting in the low half.
        let values = [0u128, 1, 255, 256, 0xffff_0000, u64::MAX as u128, u128::MAX];
        for a in values {
            for b in values {
                assert_eq!(
                    gt256(ChainWork::from(a).as_bytes(), ChainWork::from(b).as_bytes()),
                    a > b,
                    "{a} > {b}"
                );
            }
        }

        let mut ff = [0xffu8; 32];
        let max = ff;
        ff[31] = 0xfe;
        assert!(gt256(&max, &ff));
        assert!(!gt256(&ff, &max));
    }

    #[test]
    fn commitment_is_deterministic_and_monotonic() {
        let prev = stored_at(99, |h| 1_000 + h * 600);
        let next = header(1_000 + 100 * 600, 0x17034219);

        let a = compute_next_commitment(&prev, &next);
        let b = compute_next_commitment(&prev, &next);
        assert_eq!(a, b);
        assert_eq!(a.blockheight, 100);
        assert!(gt256(a.chain_work.as_bytes(), prev.chain_work.as_bytes()));
        assert_eq!(a.header, next);
    }

    #[test]
    fn three_headers_after_height_99() {
        let timestamp_of = |h: u32| 1_600_000_000 + h * 600;
        let initial = stored_at(99, timestamp_of);
        let nbits = [0x17034219, 0x170331db, 0x1903a30c];

        let mut stored = initial.clone();
        for (i, nbits) in nbits.iter().enumerate() {
            let height = 100 + i as u32;
            stored = compute_next_commitment(&stored, &header(timestamp_of(height), *nbits));
            assert_eq!(stored.blockheight, height);
        }

        assert_eq!(stored.blockheight, 102);
        // The ten blocks preceding height 102, oldest first.
        let expected: Vec<u32> = (92..102).map(timestamp_of).collect();
        assert_eq!(stored.prev_block_timestamps.to_vec(), expected);
        assert_eq!(stored.last_diff_adjustment, initial.last_diff_adjustment);

        let expected_work = nbits
            .iter()
            .fold(initial.chain_work, |acc, nbits| acc + work_from_nbits(*nbits));
        assert_eq!(stored.chain_work, expected_work);
        assert_eq!(
            stored.chain_work,
            ChainWork::from(1_000_000u128 + 86388558925171 + 88104191118793 + 1180923195)
        );
    }

    #[test]
    fn timestamps_track_previous_headers() {
        let timestamp_of = |h: u32| 10 * h + 3;
        let mut stored = stored_at(20, timestamp_of);
        for height in 21..=45 {
            stored = compute_next_commitment(&stored, &header(timestamp_of(height), 0x1d00ffff));
            let expected: Vec<u32> = (height - 10..height).map(timestamp_of).collect();
            assert_eq!(stored.prev_block_timestamps.to_vec(), expected);
        }
    }

    #[test]
    fn last_diff_adjustment_changes_only_on_retarget_boundary() {
        let timestamp_of = |h: u32| 500_000 + h;
        let mut stored = stored_at(4030, timestamp_of);
        for height in 4031..=4035 {
            let prev_adjustment = stored.last_diff_adjustment;
            stored = compute_next_commitment(&stored, &header(timestamp_of(height), 0x1d00ffff));
            if height % DIFF_ADJUSTMENT_PERIOD == 0 {
                assert_eq!(height, 4032);
                assert_eq!(stored.last_diff_adjustment, timestamp_of(4032));
            } else {
                assert_eq!(stored.last_diff_adjustment, prev_adjustment);
            }
        }
        assert_eq!(stored.last_diff_adjustment, timestamp_of(4032));
    }
}
