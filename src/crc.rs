//! CRC32C (Castagnoli, polynomial 0x1EDC6F41) helpers used for iSCSI header
//! and data digests. RFC 3720 §3.2.2.1 pads the digested region up to a
//! 4-byte boundary with zeros before running the checksum.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crc32c::crc32c_append;

/// Number of zero padding bytes needed to round `n` up to a 4-byte boundary.
#[inline]
pub fn pad_len(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

/// CRC32C over the concatenation of `parts`, skipping empty slices.
#[inline]
pub fn crc32c_of_parts(parts: &[&[u8]]) -> u32 {
    let mut acc = 0u32;
    for p in parts {
        if !p.is_empty() {
            acc = crc32c_append(acc, p);
        }
    }
    acc
}

/// CRC32C over `parts` followed by `pad` zero bytes (`pad` must be <= 3).
#[inline]
pub fn crc32c_with_padding(parts: &[&[u8]], pad: usize) -> u32 {
    let mut acc = crc32c_of_parts(parts);
    if pad != 0 {
        let zeros = [0u8; 3];
        acc = crc32c_append(acc, &zeros[..pad]);
    }
    acc
}

/// HeaderDigest over a BHS plus AHS, padded to a 4-byte boundary.
#[inline]
pub fn compute_header_digest(bhs: &[u8], ahs: &[u8]) -> u32 {
    crc32c_with_padding(&[bhs, ahs], pad_len(ahs.len()))
}

/// DataDigest over a Data Segment, padded to a 4-byte boundary.
#[inline]
pub fn compute_data_digest(data: &[u8]) -> u32 {
    crc32c_with_padding(&[data], pad_len(data.len()))
}
