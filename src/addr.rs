//! Addressing: pure functions from key hash to bucket index to physical
//! page number, and the FSM-slot to overflow-page mapping.
//!
//! Goals:
//! - Keep the hash stable and explicit (not std::DefaultHasher): the hash is
//!   persisted inside every item and compared on lookup, so it is part of
//!   the on-disk contract.
//! - Keep all of the arithmetic here free of I/O so it can be tested
//!   exhaustively against the inverse mappings.

use anyhow::Result;

use crate::consts::OVERFLOW_LEVELS;
use crate::error::MapError;

/// Stable key hash: h = 1, then h = 31*h + byte (byte interpreted as i8),
/// with 32-bit two's-complement wrap on every step.
pub fn hash_key(key: &[u8]) -> i32 {
    let mut h: i32 = 1;
    for &b in key {
        h = h.wrapping_mul(31).wrapping_add(b as i8 as i32);
    }
    h
}

/// Bucket index for a hash under the current addressing state.
///
/// Buckets already split in this round are addressed by the full
/// hash_bits; the rest by hash_bits - 1.
#[inline]
pub fn bucket_index(hash: i32, hash_bits: u8, split_index: u64) -> u64 {
    let mask = (1u64 << hash_bits) - 1;
    let full_index = (hash as u32 as u64) & mask;
    let half_index = full_index & !(1u64 << (hash_bits - 1));
    if half_index < split_index {
        full_index
    } else {
        half_index
    }
}

/// Physical page number of a bucket page.
///
/// The highest set bit of the bucket index tells how many complete levels
/// of overflow stripes precede the bucket page in the file.
pub fn bucket_page_number(bucket: u64, overflow_pages: &[u32; OVERFLOW_LEVELS]) -> u64 {
    if bucket == 0 {
        return 0;
    }
    let highest_bit = 63 - bucket.leading_zeros() as usize;
    let preceding: u64 = overflow_pages[..=highest_bit]
        .iter()
        .map(|&c| c as u64)
        .sum();
    bucket + preceding
}

/// Physical page number of the overflow page behind an FSM slot.
///
/// Slots are numbered in allocation stripes: stripe i holds the slots
/// counted by overflow_pages[i], and its pages sit right after the 2^i
/// bucket pages of level i, so a slot f in stripe i lives at page f + 2^i.
pub fn overflow_page_number(
    slot: u64,
    active_split_point: usize,
    overflow_pages: &[u32; OVERFLOW_LEVELS],
) -> Result<u64> {
    let mut pages_count = 0u64;
    for level in 0..=active_split_point {
        pages_count += overflow_pages[level] as u64;
        if slot < pages_count {
            return Ok(slot + (1u64 << level));
        }
    }
    Err(MapError::corruption(format!(
        "overflow slot {} beyond all stripes (total {})",
        slot, pages_count
    )))
}

/// Inverse of [`overflow_page_number`]: FSM slot behind an overflow page.
///
/// Stripe i occupies the half-open page range
/// [slots_before + 2^i, slots_before + overflow_pages[i] + 2^i); pages
/// below a stripe's start belong to bucket pages and are rejected.
pub fn overflow_slot(
    page: u64,
    active_split_point: usize,
    overflow_pages: &[u32; OVERFLOW_LEVELS],
) -> Result<u64> {
    let mut pages_count = 0u64;
    for level in 0..=active_split_point {
        let stripe_start = pages_count + (1u64 << level);
        pages_count += overflow_pages[level] as u64;
        if page < pages_count + (1u64 << level) {
            if page < stripe_start {
                return Err(MapError::corruption(format!(
                    "page {} is a bucket page, not an overflow page",
                    page
                )));
            }
            return Ok(page - (1u64 << level));
        }
    }
    Err(MapError::corruption(format!(
        "page {} is not an overflow page of any stripe",
        page
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_reference_vectors() {
        // Значения пересчитаны вручную по определению h = 31*h + x.
        assert_eq!(hash_key(b""), 1);
        assert_eq!(hash_key(b"a"), 31 + 97);
        assert_eq!(hash_key(b"key1"), 4212019);
        // Старший бит байта: байт интерпретируется знаково.
        assert_eq!(hash_key(&[0xFF]), 30);
        assert_eq!(hash_key(&[0x80]), -97);
        // Переполнение заворачивается по модулю 2^32.
        let long: Vec<u8> = (0..64).map(|i| (i * 7) as u8).collect();
        let h = hash_key(&long);
        let slow = long
            .iter()
            .fold(1i64, |acc, &b| {
                ((acc * 31 + (b as i8) as i64) as i32) as i64
            });
        assert_eq!(h as i64, slow);
    }

    #[test]
    fn bucket_index_respects_split_boundary() {
        // hash_bits = 3, split_index = 2: бакеты 0 и 1 уже расщеплены.
        // half < 2 берёт полный индекс, остальные усечённый.
        assert_eq!(bucket_index(0b001, 3, 2), 0b001);
        assert_eq!(bucket_index(0b101, 3, 2), 0b101);
        assert_eq!(bucket_index(0b110, 3, 2), 0b010);
        assert_eq!(bucket_index(0b011, 3, 2), 0b011);

        // С одним битом всё падает в бакет 0.
        for h in [0i32, 1, -1, 12345, i32::MIN] {
            assert_eq!(bucket_index(h, 1, 0), 0);
        }
    }

    #[test]
    fn bucket_pages_interleave_with_stripes() {
        let mut ovf = [0u32; OVERFLOW_LEVELS];
        ovf[0] = 2;
        ovf[1] = 1;

        assert_eq!(bucket_page_number(0, &ovf), 0);
        // За бакетом 0 лежит полоса уровня 0 (2 страницы).
        assert_eq!(bucket_page_number(1, &ovf), 3);
        // За бакетом 1 полоса уровня 1 (1 страница).
        assert_eq!(bucket_page_number(2, &ovf), 5);
        assert_eq!(bucket_page_number(3, &ovf), 6);
    }

    #[test]
    fn overflow_mapping_roundtrips_every_slot() {
        let mut ovf = [0u32; OVERFLOW_LEVELS];
        ovf[0] = 3;
        ovf[1] = 1;
        ovf[2] = 4;
        ovf[4] = 2;
        let asp = 4;

        let total: u64 = ovf.iter().map(|&c| c as u64).sum();
        let mut seen = std::collections::HashSet::new();
        for slot in 0..total {
            let page = overflow_page_number(slot, asp, &ovf).unwrap();
            assert!(seen.insert(page), "page {} mapped twice", page);
            assert_eq!(overflow_slot(page, asp, &ovf).unwrap(), slot);
        }

        // Слот за пределами всех полос: ошибка, а не мусорная страница.
        assert!(overflow_page_number(total, asp, &ovf).is_err());

        // Бакетные позиции не резолвятся в слоты.
        assert!(overflow_slot(0, asp, &ovf).is_err());
        // Страница бакета 1 лежит сразу за полосой уровня 0.
        assert!(overflow_slot(ovf[0] as u64 + 1, asp, &ovf).is_err());
    }

    #[test]
    fn overflow_pages_never_collide_with_bucket_pages() {
        let mut ovf = [0u32; OVERFLOW_LEVELS];
        ovf[0] = 3;
        ovf[1] = 2;
        ovf[2] = 5;
        // hash_bits = 4, split_index = 0: бакетов 8, активный уровень 3.
        let buckets = 8u64;
        let asp = 3;

        let mut pages = std::collections::HashSet::new();
        for b in 0..buckets {
            assert!(pages.insert(bucket_page_number(b, &ovf)));
        }
        let total: u64 = ovf.iter().map(|&c| c as u64).sum();
        for slot in 0..total {
            assert!(
                pages.insert(overflow_page_number(slot, asp, &ovf).unwrap()),
                "slot {} collides with an existing page",
                slot
            );
        }
        // Раскладка плотная: страницы занимают 0..buckets+total без дыр.
        assert_eq!(pages.len() as u64, buckets + total);
        assert_eq!(*pages.iter().max().unwrap(), buckets + total - 1);
    }
}
