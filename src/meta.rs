//! Метаданные карты.
//!
//! Формат (offset 0 файла данных, BE, 137 байт):
//! u8  hash_bits       (1..=33; число адресуемых бит хэша)
//! i32 split_index     (0 <= split_index < 2^(hash_bits - 1))
//! i32 overflow_pages[33]  (страниц переполнения, добавленных на уровне i)
//!
//! Производные величины:
//! - buckets_num = 2^(hash_bits - 1) + split_index;
//! - active_split_point: уровень, счётчик которого инкрементирует следующая
//!   аллокация (hash_bits - 1 при split_index == 0, иначе hash_bits);
//! - expected_pages: точное число страниц в файле данных, из которого
//!   выводятся все физические смещения.

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use crate::consts::{MAX_HASH_BITS, METADATA_SIZE, OVERFLOW_LEVELS};
use crate::error::MapError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub hash_bits: u8,
    pub split_index: u64,
    pub overflow_pages: [u32; OVERFLOW_LEVELS],
}

impl Metadata {
    /// Метаданные свежей карты на buckets_num бакетов (степень двойки).
    ///
    /// hash_bits считается как bit_length(buckets_num): для buckets_num == 1
    /// получается 1, так что 2^(hash_bits - 1) == buckets_num выполняется
    /// и в этом угловом случае.
    pub fn for_initial(buckets_num: u64) -> Self {
        debug_assert!(buckets_num.is_power_of_two());
        let hash_bits = (u64::BITS - buckets_num.leading_zeros()) as u8;
        Self {
            hash_bits,
            split_index: 0,
            overflow_pages: [0; OVERFLOW_LEVELS],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_SIZE {
            return Err(MapError::corruption(format!(
                "metadata buffer too small: {} < {}",
                buf.len(),
                METADATA_SIZE
            )));
        }

        let hash_bits = buf[0];
        if hash_bits < 1 || hash_bits > MAX_HASH_BITS {
            return Err(MapError::corruption(format!(
                "hash_bits out of range: {}",
                hash_bits
            )));
        }

        let split_index = BigEndian::read_i32(&buf[1..5]);
        if split_index < 0 || (split_index as u64) >= (1u64 << (hash_bits - 1)) {
            return Err(MapError::corruption(format!(
                "split_index {} out of range for hash_bits {}",
                split_index, hash_bits
            )));
        }
        // На последнем уровне нет места для активного раунда: индекс
        // active_split_point() обязан оставаться в пределах массива.
        if hash_bits == MAX_HASH_BITS && split_index != 0 {
            return Err(MapError::corruption(
                "split round beyond addressable overflow levels",
            ));
        }

        let mut overflow_pages = [0u32; OVERFLOW_LEVELS];
        for (i, slot) in overflow_pages.iter_mut().enumerate() {
            let off = 5 + i * 4;
            let count = BigEndian::read_i32(&buf[off..off + 4]);
            if count < 0 {
                return Err(MapError::corruption(format!(
                    "negative overflow counter at level {}: {}",
                    i, count
                )));
            }
            *slot = count as u32;
        }

        Ok(Self {
            hash_bits,
            split_index: split_index as u64,
            overflow_pages,
        })
    }

    pub fn encode(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[0] = self.hash_bits;
        BigEndian::write_i32(&mut buf[1..5], self.split_index as i32);
        for (i, count) in self.overflow_pages.iter().enumerate() {
            let off = 5 + i * 4;
            BigEndian::write_i32(&mut buf[off..off + 4], *count as i32);
        }
        buf
    }

    /// Число бакетов в текущем состоянии раунда расщепления.
    pub fn buckets_num(&self) -> u64 {
        (1u64 << (self.hash_bits - 1)) + self.split_index
    }

    /// Уровень, в счётчик которого пойдёт следующая страница переполнения.
    pub fn active_split_point(&self) -> usize {
        if self.split_index == 0 {
            (self.hash_bits - 1) as usize
        } else {
            self.hash_bits as usize
        }
    }

    /// Всего страниц переполнения по счётчикам.
    pub fn total_overflow(&self) -> u64 {
        self.overflow_pages.iter().map(|&c| c as u64).sum()
    }

    /// Точное число страниц в файле данных.
    ///
    /// Обычно buckets_num + total_overflow. Посреди раунда расщепления,
    /// когда активная полоса (уровень hash_bits) уже непуста, её страницы
    /// лежат за полным диапазоном бакетов следующего уровня, и файл
    /// дотягивается до total_overflow + 2^hash_bits.
    pub fn expected_pages(&self) -> u64 {
        let base = self.buckets_num() + self.total_overflow();
        if self.split_index > 0
            && (self.hash_bits as usize) < OVERFLOW_LEVELS
            && self.overflow_pages[self.hash_bits as usize] > 0
        {
            base.max(self.total_overflow() + (1u64 << self.hash_bits))
        } else {
            base
        }
    }
}
