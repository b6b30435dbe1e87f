//! Общие константы форматов (metadata, data pages, items, FSM).

// -------- Data pages --------

/// Размер страницы данных фиксирован форматом.
pub const PAGE_SIZE: usize = 256;

/// Заголовок страницы: [items_count u16][free_space u16][next_page i32].
pub const PAGE_HEADER_SIZE: usize = 8;

/// Закодированное значение "следующей страницы нет".
pub const NO_PAGE: i32 = -1;

// -------- Items --------

/// Максимальный размер item: всё, что остаётся в странице после заголовка.
pub const ITEM_MAX_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Максимальная длина ключа: item без hash (4) и двух длин (2 + 2).
pub const KEY_MAX_SIZE: usize = ITEM_MAX_SIZE - 4 - 2 - 2;

// -------- Metadata --------

/// Число уровней в overflow_pages: 32 бита хэша плюс один уровень сверху,
/// чтобы active_split_point() оставался валидным индексом при hash_bits = 32.
pub const OVERFLOW_LEVELS: usize = 33;

/// [hash_bits u8][split_index i32][overflow_pages 33 x i32] = 137 байт.
pub const METADATA_SIZE: usize = 1 + 4 + OVERFLOW_LEVELS * 4;

/// Верхняя граница hash_bits (см. инвариант метаданных).
pub const MAX_HASH_BITS: u8 = 33;

// -------- FSM --------

/// Размер FSM-страницы в байтах; одна страница покрывает 256 слотов.
pub const FSM_PAGE_SIZE: usize = 32;

/// Слотов на одну FSM-страницу.
pub const FSM_SLOTS_PER_PAGE: u64 = (FSM_PAGE_SIZE * 8) as u64;

// -------- Files (path-based constructors) --------

pub const DATA_FILE_SUFFIX: &str = "_data";
pub const FSM_FILE_SUFFIX: &str = "_fsm";
pub const LOCK_FILE_SUFFIX: &str = ".LOCK";
