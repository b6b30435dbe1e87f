//! Free-space map: битовый аллокатор слотов страниц переполнения.
//!
//! Файл FSM: последовательность страниц по 32 байта, каждая покрывает
//! 256 слотов. Бит i байта j страницы p отвечает слоту p*256 + j*8 + i
//! (младшие биты внутри байта идут первыми). Бит 1 означает "занят",
//! 0 означает "свободен"; слоты за концом файла читаются как свободные.
//!
//! Поиск свободного слота first-fit: байты 0xFF пропускаются целиком,
//! в первом неполном байте младший нулевой бит находится через
//! trailing_zeros инвертированного значения.

use anyhow::Result;

use crate::channel::ByteChannel;
use crate::consts::{FSM_PAGE_SIZE, FSM_SLOTS_PER_PAGE};
use crate::error::MapError;

const FULL_BYTE: u8 = 0xFF;

pub struct FreeSpaceMap {
    ch: Box<dyn ByteChannel>,
}

impl FreeSpaceMap {
    /// Обернуть канал; файл обязан состоять из целого числа FSM-страниц.
    pub fn new(mut ch: Box<dyn ByteChannel>) -> Result<Self> {
        let size = ch.size()?;
        if size % FSM_PAGE_SIZE as u64 != 0 {
            return Err(MapError::corruption(format!(
                "fsm file size {} is not a multiple of {}",
                size, FSM_PAGE_SIZE
            )));
        }
        Ok(Self { ch })
    }

    /// Свободен ли слот. Слоты за концом выделенного FSM свободны по
    /// определению.
    pub fn is_free(&mut self, slot: u64) -> Result<bool> {
        let (page_num, byte_in_page, bit_in_byte) = locate(slot);
        if page_num >= self.pages()? {
            return Ok(true);
        }
        let page = self.read_fsm_page(page_num)?;
        Ok(page[byte_in_page] & (1 << bit_in_byte) == 0)
    }

    /// Пометить слот занятым. Недостающие FSM-страницы создаются лениво,
    /// нулями. Повторный take существующего бита считается порчей.
    pub fn take(&mut self, slot: u64) -> Result<()> {
        let fsm_pages = self.pages()?;
        let (page_num, byte_in_page, bit_in_byte) = locate(slot);
        let bit_mask = 1u8 << bit_in_byte;

        let mut page;
        if page_num < fsm_pages {
            page = self.read_fsm_page(page_num)?;
            if page[byte_in_page] & bit_mask != 0 {
                return Err(MapError::corruption(format!(
                    "fsm slot {} is already taken",
                    slot
                )));
            }
        } else {
            // Явно инициализируем все промежуточные страницы.
            let empty = [0u8; FSM_PAGE_SIZE];
            for new_page_num in fsm_pages..page_num {
                self.write_fsm_page(new_page_num, &empty)?;
            }
            page = empty;
        }

        page[byte_in_page] |= bit_mask;
        self.write_fsm_page(page_num, &page)
    }

    /// Освободить занятый слот. Слот за концом FSM или уже свободный
    /// бит означают рассинхронизацию с картой.
    pub fn free(&mut self, slot: u64) -> Result<()> {
        let (page_num, byte_in_page, bit_in_byte) = locate(slot);
        if page_num >= self.pages()? {
            return Err(MapError::corruption(format!(
                "cannot free unallocated fsm slot {}",
                slot
            )));
        }
        let bit_mask = 1u8 << bit_in_byte;
        let mut page = self.read_fsm_page(page_num)?;
        if page[byte_in_page] & bit_mask == 0 {
            return Err(MapError::corruption(format!(
                "fsm slot {} is already free",
                slot
            )));
        }
        page[byte_in_page] &= !bit_mask;
        self.write_fsm_page(page_num, &page)
    }

    /// Наименьший свободный слот; слот сразу за концом FSM, если всё занято.
    /// Ничего не модифицирует.
    pub fn find_free_page(&mut self) -> Result<u64> {
        let fsm_pages = self.pages()?;
        for page_num in 0..fsm_pages {
            let page = self.read_fsm_page(page_num)?;
            for (byte_num, &b) in page.iter().enumerate() {
                if b == FULL_BYTE {
                    continue;
                }
                let bit_num = (!b).trailing_zeros() as u64;
                return Ok(compose_slot(bit_num, byte_num as u64, page_num));
            }
        }
        Ok(compose_slot(0, 0, fsm_pages))
    }

    /// find_free_page + take.
    pub fn take_free_page(&mut self) -> Result<u64> {
        let slot = self.find_free_page()?;
        self.take(slot)?;
        Ok(slot)
    }

    /// Число выделенных FSM-страниц.
    pub fn pages(&mut self) -> Result<u64> {
        Ok(self.ch.size()? / FSM_PAGE_SIZE as u64)
    }

    fn read_fsm_page(&mut self, page_num: u64) -> Result<[u8; FSM_PAGE_SIZE]> {
        let mut page = [0u8; FSM_PAGE_SIZE];
        self.ch
            .read_at(page_num * FSM_PAGE_SIZE as u64, &mut page)?;
        Ok(page)
    }

    fn write_fsm_page(&mut self, page_num: u64, page: &[u8; FSM_PAGE_SIZE]) -> Result<()> {
        self.ch.write_at(page_num * FSM_PAGE_SIZE as u64, page)
    }
}

#[inline]
fn locate(slot: u64) -> (u64, usize, u32) {
    let page_num = slot / FSM_SLOTS_PER_PAGE;
    let bit_in_page = slot % FSM_SLOTS_PER_PAGE;
    (page_num, (bit_in_page / 8) as usize, (bit_in_page % 8) as u32)
}

#[inline]
fn compose_slot(bit_num: u64, byte_num: u64, page_num: u64) -> u64 {
    bit_num + 8 * (byte_num + FSM_PAGE_SIZE as u64 * page_num)
}
