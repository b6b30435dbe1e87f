//! Страница данных и item.
//!
//! Layout страницы (BE, ровно 256 байт):
//! [items_count u16][free_space u16][next_page i32]  -- заголовок, 8 байт
//! [item ...]                                        -- подряд, без зазоров
//! хвост до 256 байт не интерпретируется.
//!
//! Layout item (BE):
//! [hash i32][key_len u16][value_len u16][key][value]
//!
//! Инвариант страницы: free_space + сумма размеров items + 8 == 256.
//! Порядок items внутри страницы: порядок вставки; replace/remove его
//! не обязаны сохранять между версиями страницы.
//!
//! Страница целиком пересериализуется при каждой записи: никакого
//! байтового патчинга внутри буфера, это часть контракта формата.

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use crate::consts::{ITEM_MAX_SIZE, NO_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::MapError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Кэшированный hash ключа; хранится на диске и сравнивается до байтов.
    pub hash: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(hash: i32, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { hash, key, value }
    }

    pub fn size(&self) -> usize {
        4 + 2 + self.key.len() + 2 + self.value.len()
    }

    /// Равенство ключей: совпадение hash и побайтовое совпадение ключа.
    pub fn key_equals(&self, key: &[u8], hash: i32) -> bool {
        self.hash == hash && self.key == key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub free_space: u16,
    /// Номер следующей страницы цепочки; на диске i32, -1 означает None.
    pub next_page: Option<u64>,
    pub items: Vec<Item>,
}

impl Page {
    /// Пустая страница: весь объём после заголовка свободен, цепочки нет.
    pub fn empty() -> Self {
        Self {
            free_space: ITEM_MAX_SIZE as u16,
            next_page: None,
            items: Vec::new(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != PAGE_SIZE {
            return Err(MapError::corruption(format!(
                "page buffer has {} bytes, expected {}",
                buf.len(),
                PAGE_SIZE
            )));
        }

        let items_count = BigEndian::read_u16(&buf[0..2]) as usize;
        let free_space = BigEndian::read_u16(&buf[2..4]);
        let next_raw = BigEndian::read_i32(&buf[4..8]);

        let next_page = match next_raw {
            NO_PAGE => None,
            n if n >= 0 => Some(n as u64),
            n => {
                return Err(MapError::corruption(format!(
                    "invalid next page number: {}",
                    n
                )))
            }
        };

        let mut items = Vec::with_capacity(items_count);
        let mut off = PAGE_HEADER_SIZE;
        for _ in 0..items_count {
            if off + 8 > PAGE_SIZE {
                return Err(MapError::corruption("item header overruns page"));
            }
            let hash = BigEndian::read_i32(&buf[off..off + 4]);
            let key_len = BigEndian::read_u16(&buf[off + 4..off + 6]) as usize;
            let value_len = BigEndian::read_u16(&buf[off + 6..off + 8]) as usize;
            off += 8;

            if off + key_len + value_len > PAGE_SIZE {
                return Err(MapError::corruption("item data overruns page"));
            }
            let key = buf[off..off + key_len].to_vec();
            off += key_len;
            let value = buf[off..off + value_len].to_vec();
            off += value_len;

            items.push(Item { hash, key, value });
        }

        Ok(Self {
            free_space,
            next_page,
            items,
        })
    }

    /// Сериализация всегда отдаёт ровно 256 байт; хвост за items нулевой.
    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.items.len() as u16);
        BigEndian::write_u16(&mut buf[2..4], self.free_space);
        let next_raw = match self.next_page {
            Some(n) => n as i32,
            None => NO_PAGE,
        };
        BigEndian::write_i32(&mut buf[4..8], next_raw);

        let mut off = PAGE_HEADER_SIZE;
        for item in &self.items {
            debug_assert!(off + item.size() <= PAGE_SIZE);
            BigEndian::write_i32(&mut buf[off..off + 4], item.hash);
            BigEndian::write_u16(&mut buf[off + 4..off + 6], item.key.len() as u16);
            BigEndian::write_u16(&mut buf[off + 6..off + 8], item.value.len() as u16);
            off += 8;
            buf[off..off + item.key.len()].copy_from_slice(&item.key);
            off += item.key.len();
            buf[off..off + item.value.len()].copy_from_slice(&item.value);
            off += item.value.len();
        }
        buf
    }

    /// Добавить item в конец. Вызывающий обязан проверить свободное место.
    pub fn add_item(&mut self, item: Item) {
        debug_assert!(item.size() <= self.free_space as usize);
        self.free_space -= item.size() as u16;
        self.items.push(item);
    }

    /// Убрать item по позиции; свободное место возвращается странице.
    pub fn remove_item(&mut self, index: usize) -> Item {
        let item = self.items.remove(index);
        self.free_space += item.size() as u16;
        item
    }

    /// Заменить item по позиции, скорректировав free_space на разницу
    /// размеров. Вызывающий обязан проверить, что новая запись помещается.
    pub fn replace(&mut self, index: usize, item: Item) {
        let old_size = self.items[index].size();
        let new_free = self.free_space as usize + old_size - item.size();
        debug_assert!(new_free <= ITEM_MAX_SIZE);
        self.free_space = new_free as u16;
        self.items[index] = item;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, value: &str) -> Item {
        Item::new(crate::addr::hash_key(key.as_bytes()), key.into(), value.into())
    }

    fn accounted(page: &Page) -> usize {
        page.free_space as usize
            + page.items.iter().map(Item::size).sum::<usize>()
            + PAGE_HEADER_SIZE
    }

    #[test]
    fn page_roundtrip_keeps_items_and_header() {
        let mut page = Page::empty();
        page.add_item(item("key1", "value - 1"));
        page.add_item(item("key2", "value - 2"));
        page.next_page = Some(17);

        let bytes = page.encode();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let back = Page::decode(&bytes).unwrap();
        assert_eq!(back, page);
        assert_eq!(accounted(&back), PAGE_SIZE);
    }

    #[test]
    fn empty_page_has_full_free_space() {
        let page = Page::empty();
        assert_eq!(page.free_space as usize, ITEM_MAX_SIZE);
        assert_eq!(page.next_page, None);
        assert_eq!(accounted(&page), PAGE_SIZE);

        let back = Page::decode(&page.encode()).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn free_space_accounting_over_add_remove_replace() {
        let mut page = Page::empty();
        page.add_item(item("a", "aaaa"));
        page.add_item(item("b", "bb"));
        page.add_item(item("c", "cccccc"));
        assert_eq!(accounted(&page), PAGE_SIZE);

        let removed = page.remove_item(1);
        assert_eq!(removed.key, b"b");
        assert_eq!(accounted(&page), PAGE_SIZE);

        // Замена на запись другого размера.
        page.replace(0, item("a", "a much longer value than before"));
        assert_eq!(accounted(&page), PAGE_SIZE);
        page.replace(0, item("a", ""));
        assert_eq!(accounted(&page), PAGE_SIZE);
    }

    #[test]
    fn decode_rejects_malformed_pages() {
        let mut page = Page::empty();
        page.add_item(item("k", "v"));
        let good = page.encode();

        // next_page < -1
        let mut bad = good;
        BigEndian::write_i32(&mut bad[4..8], -2);
        assert!(Page::decode(&bad).is_err());

        // Длина ключа вылезает за страницу.
        let mut bad = good;
        BigEndian::write_u16(&mut bad[12..14], u16::MAX);
        assert!(Page::decode(&bad).is_err());

        // items_count больше, чем реально закодировано: хвост из нулей
        // даст item нулевого размера, но счётчик в 300 items не влезает.
        let mut bad = good;
        BigEndian::write_u16(&mut bad[0..2], 300);
        assert!(Page::decode(&bad).is_err());

        // Неверная длина буфера.
        assert!(Page::decode(&good[..PAGE_SIZE - 1]).is_err());
    }
}
