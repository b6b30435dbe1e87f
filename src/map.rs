//! Координатор карты: get / put / remove поверх цепочек страниц.
//!
//! Раскладка файла данных:
//! [metadata 137 байт][страница 0][страница 1]...[страница N-1]
//!
//! Бакетные страницы и страницы переполнения перемежаются: полоса
//! переполнения уровня i лежит сразу за 2^i бакетными страницами этого
//! уровня (см. addr). Все физические смещения выводятся из метаданных.
//!
//! Модель исполнения: однопоточная, синхронная. Карта не рассчитана на
//! конкурентный доступ, вызовы сериализует владелец. Внутри одной операции
//! порядок записи фиксирован: страницы, затем метаданные, затем бит FSM
//! (для put); страница-предшественник, затем освобождение бита (для
//! remove). Отката нет, атомарности формат не обещает.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use crate::addr;
use crate::channel::{ByteChannel, FileChannel};
use crate::config::MapConfig;
use crate::consts::{
    DATA_FILE_SUFFIX, FSM_FILE_SUFFIX, FSM_SLOTS_PER_PAGE, ITEM_MAX_SIZE, KEY_MAX_SIZE,
    METADATA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::error::MapError;
use crate::fsm::FreeSpaceMap;
use crate::lock::{acquire_exclusive_lock, try_acquire_exclusive_lock, LockGuard};
use crate::meta::Metadata;
use crate::metrics;
use crate::page::{Item, Page};

pub struct DiskMap {
    // Порядок полей задаёт порядок закрытия: данные, затем FSM.
    data: Box<dyn ByteChannel>,
    fsm: FreeSpaceMap,
    meta: Metadata,
    cfg: MapConfig,
    _lock: Option<LockGuard>,
}

impl std::fmt::Debug for DiskMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskMap")
            .field("meta", &self.meta)
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl DiskMap {
    /* -------------------- Открытие -------------------- */

    /// Создать новую карту на пустых каналах.
    pub fn open_new(
        data: Box<dyn ByteChannel>,
        fsm: Box<dyn ByteChannel>,
        initial_size: u32,
    ) -> Result<Self> {
        Self::open_new_with(data, fsm, MapConfig::from_env().with_initial_size(initial_size))
    }

    pub fn open_new_with(
        mut data: Box<dyn ByteChannel>,
        fsm: Box<dyn ByteChannel>,
        cfg: MapConfig,
    ) -> Result<Self> {
        if cfg.initial_size < 1 {
            return Err(MapError::invalid("initial size must be at least 1"));
        }
        if data.size()? != 0 {
            return Err(MapError::invalid("data channel is not empty"));
        }
        let mut fsm = FreeSpaceMap::new(fsm)?;
        if fsm.pages()? != 0 {
            return Err(MapError::invalid("fsm channel is not empty"));
        }

        let buckets_num = (cfg.initial_size as u64).next_power_of_two();
        let meta = Metadata::for_initial(buckets_num);

        let mut map = Self {
            data,
            fsm,
            meta,
            cfg,
            _lock: None,
        };

        // Пустая страница под каждый бакет, затем метаданные.
        let empty = Page::empty();
        for bucket in 0..buckets_num {
            map.write_page(bucket, &empty)?;
        }
        map.write_meta()?;
        Ok(map)
    }

    /// Открыть существующую карту.
    pub fn open(data: Box<dyn ByteChannel>, fsm: Box<dyn ByteChannel>) -> Result<Self> {
        Self::open_with(data, fsm, MapConfig::from_env())
    }

    pub fn open_with(
        mut data: Box<dyn ByteChannel>,
        fsm: Box<dyn ByteChannel>,
        cfg: MapConfig,
    ) -> Result<Self> {
        let size = data.size()?;
        if size < METADATA_SIZE as u64 {
            return Err(MapError::corruption(format!(
                "data file of {} bytes is too small for metadata",
                size
            )));
        }

        let mut buf = [0u8; METADATA_SIZE];
        data.read_at(0, &mut buf)?;
        let meta = Metadata::decode(&buf)?;

        let expected = METADATA_SIZE as u64 + meta.expected_pages() * PAGE_SIZE as u64;
        if size != expected {
            return Err(MapError::corruption(format!(
                "data file size {} does not match metadata (expected {})",
                size, expected
            )));
        }

        let fsm = FreeSpaceMap::new(fsm)?;
        Ok(Self {
            data,
            fsm,
            meta,
            cfg,
            _lock: None,
        })
    }

    /// Создать карту в каталоге: файлы <name>_data и <name>_fsm,
    /// эксклюзивная блокировка <name>.LOCK на время жизни карты.
    pub fn create_at(root: &Path, name: &str, initial_size: u32) -> Result<Self> {
        let lock = acquire_exclusive_lock(root, name)?;
        let (data, fsm) = open_file_channels(root, name)?;
        let mut map = Self::open_new(data, fsm, initial_size)?;
        map._lock = Some(lock);
        Ok(map)
    }

    /// Открыть существующую карту в каталоге (см. create_at).
    pub fn open_at(root: &Path, name: &str) -> Result<Self> {
        let lock = acquire_exclusive_lock(root, name)?;
        let (data, fsm) = open_file_channels(root, name)?;
        let mut map = Self::open(data, fsm)?;
        map._lock = Some(lock);
        Ok(map)
    }

    /// То же, что open_at, но без ожидания: если карта уже открыта другим
    /// писателем, сразу возвращает ошибку вместо блокировки.
    pub fn try_open_at(root: &Path, name: &str) -> Result<Self> {
        let lock = try_acquire_exclusive_lock(root, name)?;
        let (data, fsm) = open_file_channels(root, name)?;
        let mut map = Self::open(data, fsm)?;
        map._lock = Some(lock);
        Ok(map)
    }

    /// Закрыть карту. Каналы закрываются в порядке полей (данные, затем
    /// FSM), блокировка снимается последней.
    pub fn close(self) {}

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /* -------------------- Основной API -------------------- */

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() > KEY_MAX_SIZE {
            return Err(MapError::invalid(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                KEY_MAX_SIZE
            )));
        }

        let hash = addr::hash_key(key);
        let bucket = addr::bucket_index(hash, self.meta.hash_bits, self.meta.split_index);
        let mut page_num = addr::bucket_page_number(bucket, &self.meta.overflow_pages);
        if page_num >= self.num_pages()? {
            return Ok(None);
        }

        loop {
            let page = self.read_page(page_num)?;
            if let Some(item) = page.items.iter().find(|it| it.key_equals(key, hash)) {
                return Ok(Some(item.value.clone()));
            }
            match page.next_page {
                Some(next) => page_num = next,
                None => return Ok(None),
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = addr::hash_key(key);
        let new_item = Item::new(hash, key.to_vec(), value.to_vec());
        let item_size = new_item.size();
        if item_size > ITEM_MAX_SIZE {
            return Err(MapError::invalid(format!(
                "key-value pair of {} bytes does not fit into a single page (max {})",
                item_size, ITEM_MAX_SIZE
            )));
        }

        let bucket = addr::bucket_index(hash, self.meta.hash_bits, self.meta.split_index);
        let mut page_num = addr::bucket_page_number(bucket, &self.meta.overflow_pages);

        // Четыре скользящих переменных обхода цепочки: последняя
        // просмотренная страница, первая страница с достаточным местом и
        // режим "ключ уже найден и удалён, ищем только место".
        let mut prev: (u64, Page);
        let mut free_page: Option<(u64, Page)> = None;
        let mut looking = false;

        loop {
            let mut page = self.read_page(page_num)?;

            if !looking {
                if let Some(i) = page.items.iter().position(|it| it.key_equals(key, hash)) {
                    let old_size = page.items[i].size();
                    if page.free_space as usize + old_size >= item_size {
                        // Новое значение помещается на место старого.
                        page.replace(i, new_item);
                        return self.write_page(page_num, &page);
                    }
                    // Не помещается: вынимаем старую запись и дальше ищем
                    // только страницу со свободным местом.
                    page.remove_item(i);
                    self.write_page(page_num, &page)?;
                    looking = true;
                }
            }

            if free_page.is_none() && item_size <= page.free_space as usize {
                free_page = Some((page_num, page.clone()));
            }

            let next = page.next_page;
            prev = (page_num, page);
            match next {
                Some(n) if !(looking && free_page.is_some()) => page_num = n,
                _ => break,
            }
        }

        if let Some((free_num, mut page)) = free_page {
            page.add_item(new_item);
            return self.write_page(free_num, &page);
        }

        let (prev_num, prev_page) = prev;
        self.append_overflow(prev_num, prev_page, new_item)?;
        self.maybe_auto_split()
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if key.len() > KEY_MAX_SIZE {
            return Err(MapError::invalid(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                KEY_MAX_SIZE
            )));
        }

        let hash = addr::hash_key(key);
        let bucket = addr::bucket_index(hash, self.meta.hash_bits, self.meta.split_index);
        let mut page_num = addr::bucket_page_number(bucket, &self.meta.overflow_pages);
        if page_num >= self.num_pages()? {
            return Ok(());
        }

        let mut prev: Option<(u64, Page)> = None;
        loop {
            let mut page = self.read_page(page_num)?;

            if let Some(i) = page.items.iter().position(|it| it.key_equals(key, hash)) {
                page.remove_item(i);

                return match prev {
                    Some((prev_num, mut prev_page)) if page.items.is_empty() => {
                        // Опустевшая страница переполнения выщёлкивается из
                        // цепочки, её слот возвращается в FSM. Счётчик уровня
                        // при этом не уменьшается: физический слот
                        // переиспользуется только через FSM.
                        prev_page.next_page = page.next_page;
                        self.write_page(prev_num, &prev_page)?;
                        let slot = addr::overflow_slot(
                            page_num,
                            self.meta.active_split_point(),
                            &self.meta.overflow_pages,
                        )?;
                        self.fsm.free(slot)?;
                        metrics::record_overflow_freed();
                        Ok(())
                    }
                    // Бакетная страница (голова цепочки) или непустая
                    // страница просто переписывается.
                    _ => self.write_page(page_num, &page),
                };
            }

            match page.next_page {
                Some(next) => {
                    prev = Some((page_num, page));
                    page_num = next;
                }
                None => return Ok(()),
            }
        }
    }

    /* -------------------- Строковые обёртки -------------------- */

    pub fn put_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.put(key.as_bytes(), value.as_bytes())
    }

    pub fn get_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.get(key.as_bytes())? {
            Some(value) => Ok(Some(
                String::from_utf8(value).context("stored value is not valid UTF-8")?,
            )),
            None => Ok(None),
        }
    }

    /* -------------------- Расщепление -------------------- */

    /// Расщепить бакет split_index: его items перехэшируются на уровне
    /// hash_bits и распределяются между split_index и
    /// split_index + 2^(hash_bits - 1). Страница бадди-бакета создаётся
    /// ростом файла данных, мимо FSM (бакетные страницы им не учитываются).
    pub fn split(&mut self) -> Result<()> {
        if self.meta.hash_bits > 32 {
            return Err(MapError::not_supported(
                "cannot split further: hash_bits is at its ceiling",
            ));
        }

        let source = self.meta.split_index;
        let edge_bit = 1u64 << (self.meta.hash_bits - 1);
        let buddy = source + edge_bit;

        // Снимаем всю цепочку бакета-источника.
        let head_num = addr::bucket_page_number(source, &self.meta.overflow_pages);
        let mut items: Vec<Item> = Vec::new();
        let mut overflow_nums: Vec<u64> = Vec::new();
        let mut page_num = head_num;
        loop {
            let page = self.read_page(page_num)?;
            if page_num != head_num {
                overflow_nums.push(page_num);
            }
            let next = page.next_page;
            items.extend(page.items);
            match next {
                Some(n) => page_num = n,
                None => break,
            }
        }

        // Слоты цепочки возвращаются в FSM, голова обнуляется.
        let asp = self.meta.active_split_point();
        for &num in &overflow_nums {
            let slot = addr::overflow_slot(num, asp, &self.meta.overflow_pages)?;
            self.fsm.free(slot)?;
            metrics::record_overflow_freed();
        }
        self.write_page(head_num, &Page::empty())?;

        let buddy_num = addr::bucket_page_number(buddy, &self.meta.overflow_pages);
        self.write_page(buddy_num, &Page::empty())?;

        // Продвигаем указатель раунда и фиксируем метаданные.
        self.meta.split_index += 1;
        if self.meta.split_index == edge_bit {
            self.meta.hash_bits += 1;
            self.meta.split_index = 0;
        }
        self.write_meta()?;

        // Перекладываем items уже под новым состоянием адресации; ключи
        // уникальны, так что поиск дублей не нужен.
        for item in items {
            self.insert_item(item)?;
        }

        metrics::record_bucket_split();
        log::debug!(
            "split bucket {} with buddy {} (hash_bits {}, split_index {})",
            source,
            buddy,
            self.meta.hash_bits,
            self.meta.split_index
        );
        Ok(())
    }

    fn maybe_auto_split(&mut self) -> Result<()> {
        let Some(factor) = self.cfg.split_load_factor else {
            return Ok(());
        };
        let ratio = self.meta.total_overflow() as f64 / self.meta.buckets_num() as f64;
        if ratio < factor as f64 {
            return Ok(());
        }
        match self.split() {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.downcast_ref::<MapError>(),
                    Some(MapError::NotSupported(_))
                ) =>
            {
                warn_split_exhausted_once();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /* -------------------- Внутренности -------------------- */

    /// Вставка заведомо отсутствующего ключа: первая страница цепочки с
    /// достаточным местом, иначе новая страница в хвост.
    fn insert_item(&mut self, item: Item) -> Result<()> {
        let bucket = addr::bucket_index(item.hash, self.meta.hash_bits, self.meta.split_index);
        let mut page_num = addr::bucket_page_number(bucket, &self.meta.overflow_pages);
        let item_size = item.size();

        loop {
            let mut page = self.read_page(page_num)?;
            if item_size <= page.free_space as usize {
                page.add_item(item);
                return self.write_page(page_num, &page);
            }
            match page.next_page {
                Some(next) => page_num = next,
                None => return self.append_overflow(page_num, page, item),
            }
        }
    }

    /// Добавить страницу переполнения в хвост цепочки и положить в неё item.
    fn append_overflow(&mut self, prev_num: u64, mut prev_page: Page, item: Item) -> Result<()> {
        // Счётчик активного уровня инкрементируется до вычисления
        // отображения: для нового слота именно он задаёт полосу.
        let total_before = self.meta.total_overflow();
        let asp = self.meta.active_split_point();
        self.meta.overflow_pages[asp] += 1;

        let slot = self.fsm.find_free_page()?;
        if slot < total_before {
            // Переиспользуем освобождённый слот: его физическая страница
            // уже существует, счётчик возвращается назад, иначе разошлись
            // бы счётчики и длина файла.
            self.meta.overflow_pages[asp] -= 1;
            metrics::record_overflow_reused();
        } else {
            metrics::record_overflow_allocated();
        }

        let new_page_num = addr::overflow_page_number(
            slot,
            self.meta.active_split_point(),
            &self.meta.overflow_pages,
        )?;

        let mut new_page = Page::empty();
        new_page.add_item(item);
        prev_page.next_page = Some(new_page_num);

        // Порядок фиксации: страницы, затем метаданные, затем бит FSM.
        self.write_page(prev_num, &prev_page)?;
        self.write_page(new_page_num, &new_page)?;
        self.write_meta()?;
        self.fsm.take(slot)?;

        log::debug!(
            "chained overflow page {} (fsm slot {}) after page {}",
            new_page_num,
            slot,
            prev_num
        );
        Ok(())
    }

    fn num_pages(&mut self) -> Result<u64> {
        Ok((self.data.size()? - METADATA_SIZE as u64) / PAGE_SIZE as u64)
    }

    fn read_page(&mut self, page_num: u64) -> Result<Page> {
        let pages = self.num_pages()?;
        if page_num >= pages {
            return Err(MapError::corruption(format!(
                "page {} does not exist (file has {} pages)",
                page_num, pages
            )));
        }
        let mut buf = [0u8; PAGE_SIZE];
        self.data.read_at(page_offset(page_num), &mut buf)?;
        metrics::record_page_read();
        Page::decode(&buf).with_context(|| format!("decode page {}", page_num))
    }

    fn write_page(&mut self, page_num: u64, page: &Page) -> Result<()> {
        let buf = page.encode();
        self.data.write_at(page_offset(page_num), &buf)?;
        metrics::record_page_written();
        Ok(())
    }

    fn write_meta(&mut self) -> Result<()> {
        let buf = self.meta.encode();
        self.data.write_at(0, &buf)
    }

    /* -------------------- Проверка инвариантов -------------------- */

    /// Пройти все структуры и сверить инварианты формата. Возвращает
    /// сводку; любое расхождение считается порчей.
    pub fn check(&mut self) -> Result<CheckReport> {
        let pages = self.num_pages()?;
        if pages != self.meta.expected_pages() {
            return Err(MapError::corruption(format!(
                "file has {} pages, metadata expects {}",
                pages,
                self.meta.expected_pages()
            )));
        }

        let buckets = self.meta.buckets_num();
        let total_overflow = self.meta.total_overflow();
        let asp = self.meta.active_split_point();

        let mut linked_slots: HashSet<u64> = HashSet::new();
        let mut items = 0u64;

        for bucket in 0..buckets {
            let head_num = addr::bucket_page_number(bucket, &self.meta.overflow_pages);
            let mut keys: HashSet<Vec<u8>> = HashSet::new();
            let mut page_num = head_num;
            loop {
                let page = self.read_page(page_num)?;

                let used: usize = page.items.iter().map(Item::size).sum();
                if page.free_space as usize + used + PAGE_HEADER_SIZE != PAGE_SIZE {
                    return Err(MapError::corruption(format!(
                        "page {} free space accounting is off",
                        page_num
                    )));
                }

                for item in &page.items {
                    items += 1;
                    let owner =
                        addr::bucket_index(item.hash, self.meta.hash_bits, self.meta.split_index);
                    if owner != bucket {
                        return Err(MapError::corruption(format!(
                            "item on page {} belongs to bucket {}, found in {}",
                            page_num, owner, bucket
                        )));
                    }
                    if !keys.insert(item.key.clone()) {
                        return Err(MapError::corruption(format!(
                            "duplicate key in chain of bucket {}",
                            bucket
                        )));
                    }
                }

                if page_num != head_num {
                    let slot =
                        addr::overflow_slot(page_num, asp, &self.meta.overflow_pages)?;
                    if slot >= total_overflow {
                        return Err(MapError::corruption(format!(
                            "page {} maps to slot {} beyond counters",
                            page_num, slot
                        )));
                    }
                    if !linked_slots.insert(slot) {
                        return Err(MapError::corruption(format!(
                            "overflow page {} is linked twice",
                            page_num
                        )));
                    }
                }

                match page.next_page {
                    Some(next) => {
                        if next >= pages {
                            return Err(MapError::corruption(format!(
                                "page {} links to nonexistent page {}",
                                page_num, next
                            )));
                        }
                        page_num = next;
                    }
                    None => break,
                }
            }
        }

        // Сверка FSM: занятые биты ровно на прилинкованных слотах.
        for slot in 0..total_overflow {
            let linked = linked_slots.contains(&slot);
            let free = self.fsm.is_free(slot)?;
            if linked == free {
                return Err(MapError::corruption(format!(
                    "fsm slot {} is {} but {} by a chain",
                    slot,
                    if free { "free" } else { "taken" },
                    if linked { "referenced" } else { "not referenced" }
                )));
            }
        }
        // Хвост FSM за пределами счётчиков обязан быть свободным.
        let fsm_slots = self.fsm.pages()? * FSM_SLOTS_PER_PAGE;
        for slot in total_overflow..fsm_slots {
            if !self.fsm.is_free(slot)? {
                return Err(MapError::corruption(format!(
                    "fsm slot {} is taken beyond the overflow counters",
                    slot
                )));
            }
        }

        let linked = linked_slots.len() as u64;
        Ok(CheckReport {
            pages,
            bucket_pages: buckets,
            linked_overflow_pages: linked,
            free_overflow_slots: total_overflow - linked,
            reserved_pages: pages - buckets - total_overflow,
            items,
        })
    }
}

/// Сводка обхода check().
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub pages: u64,
    pub bucket_pages: u64,
    /// Страницы переполнения, прилинкованные к цепочкам.
    pub linked_overflow_pages: u64,
    /// Слоты, когда-то выделенные и возвращённые в FSM.
    pub free_overflow_slots: u64,
    /// Нулевые страницы в зазоре незавершённого раунда расщепления.
    pub reserved_pages: u64,
    pub items: u64,
}

#[inline]
fn page_offset(page_num: u64) -> u64 {
    METADATA_SIZE as u64 + page_num * PAGE_SIZE as u64
}

fn open_file_channels(
    root: &Path,
    name: &str,
) -> Result<(Box<dyn ByteChannel>, Box<dyn ByteChannel>)> {
    let data = FileChannel::open(&root.join(format!("{}{}", name, DATA_FILE_SUFFIX)))?;
    let fsm = FileChannel::open(&root.join(format!("{}{}", name, FSM_FILE_SUFFIX)))?;
    Ok((Box::new(data), Box::new(fsm)))
}

fn warn_split_exhausted_once() {
    static WARNED: OnceLock<()> = OnceLock::new();
    WARNED.get_or_init(|| {
        log::warn!("auto-split skipped: hash space exhausted");
    });
}
