//! Байтовый канал: абстракция над файлом или буфером в памяти.
//!
//! Контракт:
//! - read_at читает ровно buf.len() байт, короткое чтение считается ошибкой;
//! - write_at за концом файла расширяет его, промежуток заполняется нулями;
//! - size возвращает текущую логическую длину;
//! - truncate только укорачивает (удлинение делает write_at).
//!
//! Карта открывает два независимых канала: данные и FSM. Каналы принадлежат
//! карте и закрываются вместе с ней (Drop).

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait ByteChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
    fn truncate(&mut self, size: u64) -> Result<()>;
}

/// Канал поверх обычного файла (seek + read_exact / write_all).
pub struct FileChannel {
    file: File,
}

impl FileChannel {
    /// Открыть файл на чтение и запись, создав при отсутствии.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open channel file {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl ByteChannel for FileChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(buf)
            .with_context(|| format!("short read: {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        // Запись за концом файла: ОС дозаполняет промежуток нулями.
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(buf)
            .with_context(|| format!("write {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        // set_len умеет и удлинять; контракт канала разрешает только
        // укорачивание, удлинение остаётся за write_at.
        if size < self.file.metadata()?.len() {
            self.file.set_len(size)?;
        }
        Ok(())
    }
}

/// Канал в памяти; используется в тестах и для одноразовых карт.
#[derive(Default)]
pub struct MemChannel {
    buf: Vec<u8>,
}

impl MemChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Копия содержимого, удобно для ручной проверки байтов.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl ByteChannel for MemChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            anyhow::bail!(
                "short read: {} bytes at offset {} (size {})",
                buf.len(),
                offset,
                self.buf.len()
            );
        }
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if (size as usize) < self.buf.len() {
            self.buf.truncate(size as usize);
        }
        Ok(())
    }
}
