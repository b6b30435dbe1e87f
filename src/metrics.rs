//! Lightweight global metrics.
//!
//! Потокобезопасные атомарные счётчики подсистем:
//! - страницы данных (чтение/запись);
//! - страницы переполнения (новые, переиспользованные, освобождённые);
//! - расщепления бакетов.

use std::sync::atomic::{AtomicU64, Ordering};

static PAGES_READ: AtomicU64 = AtomicU64::new(0);
static PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);

static OVERFLOW_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static OVERFLOW_REUSED: AtomicU64 = AtomicU64::new(0);
static OVERFLOW_FREED: AtomicU64 = AtomicU64::new(0);

static BUCKET_SPLITS: AtomicU64 = AtomicU64::new(0);

pub fn record_page_read() {
    PAGES_READ.fetch_add(1, Ordering::Relaxed);
}

pub fn record_page_written() {
    PAGES_WRITTEN.fetch_add(1, Ordering::Relaxed);
}

pub fn record_overflow_allocated() {
    OVERFLOW_ALLOCATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_overflow_reused() {
    OVERFLOW_REUSED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_overflow_freed() {
    OVERFLOW_FREED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_bucket_split() {
    BUCKET_SPLITS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub pages_read: u64,
    pub pages_written: u64,
    pub overflow_allocated: u64,
    pub overflow_reused: u64,
    pub overflow_freed: u64,
    pub bucket_splits: u64,
}

/// Снимок всех счётчиков.
pub fn metrics() -> MetricsSnapshot {
    MetricsSnapshot {
        pages_read: PAGES_READ.load(Ordering::Relaxed),
        pages_written: PAGES_WRITTEN.load(Ordering::Relaxed),
        overflow_allocated: OVERFLOW_ALLOCATED.load(Ordering::Relaxed),
        overflow_reused: OVERFLOW_REUSED.load(Ordering::Relaxed),
        overflow_freed: OVERFLOW_FREED.load(Ordering::Relaxed),
        bucket_splits: BUCKET_SPLITS.load(Ordering::Relaxed),
    }
}

/// Сброс в ноль (для тестов и бенчей).
pub fn reset_metrics() {
    PAGES_READ.store(0, Ordering::Relaxed);
    PAGES_WRITTEN.store(0, Ordering::Relaxed);
    OVERFLOW_ALLOCATED.store(0, Ordering::Relaxed);
    OVERFLOW_REUSED.store(0, Ordering::Relaxed);
    OVERFLOW_FREED.store(0, Ordering::Relaxed);
    BUCKET_SPLITS.store(0, Ordering::Relaxed);
}
