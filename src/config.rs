//! Настройки карты в одном месте вместо разбросанных обращений к env.
//!
//! MapConfig::from_env() читает те же переменные, что и раньше:
//! - LH_INITIAL_SIZE: стартовое число бакетов (округляется вверх до
//!   степени двойки), по умолчанию 1;
//! - LH_SPLIT_LOAD_FACTOR: порог авторасщепления, отношение числа страниц
//!   переполнения к числу бакетов. Не задан: расщепление только вручную.

#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Стартовое число бакетов для новой карты.
    pub initial_size: u32,

    /// Порог авторасщепления: total_overflow / buckets_num. None выключает
    /// автоматический вызов split() из put().
    pub split_load_factor: Option<f32>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_size: 1,
            split_load_factor: None,
        }
    }
}

impl MapConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = std::env::var("LH_INITIAL_SIZE")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
        {
            if v >= 1 {
                cfg.initial_size = v;
            }
        }

        if let Some(v) = std::env::var("LH_SPLIT_LOAD_FACTOR")
            .ok()
            .and_then(|s| s.trim().parse::<f32>().ok())
        {
            if v > 0.0 {
                cfg.split_load_factor = Some(v);
            }
        }

        cfg
    }

    pub fn with_initial_size(mut self, initial_size: u32) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub fn with_split_load_factor(mut self, factor: Option<f32>) -> Self {
        self.split_load_factor = factor;
        self
    }
}
