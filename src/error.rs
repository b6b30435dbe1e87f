//! Типизированные ошибки карты.
//!
//! Вся цепочка вызовов ходит через anyhow::Result; MapError вкладывается
//! внутрь anyhow::Error и доступен через downcast_ref. Ошибки ввода-вывода
//! едут по той же цепочке как std::io::Error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    /// Некорректный аргумент вызова. Проверяется до любого I/O,
    /// состояние карты не затронуто.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Нарушен инвариант формата при чтении (metadata, страница, FSM).
    /// Открытый экземпляр карты следует выбросить.
    #[error("corrupted map state: {0}")]
    Corruption(String),

    /// Операция не поддерживается в текущем состоянии
    /// (например, расщепление при исчерпанном hash_bits).
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl MapError {
    pub fn invalid(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(MapError::InvalidArgument(msg.into()))
    }

    pub fn corruption(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(MapError::Corruption(msg.into()))
    }

    pub fn not_supported(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(MapError::NotSupported(msg.into()))
    }
}
