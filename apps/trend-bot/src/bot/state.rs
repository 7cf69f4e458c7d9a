//! Bot state that must survive restarts.

use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::persistence::{JsonStateFile, StoreError};

/// File name inside the state directory.
pub const BOT_STATE_FILE: &str = "bot_state.json";

/// Cadence and stop-loss bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotState {
    /// When the last BUY or SELL signal was acted on.
    #[serde(default)]
    pub last_rebalance_at: Option<DateTime<Utc>>,
    /// Price the open position was entered at.
    #[serde(default)]
    pub entry_price: Option<Decimal>,
}

/// Persisted [`BotState`].
#[derive(Debug, Clone)]
pub struct BotStateStore {
    file: JsonStateFile<BotState>,
}

impl BotStateStore {
    /// Store at `<state_dir>/bot_state.json`.
    #[must_use]
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            file: JsonStateFile::new(state_dir.as_ref().join(BOT_STATE_FILE)),
        }
    }

    /// Current state.
    pub fn load(&self) -> Result<BotState, StoreError> {
        self.file.load()
    }

    /// Record an entry at `price`.
    pub fn record_entry(&self, price: Decimal) -> Result<(), StoreError> {
        self.file.update(|state| state.entry_price = Some(price))
    }

    /// Forget the entry price after an exit.
    pub fn clear_entry(&self) -> Result<(), StoreError> {
        self.file.update(|state| state.entry_price = None)
    }

    /// Mark a rebalance at `at`.
    pub fn mark_rebalanced(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.file.update(|state| state.last_rebalance_at = Some(at))
    }
}
