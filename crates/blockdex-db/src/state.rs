//! Persistence of [`InternalState`] in the `internalState` column and the
//! open-time compatibility checks.

use std::sync::atomic::Ordering;

use tracing::{info, warn};

use blockdex_core::constants::DB_VERSION;
use blockdex_core::error::{BlockdexError, DbError};
use blockdex_core::internal_state::{DbState, InternalState};

use crate::index::Indexer;
use crate::store::{Column, RocksStore};

const STATE_KEY: &[u8] = b"internalState";

/// Load the stored state, or create a fresh one for an empty database.
pub(crate) fn load_internal_state(
    store: &RocksStore,
    coin: &str,
    coin_shortcut: &str,
) -> Result<InternalState, BlockdexError> {
    let state = match store.get(Column::InternalState, STATE_KEY)? {
        None => {
            info!(coin, "initializing new index state");
            InternalState::new(coin, coin_shortcut)
        }
        Some(buf) => {
            let state = InternalState::unpack(&buf)?;
            let stored = state.coin();
            if stored != coin {
                return Err(DbError::CoinMismatch { stored, configured: coin.to_string() }.into());
            }
            if state.db_state() == DbState::Inconsistent {
                return Err(DbError::InconsistentState.into());
            }
            for c in state.column_stats() {
                if c.version != DB_VERSION {
                    return Err(DbError::VersionMismatch { column: c.name, stored: c.version, expected: DB_VERSION }.into());
                }
            }
            state
        }
    };
    state.ensure_columns(&Column::names(), DB_VERSION);
    Ok(state)
}

impl Indexer {
    /// Persist the current state.
    pub fn store_internal_state(&self) -> Result<(), BlockdexError> {
        let buf = self.state.pack()?;
        self.store.put(Column::InternalState, STATE_KEY, &buf)
    }

    /// Mark the database as being bulk loaded; a crash before
    /// [`finish_bulk_state`](Self::finish_bulk_state) leaves it inconsistent.
    pub fn start_bulk_state(&self) -> Result<(), BlockdexError> {
        self.state.set_db_state(DbState::Inconsistent);
        self.state.set_initial_sync(true);
        self.store_internal_state()
    }

    pub fn finish_bulk_state(&self) -> Result<(), BlockdexError> {
        self.state.set_db_state(DbState::Open);
        self.state.set_initial_sync(false);
        self.store_internal_state()
    }

    /// Recount rows and bytes of every column. Stops early, keeping the old
    /// stats, when [`stop_computing_stats`](Self::stop_computing_stats) is called.
    pub fn compute_column_stats(&self) -> Result<(), BlockdexError> {
        self.stop.store(false, Ordering::Relaxed);
        for col in Column::ALL {
            match self.store.compute_column_size(col, &self.stop)? {
                Some((rows, kb, vb)) => {
                    info!(column = col.name(), rows, key_bytes = kb, value_bytes = vb, "column stats");
                    self.state.set_db_column_stats(col.index(), rows, kb, vb);
                }
                None => {
                    warn!(column = col.name(), "column stats computation interrupted");
                    return Ok(());
                }
            }
        }
        self.store_internal_state()
    }

    pub fn stop_computing_stats(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Flag the state closed and persist it.
    pub fn close(&self) -> Result<(), BlockdexError> {
        let _guard = self.write_lock.lock();
        self.state.set_db_state(DbState::Closed);
        self.store_internal_state()?;
        info!("index closed");
        Ok(())
    }
}
