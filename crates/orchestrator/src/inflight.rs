//! At most one run per `(table, symbol)`.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// `(table, symbol)`.
pub type SymbolKey = (String, String);

/// Set of keys with a run queued or in progress.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<SymbolKey>>>,
}

/// Claim on one key. Released on drop.
#[derive(Debug)]
pub struct InFlightPermit {
    keys: Arc<Mutex<HashSet<SymbolKey>>>,
    key: SymbolKey,
}

impl InFlightPermit {
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.key.1
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

impl InFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `(table, symbol)` unless it is already running.
    #[must_use]
    pub fn try_acquire(&self, table: &str, symbol: &str) -> Option<InFlightPermit> {
        let key = (table.to_string(), symbol.to_string());
        let mut keys = self.keys.lock();
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightPermit {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    /// Claims every symbol or none of them.
    ///
    /// # Errors
    /// Returns the symbols that are already running.
    pub fn try_acquire_all(
        &self,
        table: &str,
        symbols: &[String],
    ) -> Result<Vec<InFlightPermit>, Vec<String>> {
        let mut keys = self.keys.lock();
        let busy: Vec<String> = symbols
            .iter()
            .filter(|s| keys.contains(&(table.to_string(), (*s).clone())))
            .cloned()
            .collect();
        if !busy.is_empty() {
            return Err(busy);
        }

        let mut permits = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let key = (table.to_string(), symbol.clone());
            // Duplicates in `symbols` share the first permit.
            if keys.insert(key.clone()) {
                permits.push(InFlightPermit {
                    keys: Arc::clone(&self.keys),
                    key,
                });
            }
        }
        Ok(permits)
    }

    #[must_use]
    pub fn contains(&self, table: &str, symbol: &str) -> bool {
        self.keys
            .lock()
            .contains(&(table.to_string(), symbol.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}
