//! Routing tables, grounded on `table.c`/`backend.c`. The original threads
//! `Table`/`Backend` through intrusive `STAILQ`/`SLIST` macros and a
//! process-wide reference count; per spec §9's design note this becomes an
//! owned `Vec<Backend>` plus `Arc` for shared ownership, and the "hot
//! reload without a mutex" guarantee (spec §4.3, written for a
//! single-threaded reactor) is realized here as an `RwLock<Arc<Table>>`:
//! readers clone the `Arc` under a brief read lock and then look up against
//! their own owned handle, so a concurrent `SIGHUP` reload can never free a
//! `Table` out from under a lookup in progress on another thread.

use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::address::Address;
use crate::error::LookupError;

/// A single pattern -> target rule, per spec §3.
pub struct Backend {
    pub pattern: String,
    regex: Regex,
    pub target: Address,
    pub use_proxy_header: bool,
}

impl Backend {
    pub fn new(pattern: &str, target: Address, use_proxy_header: bool) -> Result<Self, regex::Error> {
        Ok(Backend {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern)?,
            target,
            use_proxy_header,
        })
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname)
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("pattern", &self.pattern)
            .field("target", &self.target)
            .field("use_proxy_header", &self.use_proxy_header)
            .finish()
    }
}

/// An ordered list of backend rules sharing a name, reference-counted
/// (spec §3/§4.3) through `Arc` cloning by every `Listener` that holds it.
pub struct Table {
    pub name: Option<String>,
    backends: Vec<Backend>,
    pub use_proxy_header_default: bool,
}

impl Table {
    pub fn new(name: Option<String>, backends: Vec<Backend>, use_proxy_header_default: bool) -> Self {
        Table {
            name,
            backends,
            use_proxy_header_default,
        }
    }

    /// First backend (in declared order) whose pattern matches `hostname`.
    pub fn lookup(&self, hostname: &str) -> Result<&Backend, LookupError> {
        self.backends
            .iter()
            .find(|b| b.matches(hostname))
            .ok_or(LookupError::NoMatch)
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}

/// A hot-swappable handle to a [`Table`], held by every
/// [`crate::listener::Listener`] that routes through it. `SIGHUP` reload
/// (spec §4.3) replaces the inner `Arc<Table>` under a write lock held only
/// long enough to swap the pointer; a lookup in progress on another thread
/// holds its own clone of the old `Arc<Table>` (taken via
/// [`current`](Self::current)) and keeps using it until its next call,
/// exactly matching "existing Connections with a ref on the old Table see
/// the new rules on subsequent lookups" -- without the old table ever being
/// freed while a reader still references it.
pub struct TableHandle {
    inner: RwLock<Arc<Table>>,
}

impl TableHandle {
    pub fn new(table: Table) -> Arc<Self> {
        Arc::new(TableHandle {
            inner: RwLock::new(Arc::new(table)),
        })
    }

    /// A fresh `Arc` clone of the table as of this call. Cheap: it's a
    /// refcount bump under a read lock, not a copy of the backend list.
    pub fn current(&self) -> Arc<Table> {
        Arc::clone(&self.inner.read().unwrap())
    }

    /// Replace the table contents. Used by `SIGHUP` reload (spec §4.3).
    /// Readers that already cloned the previous `Arc<Table>` keep it alive
    /// until they drop it, so this never disturbs a lookup in flight.
    pub fn swap(&self, table: Table) {
        *self.inner.write().unwrap() = Arc::new(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(pattern: &str, target: &str) -> Backend {
        Backend::new(pattern, Address::parse(target).unwrap(), false).unwrap()
    }

    #[test]
    fn lookup_returns_first_match_in_order() {
        let table = Table::new(
            None,
            vec![
                backend("^a\\.example\\.com$", "10.0.0.1:80"),
                backend("^.*\\.example\\.com$", "10.0.0.2:80"),
            ],
            false,
        );
        let hit = table.lookup("a.example.com").unwrap();
        assert_eq!(hit.target.to_string(), "10.0.0.1:80");

        let hit = table.lookup("b.example.com").unwrap();
        assert_eq!(hit.target.to_string(), "10.0.0.2:80");
    }

    #[test]
    fn lookup_no_match() {
        let table = Table::new(None, vec![backend("^only\\.this$", "10.0.0.1:80")], false);
        assert_eq!(table.lookup("other.host").unwrap_err(), LookupError::NoMatch);
    }

    #[test]
    fn wildcard_target_is_preserved_for_caller_substitution() {
        let table = Table::new(None, vec![backend("^.*$", "*")], false);
        let hit = table.lookup("anything.example").unwrap();
        assert!(hit.target.is_wildcard());
    }

    #[test]
    fn hot_swap_is_visible_to_new_lookups() {
        let handle = TableHandle::new(Table::new(
            None,
            vec![backend("^old\\.example$", "10.0.0.1:80")],
            false,
        ));
        assert!(handle.current().lookup("old.example").is_ok());

        handle.swap(Table::new(
            None,
            vec![backend("^new\\.example$", "10.0.0.2:80")],
            false,
        ));

        assert!(handle.current().lookup("old.example").is_err());
        assert!(handle.current().lookup("new.example").is_ok());
    }
}
