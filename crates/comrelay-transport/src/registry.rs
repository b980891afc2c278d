//! Named client registry shared by every manager
//!
//! A registry maps a client identifier to exactly one live client. All
//! membership changes serialize on a single lock; callers only ever receive
//! individual `Arc` handles, never the underlying map, so I/O on a client
//! happens after the lock has been released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TransportError};

pub struct Registry<C> {
    clients: Mutex<HashMap<String, Arc<C>>>,
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register `client` under `id`. Fails without constructing anything if
    /// the identifier is taken.
    pub fn insert_with<F>(&self, id: &str, make: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> C,
    {
        let mut clients = self.clients.lock();
        if clients.contains_key(id) {
            return Err(TransportError::AlreadyRegistered(id.to_string()));
        }
        let client = Arc::new(make());
        clients.insert(id.to_string(), client.clone());
        Ok(client)
    }

    pub fn get(&self, id: &str) -> Result<Arc<C>> {
        self.clients
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownClient(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<Arc<C>> {
        self.clients
            .lock()
            .remove(id)
            .ok_or_else(|| TransportError::UnknownClient(id.to_string()))
    }

    /// Run `f` against a client while the registry lock is held
    pub fn with_client<F, R>(&self, id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&C) -> R,
    {
        let clients = self.clients.lock();
        let client = clients
            .get(id)
            .ok_or_else(|| TransportError::UnknownClient(id.to_string()))?;
        Ok(f(client))
    }

    /// Current members ordered by identifier
    pub fn snapshot(&self) -> Vec<(String, Arc<C>)> {
        let mut entries: Vec<_> = self
            .clients
            .lock()
            .iter()
            .map(|(id, client)| (id.clone(), client.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove and return every member
    pub fn drain(&self) -> Vec<(String, Arc<C>)> {
        let mut entries: Vec<_> = self.clients.lock().drain().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client outcome of a fan-out send
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub results: Vec<(String, Result<()>)>,
}

impl BroadcastReport {
    pub fn record(&mut self, id: impl Into<String>, result: Result<()>) {
        self.results.push((id.into(), result));
    }

    /// Identifiers the message was handed to
    pub fn delivered(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Identifiers the message could not be handed to
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn all_delivered(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }
}
