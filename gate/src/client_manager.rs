//! Registry of connected client proxies
//!
//! This module is the authoritative map from client id to [`ClientProxy`]:
//! - Connection lifecycle (register on accept, remove on disconnect)
//! - Lookups for every packet redirected to a single client
//! - The terminating flag that refuses late registrations
//!
//! Lookups vastly outnumber registrations, so the map is a sharded
//! [`DashMap`]. Registration and the start of termination additionally
//! serialize on a small read/write lock so a connection accepted while the
//! gate shuts down is either refused or included in the shutdown snapshot,
//! never neither.

use crate::client_proxy::ClientProxy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::info;
use parking_lot::RwLock;
use shared::ClientId;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The gate is shutting down; the caller must close the connection
    #[error("gate is terminating")]
    Terminating,

    #[error("client {0} is already registered")]
    Duplicate(ClientId),
}

/// Manages all connected client proxies
pub struct ClientManager {
    /// Connected clients indexed by their id
    clients: DashMap<ClientId, Arc<ClientProxy>>,
    /// Set once by `begin_termination`
    terminating: RwLock<bool>,
}

impl ClientManager {
    /// Creates an empty registry that accepts registrations
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            terminating: RwLock::new(false),
        }
    }

    /// Adds a client proxy to the registry
    ///
    /// Fails with [`RegisterError::Terminating`] once termination has begun,
    /// in which case the proxy was not stored and the caller is expected to
    /// close the connection. An id that is already registered is refused
    /// rather than overwritten.
    pub fn register(&self, proxy: Arc<ClientProxy>) -> Result<(), RegisterError> {
        let terminating = self.terminating.read();
        if *terminating {
            return Err(RegisterError::Terminating);
        }

        match self.clients.entry(proxy.id()) {
            Entry::Occupied(_) => Err(RegisterError::Duplicate(proxy.id())),
            Entry::Vacant(slot) => {
                info!("{} registered", proxy);
                slot.insert(proxy);
                Ok(())
            }
        }
    }

    /// Looks up a client proxy by id
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientProxy>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a client proxy from the registry
    ///
    /// Returns the proxy if it was registered, `None` if it was already gone
    /// or never made it in (for example a connection refused during
    /// termination).
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<ClientProxy>> {
        let (_, proxy) = self.clients.remove(client_id)?;
        info!("{} unregistered", proxy);
        Some(proxy)
    }

    /// Flips the terminating flag and snapshots the registered proxies
    ///
    /// Returns `None` if termination had already begun. No registration can
    /// complete between the flag flip and the snapshot.
    pub fn begin_termination(&self) -> Option<Vec<Arc<ClientProxy>>> {
        let mut terminating = self.terminating.write();
        if *terminating {
            return None;
        }
        *terminating = true;

        Some(
            self.clients
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect(),
        )
    }

    /// Whether termination has begun and registrations are refused
    pub fn is_terminating(&self) -> bool {
        *self.terminating.read()
    }

    /// Returns the number of currently registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
