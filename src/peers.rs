//! Peer registry: the fixed set of peers this host measures.

use std::{collections::HashSet, net::SocketAddr};

use thiserror::Error;

use crate::report::TERMINATOR;

/// One peer host, identified by a stable slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Name used in reports.
    pub name: String,
    /// Address of the peer's Responder.
    pub address: SocketAddr,
    /// Slot in the delay table; unique within a registry.
    pub index: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid name {0:?}: expected a non-empty word without ':' other than '{TERMINATOR}'")]
    InvalidName(String),
    #[error("Duplicate peer name {0:?}")]
    DuplicateName(String),
    #[error("Duplicate peer index {0}")]
    DuplicateIndex(usize),
    #[error("Peer index {index} out of range for {count} peers")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Checks that `name` can be carried in a report line.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty()
        || name == TERMINATOR
        || name.chars().any(|c| c.is_whitespace() || c == ':')
    {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Immutable, index-ordered list of peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerDescriptor>,
}

impl PeerRegistry {
    /// Builds a registry from `(name, address)` pairs, assigning indices in order.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, SocketAddr)>,
        S: Into<String>,
    {
        let peers = pairs
            .into_iter()
            .enumerate()
            .map(|(index, (name, address))| PeerDescriptor {
                name: name.into(),
                address,
                index,
            })
            .collect();
        Self::new(peers)
    }

    /// Builds a registry from explicit descriptors.
    ///
    /// Indices must be unique and dense (`0..len`) since they address the
    /// delay table directly. Descriptors are stored in index order.
    pub fn new(mut peers: Vec<PeerDescriptor>) -> Result<Self, RegistryError> {
        let count = peers.len();
        let mut names = HashSet::new();
        let mut indices = HashSet::new();

        for peer in &peers {
            validate_name(&peer.name)?;
            if peer.index >= count {
                return Err(RegistryError::IndexOutOfRange {
                    index: peer.index,
                    count,
                });
            }
            if !indices.insert(peer.index) {
                return Err(RegistryError::DuplicateIndex(peer.index));
            }
            if !names.insert(peer.name.as_str()) {
                return Err(RegistryError::DuplicateName(peer.name.clone()));
            }
        }

        peers.sort_by_key(|p| p.index);
        Ok(PeerRegistry { peers })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PeerDescriptor> {
        self.peers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDescriptor> {
        self.peers.iter()
    }
}

impl<'a> IntoIterator for &'a PeerRegistry {
    type Item = &'a PeerDescriptor;
    type IntoIter = std::slice::Iter<'a, PeerDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}
