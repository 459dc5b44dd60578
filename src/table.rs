use std::io::{Error, ErrorKind, Result};

use rand::Rng;

use crate::connection::Connection;

/// Identifies a connection within one engine by its port pair. Handles are
/// plain values; every engine entry point revalidates them against the
/// table, so a handle held past `close` simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId {
    pub local: u16,
    pub remote: u16,
}

/// Connections sorted by `(local, remote)` for binary-search lookup.
pub(crate) struct ConnTable {
    conns: Vec<Connection>,
}

const MAX_CONNECTIONS: usize = 32767;

impl ConnTable {
    pub fn new() -> Self {
        ConnTable { conns: Vec::new() }
    }

    fn position(&self, id: ConnId) -> std::result::Result<usize, usize> {
        self.conns.binary_search_by_key(&id, |c| c.id())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        let i = self.position(id).ok()?;
        Some(&self.conns[i])
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        let i = self.position(id).ok()?;
        Some(&mut self.conns[i])
    }

    pub fn at_mut(&mut self, index: usize) -> &mut Connection {
        &mut self.conns[index]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    /// Picks a free local port for a connection to `remote`. Ephemeral
    /// ports carry the high bit; collisions probe linearly from a random
    /// starting point.
    pub fn alloc_local_port(&self, remote: u16) -> Result<u16> {
        if self.conns.len() >= MAX_CONNECTIONS {
            return Err(Error::new(ErrorKind::OutOfMemory, "connection table full"));
        }

        let mut local = rand::thread_rng().gen::<u16>() | 0x8000;

        while self
            .position(ConnId {
                local,
                remote,
            })
            .is_ok()
        {
            local = local.wrapping_add(1) | 0x8000;
        }

        Ok(local)
    }

    pub fn insert(&mut self, conn: Connection) -> Result<&mut Connection> {
        if self.conns.len() >= MAX_CONNECTIONS {
            return Err(Error::new(ErrorKind::OutOfMemory, "connection table full"));
        }

        match self.position(conn.id()) {
            Ok(_) => Err(Error::new(ErrorKind::AddrInUse, "port pair in use")),
            Err(i) => {
                self.conns.insert(i, conn);
                Ok(&mut self.conns[i])
            }
        }
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let i = self.position(id).ok()?;
        Some(self.conns.remove(i))
    }

    pub fn remove_at(&mut self, index: usize) -> Connection {
        self.conns.remove(index)
    }
}
