//! Versioned snapshots of OS network interfaces.
//!
//! A link-table provider (netlink in production, a fixture in tests) pushes
//! whole-table snapshots. The engine hands each subscriber a reference to
//! the published version; a newer version is only published once every
//! declared consumer has released the previous one.

use std::sync::Arc;

use bitflags::bitflags;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Physical,
    Bond,
    Team,
    Bridge,
    Vlan,
    Macvlan,
    Veth,
    Other,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    pub struct LinkFlags: u32 {
        const UP = 1 << 0;
        const RUNNING = 1 << 1;
        const SLAVE = 1 << 2;
    }
}

bitflags! {
    /// Timestamping capabilities reported for an interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    pub struct TsCaps: u32 {
        const SOFTWARE = 1 << 0;
        const HARDWARE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BondMode {
    ActiveBackup,
    Lacp,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct BondInfo {
    pub mode: BondMode,
    pub active_slave: Option<i32>,
    pub members: Vec<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkRow {
    pub if_index: i32,
    pub if_name: String,
    pub kind: LinkKind,
    pub flags: LinkFlags,
    pub bond: Option<BondInfo>,
    pub vlan_id: Option<u16>,
    pub l2_addr: [u8; 6],
    pub ts_caps: TsCaps,
}

impl LinkRow {
    pub fn is_up(&self) -> bool {
        self.flags.contains(LinkFlags::UP | LinkFlags::RUNNING)
    }
}

/// One immutable snapshot. Consumers must treat rows as read-only.
#[derive(Debug, Clone, Serialize)]
pub struct LinkTable {
    pub version: u64,
    pub rows: Vec<LinkRow>,
}

impl LinkTable {
    pub fn by_name(&self, name: &str) -> Option<&LinkRow> {
        self.rows.iter().find(|r| r.if_name == name)
    }

    pub fn by_index(&self, index: i32) -> Option<&LinkRow> {
        self.rows.iter().find(|r| r.if_index == index)
    }

    /// Resolve the physical interface that carries traffic for `name`:
    /// bonds resolve to their active slave, VLANs to their parent row.
    pub fn physical_for(&self, name: &str) -> Option<&LinkRow> {
        let row = self.by_name(name)?;
        match row.kind {
            LinkKind::Bond | LinkKind::Team => row
                .bond
                .as_ref()
                .and_then(|b| b.active_slave)
                .and_then(|idx| self.by_index(idx)),
            _ => Some(row),
        }
    }
}

/// Publication bookkeeping: at most one outstanding version, a pending
/// snapshot replaces any older pending one.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    current: Option<Arc<LinkTable>>,
    outstanding: usize,
    pending: Option<Vec<LinkRow>>,
    next_version: u64,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new snapshot from the provider. Supersedes any snapshot that
    /// was staged but not yet published.
    pub fn offer(&mut self, rows: Vec<LinkRow>) {
        self.pending = Some(rows);
    }

    pub fn ready(&self) -> bool {
        self.outstanding == 0
    }

    /// Publish the staged snapshot to `consumers` subscribers, if the
    /// previous version has been fully released.
    pub fn take_next(&mut self, consumers: usize) -> Option<Arc<LinkTable>> {
        if !self.ready() {
            return None;
        }
        let rows = self.pending.take()?;
        self.next_version += 1;
        let table = Arc::new(LinkTable {
            version: self.next_version,
            rows,
        });
        self.outstanding = consumers;
        self.current = Some(Arc::clone(&table));
        Some(table)
    }

    /// Consumer release. Stale or duplicate releases are ignored.
    /// Returns true once every declared consumer has released.
    pub fn release(&mut self, version: u64) -> bool {
        if let Some(current) = &self.current
            && current.version == version
            && self.outstanding > 0
        {
            self.outstanding -= 1;
        }
        self.ready()
    }

    pub fn current(&self) -> Option<&Arc<LinkTable>> {
        self.current.as_ref()
    }
}
