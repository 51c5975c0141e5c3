//! Background connection interest tracking.
//!
//! Applications can ask for an auto-reconnect (passive connect) or an
//! advertisement-listen relationship with a peer without holding a live
//! session. Interest is a per-peer pair of application bitmasks consulted
//! whenever a link comes up with no matching session.

use smallvec::SmallVec;

use crate::le::Addr;
use crate::util::Slot;

/// Maximum tracked peers with background interest.
const MAX_TRACK: usize = 7;

#[derive(Debug, Default, Eq, PartialEq)]
struct Entry {
    /// `None` is the wildcard entry matching any peer (listen-all).
    peer: Option<Addr>,
    conn_mask: u16,
    listen_mask: u16,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.conn_mask == 0 && self.listen_mask == 0
    }
}

fn bit(cif: Slot) -> u16 {
    // MAX_CLIENTS <= 16, so every registration index fits the mask.
    1_u16 << (cif.index() & 0xF)
}

/// Per-peer background interest table.
#[derive(Debug, Default)]
pub(super) struct BgTracker {
    ent: SmallVec<[Entry; MAX_TRACK]>,
}

impl BgTracker {
    /// Records or clears interest. Returns `false` when a new entry is
    /// needed but the table is full.
    pub fn mark(&mut self, cif: Slot, peer: Option<Addr>, listen: bool, add: bool) -> bool {
        let b = bit(cif);
        if let Some(e) = self.ent.iter_mut().find(|e| e.peer == peer) {
            let mask = if listen { &mut e.listen_mask } else { &mut e.conn_mask };
            if add {
                *mask |= b;
            } else {
                *mask &= !b;
            }
            if e.is_empty() {
                self.ent.retain(|e| !e.is_empty());
            }
            return true;
        }
        if !add {
            return true;
        }
        if self.ent.len() >= MAX_TRACK {
            return false;
        }
        let mut e = Entry {
            peer,
            ..Entry::default()
        };
        if listen {
            e.listen_mask = b;
        } else {
            e.conn_mask = b;
        }
        self.ent.push(e);
        true
    }

    /// Returns whether `cif` holds auto-connect interest in `peer`.
    #[must_use]
    pub fn is_marked(&self, cif: Slot, peer: Addr) -> bool {
        let b = bit(cif);
        (self.ent.iter()).any(|e| e.peer == Some(peer) && e.conn_mask & b != 0)
    }

    /// Returns whether `cif` should accept an unsolicited link from `peer`,
    /// via either auto-connect or listen interest (including wildcard).
    #[must_use]
    pub fn accepts(&self, cif: Slot, peer: Addr) -> bool {
        let b = bit(cif);
        (self.ent.iter()).any(|e| {
            let hit = (e.conn_mask | e.listen_mask) & b != 0;
            hit && (e.peer.is_none() || e.peer == Some(peer))
        })
    }

    /// Clears every interest bit held by `cif` on deregistration.
    pub fn clear(&mut self, cif: Slot) {
        let b = bit(cif);
        for e in &mut self.ent {
            e.conn_mask &= !b;
            e.listen_mask &= !b;
        }
        self.ent.retain(|e| !e.is_empty());
    }
}
