//! In-memory mirror of a remote server's attribute database.
//!
//! The cache is an ordered forest: services sorted by starting handle, each
//! owning its attributes (includes, characteristics, descriptors) in
//! ascending handle order. Every lookup is an ordered linear scan over that
//! structure, so the ordering invariant is load-bearing and is enforced when
//! a cache is built. A cache is rebuilt either attribute-by-attribute during
//! discovery or record-by-record from persisted storage; both paths go
//! through [`CacheBuilder`].

use std::fmt::{Debug, Formatter};

use crate::att::{Handle, HandleRange, Prop};
use crate::uuid::{self, Uuid};

/// Attribute classes stored within a service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum AttrKind {
    Include,
    Characteristic,
    Descriptor,
}

/// One cached attribute. For characteristics, `handle` is the value handle
/// and `prop` carries the declared properties.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attr {
    pub kind: AttrKind,
    pub uuid: Uuid,
    /// Instance id distinguishing same-UUID attributes within one service,
    /// assigned in handle order.
    pub inst: u8,
    pub handle: Handle,
    pub prop: Prop,
}

/// One cached service and its attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Service {
    pub uuid: Uuid,
    /// Instance id distinguishing same-UUID services, assigned in handle
    /// order.
    pub inst: u8,
    pub range: HandleRange,
    pub primary: bool,
    attrs: Vec<Attr>,
}

impl Service {
    /// Returns the service's attributes in ascending handle order.
    #[inline(always)]
    #[must_use]
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    /// Returns the service's characteristics in ascending handle order.
    pub fn characteristics(&self) -> impl Iterator<Item = &Attr> {
        (self.attrs.iter()).filter(|a| a.kind == AttrKind::Characteristic)
    }

    /// Returns the descriptors that belong to the characteristic with value
    /// handle `ch`: the descriptor run following it, up to the next
    /// characteristic.
    pub fn descriptors(&self, ch: Handle) -> impl Iterator<Item = &Attr> {
        let start = (self.attrs.iter())
            .position(|a| a.handle == ch)
            .map_or(self.attrs.len(), |i| i + 1);
        (self.attrs[start..].iter()).take_while(|a| a.kind == AttrKind::Descriptor)
    }
}

/// Service identity reported with search results.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub inst: u8,
    pub range: HandleRange,
    pub primary: bool,
}

impl From<&Service> for ServiceInfo {
    #[inline]
    fn from(s: &Service) -> Self {
        Self {
            uuid: s.uuid,
            inst: s.inst,
            range: s.range,
            primary: s.primary,
        }
    }
}

/// Cache construction failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("attribute record without an owning service")]
    NoService,
    #[error("attribute handles out of order or duplicated")]
    OutOfOrder,
    #[error("service ranges overlap")]
    Overlap,
    #[error("cache capacity exceeded")]
    Full,
}

/// Immutable attribute cache for one remote server.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Cache {
    svcs: Vec<Service>,
}

impl Cache {
    /// Returns all services ordered by starting handle.
    #[inline(always)]
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.svcs
    }

    /// Returns services matching the optional UUID filter, in handle order.
    pub fn services_filtered(&self, uuid: Option<Uuid>) -> impl Iterator<Item = &Service> {
        (self.svcs.iter()).filter(move |s| uuid.map_or(true, |u| s.uuid == u))
    }

    /// Resolves an attribute handle to its owning service and attribute.
    #[must_use]
    pub fn find(&self, h: Handle) -> Option<(&Service, &Attr)> {
        let s = self.service_for(h)?;
        (s.attrs.iter().find(|a| a.handle == h)).map(|a| (s, a))
    }

    /// Returns the service whose range covers `h`.
    #[must_use]
    pub fn service_for(&self, h: Handle) -> Option<&Service> {
        use std::ops::RangeBounds;
        self.svcs.iter().find(|s| s.range.contains(&h))
    }

    /// Resolves a handle to positional (service, attribute) ids.
    #[must_use]
    pub fn position(&self, h: Handle) -> Option<(usize, usize)> {
        self.svcs.iter().enumerate().find_map(|(si, s)| {
            (s.attrs.iter())
                .position(|a| a.handle == h)
                .map(|ai| (si, ai))
        })
    }

    /// Resolves positional (service, attribute) ids back to the attribute.
    #[must_use]
    pub fn at(&self, svc: usize, attr: usize) -> Option<(&Service, &Attr)> {
        let s = self.svcs.get(svc)?;
        s.attrs.get(attr).map(|a| (s, a))
    }

    /// Returns the characteristic that owns the descriptor at `h`: the
    /// nearest preceding characteristic within the same service.
    #[must_use]
    pub fn owner_char(&self, h: Handle) -> Option<&Attr> {
        let s = self.service_for(h)?;
        let i = s.attrs.iter().position(|a| a.handle == h)?;
        if s.attrs[i].kind != AttrKind::Descriptor {
            return None;
        }
        (s.attrs[..i].iter().rev()).find(|a| a.kind == AttrKind::Characteristic)
    }

    /// Returns the Client Characteristic Configuration descriptor handle of
    /// the characteristic with value handle `ch`.
    #[must_use]
    pub fn ccc_of(&self, ch: Handle) -> Option<Handle> {
        let s = self.service_for(ch)?;
        (s.descriptors(ch).find(|a| a.uuid == uuid::CLIENT_CHAR_CFG)).map(|a| a.handle)
    }

    /// Returns the value handle of the Service Changed characteristic, if
    /// the server exposes one.
    #[must_use]
    pub fn service_changed(&self) -> Option<Handle> {
        let s = (self.svcs.iter()).find(|s| s.uuid == uuid::GATT_SERVICE)?;
        (s.characteristics().find(|a| a.uuid == uuid::SERVICE_CHANGED)).map(|a| a.handle)
    }

    /// Serializes the cache into the flat record format, services followed
    /// by their attributes, preserving cache order.
    #[must_use]
    pub fn to_records(&self) -> Vec<CacheRecord> {
        let n = self.svcs.len() + self.svcs.iter().map(|s| s.attrs.len()).sum::<usize>();
        let mut v = Vec::with_capacity(n);
        for s in &self.svcs {
            v.push(CacheRecord {
                kind: RecKind::Service,
                handle: s.range.start(),
                end: s.range.end(),
                inst: s.inst,
                uuid: s.uuid,
                prop: Prop::empty(),
                primary: s.primary,
            });
            for a in &s.attrs {
                v.push(CacheRecord {
                    kind: match a.kind {
                        AttrKind::Include => RecKind::Include,
                        AttrKind::Characteristic => RecKind::Characteristic,
                        AttrKind::Descriptor => RecKind::Descriptor,
                    },
                    handle: a.handle,
                    end: a.handle,
                    inst: a.inst,
                    uuid: a.uuid,
                    prop: a.prop,
                    primary: false,
                });
            }
        }
        v
    }
}

impl Debug for Cache {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.svcs).finish()
    }
}

/// Flat record kinds used by the persistence format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RecKind {
    Service,
    Include,
    Characteristic,
    Descriptor,
}

/// One flat cache record as exchanged with the storage collaborator.
/// Services precede their attributes; relative order is significant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheRecord {
    pub kind: RecKind,
    pub handle: Handle,
    /// Ending handle for service records; equal to `handle` otherwise.
    pub end: Handle,
    pub inst: u8,
    pub uuid: Uuid,
    #[serde(default)]
    pub prop: Prop,
    #[serde(default)]
    pub primary: bool,
}

/// Incremental cache construction from discovery results or persisted
/// records.
#[derive(Debug, Default)]
pub struct CacheBuilder {
    svcs: Vec<Service>,
}

impl CacheBuilder {
    /// Maximum number of services tracked during one rebuild.
    pub const MAX_SERVICES: usize = 40;

    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new service; subsequent attributes are appended to it.
    pub fn service(
        &mut self,
        uuid: Uuid,
        range: HandleRange,
        primary: bool,
    ) -> Result<(), CacheError> {
        if self.svcs.len() >= Self::MAX_SERVICES {
            return Err(CacheError::Full);
        }
        self.svcs.push(Service {
            uuid,
            inst: 0,
            range,
            primary,
            attrs: Vec::new(),
        });
        Ok(())
    }

    /// Appends an attribute to the most recently opened service.
    pub fn attr(
        &mut self,
        kind: AttrKind,
        uuid: Uuid,
        handle: Handle,
        prop: Prop,
    ) -> Result<(), CacheError> {
        let s = self.svcs.last_mut().ok_or(CacheError::NoService)?;
        s.attrs.push(Attr {
            kind,
            uuid,
            inst: 0,
            handle,
            prop,
        });
        Ok(())
    }

    /// Appends one batch of persisted records, preserving relative order.
    pub fn records(&mut self, recs: &[CacheRecord]) -> Result<(), CacheError> {
        for r in recs {
            match r.kind {
                RecKind::Service => {
                    self.service(r.uuid, HandleRange::new(r.handle, r.end), r.primary)?;
                }
                RecKind::Include => self.attr(AttrKind::Include, r.uuid, r.handle, r.prop)?,
                RecKind::Characteristic => {
                    self.attr(AttrKind::Characteristic, r.uuid, r.handle, r.prop)?;
                }
                RecKind::Descriptor => self.attr(AttrKind::Descriptor, r.uuid, r.handle, r.prop)?,
            }
        }
        Ok(())
    }

    /// Returns whether a service with this range is already known.
    #[must_use]
    pub fn has_service(&self, range: HandleRange) -> bool {
        self.svcs.iter().any(|s| s.range == range)
    }

    /// Orders, validates, and seals the cache. Instance ids are
    /// (re)assigned deterministically from the final order, so they are
    /// stable across save/load round trips.
    pub fn finish(mut self) -> Result<Cache, CacheError> {
        self.svcs.sort_by_key(|s| s.range.start());
        for w in self.svcs.windows(2) {
            if w[0].range.end() >= w[1].range.start() {
                return Err(CacheError::Overlap);
            }
        }
        for s in &mut self.svcs {
            s.attrs.sort_by_key(|a| a.handle);
            for w in s.attrs.windows(2) {
                if w[0].handle >= w[1].handle {
                    return Err(CacheError::OutOfOrder);
                }
            }
            for j in 0..s.attrs.len() {
                #[allow(clippy::cast_possible_truncation)]
                let inst = (s.attrs[..j].iter())
                    .filter(|a| a.uuid == s.attrs[j].uuid && a.kind == s.attrs[j].kind)
                    .count() as u8;
                s.attrs[j].inst = inst;
            }
        }
        for i in 0..self.svcs.len() {
            #[allow(clippy::cast_possible_truncation)]
            let inst = (self.svcs[..i].iter())
                .filter(|p| p.uuid == self.svcs[i].uuid)
                .count() as u8;
            self.svcs[i].inst = inst;
        }
        Ok(Cache { svcs: self.svcs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::att::Handle;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn r(s: u16, e: u16) -> HandleRange {
        HandleRange::new(h(s), h(e))
    }

    fn u(v: u16) -> Uuid {
        crate::uuid::Uuid16::new(v).unwrap().as_uuid()
    }

    fn sample() -> Cache {
        let mut b = CacheBuilder::new();
        b.service(u(0x1801), r(1, 5), true).unwrap();
        b.attr(AttrKind::Characteristic, u(0x2A05), h(3), Prop::INDICATE).unwrap();
        b.attr(AttrKind::Descriptor, u(0x2902), h(4), Prop::empty()).unwrap();
        b.service(u(0x180F), r(6, 10), true).unwrap();
        b.attr(AttrKind::Characteristic, u(0x2A19), h(8), Prop::READ | Prop::NOTIFY).unwrap();
        b.attr(AttrKind::Descriptor, u(0x2902), h(9), Prop::empty()).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn ordering_invariant() {
        let c = sample();
        for w in c.services().windows(2) {
            assert!(w[0].range.end() < w[1].range.start());
        }
        for s in c.services() {
            for w in s.attrs().windows(2) {
                assert!(w[0].handle < w[1].handle);
            }
        }
    }

    #[test]
    fn lookups() {
        let c = sample();
        let (s, a) = c.find(h(8)).unwrap();
        assert_eq!(s.uuid, u(0x180F));
        assert_eq!(a.kind, AttrKind::Characteristic);
        assert_eq!(c.position(h(8)), Some((1, 0)));
        assert_eq!(c.at(1, 0).unwrap().1.handle, h(8));
        assert_eq!(c.service_changed(), Some(h(3)));
        assert_eq!(c.ccc_of(h(3)), Some(h(4)));
        assert_eq!(c.ccc_of(h(8)), Some(h(9)));
        assert_eq!(c.owner_char(h(9)).unwrap().handle, h(8));
        assert!(c.find(h(2)).is_none());
    }

    #[test]
    fn instance_ids() {
        let mut b = CacheBuilder::new();
        b.service(u(0x180D), r(1, 5), true).unwrap();
        b.attr(AttrKind::Characteristic, u(0x2A37), h(2), Prop::NOTIFY).unwrap();
        b.attr(AttrKind::Characteristic, u(0x2A37), h(4), Prop::NOTIFY).unwrap();
        b.service(u(0x180D), r(6, 9), true).unwrap();
        let c = b.finish().unwrap();
        assert_eq!(c.services()[0].inst, 0);
        assert_eq!(c.services()[1].inst, 1);
        let ch: Vec<_> = c.services()[0].characteristics().collect();
        assert_eq!((ch[0].inst, ch[1].inst), (0, 1));
    }

    #[test]
    fn record_round_trip() {
        let c = sample();
        let recs = c.to_records();
        let mut b = CacheBuilder::new();
        // Deliver in two batches to mimic a chunked load.
        b.records(&recs[..3]).unwrap();
        b.records(&recs[3..]).unwrap();
        assert_eq!(b.finish().unwrap(), c);
    }

    #[test]
    fn rejects_disorder() {
        let mut b = CacheBuilder::new();
        b.service(u(0x1801), r(1, 5), true).unwrap();
        b.attr(AttrKind::Descriptor, u(0x2902), h(3), Prop::empty()).unwrap();
        b.attr(AttrKind::Descriptor, u(0x2903), h(3), Prop::empty()).unwrap();
        assert_eq!(b.finish().unwrap_err(), CacheError::OutOfOrder);

        let mut b = CacheBuilder::new();
        b.service(u(0x1801), r(1, 5), true).unwrap();
        b.service(u(0x180F), r(4, 9), true).unwrap();
        assert_eq!(b.finish().unwrap_err(), CacheError::Overlap);

        let mut b = CacheBuilder::new();
        assert_eq!(
            b.attr(AttrKind::Descriptor, u(0x2902), h(3), Prop::empty()),
            Err(CacheError::NoService)
        );
    }

    #[test]
    fn builder_capacity() {
        let mut b = CacheBuilder::new();
        for i in 0..CacheBuilder::MAX_SERVICES {
            #[allow(clippy::cast_possible_truncation)]
            let s = (i as u16) * 2 + 1;
            b.service(u(0x1801), r(s, s + 1), true).unwrap();
        }
        assert_eq!(b.service(u(0x1801), r(999, 1000), true), Err(CacheError::Full));
    }
}
