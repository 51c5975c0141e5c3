//! Lower-stack interface.
//!
//! The engine treats the GATT/L2CAP/LE connection manager as a black box
//! that exchanges typed primitives: requests go out through [`Transport`]
//! and results come back as messages posted to the engine (link events,
//! discovery records, operation completions). Wire encoding, timing, and
//! security are the transport's business.

use std::fmt::{Debug, Formatter};
use std::num::{NonZeroU16, NonZeroU8};

use crate::att::{AuthReq, Handle, HandleRange, Prop, Status, WriteType};
use crate::le::{Addr, LinkType};
use crate::util::name_of;
use crate::uuid::Uuid;

/// Lower-stack interface identifier assigned at registration. Each
/// registered application holds its own interface; connection events are
/// reported per interface.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Iface(NonZeroU8);

impl Iface {
    /// Wraps a raw interface id. Returns `None` for the reserved zero id.
    #[inline]
    #[must_use]
    pub const fn new(v: u8) -> Option<Self> {
        match NonZeroU8::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the raw interface id.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0.get()
    }
}

impl Debug for Iface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(Iface), self.0.get())
    }
}

/// Logical connection identifier, unique per (interface, peer) while the
/// link is up.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ConnId(NonZeroU16);

impl ConnId {
    /// Wraps a raw connection id. Returns `None` for the reserved zero id.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match NonZeroU16::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the raw connection id.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(ConnId), self.0.get())
    }
}

/// Discovery request classes issued by the cache engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DiscKind {
    /// Discover All Primary Services ([Vol 3] Part G, Section 4.4.1).
    Primary,
    /// Find Included Services ([Vol 3] Part G, Section 4.5.1).
    Included,
    /// Discover All Characteristics of a Service
    /// ([Vol 3] Part G, Section 4.6.1).
    Characteristics,
    /// Discover All Characteristic Descriptors
    /// ([Vol 3] Part G, Section 4.7.1).
    Descriptors,
}

/// One discovery result record, reported before the matching
/// discovery-complete message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DiscRecord {
    Service {
        range: HandleRange,
        uuid: Uuid,
    },
    Included {
        /// Handle of the include declaration.
        handle: Handle,
        /// Handle range of the referenced service.
        range: HandleRange,
        uuid: Uuid,
    },
    Characteristic {
        /// Handle of the characteristic declaration.
        decl: Handle,
        /// Handle of the characteristic value.
        value: Handle,
        prop: Prop,
        uuid: Uuid,
    },
    Descriptor {
        handle: Handle,
        uuid: Uuid,
    },
}

/// Payload of an operation-complete call-in.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpValue {
    /// Read or read-multiple response.
    Read { handle: Handle, value: Vec<u8> },
    /// Write or prepare-write acknowledgement.
    Write { handle: Handle },
    /// Negotiated MTU.
    Mtu { mtu: u16 },
}

/// Connection manager and ATT bearer owned by the integrator.
///
/// Requests either fail synchronously with a [`Status`] or complete later
/// through a message posted to the engine. A request that failed
/// synchronously must not also produce a completion message.
pub trait Transport: Send + Sync {
    /// Allocates a lower-stack interface for a newly registered application.
    fn register(&self) -> Option<Iface>;

    /// Releases a lower-stack interface.
    fn deregister(&self, iface: Iface);

    /// Initiates a connection to `peer`. A non-direct connection asks the
    /// stack to hold a passive (auto-reconnect) slot instead of paging the
    /// peer. The outcome arrives as a link-up or link-down message.
    fn connect(&self, iface: Iface, peer: Addr, link: LinkType, direct: bool) -> bool;

    /// Cancels a pending direct connection or releases a passive slot.
    /// Returns `false` if no matching attempt exists.
    fn cancel_connect(&self, iface: Iface, peer: Addr, direct: bool) -> bool;

    /// Tears down a logical connection. Completion arrives as a link-down
    /// message.
    fn disconnect(&self, conn: ConnId);

    /// Starts or stops accepting advertisement-triggered connections for
    /// `iface`.
    fn listen(&self, iface: Iface, start: bool) -> bool;

    /// Returns the live connection id for `(iface, peer)`, if any.
    fn conn_id(&self, iface: Iface, peer: Addr, link: LinkType) -> Option<ConnId>;

    /// Resolves a connection id back to its owning interface and peer.
    fn conn_info(&self, conn: ConnId) -> Option<(Iface, Addr, LinkType)>;

    /// Issues a discovery procedure over `range`. Records arrive as
    /// discovery-result messages followed by one discovery-complete message.
    fn discover(&self, conn: ConnId, kind: DiscKind, range: HandleRange) -> Status;

    /// Reads an attribute value.
    fn read(&self, conn: ConnId, handle: Handle, auth: AuthReq) -> Status;

    /// Reads multiple attribute values in a single request.
    fn read_multiple(&self, conn: ConnId, handles: &[Handle], auth: AuthReq) -> Status;

    /// Writes an attribute value.
    fn write(&self, conn: ConnId, typ: WriteType, handle: Handle, value: &[u8], auth: AuthReq)
        -> Status;

    /// Queues a prepare-write at `offset`.
    fn prepare_write(
        &self,
        conn: ConnId,
        handle: Handle,
        offset: u16,
        value: &[u8],
        auth: AuthReq,
    ) -> Status;

    /// Executes or cancels all queued prepare-writes.
    fn execute_write(&self, conn: ConnId, execute: bool) -> Status;

    /// Starts an MTU exchange.
    fn configure_mtu(&self, conn: ConnId, mtu: u16) -> Status;

    /// Acknowledges an indication.
    fn confirm(&self, conn: ConnId, handle: Handle);
}
