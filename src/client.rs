//! GATT client session engine.
//!
//! The engine multiplexes many registered applications over shared
//! per-peer server sessions: it serializes ATT operations per logical
//! session, maintains each peer's attribute cache, routes server-initiated
//! notifications, and recovers from service changes and link loss.
//!
//! Concurrency model: single-threaded and message-driven. Every entry
//! point — application call, transport call-in, storage completion, timer
//! fire — is a [`Msg`] handled to completion by [`Engine::dispatch`] in
//! arrival order. [`channel`] wraps the engine in a tokio task with a
//! cloneable [`Handle`] for integrators that want the pump managed for
//! them; the engine itself never blocks and owns no runtime.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

pub use crate::client::engine::Engine;
pub use crate::client::pump::{channel, Driver, Handle};
use crate::att::{AuthReq, Handle as AttHandle, Status, WriteType};
use crate::cache::{CacheRecord, ServiceInfo};
use crate::le::{Addr, LinkType};
use crate::transport::{ConnId, DiscKind, DiscRecord, Iface, OpValue};
use crate::util::Slot;
use crate::uuid::Uuid;

mod background;
mod engine;
mod notify;
mod pump;
mod queue;
mod server;
mod session;

#[cfg(test)]
mod tests;

/// Maximum number of registered applications.
pub const MAX_CLIENTS: usize = 10;
/// Maximum number of concurrent logical sessions across all applications.
pub const MAX_SESSIONS: usize = 12;
/// Maximum number of distinct peers with live session state.
pub const MAX_SERVERS: usize = 10;
/// Maximum notification-interest registrations per application.
pub const MAX_NOTIFY: usize = 15;
/// Capacity of the per-session auxiliary command list.
pub const QUEUE_DEPTH: usize = 20;
/// ATT MTU before negotiation ([Vol 3] Part G, Section 5.2.1).
pub const DEFAULT_MTU: u16 = 23;

/// Registered application identifier. Valid from the `Register` event until
/// the matching `Deregister` event.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ClientIf(pub(crate) Slot);

impl Debug for ClientIf {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// Engine submission failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The engine task has terminated and no longer accepts messages.
    #[error("client engine is not running")]
    Closed,
}

/// Application callback sink registered with [`Msg::Register`]. Events are
/// delivered from the engine's serialized context; implementations must not
/// call back into the engine synchronously.
pub trait EventSink: Send + Sync {
    fn event(&self, evt: Event);
}

/// Events delivered to application sinks. Every asynchronous request
/// produces exactly one terminal event carrying a [`Status`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Event {
    Register {
        status: Status,
        cif: Option<ClientIf>,
    },
    Deregister {
        cif: ClientIf,
        status: Status,
    },
    /// Outcome of an open request. `conn` is set on success.
    Open {
        cif: ClientIf,
        status: Status,
        conn: Option<ConnId>,
        peer: Addr,
        mtu: u16,
    },
    CancelOpen {
        cif: ClientIf,
        status: Status,
    },
    /// Physical link established on this application's interface.
    Connect {
        cif: ClientIf,
        conn: ConnId,
        peer: Addr,
    },
    /// Physical link lost on this application's interface.
    Disconnect {
        cif: ClientIf,
        conn: ConnId,
        peer: Addr,
        reason: Status,
    },
    /// Logical session closed.
    Close {
        cif: ClientIf,
        conn: ConnId,
        peer: Addr,
        reason: Status,
    },
    SearchResult {
        conn: ConnId,
        service: ServiceInfo,
    },
    SearchComplete {
        conn: ConnId,
        status: Status,
    },
    ReadChar {
        conn: ConnId,
        status: Status,
        handle: AttHandle,
        value: Vec<u8>,
    },
    ReadDescr {
        conn: ConnId,
        status: Status,
        handle: AttHandle,
        value: Vec<u8>,
    },
    ReadMultiple {
        conn: ConnId,
        status: Status,
        value: Vec<u8>,
    },
    WriteChar {
        conn: ConnId,
        status: Status,
        handle: AttHandle,
    },
    WriteDescr {
        conn: ConnId,
        status: Status,
        handle: AttHandle,
    },
    PrepareWrite {
        conn: ConnId,
        status: Status,
        handle: AttHandle,
    },
    ExecuteWrite {
        conn: ConnId,
        status: Status,
    },
    ConfigureMtu {
        conn: ConnId,
        status: Status,
        mtu: u16,
    },
    Notify {
        cif: ClientIf,
        conn: ConnId,
        peer: Addr,
        handle: AttHandle,
        value: Vec<u8>,
        indication: bool,
    },
    /// The peer indicated a change to its attribute database. The cache is
    /// rediscovered automatically; cached handles are stale.
    ServiceChanged {
        cif: ClientIf,
        peer: Addr,
    },
    NotifyRegistered {
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
        status: Status,
    },
    NotifyDeregistered {
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
        status: Status,
    },
    Congested {
        conn: ConnId,
        congested: bool,
    },
    /// A command was rejected because the session's auxiliary list is full.
    QueueFull {
        conn: ConnId,
    },
    Listen {
        cif: ClientIf,
        status: Status,
    },
    EncryptionComplete {
        cif: ClientIf,
        peer: Addr,
    },
}

/// Messages processed by the engine, in arrival order.
#[derive(Clone)]
#[non_exhaustive]
pub enum Msg {
    // Application requests
    Register {
        sink: Arc<dyn EventSink>,
    },
    Deregister {
        cif: ClientIf,
    },
    Open {
        cif: ClientIf,
        peer: Addr,
        link: LinkType,
        direct: bool,
    },
    CancelOpen {
        cif: ClientIf,
        peer: Addr,
        direct: bool,
    },
    Close {
        conn: ConnId,
    },
    Refresh {
        peer: Addr,
    },
    Search {
        conn: ConnId,
        uuid: Option<Uuid>,
    },
    ReadChar {
        conn: ConnId,
        handle: AttHandle,
        auth: AuthReq,
    },
    ReadDescr {
        conn: ConnId,
        handle: AttHandle,
        auth: AuthReq,
    },
    ReadMultiple {
        conn: ConnId,
        handles: Vec<AttHandle>,
        auth: AuthReq,
    },
    WriteChar {
        conn: ConnId,
        handle: AttHandle,
        typ: WriteType,
        value: Vec<u8>,
        auth: AuthReq,
    },
    WriteDescr {
        conn: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        auth: AuthReq,
    },
    PrepareWrite {
        conn: ConnId,
        handle: AttHandle,
        offset: u16,
        value: Vec<u8>,
        auth: AuthReq,
    },
    ExecuteWrite {
        conn: ConnId,
        execute: bool,
    },
    ConfigureMtu {
        conn: ConnId,
        mtu: u16,
    },
    Confirm {
        conn: ConnId,
        handle: AttHandle,
    },
    RegisterNotify {
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
    },
    DeregisterNotify {
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
    },
    Listen {
        cif: ClientIf,
        start: bool,
    },
    // Transport call-ins
    LinkUp {
        iface: Iface,
        peer: Addr,
        conn: ConnId,
        link: LinkType,
    },
    /// Link lost, or a direct connection attempt failed (`conn` is `None`).
    LinkDown {
        iface: Iface,
        peer: Addr,
        conn: Option<ConnId>,
        link: LinkType,
        reason: Status,
    },
    EncryptionComplete {
        iface: Iface,
        peer: Addr,
    },
    Congest {
        conn: ConnId,
        congested: bool,
    },
    DiscResult {
        conn: ConnId,
        rec: DiscRecord,
    },
    DiscComplete {
        conn: ConnId,
        kind: DiscKind,
        status: Status,
    },
    /// ATT operation completion for the command in flight on `conn`.
    OpComplete {
        conn: ConnId,
        op: crate::att::OpKind,
        status: Status,
        value: Option<OpValue>,
    },
    /// Server-initiated notification or indication.
    Notify {
        conn: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        indication: bool,
    },
    // Storage call-ins
    StoreOpened {
        conn: ConnId,
        status: Status,
    },
    StoreLoaded {
        conn: ConnId,
        status: Status,
        recs: Vec<CacheRecord>,
    },
    StoreSaved {
        conn: ConnId,
        status: Status,
    },
    // Timer fires
    CccTick {
        srcb: Slot,
    },
    /// Stops the message pump.
    Shutdown,
}

/// Single-shot timer scheduling used by the service-change watchdog. The
/// production implementation lives in the tokio pump; tests substitute a
/// recording fake.
pub trait Timers: Send + Sync {
    /// Schedules `msg` for delivery after `delay`. Dropping the returned
    /// guard cancels delivery.
    fn schedule(&self, msg: Msg, delay: Duration) -> TimerGuard;
}

/// Cancellation handle for a scheduled timer. Dropping the guard cancels
/// the pending delivery.
#[derive(Debug)]
#[must_use]
pub struct TimerGuard(tokio_util::sync::CancellationToken);

impl TimerGuard {
    #[inline]
    pub(crate) fn new(ct: tokio_util::sync::CancellationToken) -> Self {
        Self(ct)
    }
}

impl Drop for TimerGuard {
    #[inline]
    fn drop(&mut self) {
        self.0.cancel();
    }
}
