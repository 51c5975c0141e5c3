//! Engine object owning all client state.
//!
//! The engine is the single serialized mutation context: registration,
//! session, and server tables live here, and every message is handled to
//! completion by [`Engine::dispatch`]. Connection and command handling is
//! in this file; discovery and storage are in `server`, notification
//! routing and the service-change watchdog in `notify`.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::att::{OpKind, Status};
use crate::cache::AttrKind;
use crate::client::background::BgTracker;
use crate::client::notify::NotifReg;
use crate::client::queue::{Command, Enqueue, Finish};
use crate::client::server::Srcb;
use crate::client::session::{Clcb, Defer, SessionState};
use crate::client::{
    ClientIf, Event, EventSink, Msg, Timers, MAX_CLIENTS, MAX_NOTIFY, MAX_SERVERS, MAX_SESSIONS,
};
use crate::le::{Addr, LinkType};
use crate::store::CacheStore;
use crate::transport::{ConnId, Iface, OpValue, Transport};
use crate::util::{Pool, Slot};
use crate::uuid::Uuid;

/// Per-application registration record.
pub(super) struct Rcb {
    pub iface: Iface,
    pub sink: Arc<dyn EventSink>,
    pub notif: SmallVec<[NotifReg; MAX_NOTIFY]>,
    pub dereg_pending: bool,
}

/// GATT client engine. All state mutation happens through [`Self::dispatch`]
/// on one thread; the engine never blocks and posts no messages to itself.
pub struct Engine {
    pub(super) tr: Arc<dyn Transport>,
    pub(super) store: Arc<dyn CacheStore>,
    pub(super) timers: Arc<dyn Timers>,
    pub(super) rcb: Pool<Rcb>,
    pub(super) clcb: Pool<Clcb>,
    pub(super) srcb: Pool<Srcb>,
    pub(super) bg: BgTracker,
}

impl Engine {
    /// Creates an engine over the given collaborators.
    #[must_use]
    pub fn new(
        tr: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
        timers: Arc<dyn Timers>,
    ) -> Self {
        Self {
            tr,
            store,
            timers,
            rcb: Pool::new(MAX_CLIENTS),
            clcb: Pool::new(MAX_SESSIONS),
            srcb: Pool::new(MAX_SERVERS),
            bg: BgTracker::default(),
        }
    }

    /// Handles one message to completion.
    #[allow(clippy::too_many_lines)]
    pub fn dispatch(&mut self, msg: Msg) {
        match msg {
            Msg::Register { sink } => self.register(sink),
            Msg::Deregister { cif } => self.deregister(cif),
            Msg::Open {
                cif,
                peer,
                link,
                direct,
            } => self.open(cif, peer, link, direct),
            Msg::CancelOpen { cif, peer, direct } => self.cancel_open(cif, peer, direct),
            Msg::Close { conn } => self.close(conn),
            Msg::Refresh { peer } => self.refresh(peer),
            Msg::Search { conn, uuid } => self.search(conn, uuid),
            Msg::ReadChar { conn, handle, auth } => {
                self.command(conn, Command::ReadChar { handle, auth });
            }
            Msg::ReadDescr { conn, handle, auth } => {
                self.command(conn, Command::ReadDescr { handle, auth });
            }
            Msg::ReadMultiple {
                conn,
                handles,
                auth,
            } => {
                let handles = SmallVec::from_vec(handles);
                self.command(conn, Command::ReadMultiple { handles, auth });
            }
            Msg::WriteChar {
                conn,
                handle,
                typ,
                value,
                auth,
            } => self.command(
                conn,
                Command::WriteChar {
                    handle,
                    typ,
                    value,
                    auth,
                },
            ),
            Msg::WriteDescr {
                conn,
                handle,
                value,
                auth,
            } => self.command(
                conn,
                Command::WriteDescr {
                    handle,
                    value,
                    auth,
                },
            ),
            Msg::PrepareWrite {
                conn,
                handle,
                offset,
                value,
                auth,
            } => self.command(
                conn,
                Command::PrepareWrite {
                    handle,
                    offset,
                    value,
                    auth,
                },
            ),
            Msg::ExecuteWrite { conn, execute } => {
                self.command(conn, Command::ExecuteWrite { execute });
            }
            Msg::ConfigureMtu { conn, mtu } => self.command(conn, Command::ConfigureMtu { mtu }),
            Msg::Confirm { conn, handle } => self.tr.confirm(conn, handle),
            Msg::RegisterNotify { cif, peer, handle } => self.register_notify(cif, peer, handle),
            Msg::DeregisterNotify { cif, peer, handle } => {
                self.deregister_notify(cif, peer, handle);
            }
            Msg::Listen { cif, start } => self.listen(cif, start),
            Msg::LinkUp {
                iface,
                peer,
                conn,
                link,
            } => self.link_up(iface, peer, conn, link),
            Msg::LinkDown {
                iface,
                peer,
                conn,
                link,
                reason,
            } => self.link_down(iface, peer, conn, link, reason),
            Msg::EncryptionComplete { iface, peer } => {
                if let Some(cif) = self.rcb_by_iface(iface) {
                    self.send(cif, Event::EncryptionComplete {
                        cif: ClientIf(cif),
                        peer,
                    });
                }
            }
            Msg::Congest { conn, congested } => self.congest(conn, congested),
            Msg::DiscResult { conn, rec } => self.disc_result(conn, rec),
            Msg::DiscComplete { conn, kind, status } => self.disc_complete(conn, kind, status),
            Msg::OpComplete {
                conn,
                op,
                status,
                value,
            } => self.op_complete(conn, op, status, value),
            Msg::Notify {
                conn,
                handle,
                value,
                indication,
            } => self.process_notify(conn, handle, value, indication),
            Msg::StoreOpened { conn, status } => self.store_opened(conn, status),
            Msg::StoreLoaded { conn, status, recs } => self.store_loaded(conn, status, recs),
            Msg::StoreSaved { conn, status } => self.store_saved(conn, status),
            Msg::CccTick { srcb } => self.ccc_tick(srcb),
            // Consumed by the message pump.
            Msg::Shutdown => {}
        }
    }

    // Lookup helpers

    pub(super) fn send(&self, cif: Slot, evt: Event) {
        match self.rcb.get(cif) {
            Some(r) => r.sink.event(evt),
            None => warn!("Event for unknown registration dropped: {evt:?}"),
        }
    }

    pub(super) fn rcb_by_iface(&self, iface: Iface) -> Option<Slot> {
        self.rcb.find(|r| r.iface == iface)
    }

    pub(super) fn clcb_by_conn(&self, conn: ConnId) -> Option<Slot> {
        self.clcb.find(|c| c.conn == Some(conn))
    }

    pub(super) fn clcb_by_pair(&self, cif: Slot, peer: Addr) -> Option<Slot> {
        self.clcb.find(|c| c.cif == cif && c.peer == peer)
    }

    /// Finds or allocates the server record for `peer`, stealing a
    /// disconnected unreferenced slot if the table is full.
    pub(super) fn alloc_srcb(&mut self, peer: Addr) -> Option<Slot> {
        if let Some(s) = self.srcb.find(|v| v.peer == peer) {
            return Some(s);
        }
        if let Some(s) = self.srcb.alloc(Srcb::new(peer)) {
            return Some(s);
        }
        let victim = (self.srcb).find(|v| !v.connected && v.num_clcb == 0)?;
        debug!("Recycling server record {victim:?} for {peer}");
        self.srcb.free(victim);
        self.srcb.alloc(Srcb::new(peer))
    }

    // Registration

    fn register(&mut self, sink: Arc<dyn EventSink>) {
        let Some(iface) = self.tr.register() else {
            sink.event(Event::Register {
                status: Status::NoResources,
                cif: None,
            });
            return;
        };
        let rcb = Rcb {
            iface,
            sink: Arc::clone(&sink),
            notif: SmallVec::new(),
            dereg_pending: false,
        };
        match self.rcb.alloc(rcb) {
            Some(s) => sink.event(Event::Register {
                status: Status::Ok,
                cif: Some(ClientIf(s)),
            }),
            None => {
                self.tr.deregister(iface);
                sink.event(Event::Register {
                    status: Status::NoResources,
                    cif: None,
                });
            }
        }
    }

    fn deregister(&mut self, cif: ClientIf) {
        let Some(rcb) = self.rcb.get_mut(cif.0) else {
            warn!("Deregister for unknown {cif:?}");
            return;
        };
        rcb.dereg_pending = true;
        let iface = rcb.iface;
        let owned: Vec<Slot> = (self.clcb.iter())
            .filter(|(_, c)| c.cif == cif.0)
            .map(|(id, _)| id)
            .collect();
        for id in owned {
            match self.clcb.get(id).map(|c| (c.state, c.peer)) {
                Some((SessionState::WaitConn, peer)) => {
                    // Withdraw the outstanding direct connect before
                    // releasing the session.
                    self.tr.cancel_connect(iface, peer, true);
                    self.cancel_session(id);
                }
                Some(_) => self.close_session(id, Status::Ok),
                None => {}
            }
        }
        self.try_finish_dereg(cif.0);
    }

    /// Completes a pending deregistration once the registration owns no
    /// sessions.
    pub(super) fn try_finish_dereg(&mut self, cif: Slot) {
        let pending = self.rcb.get(cif).is_some_and(|r| r.dereg_pending);
        if !pending || self.clcb.find(|c| c.cif == cif).is_some() {
            return;
        }
        if let Some(rcb) = self.rcb.free(cif) {
            self.tr.deregister(rcb.iface);
            self.bg.clear(cif);
            rcb.sink.event(Event::Deregister {
                cif: ClientIf(cif),
                status: Status::Ok,
            });
        }
    }

    // Session open/close

    fn open(&mut self, cif: ClientIf, peer: Addr, link: LinkType, direct: bool) {
        let Some(rcb) = self.rcb.get(cif.0) else {
            warn!("Open from unknown {cif:?}");
            return;
        };
        let iface = rcb.iface;
        let fail = |e: &Self, status: Status| {
            e.send(cif.0, Event::Open {
                cif,
                status,
                conn: None,
                peer,
                mtu: 0,
            });
        };
        if !direct {
            // Passive connect: interest bit plus a lower-layer hold. The
            // session is allocated when the link actually comes up.
            if !self.bg.mark(cif.0, Some(peer), false, true) {
                fail(self, Status::NoResources);
                return;
            }
            if !self.tr.connect(iface, peer, link, false) {
                self.bg.mark(cif.0, Some(peer), false, false);
                fail(self, Status::Error);
            }
            return;
        }
        if let Some(id) = self.clcb_by_pair(cif.0, peer) {
            let conn = self.clcb.get(id).and_then(|c| c.conn);
            self.send(cif.0, Event::Open {
                cif,
                status: Status::AlreadyOpen,
                conn,
                peer,
                mtu: 0,
            });
            return;
        }
        let Some(srcb) = self.alloc_srcb(peer) else {
            fail(self, Status::NoResources);
            return;
        };
        let Some(id) = self.clcb.alloc(Clcb::new(cif.0, srcb, peer, link)) else {
            fail(self, Status::NoResources);
            return;
        };
        if let Some(s) = self.srcb.get_mut(srcb) {
            s.num_clcb += 1;
        }
        if !self.tr.connect(iface, peer, link, true) {
            self.dealloc_clcb(id);
            fail(self, Status::Error);
            return;
        }
        // The peer may already be link-connected on this interface.
        if let Some(conn) = self.tr.conn_id(iface, peer, link) {
            self.link_ready(id, conn);
        }
    }

    fn cancel_open(&mut self, cif: ClientIf, peer: Addr, direct: bool) {
        if self.rcb.get(cif.0).is_none() {
            warn!("CancelOpen from unknown {cif:?}");
            return;
        }
        let iface = match self.rcb.get(cif.0) {
            Some(r) => r.iface,
            None => return,
        };
        let ok = if direct {
            match self.clcb_by_pair(cif.0, peer) {
                Some(id) if self.clcb.get(id).is_some_and(|c| c.state == SessionState::WaitConn) => {
                    let ok = self.tr.cancel_connect(iface, peer, true);
                    if ok {
                        self.cancel_session(id);
                    }
                    ok
                }
                // Only meaningful before the link comes up.
                _ => false,
            }
        } else {
            let had = self.bg.is_marked(cif.0, peer);
            self.bg.mark(cif.0, Some(peer), false, false);
            had && self.tr.cancel_connect(iface, peer, false)
        };
        self.send(cif.0, Event::CancelOpen {
            cif,
            status: if ok { Status::Ok } else { Status::Error },
        });
    }

    /// Tears down a session whose link never came up, completing its open
    /// with `Cancel`.
    fn cancel_session(&mut self, id: Slot) {
        let Some(c) = self.clcb.get(id) else { return };
        let (cif, peer) = (c.cif, c.peer);
        self.send(cif, Event::Open {
            cif: ClientIf(cif),
            status: Status::Cancel,
            conn: None,
            peer,
            mtu: 0,
        });
        self.dealloc_clcb(id);
    }

    fn close(&mut self, conn: ConnId) {
        match self.clcb_by_conn(conn) {
            Some(id) => self.close_session(id, Status::Ok),
            None => warn!("Close for unknown {conn:?}"),
        }
    }

    /// Ordered close: flush owned commands with `Cancel`, report `Close`,
    /// ask the transport to drop the link, release the session.
    pub(super) fn close_session(&mut self, id: Slot, reason: Status) {
        let Some(c) = self.clcb.get_mut(id) else { return };
        let (cif, peer, conn) = (c.cif, c.peer, c.conn);
        let flushed = c.queue.flush();
        if let Some(conn) = conn {
            for cmd in &flushed {
                self.cmd_done(id, conn, cmd, Status::Cancel, None);
            }
            self.send(cif, Event::Close {
                cif: ClientIf(cif),
                conn,
                peer,
                reason,
            });
            self.tr.disconnect(conn);
        }
        self.dealloc_clcb(id);
    }

    /// Releases a session slot and the references it holds.
    pub(super) fn dealloc_clcb(&mut self, id: Slot) {
        let Some(c) = self.clcb.free(id) else { return };
        if let Some(conn) = c.conn {
            self.disc_session_lost(c.srcb, conn);
        }
        if let Some(s) = self.srcb.get_mut(c.srcb) {
            s.num_clcb = s.num_clcb.saturating_sub(1);
        }
        self.try_finish_dereg(c.cif);
    }

    // Link events

    fn link_up(&mut self, iface: Iface, peer: Addr, conn: ConnId, link: LinkType) {
        let Some(cif) = self.rcb_by_iface(iface) else {
            warn!("Link up for unknown interface {iface:?}");
            return;
        };
        self.send(cif, Event::Connect {
            cif: ClientIf(cif),
            conn,
            peer,
        });
        if let Some(s) = self.srcb.find(|v| v.peer == peer) {
            if let Some(srcb) = self.srcb.get_mut(s) {
                srcb.connected = true;
            }
        }
        if let Some(id) = self.clcb_by_pair(cif, peer) {
            if self.clcb.get(id).is_some_and(|c| c.state == SessionState::WaitConn) {
                self.link_ready(id, conn);
            }
            return;
        }
        // Unsolicited link: accept it if a background interest matches.
        if self.bg.accepts(cif, peer) {
            if let Some(id) = self.alloc_session(cif, peer, link) {
                self.link_ready(id, conn);
            }
        }
    }

    /// Allocates a session outside the direct-open path (background accept,
    /// listen, on-demand notification delivery).
    pub(super) fn alloc_session(&mut self, cif: Slot, peer: Addr, link: LinkType) -> Option<Slot> {
        let srcb = self.alloc_srcb(peer)?;
        let id = self.clcb.alloc(Clcb::new(cif, srcb, peer, link))?;
        if let Some(s) = self.srcb.get_mut(srcb) {
            s.num_clcb += 1;
        }
        Some(id)
    }

    /// Drives a session into the connected state and reports its open.
    pub(super) fn link_ready(&mut self, id: Slot, conn: ConnId) {
        let Some(c) = self.clcb.get_mut(id) else { return };
        c.conn = Some(conn);
        c.state = SessionState::Conn;
        let (cif, peer, srcb) = (c.cif, c.peer, c.srcb);
        let mtu = match self.srcb.get_mut(srcb) {
            Some(s) => {
                s.connected = true;
                s.mtu
            }
            None => 0,
        };
        self.send(cif, Event::Open {
            cif: ClientIf(cif),
            status: Status::Ok,
            conn: Some(conn),
            peer,
            mtu,
        });
        self.conn_ready(id, conn);
    }

    fn link_down(
        &mut self,
        iface: Iface,
        peer: Addr,
        conn: Option<ConnId>,
        _link: LinkType,
        reason: Status,
    ) {
        if let Some(cif) = self.rcb_by_iface(iface) {
            if let Some(conn) = conn {
                self.send(cif, Event::Disconnect {
                    cif: ClientIf(cif),
                    conn,
                    peer,
                    reason,
                });
            }
        }
        if let Some(s) = self.srcb.find(|v| v.peer == peer) {
            if self.srcb.get(s).is_some_and(|v| v.connected) {
                // The watchdog and any in-progress discovery die with the
                // link; the cache itself survives for the next connection.
                if let Some(conn) = conn {
                    self.disc_session_lost(s, conn);
                    self.ccc_link_down(s, conn);
                }
                let other = self
                    .clcb
                    .find(|c| c.peer == peer && c.conn.is_some() && c.conn != conn);
                if let Some(srcb) = self.srcb.get_mut(s) {
                    srcb.connected = other.is_some();
                }
            }
        }
        let id = match conn {
            Some(conn) => self.clcb_by_conn(conn),
            None => None,
        }
        .or_else(|| {
            let cif = self.rcb_by_iface(iface)?;
            let id = self.clcb_by_pair(cif, peer)?;
            (self.clcb.get(id)?.state == SessionState::WaitConn).then_some(id)
        });
        let Some(id) = id else { return };
        let Some(c) = self.clcb.get_mut(id) else { return };
        match c.state {
            SessionState::WaitConn => {
                let cif = c.cif;
                self.send(cif, Event::Open {
                    cif: ClientIf(cif),
                    status: if reason.is_ok() { Status::Error } else { reason },
                    conn: None,
                    peer,
                    mtu: 0,
                });
                self.dealloc_clcb(id);
            }
            SessionState::Conn | SessionState::Discover => {
                let (cif, flushed) = (c.cif, c.queue.flush());
                c.conn = None;
                if let Some(conn) = conn {
                    for cmd in &flushed {
                        self.cmd_done(id, conn, cmd, Status::Error, None);
                    }
                    self.send(cif, Event::Close {
                        cif: ClientIf(cif),
                        conn,
                        peer,
                        reason,
                    });
                }
                self.dealloc_clcb(id);
            }
        }
    }

    fn congest(&mut self, conn: ConnId, congested: bool) {
        let Some(id) = self.clcb_by_conn(conn) else { return };
        let Some(c) = self.clcb.get_mut(id) else { return };
        c.congested = congested;
        let cif = c.cif;
        self.send(cif, Event::Congested { conn, congested });
        if !congested {
            self.pump_queue(id);
        }
    }

    fn listen(&mut self, cif: ClientIf, start: bool) {
        let Some(rcb) = self.rcb.get(cif.0) else {
            warn!("Listen from unknown {cif:?}");
            return;
        };
        let iface = rcb.iface;
        if start && !self.bg.mark(cif.0, None, true, true) {
            self.send(cif.0, Event::Listen {
                cif,
                status: Status::NoResources,
            });
            return;
        }
        if !start {
            self.bg.mark(cif.0, None, true, false);
        }
        let ok = self.tr.listen(iface, start);
        self.send(cif.0, Event::Listen {
            cif,
            status: if ok { Status::Ok } else { Status::Error },
        });
        if !(start && ok) {
            return;
        }
        // Adopt peers that connected before listen was enabled.
        let peers: Vec<Addr> = (self.srcb.iter())
            .filter(|(_, s)| s.connected)
            .map(|(_, s)| s.peer)
            .collect();
        for peer in peers {
            if self.clcb_by_pair(cif.0, peer).is_some() {
                continue;
            }
            let Some(conn) = self.tr.conn_id(iface, peer, LinkType::Le) else {
                continue;
            };
            if let Some(id) = self.alloc_session(cif.0, peer, LinkType::Le) {
                self.link_ready(id, conn);
            }
        }
    }

    // Cache search

    fn search(&mut self, conn: ConnId, uuid: Option<Uuid>) {
        let Some(id) = self.clcb_by_conn(conn) else {
            warn!("Search for unknown {conn:?}");
            return;
        };
        let Some(c) = self.clcb.get(id) else { return };
        let cif = c.cif;
        let status = match c.state {
            SessionState::WaitConn => Status::WrongState,
            SessionState::Discover => Status::Busy,
            SessionState::Conn => match self.srcb.get(c.srcb).and_then(|s| s.cache.as_ref()) {
                Some(cache) => {
                    for svc in cache.services_filtered(uuid) {
                        self.send(cif, Event::SearchResult {
                            conn,
                            service: svc.into(),
                        });
                    }
                    Status::Ok
                }
                None => Status::Error,
            },
        };
        self.send(cif, Event::SearchComplete { conn, status });
    }

    // Command queue and dispatch

    fn command(&mut self, conn: ConnId, cmd: Command) {
        let Some(id) = self.clcb_by_conn(conn) else {
            warn!("Command for unknown {conn:?} dropped");
            return;
        };
        let Some(c) = self.clcb.get_mut(id) else { return };
        let cif = c.cif;
        match c.state {
            SessionState::WaitConn => {
                self.cmd_done(id, conn, &cmd, Status::WrongState, None);
                return;
            }
            SessionState::Conn => match c.queue.enqueue(cmd, c.congested) {
                Enqueue::Submit => {
                    self.submit(id);
                }
                Enqueue::Queued => {}
                Enqueue::Reject(_, Status::QueueFull) => {
                    self.send(cif, Event::QueueFull { conn });
                }
                Enqueue::Reject(cmd, status) => self.cmd_done(id, conn, &cmd, status, None),
            },
            SessionState::Discover => {
                c.defer = Defer::Reissue;
                match c.queue.enqueue(cmd, true) {
                    Enqueue::Queued | Enqueue::Submit => {}
                    Enqueue::Reject(_, Status::QueueFull) => {
                        self.send(cif, Event::QueueFull { conn });
                    }
                    Enqueue::Reject(cmd, status) => self.cmd_done(id, conn, &cmd, status, None),
                }
            }
        }
    }

    /// Submits the in-flight command to the transport. Returns `true` if it
    /// is now outstanding; a synchronous failure completes the command and
    /// returns `false`.
    pub(super) fn submit(&mut self, id: Slot) -> bool {
        let Some(c) = self.clcb.get(id) else { return false };
        let Some(conn) = c.conn else {
            if let Some(cmd) = self.clcb.get_mut(id).and_then(|c| c.queue.abort()) {
                debug!("Command without a link: {cmd:?}");
            }
            return false;
        };
        let Some(cmd) = c.queue.inflight() else {
            return true;
        };
        let cache = self.srcb.get(c.srcb).and_then(|s| s.cache.as_ref());
        let kind_of = |h| cache.and_then(|db| db.find(h)).map(|(_, a)| a.kind);
        let status = match *cmd {
            Command::ReadChar { handle, auth } => match kind_of(handle) {
                Some(AttrKind::Characteristic) => self.tr.read(conn, handle, auth),
                _ => Status::Error,
            },
            Command::ReadDescr { handle, auth } => match kind_of(handle) {
                Some(AttrKind::Descriptor) => self.tr.read(conn, handle, auth),
                _ => Status::Error,
            },
            Command::ReadMultiple { ref handles, auth } => {
                if handles.is_empty() {
                    Status::IllegalParameter
                } else if handles.iter().any(|&h| kind_of(h).is_none()) {
                    Status::Error
                } else {
                    self.tr.read_multiple(conn, handles, auth)
                }
            }
            Command::WriteChar {
                handle,
                typ,
                ref value,
                auth,
            } => match kind_of(handle) {
                Some(AttrKind::Characteristic) => self.tr.write(conn, typ, handle, value, auth),
                _ => Status::Error,
            },
            Command::WriteDescr {
                handle,
                ref value,
                auth,
            } => match kind_of(handle) {
                Some(AttrKind::Descriptor) => {
                    (self.tr).write(conn, crate::att::WriteType::Request, handle, value, auth)
                }
                _ => Status::Error,
            },
            Command::PrepareWrite {
                handle,
                offset,
                ref value,
                auth,
            } => match kind_of(handle) {
                Some(AttrKind::Characteristic | AttrKind::Descriptor) => {
                    self.tr.prepare_write(conn, handle, offset, value, auth)
                }
                _ => Status::Error,
            },
            Command::ExecuteWrite { execute } => self.tr.execute_write(conn, execute),
            Command::ConfigureMtu { mtu } => {
                if mtu < crate::client::DEFAULT_MTU {
                    Status::IllegalParameter
                } else {
                    self.tr.configure_mtu(conn, mtu)
                }
            }
            Command::WriteCcc { handle, value } => {
                let v = value.bits().to_le_bytes();
                match kind_of(handle) {
                    Some(AttrKind::Descriptor) => self.tr.write(
                        conn,
                        crate::att::WriteType::Request,
                        handle,
                        &v,
                        crate::att::AuthReq::None,
                    ),
                    _ => Status::Error,
                }
            }
        };
        if status.is_ok() {
            return true;
        }
        let Some(cmd) = self.clcb.get_mut(id).and_then(|c| c.queue.abort()) else {
            return false;
        };
        self.cmd_done(id, conn, &cmd, status, None);
        false
    }

    fn op_complete(
        &mut self,
        conn: ConnId,
        op: OpKind,
        mut status: Status,
        mut value: Option<OpValue>,
    ) {
        let Some(id) = self.clcb_by_conn(conn) else {
            warn!("Completion for unknown {conn:?} dropped");
            return;
        };
        let Some(c) = self.clcb.get(id) else { return };
        let srcb = c.srcb;
        // A pending service change makes any in-flight response stale: the
        // cache it was issued against is about to be rebuilt.
        let stale = op != OpKind::ConfigMtu
            && self.srcb.get(srcb).is_some_and(|s| s.srvc_chg);
        if stale {
            debug!("Discarding stale {op:?} response on {conn:?}");
            status = Status::Error;
            value = None;
        }
        let Some(c) = self.clcb.get_mut(id) else { return };
        match c.queue.finish(op) {
            Finish::Idle => {
                warn!("Unexpected {op:?} completion on {conn:?} dropped");
                return;
            }
            Finish::Mismatch => {
                warn!("Mismatched {op:?} completion on {conn:?} dropped");
                return;
            }
            Finish::Done(cmd) => {
                if let (true, Some(&OpValue::Mtu { mtu })) = (status.is_ok(), value.as_ref()) {
                    if let Some(s) = self.srcb.get_mut(srcb) {
                        s.mtu = mtu;
                    }
                }
                self.cmd_done(id, conn, &cmd, status, value);
            }
        }
        // A rediscovery deferred behind this command runs before anything
        // else queued on the session.
        let deferred_disc = self.clcb.get(id).is_some_and(|c| {
            c.defer == Defer::Discovery && c.queue.inflight().is_none()
        });
        if deferred_disc {
            if let Some(c) = self.clcb.get_mut(id) {
                c.defer = Defer::None;
            }
            self.start_discovery(srcb, conn);
            return;
        }
        self.pump_queue(id);
    }

    /// Resubmits queued commands until one is outstanding or the queue
    /// drains.
    pub(super) fn pump_queue(&mut self, id: Slot) {
        loop {
            let Some(c) = self.clcb.get_mut(id) else { return };
            if c.state != SessionState::Conn || c.congested || c.queue.advance().is_none() {
                return;
            }
            if self.submit(id) {
                return;
            }
        }
    }

    /// Translates a completed command into its application-facing event.
    /// The event kind follows the originating API call, not the response
    /// opcode.
    pub(super) fn cmd_done(
        &mut self,
        id: Slot,
        conn: ConnId,
        cmd: &Command,
        status: Status,
        value: Option<OpValue>,
    ) {
        let Some(c) = self.clcb.get(id) else { return };
        let (cif, srcb) = (c.cif, c.srcb);
        let read_value = || match value {
            Some(OpValue::Read { ref value, .. }) if status.is_ok() => value.clone(),
            _ => Vec::new(),
        };
        let evt = match *cmd {
            Command::ReadChar { handle, .. } => Event::ReadChar {
                conn,
                status,
                handle,
                value: read_value(),
            },
            Command::ReadDescr { handle, .. } => Event::ReadDescr {
                conn,
                status,
                handle,
                value: read_value(),
            },
            Command::ReadMultiple { .. } => Event::ReadMultiple {
                conn,
                status,
                value: read_value(),
            },
            Command::WriteChar { handle, .. } => Event::WriteChar {
                conn,
                status,
                handle,
            },
            Command::WriteDescr { handle, .. } => Event::WriteDescr {
                conn,
                status,
                handle,
            },
            Command::PrepareWrite { handle, .. } => Event::PrepareWrite {
                conn,
                status,
                handle,
            },
            Command::ExecuteWrite { .. } => Event::ExecuteWrite { conn, status },
            Command::ConfigureMtu { .. } => Event::ConfigureMtu {
                conn,
                status,
                mtu: self.srcb.get(srcb).map_or(0, |s| s.mtu),
            },
            Command::WriteCcc { .. } => {
                self.ccc_write_done(srcb, status);
                return;
            }
        };
        self.send(cif, evt);
    }
}
