//! Per-peer server records, service discovery, and cache persistence.
//!
//! One [`Srcb`] exists per peer device and owns the attribute cache, the
//! discovery state machine, and the storage handshake. All sessions to the
//! same peer share it.

use std::collections::VecDeque;
use std::mem;

use tracing::{debug, warn};

use crate::att::{Handle, HandleRange, Prop, Status};
use crate::cache::{AttrKind, Cache, CacheBuilder, CacheRecord};
use crate::client::notify::CccWatch;
use crate::client::session::{Defer, SessionState};
use crate::client::{Engine, DEFAULT_MTU};
use crate::le::{Addr, LinkType};
use crate::transport::{ConnId, DiscKind, DiscRecord};
use crate::util::Slot;
use crate::uuid::Uuid;

/// Per-peer server record.
pub(super) struct Srcb {
    pub peer: Addr,
    pub connected: bool,
    pub mtu: u16,
    /// Sessions currently referencing this record.
    pub num_clcb: u8,
    pub cache: Option<Cache>,
    pub state: SrvState,
    /// Connection driving the current load or discovery.
    pub disc_conn: Option<ConnId>,
    /// A rediscovery was requested while the record was busy.
    pub disc_pending: bool,
    /// Service-changed indication received; the cache is stale.
    pub srvc_chg: bool,
    /// Applications notified of the pending service change so far.
    pub update_count: u8,
    pub save: Option<SaveJob>,
    pub ccc: Option<CccWatch>,
}

impl Srcb {
    pub fn new(peer: Addr) -> Self {
        Self {
            peer,
            connected: false,
            mtu: DEFAULT_MTU,
            num_clcb: 0,
            cache: None,
            state: SrvState::Idle,
            disc_conn: None,
            disc_pending: false,
            srvc_chg: false,
            update_count: 0,
            save: None,
            ccc: None,
        }
    }
}

/// Cache lifecycle of a server record.
pub(super) enum SrvState {
    /// No cache and nothing in progress.
    Idle,
    /// Waiting for the store to open for reading.
    LoadOpen,
    /// Reading persisted records, `index` batches consumed so far.
    Load { index: u16, builder: CacheBuilder },
    /// Walking the peer's attribute table.
    Discover(Explore),
    /// Cache valid and usable.
    On,
}

/// In-progress chunked write of a freshly built cache.
pub(super) struct SaveJob {
    pub conn: ConnId,
    pub recs: Vec<CacheRecord>,
    pub index: usize,
    pub opened: bool,
}

/// Discovery explore loop state. Services are visited one at a time:
/// includes, then characteristic declarations, then one descriptor range
/// per characteristic.
pub(super) struct Explore {
    svcs: Vec<PendingService>,
    cur: usize,
    phase: Phase,
    builder: CacheBuilder,
    chars: Vec<CharDecl>,
    dranges: VecDeque<HandleRange>,
    failed: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Primary,
    Included,
    Chars,
    Descrs,
}

struct PendingService {
    uuid: Uuid,
    range: HandleRange,
    primary: bool,
}

struct CharDecl {
    decl: Handle,
    value: Handle,
    prop: Prop,
    uuid: Uuid,
}

/// Next action after one discovery request completes.
pub(super) enum Step {
    Req(DiscKind, HandleRange),
    Done,
    Fail,
}

impl Explore {
    fn new() -> Self {
        Self {
            svcs: Vec::new(),
            cur: 0,
            phase: Phase::Primary,
            builder: CacheBuilder::new(),
            chars: Vec::new(),
            dranges: VecDeque::new(),
            failed: false,
        }
    }

    fn known(&self, range: HandleRange) -> bool {
        self.svcs.iter().any(|p| p.range == range) || self.builder.has_service(range)
    }

    /// Folds one discovery record into the current phase.
    fn collect(&mut self, rec: DiscRecord) {
        match (self.phase, rec) {
            (Phase::Primary, DiscRecord::Service { range, uuid }) => {
                if self.svcs.len() < CacheBuilder::MAX_SERVICES {
                    self.svcs.push(PendingService {
                        uuid,
                        range,
                        primary: true,
                    });
                } else {
                    warn!("Service table full, aborting discovery");
                    self.failed = true;
                }
            }
            (Phase::Included, DiscRecord::Included { handle, range, uuid }) => {
                if (self.builder)
                    .attr(AttrKind::Include, uuid, handle, Prop::empty())
                    .is_err()
                {
                    self.failed = true;
                }
                // An included service not reported as primary still gets
                // explored and cached.
                if !self.known(range) {
                    if self.svcs.len() < CacheBuilder::MAX_SERVICES {
                        self.svcs.push(PendingService {
                            uuid,
                            range,
                            primary: false,
                        });
                    } else {
                        warn!("Service table full, aborting discovery");
                        self.failed = true;
                    }
                }
            }
            (
                Phase::Chars,
                DiscRecord::Characteristic {
                    decl,
                    value,
                    prop,
                    uuid,
                },
            ) => self.chars.push(CharDecl {
                decl,
                value,
                prop,
                uuid,
            }),
            (Phase::Descrs, DiscRecord::Descriptor { handle, uuid }) => {
                if (self.builder)
                    .attr(AttrKind::Descriptor, uuid, handle, Prop::empty())
                    .is_err()
                {
                    self.failed = true;
                }
            }
            (phase, rec) => {
                warn!("Discovery record out of phase ({phase:?}): {rec:?}");
                self.failed = true;
            }
        }
    }

    /// Advances past a completed request of the given kind.
    fn advance(&mut self, kind: DiscKind) -> Step {
        if self.failed || kind != self.expected() {
            return Step::Fail;
        }
        match self.phase {
            Phase::Primary => {
                if self.svcs.is_empty() {
                    return Step::Done;
                }
                self.begin_service()
            }
            Phase::Included => {
                self.phase = Phase::Chars;
                Step::Req(DiscKind::Characteristics, self.svcs[self.cur].range)
            }
            Phase::Chars => {
                if !self.seal_chars() {
                    return Step::Fail;
                }
                self.phase = Phase::Descrs;
                self.next_descr_range()
            }
            Phase::Descrs => self.next_descr_range(),
        }
    }

    fn expected(&self) -> DiscKind {
        match self.phase {
            Phase::Primary => DiscKind::Primary,
            Phase::Included => DiscKind::Included,
            Phase::Chars => DiscKind::Characteristics,
            Phase::Descrs => DiscKind::Descriptors,
        }
    }

    fn begin_service(&mut self) -> Step {
        let p = &self.svcs[self.cur];
        if (self.builder).service(p.uuid, p.range, p.primary).is_err() {
            return Step::Fail;
        }
        self.chars.clear();
        self.dranges.clear();
        self.phase = Phase::Included;
        Step::Req(DiscKind::Included, p.range)
    }

    /// Commits the collected characteristic declarations and derives the
    /// descriptor ranges between them.
    fn seal_chars(&mut self) -> bool {
        self.chars.sort_by_key(|c| c.decl);
        let end = self.svcs[self.cur].range.end();
        for i in 0..self.chars.len() {
            let c = &self.chars[i];
            if (self.builder)
                .attr(AttrKind::Characteristic, c.uuid, c.value, c.prop)
                .is_err()
            {
                return false;
            }
            let Some(start) = c.value.next() else { continue };
            let last = match self.chars.get(i + 1) {
                Some(n) => match n.decl.prev() {
                    Some(h) => h,
                    None => continue,
                },
                None => end,
            };
            if start <= last {
                self.dranges.push_back(HandleRange::new(start, last));
            }
        }
        true
    }

    fn next_descr_range(&mut self) -> Step {
        if let Some(r) = self.dranges.pop_front() {
            return Step::Req(DiscKind::Descriptors, r);
        }
        self.cur += 1;
        if self.cur < self.svcs.len() {
            self.begin_service()
        } else {
            Step::Done
        }
    }
}

impl Engine {
    /// Runs when a session reaches the connected state: start or join the
    /// cache load, or go straight to ready.
    pub(super) fn conn_ready(&mut self, id: Slot, conn: ConnId) {
        let Some(c) = self.clcb.get(id) else { return };
        let (s, link) = (c.srcb, c.link);
        match self.srcb.get(s).map(|v| &v.state) {
            Some(SrvState::On) => self.pump_queue(id),
            Some(SrvState::Idle) => {
                let peer = match self.srcb.get_mut(s) {
                    Some(v) => {
                        v.state = SrvState::LoadOpen;
                        v.disc_conn = Some(conn);
                        v.peer
                    }
                    None => return,
                };
                if let Some(c) = self.clcb.get_mut(id) {
                    c.state = SessionState::Discover;
                }
                self.store.open(conn, peer, false);
            }
            Some(_) => {
                // Load or discovery already running; wait for it.
                if let Some(c) = self.clcb.get_mut(id) {
                    c.state = SessionState::Discover;
                }
            }
            None => return,
        }
        if link == LinkType::Le {
            self.arm_ccc(s, conn);
        }
    }

    // Storage handshake

    pub(super) fn store_opened(&mut self, conn: ConnId, status: Status) {
        if let Some(s) = (self.srcb).find(|v| {
            v.save.as_ref().is_some_and(|j| j.conn == conn && !j.opened)
        }) {
            if status.is_ok() {
                if let Some(j) = self.srcb.get_mut(s).and_then(|v| v.save.as_mut()) {
                    j.opened = true;
                }
                self.save_chunk(s);
            } else {
                warn!("Cache store open for write failed: {status}");
                if let Some(v) = self.srcb.get_mut(s) {
                    v.save = None;
                }
                self.resume_pending(s);
            }
            return;
        }
        let Some(s) = (self.srcb)
            .find(|v| v.disc_conn == Some(conn) && matches!(v.state, SrvState::LoadOpen))
        else {
            warn!("Store open completion for unknown {conn:?} dropped");
            return;
        };
        if status.is_ok() {
            let peer = match self.srcb.get_mut(s) {
                Some(v) => {
                    v.state = SrvState::Load {
                        index: 0,
                        builder: CacheBuilder::new(),
                    };
                    v.peer
                }
                None => return,
            };
            self.store.load(conn, peer, 0);
        } else {
            // No persisted cache; fall back to live discovery.
            self.start_discover_now(s, conn);
        }
    }

    pub(super) fn store_loaded(&mut self, conn: ConnId, status: Status, recs: Vec<CacheRecord>) {
        let Some(s) = (self.srcb)
            .find(|v| v.disc_conn == Some(conn) && matches!(v.state, SrvState::Load { .. }))
        else {
            warn!("Store load completion for unknown {conn:?} dropped");
            return;
        };
        let Some(srcb) = self.srcb.get_mut(s) else { return };
        let peer = srcb.peer;
        if !matches!(status, Status::Ok | Status::More) {
            self.store.close(conn, peer);
            self.start_discover_now(s, conn);
            return;
        }
        let SrvState::Load { index, mut builder } =
            mem::replace(&mut srcb.state, SrvState::Idle)
        else {
            return;
        };
        if builder.records(&recs).is_err() {
            warn!("Persisted cache for {peer} is invalid, rediscovering");
            self.store.close(conn, peer);
            self.start_discover_now(s, conn);
            return;
        }
        if status == Status::More {
            #[allow(clippy::cast_possible_truncation)]
            let index = index + recs.len() as u16;
            srcb.state = SrvState::Load { index, builder };
            self.store.load(conn, peer, index);
            return;
        }
        match builder.finish() {
            Ok(cache) => {
                debug!("Loaded {} cached services for {peer}", cache.services().len());
                srcb.cache = Some(cache);
                srcb.state = SrvState::On;
                self.store.close(conn, peer);
                self.discovery_done(s, Status::Ok);
            }
            Err(e) => {
                warn!("Persisted cache for {peer} is invalid ({e}), rediscovering");
                self.store.close(conn, peer);
                self.start_discover_now(s, conn);
            }
        }
    }

    pub(super) fn store_saved(&mut self, conn: ConnId, status: Status) {
        let Some(s) = (self.srcb)
            .find(|v| v.save.as_ref().is_some_and(|j| j.conn == conn && j.opened))
        else {
            warn!("Store save completion for unknown {conn:?} dropped");
            return;
        };
        if !status.is_ok() {
            // The in-memory cache stays valid; only persistence is lost.
            warn!("Cache save failed: {status}");
            self.finish_save(s, conn);
            return;
        }
        let more = match self.srcb.get_mut(s).and_then(|v| v.save.as_mut()) {
            Some(j) => {
                j.index = (j.index + crate::store::BATCH_RECORDS).min(j.recs.len());
                j.index < j.recs.len()
            }
            None => return,
        };
        if more {
            self.save_chunk(s);
        } else {
            self.finish_save(s, conn);
        }
    }

    fn save_chunk(&mut self, s: Slot) {
        let Some(srcb) = self.srcb.get(s) else { return };
        let peer = srcb.peer;
        let Some(j) = srcb.save.as_ref() else { return };
        let end = (j.index + crate::store::BATCH_RECORDS).min(j.recs.len());
        let chunk = j.recs[j.index..end].to_vec();
        #[allow(clippy::cast_possible_truncation)]
        let index = j.index as u16;
        self.store.save(j.conn, peer, index, chunk, end == j.recs.len());
    }

    fn finish_save(&mut self, s: Slot, conn: ConnId) {
        let peer = match self.srcb.get_mut(s) {
            Some(v) => {
                v.save = None;
                v.peer
            }
            None => return,
        };
        self.store.close(conn, peer);
        self.resume_pending(s);
    }

    // Discovery

    /// Requests a cache rebuild over `conn`, deferring while a load,
    /// discovery, or save is already running on the record.
    pub(super) fn start_discovery(&mut self, s: Slot, conn: ConnId) {
        let Some(srcb) = self.srcb.get_mut(s) else { return };
        let busy = !matches!(srcb.state, SrvState::Idle | SrvState::On) || srcb.save.is_some();
        if busy {
            srcb.disc_pending = true;
            return;
        }
        self.start_discover_now(s, conn);
    }

    fn start_discover_now(&mut self, s: Slot, conn: ConnId) {
        let peer = match self.srcb.get_mut(s) {
            Some(v) => {
                v.cache = None;
                v.srvc_chg = false;
                v.update_count = 0;
                v.disc_conn = Some(conn);
                v.state = SrvState::Discover(Explore::new());
                v.peer
            }
            None => return,
        };
        debug!("Starting service discovery for {peer}");
        let parked: Vec<Slot> = (self.clcb.iter())
            .filter(|(_, c)| c.srcb == s && c.state == SessionState::Conn)
            .map(|(id, _)| id)
            .collect();
        for id in parked {
            if let Some(c) = self.clcb.get_mut(id) {
                c.state = SessionState::Discover;
            }
        }
        let st = self.tr.discover(conn, DiscKind::Primary, HandleRange::ALL);
        if !st.is_ok() {
            self.disc_failed(s);
        }
    }

    pub(super) fn disc_result(&mut self, conn: ConnId, rec: DiscRecord) {
        let Some(s) = self.srcb.find(|v| v.disc_conn == Some(conn)) else {
            warn!("Discovery record for unknown {conn:?} dropped");
            return;
        };
        let Some(srcb) = self.srcb.get_mut(s) else { return };
        match srcb.state {
            SrvState::Discover(ref mut ex) => ex.collect(rec),
            _ => warn!("Discovery record outside discovery dropped"),
        }
    }

    pub(super) fn disc_complete(&mut self, conn: ConnId, kind: DiscKind, status: Status) {
        let Some(s) = (self.srcb)
            .find(|v| v.disc_conn == Some(conn) && matches!(v.state, SrvState::Discover(_)))
        else {
            warn!("Discovery completion for unknown {conn:?} dropped");
            return;
        };
        if !status.is_ok() {
            self.disc_failed(s);
            return;
        }
        let step = match self.srcb.get_mut(s) {
            Some(Srcb {
                state: SrvState::Discover(ex),
                ..
            }) => ex.advance(kind),
            _ => return,
        };
        match step {
            Step::Req(kind, range) => {
                let st = self.tr.discover(conn, kind, range);
                if !st.is_ok() {
                    self.disc_failed(s);
                }
            }
            Step::Done => self.finish_discovery(s, conn),
            Step::Fail => self.disc_failed(s),
        }
    }

    fn finish_discovery(&mut self, s: Slot, conn: ConnId) {
        let Some(srcb) = self.srcb.get_mut(s) else { return };
        let peer = srcb.peer;
        let SrvState::Discover(ex) = mem::replace(&mut srcb.state, SrvState::Idle) else {
            return;
        };
        match ex.builder.finish() {
            Ok(cache) => {
                debug!("Discovered {} services for {peer}", cache.services().len());
                let recs = cache.to_records();
                srcb.cache = Some(cache);
                srcb.state = SrvState::On;
                srcb.disc_conn = None;
                if recs.is_empty() {
                    self.store.reset(peer);
                } else {
                    srcb.save = Some(SaveJob {
                        conn,
                        recs,
                        index: 0,
                        opened: false,
                    });
                    self.store.open(conn, peer, true);
                }
                self.discovery_done(s, Status::Ok);
            }
            Err(e) => {
                warn!("Discovered attribute table for {peer} is invalid: {e}");
                self.disc_failed(s);
            }
        }
    }

    fn disc_failed(&mut self, s: Slot) {
        let peer = match self.srcb.get_mut(s) {
            Some(v) => {
                v.state = SrvState::Idle;
                v.cache = None;
                v.disc_conn = None;
                v.peer
            }
            None => return,
        };
        warn!("Service discovery failed for {peer}");
        self.store.reset(peer);
        self.discovery_done(s, Status::Error);
    }

    /// Releases sessions parked behind a load or discovery and resumes
    /// their queued commands.
    fn discovery_done(&mut self, s: Slot, _status: Status) {
        let parked: Vec<Slot> = (self.clcb.iter())
            .filter(|(_, c)| c.srcb == s && c.state == SessionState::Discover)
            .map(|(id, _)| id)
            .collect();
        for id in parked {
            if let Some(c) = self.clcb.get_mut(id) {
                c.state = SessionState::Conn;
                c.defer = Defer::None;
            }
            self.pump_queue(id);
        }
        if self.srcb.get(s).is_some_and(|v| v.ccc.is_some()) {
            self.ccc_poll(s);
        }
        self.resume_pending(s);
    }

    fn resume_pending(&mut self, s: Slot) {
        let pending = match self.srcb.get_mut(s) {
            Some(v) if v.disc_pending => {
                v.disc_pending = false;
                true
            }
            _ => false,
        };
        if !pending {
            return;
        }
        let conn = (self.clcb.iter())
            .find(|(_, c)| c.srcb == s && c.conn.is_some())
            .and_then(|(_, c)| c.conn);
        if let Some(conn) = conn {
            self.start_discovery(s, conn);
        }
    }

    /// Called when a connection that was driving this record's load,
    /// discovery, or save goes away.
    pub(super) fn disc_session_lost(&mut self, s: Slot, conn: ConnId) {
        let peer = match self.srcb.get(s) {
            Some(v) => v.peer,
            None => return,
        };
        let save_opened = (self.srcb.get(s))
            .and_then(|v| v.save.as_ref())
            .filter(|j| j.conn == conn)
            .map(|j| j.opened);
        if let Some(opened) = save_opened {
            if let Some(v) = self.srcb.get_mut(s) {
                v.save = None;
            }
            if opened {
                self.store.close(conn, peer);
            }
        }
        if self.srcb.get(s).is_some_and(|v| v.disc_conn != Some(conn)) {
            return;
        }
        let Some(srcb) = self.srcb.get_mut(s) else { return };
        match srcb.state {
            SrvState::LoadOpen | SrvState::Load { .. } => {
                srcb.state = SrvState::Idle;
                srcb.disc_conn = None;
                self.store.close(conn, peer);
                self.discovery_done(s, Status::Error);
            }
            SrvState::Discover(_) => self.disc_failed(s),
            _ => srcb.disc_conn = None,
        }
    }

    // Refresh

    /// Discards any cached state for `peer`. A connected peer is
    /// rediscovered in place; a disconnected or unknown one just has its
    /// persisted copy erased.
    pub(super) fn refresh(&mut self, peer: Addr) {
        let Some(s) = self.srcb.find(|v| v.peer == peer) else {
            self.store.reset(peer);
            return;
        };
        if self.srcb.get(s).is_some_and(|v| v.connected) {
            let conn = (self.clcb.iter())
                .find(|(_, c)| c.srcb == s && c.conn.is_some())
                .and_then(|(_, c)| c.conn);
            if let Some(conn) = conn {
                self.start_discovery(s, conn);
                return;
            }
        }
        if let Some(v) = self.srcb.get_mut(s) {
            v.cache = None;
            v.state = SrvState::Idle;
        }
        self.store.reset(peer);
    }
}
