use std::mem;
use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::att::{AuthReq, Handle, HandleRange, OpKind, Prop, Status, WriteType};
use crate::cache::{CacheRecord, RecKind};
use crate::le::{Addr, LinkType, RawAddr};
use crate::store::CacheStore;
use crate::transport::{ConnId, DiscKind, DiscRecord, Iface, OpValue, Transport};
use crate::uuid::{Uuid, Uuid16};

use super::*;

const PEER: Addr = Addr::Public(RawAddr::from_le_bytes([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]));

fn h(v: u16) -> Handle {
    Handle::new(v).unwrap()
}

fn r(a: u16, b: u16) -> HandleRange {
    HandleRange::new(h(a), h(b))
}

fn cid(v: u16) -> ConnId {
    ConnId::new(v).unwrap()
}

fn ifc(v: u8) -> Iface {
    Iface::new(v).unwrap()
}

fn u(v: u16) -> Uuid {
    Uuid16::new(v).unwrap().as_uuid()
}

fn rec(kind: RecKind, handle: u16, end: u16, uuid: u16) -> CacheRecord {
    CacheRecord {
        kind,
        handle: h(handle),
        end: h(end),
        inst: 0,
        uuid: u(uuid),
        prop: Prop::READ,
        primary: true,
    }
}

/// Transport calls recorded by the fake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum Call {
    Register,
    Deregister(Iface),
    Connect { iface: Iface, direct: bool },
    CancelConnect { direct: bool },
    Disconnect(ConnId),
    Listen { start: bool },
    Discover { kind: DiscKind, range: HandleRange },
    Read { conn: ConnId, handle: Handle },
    ReadMultiple { conn: ConnId, n: usize },
    Write { conn: ConnId, handle: Handle, value: Vec<u8> },
    PrepareWrite { handle: Handle, offset: u16 },
    ExecuteWrite { execute: bool },
    ConfigureMtu { mtu: u16 },
    Confirm { conn: ConnId, handle: Handle },
}

#[derive(Default)]
pub(super) struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    next_iface: Mutex<u8>,
    conns: Mutex<Vec<(Iface, Addr, ConnId)>>,
    fail_connect: Mutex<bool>,
    op_status: Mutex<Status>,
}

impl FakeTransport {
    pub(super) fn take(&self) -> Vec<Call> {
        mem::take(&mut *self.calls.lock())
    }

    fn add_conn(&self, iface: Iface, peer: Addr, conn: ConnId) {
        self.conns.lock().push((iface, peer, conn));
    }

    fn push(&self, c: Call) {
        self.calls.lock().push(c);
    }
}

impl Transport for FakeTransport {
    fn register(&self) -> Option<Iface> {
        self.push(Call::Register);
        let mut n = self.next_iface.lock();
        *n += 1;
        Iface::new(*n)
    }

    fn deregister(&self, iface: Iface) {
        self.push(Call::Deregister(iface));
    }

    fn connect(&self, iface: Iface, _peer: Addr, _link: LinkType, direct: bool) -> bool {
        self.push(Call::Connect { iface, direct });
        !*self.fail_connect.lock()
    }

    fn cancel_connect(&self, _iface: Iface, _peer: Addr, direct: bool) -> bool {
        self.push(Call::CancelConnect { direct });
        true
    }

    fn disconnect(&self, conn: ConnId) {
        self.push(Call::Disconnect(conn));
    }

    fn listen(&self, _iface: Iface, start: bool) -> bool {
        self.push(Call::Listen { start });
        true
    }

    fn conn_id(&self, iface: Iface, peer: Addr, _link: LinkType) -> Option<ConnId> {
        (self.conns.lock().iter())
            .find(|&&(i, p, _)| i == iface && p == peer)
            .map(|&(.., c)| c)
    }

    fn conn_info(&self, conn: ConnId) -> Option<(Iface, Addr, LinkType)> {
        (self.conns.lock().iter())
            .find(|&&(.., c)| c == conn)
            .map(|&(i, p, _)| (i, p, LinkType::Le))
    }

    fn discover(&self, _conn: ConnId, kind: DiscKind, range: HandleRange) -> Status {
        self.push(Call::Discover { kind, range });
        Status::Ok
    }

    fn read(&self, conn: ConnId, handle: Handle, _auth: AuthReq) -> Status {
        self.push(Call::Read { conn, handle });
        *self.op_status.lock()
    }

    fn read_multiple(&self, conn: ConnId, handles: &[Handle], _auth: AuthReq) -> Status {
        self.push(Call::ReadMultiple {
            conn,
            n: handles.len(),
        });
        *self.op_status.lock()
    }

    fn write(
        &self,
        conn: ConnId,
        _typ: WriteType,
        handle: Handle,
        value: &[u8],
        _auth: AuthReq,
    ) -> Status {
        self.push(Call::Write {
            conn,
            handle,
            value: value.to_vec(),
        });
        *self.op_status.lock()
    }

    fn prepare_write(
        &self,
        _conn: ConnId,
        handle: Handle,
        offset: u16,
        _value: &[u8],
        _auth: AuthReq,
    ) -> Status {
        self.push(Call::PrepareWrite { handle, offset });
        *self.op_status.lock()
    }

    fn execute_write(&self, _conn: ConnId, execute: bool) -> Status {
        self.push(Call::ExecuteWrite { execute });
        *self.op_status.lock()
    }

    fn configure_mtu(&self, _conn: ConnId, mtu: u16) -> Status {
        self.push(Call::ConfigureMtu { mtu });
        *self.op_status.lock()
    }

    fn confirm(&self, conn: ConnId, handle: Handle) {
        self.push(Call::Confirm { conn, handle });
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum StoreCall {
    Open { conn: ConnId, write: bool },
    Load { conn: ConnId, index: u16 },
    Save { index: u16, n: usize, last: bool },
    Close(ConnId),
    Reset(Addr),
}

#[derive(Default)]
pub(super) struct FakeStore {
    calls: Mutex<Vec<StoreCall>>,
}

impl FakeStore {
    fn take(&self) -> Vec<StoreCall> {
        mem::take(&mut *self.calls.lock())
    }
}

impl CacheStore for FakeStore {
    fn open(&self, conn: ConnId, _peer: Addr, write: bool) {
        self.calls.lock().push(StoreCall::Open { conn, write });
    }

    fn load(&self, conn: ConnId, _peer: Addr, index: u16) {
        self.calls.lock().push(StoreCall::Load { conn, index });
    }

    fn save(&self, _conn: ConnId, _peer: Addr, index: u16, recs: Vec<CacheRecord>, last: bool) {
        self.calls.lock().push(StoreCall::Save {
            index,
            n: recs.len(),
            last,
        });
    }

    fn close(&self, conn: ConnId, _peer: Addr) {
        self.calls.lock().push(StoreCall::Close(conn));
    }

    fn reset(&self, peer: Addr) {
        self.calls.lock().push(StoreCall::Reset(peer));
    }
}

#[derive(Default)]
struct FakeTimers {
    sched: Mutex<Vec<(Msg, Duration)>>,
}

impl FakeTimers {
    fn take(&self) -> Vec<(Msg, Duration)> {
        mem::take(&mut *self.sched.lock())
    }
}

impl Timers for FakeTimers {
    fn schedule(&self, msg: Msg, delay: Duration) -> TimerGuard {
        self.sched.lock().push((msg, delay));
        TimerGuard::new(CancellationToken::new())
    }
}

#[derive(Default)]
pub(super) struct FakeSink {
    evts: Mutex<Vec<Event>>,
}

impl FakeSink {
    pub(super) fn take(&self) -> Vec<Event> {
        mem::take(&mut *self.evts.lock())
    }
}

impl EventSink for FakeSink {
    fn event(&self, evt: Event) {
        self.evts.lock().push(evt);
    }
}

struct Fix {
    tr: Arc<FakeTransport>,
    st: Arc<FakeStore>,
    tm: Arc<FakeTimers>,
    eng: Engine,
}

fn fix() -> Fix {
    let tr = Arc::new(FakeTransport::default());
    let st = Arc::new(FakeStore::default());
    let tm = Arc::new(FakeTimers::default());
    let eng = Engine::new(tr.clone(), st.clone(), tm.clone());
    Fix { tr, st, tm, eng }
}

impl Fix {
    fn app(&mut self) -> (ClientIf, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        self.eng.dispatch(Msg::Register { sink: sink.clone() });
        match sink.take().as_slice() {
            [Event::Register {
                status: Status::Ok,
                cif: Some(cif),
            }] => (*cif, sink),
            e => panic!("unexpected registration outcome: {e:?}"),
        }
    }

    fn open(&mut self, cif: ClientIf) {
        self.eng.dispatch(Msg::Open {
            cif,
            peer: PEER,
            link: LinkType::Le,
            direct: true,
        });
    }

    fn link_up(&mut self, n: u8, conn: u16) -> ConnId {
        let conn = cid(conn);
        self.tr.add_conn(ifc(n), PEER, conn);
        self.eng.dispatch(Msg::LinkUp {
            iface: ifc(n),
            peer: PEER,
            conn,
            link: LinkType::Le,
        });
        conn
    }

    fn disc(&mut self, conn: ConnId, rec: DiscRecord) {
        self.eng.dispatch(Msg::DiscResult { conn, rec });
    }

    fn done(&mut self, conn: ConnId, kind: DiscKind) {
        self.eng.dispatch(Msg::DiscComplete {
            conn,
            kind,
            status: Status::Ok,
        });
    }

    /// Drives discovery of one battery service: characteristic value at
    /// handle 3, client configuration descriptor at handle 4.
    fn discover_battery(&mut self, conn: ConnId) {
        self.eng.dispatch(Msg::StoreOpened {
            conn,
            status: Status::Error,
        });
        self.disc(conn, DiscRecord::Service {
            range: r(1, 4),
            uuid: u(0x180F),
        });
        self.done(conn, DiscKind::Primary);
        self.done(conn, DiscKind::Included);
        self.disc(conn, DiscRecord::Characteristic {
            decl: h(2),
            value: h(3),
            prop: Prop::READ | Prop::NOTIFY,
            uuid: u(0x2A19),
        });
        self.done(conn, DiscKind::Characteristics);
        self.disc(conn, DiscRecord::Descriptor {
            handle: h(4),
            uuid: u(0x2902),
        });
        self.done(conn, DiscKind::Descriptors);
        self.eng.dispatch(Msg::StoreOpened {
            conn,
            status: Status::Ok,
        });
        self.eng.dispatch(Msg::StoreSaved {
            conn,
            status: Status::Ok,
        });
    }

    /// Like [`Self::discover_battery`], plus a GATT service whose Service
    /// Changed characteristic sits at handle 0x12 with its client
    /// configuration descriptor at 0x13.
    fn discover_gatt(&mut self, conn: ConnId) {
        self.eng.dispatch(Msg::StoreOpened {
            conn,
            status: Status::Error,
        });
        self.disc(conn, DiscRecord::Service {
            range: r(1, 4),
            uuid: u(0x180F),
        });
        self.disc(conn, DiscRecord::Service {
            range: r(0x10, 0x13),
            uuid: u(0x1801),
        });
        self.done(conn, DiscKind::Primary);
        self.done(conn, DiscKind::Included);
        self.disc(conn, DiscRecord::Characteristic {
            decl: h(2),
            value: h(3),
            prop: Prop::READ | Prop::NOTIFY,
            uuid: u(0x2A19),
        });
        self.done(conn, DiscKind::Characteristics);
        self.disc(conn, DiscRecord::Descriptor {
            handle: h(4),
            uuid: u(0x2902),
        });
        self.done(conn, DiscKind::Descriptors);
        self.done(conn, DiscKind::Included);
        self.disc(conn, DiscRecord::Characteristic {
            decl: h(0x11),
            value: h(0x12),
            prop: Prop::INDICATE,
            uuid: u(0x2A05),
        });
        self.done(conn, DiscKind::Characteristics);
        self.disc(conn, DiscRecord::Descriptor {
            handle: h(0x13),
            uuid: u(0x2902),
        });
        self.done(conn, DiscKind::Descriptors);
        self.eng.dispatch(Msg::StoreOpened {
            conn,
            status: Status::Ok,
        });
        self.eng.dispatch(Msg::StoreSaved {
            conn,
            status: Status::Ok,
        });
    }

    /// Completes the watchdog's pending client configuration write.
    fn settle_ccc(&mut self, conn: ConnId) {
        self.eng.dispatch(Msg::OpComplete {
            conn,
            op: OpKind::Write,
            status: Status::Ok,
            value: None,
        });
    }

    /// Registers an application and brings up a ready session over the
    /// battery-only table.
    fn connected_app(&mut self) -> (ClientIf, Arc<FakeSink>, ConnId) {
        let (cif, sink) = self.app();
        self.open(cif);
        let conn = self.link_up(1, 0xC1);
        self.discover_battery(conn);
        sink.take();
        self.tr.take();
        self.st.take();
        self.tm.take();
        (cif, sink, conn)
    }

    fn read(&mut self, conn: ConnId, handle: Handle) {
        self.eng.dispatch(Msg::ReadChar {
            conn,
            handle,
            auth: AuthReq::None,
        });
    }

    fn read_done(&mut self, conn: ConnId, handle: Handle, value: &[u8]) {
        self.eng.dispatch(Msg::OpComplete {
            conn,
            op: OpKind::Read,
            status: Status::Ok,
            value: Some(OpValue::Read {
                handle,
                value: value.to_vec(),
            }),
        });
    }
}

// Registration

#[test]
fn register_capacity() {
    let mut f = fix();
    for _ in 0..MAX_CLIENTS {
        f.app();
    }
    let sink = Arc::new(FakeSink::default());
    f.tr.take();
    f.eng.dispatch(Msg::Register { sink: sink.clone() });
    assert_matches!(sink.take().as_slice(), [Event::Register {
        status: Status::NoResources,
        cif: None,
    }]);
    // The transport interface allocated for the failed registration is
    // released again.
    assert_eq!(f.tr.take(), vec![Call::Register, Call::Deregister(ifc(11))]);
}

#[test]
fn deregister_closes_sessions() {
    let mut f = fix();
    let (cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::Deregister { cif });
    assert_matches!(sink.take().as_slice(), [
        Event::Close {
            reason: Status::Ok,
            ..
        },
        Event::Deregister {
            status: Status::Ok,
            ..
        },
    ]);
    assert_eq!(f.tr.take(), vec![
        Call::Disconnect(conn),
        Call::Deregister(ifc(1)),
    ]);
}

#[test]
fn deregister_cancels_pending_connect() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.open(cif);
    f.tr.take();
    f.eng.dispatch(Msg::Deregister { cif });
    assert_matches!(sink.take().as_slice(), [
        Event::Open {
            status: Status::Cancel,
            conn: None,
            ..
        },
        Event::Deregister {
            status: Status::Ok,
            ..
        },
    ]);
    assert_eq!(f.tr.take(), vec![
        Call::CancelConnect { direct: true },
        Call::Deregister(ifc(1)),
    ]);
}

// Session open/close

#[test]
fn open_discovers_and_caches() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.tr.take();
    f.open(cif);
    assert_eq!(f.tr.take(), vec![Call::Connect {
        iface: ifc(1),
        direct: true,
    }]);
    let conn = f.link_up(1, 0xC1);
    assert_matches!(sink.take().as_slice(), [
        Event::Connect { .. },
        Event::Open {
            status: Status::Ok,
            conn: Some(_),
            mtu: DEFAULT_MTU,
            ..
        },
    ]);
    // No persisted cache: fall back to live discovery.
    assert_eq!(f.st.take(), vec![StoreCall::Open { conn, write: false }]);
    f.eng.dispatch(Msg::StoreOpened {
        conn,
        status: Status::Error,
    });
    assert_eq!(f.tr.take(), vec![Call::Discover {
        kind: DiscKind::Primary,
        range: HandleRange::ALL,
    }]);
    f.disc(conn, DiscRecord::Service {
        range: r(1, 4),
        uuid: u(0x180F),
    });
    f.done(conn, DiscKind::Primary);
    assert_eq!(f.tr.take(), vec![Call::Discover {
        kind: DiscKind::Included,
        range: r(1, 4),
    }]);
    f.done(conn, DiscKind::Included);
    assert_eq!(f.tr.take(), vec![Call::Discover {
        kind: DiscKind::Characteristics,
        range: r(1, 4),
    }]);
    f.disc(conn, DiscRecord::Characteristic {
        decl: h(2),
        value: h(3),
        prop: Prop::READ | Prop::NOTIFY,
        uuid: u(0x2A19),
    });
    f.done(conn, DiscKind::Characteristics);
    // Descriptors live between the value handle and the end of service.
    assert_eq!(f.tr.take(), vec![Call::Discover {
        kind: DiscKind::Descriptors,
        range: r(4, 4),
    }]);
    f.disc(conn, DiscRecord::Descriptor {
        handle: h(4),
        uuid: u(0x2902),
    });
    f.done(conn, DiscKind::Descriptors);
    // The fresh cache is persisted in order.
    assert_eq!(f.st.take(), vec![StoreCall::Open { conn, write: true }]);
    f.eng.dispatch(Msg::StoreOpened {
        conn,
        status: Status::Ok,
    });
    assert_eq!(f.st.take(), vec![StoreCall::Save {
        index: 0,
        n: 3,
        last: true,
    }]);
    f.eng.dispatch(Msg::StoreSaved {
        conn,
        status: Status::Ok,
    });
    assert_eq!(f.st.take(), vec![StoreCall::Close(conn)]);

    f.eng.dispatch(Msg::Search { conn, uuid: None });
    match sink.take().as_slice() {
        [Event::SearchResult { service, .. }, Event::SearchComplete {
            status: Status::Ok,
            ..
        }] => {
            assert_eq!(service.uuid, u(0x180F));
            assert_eq!(service.range, r(1, 4));
            assert!(service.primary);
        }
        e => panic!("unexpected {e:?}"),
    }
}

#[test]
fn cached_load_skips_discovery() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    f.st.take();
    f.eng.dispatch(Msg::StoreOpened {
        conn,
        status: Status::Ok,
    });
    assert_eq!(f.st.take(), vec![StoreCall::Load { conn, index: 0 }]);
    f.eng.dispatch(Msg::StoreLoaded {
        conn,
        status: Status::More,
        recs: vec![rec(RecKind::Service, 1, 4, 0x180F)],
    });
    assert_eq!(f.st.take(), vec![StoreCall::Load { conn, index: 1 }]);
    f.eng.dispatch(Msg::StoreLoaded {
        conn,
        status: Status::Ok,
        recs: vec![
            rec(RecKind::Characteristic, 3, 3, 0x2A19),
            rec(RecKind::Descriptor, 4, 4, 0x2902),
        ],
    });
    assert_eq!(f.st.take(), vec![StoreCall::Close(conn)]);
    assert!(f.tr.take().iter().all(|c| !matches!(c, Call::Discover { .. })));

    sink.take();
    f.eng.dispatch(Msg::Search { conn, uuid: None });
    assert_matches!(sink.take().as_slice(), [
        Event::SearchResult { .. },
        Event::SearchComplete {
            status: Status::Ok,
            ..
        },
    ]);
}

#[test]
fn invalid_cache_falls_back_to_discovery() {
    let mut f = fix();
    let (cif, _sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    f.st.take();
    f.tr.take();
    f.eng.dispatch(Msg::StoreOpened {
        conn,
        status: Status::Ok,
    });
    // An attribute record before any service record is invalid.
    f.eng.dispatch(Msg::StoreLoaded {
        conn,
        status: Status::Ok,
        recs: vec![rec(RecKind::Descriptor, 4, 4, 0x2902)],
    });
    assert_eq!(f.st.take(), vec![
        StoreCall::Load { conn, index: 0 },
        StoreCall::Close(conn),
    ]);
    assert!((f.tr.take().iter()).any(|c| matches!(c, Call::Discover {
        kind: DiscKind::Primary,
        ..
    })));
}

#[test]
fn already_open_reported() {
    let mut f = fix();
    let (cif, sink, conn) = f.connected_app();
    f.open(cif);
    assert_eq!(sink.take(), vec![Event::Open {
        cif,
        status: Status::AlreadyOpen,
        conn: Some(conn),
        peer: PEER,
        mtu: 0,
    }]);
}

#[test]
fn cancel_pending_open() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.open(cif);
    f.tr.take();
    f.eng.dispatch(Msg::CancelOpen {
        cif,
        peer: PEER,
        direct: true,
    });
    assert_matches!(sink.take().as_slice(), [
        Event::Open {
            status: Status::Cancel,
            conn: None,
            ..
        },
        Event::CancelOpen {
            status: Status::Ok,
            ..
        },
    ]);
    assert_eq!(f.tr.take(), vec![Call::CancelConnect { direct: true }]);
    // The slot is free for a fresh open.
    f.open(cif);
    assert_eq!(sink.take(), vec![]);
}

#[test]
fn cancel_background_open() {
    let mut f = fix();
    let (cif, sink) = f.app();
    // Nothing was requested; there is nothing to cancel.
    f.eng.dispatch(Msg::CancelOpen {
        cif,
        peer: PEER,
        direct: false,
    });
    assert_matches!(sink.take().as_slice(), [Event::CancelOpen {
        status: Status::Error,
        ..
    }]);
    f.eng.dispatch(Msg::Open {
        cif,
        peer: PEER,
        link: LinkType::Le,
        direct: false,
    });
    f.tr.take();
    f.eng.dispatch(Msg::CancelOpen {
        cif,
        peer: PEER,
        direct: false,
    });
    assert_matches!(sink.take().as_slice(), [Event::CancelOpen {
        status: Status::Ok,
        ..
    }]);
    assert_eq!(f.tr.take(), vec![Call::CancelConnect { direct: false }]);
}

#[test]
fn failed_connect_reports_error() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.open(cif);
    f.eng.dispatch(Msg::LinkDown {
        iface: ifc(1),
        peer: PEER,
        conn: None,
        link: LinkType::Le,
        reason: Status::Error,
    });
    assert_matches!(sink.take().as_slice(), [Event::Open {
        status: Status::Error,
        conn: None,
        ..
    }]);
}

#[test]
fn background_open_waits_for_link() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.tr.take();
    f.eng.dispatch(Msg::Open {
        cif,
        peer: PEER,
        link: LinkType::Le,
        direct: false,
    });
    assert_eq!(f.tr.take(), vec![Call::Connect {
        iface: ifc(1),
        direct: false,
    }]);
    // No session and no event until the peer actually connects.
    assert_eq!(sink.take(), vec![]);
    f.link_up(1, 0xC1);
    assert_matches!(sink.take().as_slice(), [
        Event::Connect { .. },
        Event::Open {
            status: Status::Ok,
            conn: Some(_),
            ..
        },
    ]);
}

#[test]
fn close_cancels_queued_commands() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(3));
    f.read(conn, h(3));
    f.eng.dispatch(Msg::Close { conn });
    assert_matches!(sink.take().as_slice(), [
        Event::ReadChar {
            status: Status::Cancel,
            ..
        },
        Event::ReadChar {
            status: Status::Cancel,
            ..
        },
        Event::Close {
            reason: Status::Ok,
            ..
        },
    ]);
    assert!(f.tr.take().contains(&Call::Disconnect(conn)));
}

#[test]
fn link_loss_flushes_queue() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(3));
    f.read(conn, h(3));
    f.eng.dispatch(Msg::LinkDown {
        iface: ifc(1),
        peer: PEER,
        conn: Some(conn),
        link: LinkType::Le,
        reason: Status::Error,
    });
    assert_matches!(sink.take().as_slice(), [
        Event::Disconnect { .. },
        Event::ReadChar {
            status: Status::Error,
            ..
        },
        Event::ReadChar {
            status: Status::Error,
            ..
        },
        Event::Close {
            reason: Status::Error,
            ..
        },
    ]);
    // The session is gone; further commands are dropped.
    f.read(conn, h(3));
    assert_eq!(sink.take(), vec![]);
}

// Command queue

#[test]
fn read_roundtrip() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(3));
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
    f.read_done(conn, h(3), &[0x64]);
    assert_eq!(sink.take(), vec![Event::ReadChar {
        conn,
        status: Status::Ok,
        handle: h(3),
        value: vec![0x64],
    }]);
}

#[test]
fn one_command_in_flight() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(3));
    f.read(conn, h(3));
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
    f.read_done(conn, h(3), &[1]);
    // Completion of the first submits the second.
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
    f.read_done(conn, h(3), &[2]);
    assert_eq!(sink.take().len(), 2);
}

#[test]
fn unknown_handle_fails_without_request() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(9));
    assert_eq!(f.tr.take(), vec![]);
    assert_eq!(sink.take(), vec![Event::ReadChar {
        conn,
        status: Status::Error,
        handle: h(9),
        value: vec![],
    }]);
}

#[test]
fn descriptor_read_validates_kind() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    // Handle 3 is a characteristic, not a descriptor.
    f.eng.dispatch(Msg::ReadDescr {
        conn,
        handle: h(3),
        auth: AuthReq::None,
    });
    assert_eq!(f.tr.take(), vec![]);
    assert_matches!(sink.take().as_slice(), [Event::ReadDescr {
        status: Status::Error,
        ..
    }]);
    f.eng.dispatch(Msg::ReadDescr {
        conn,
        handle: h(4),
        auth: AuthReq::None,
    });
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(4) }]);
}

#[test]
fn mismatched_completion_dropped() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.read(conn, h(3));
    f.eng.dispatch(Msg::OpComplete {
        conn,
        op: OpKind::Write,
        status: Status::Ok,
        value: None,
    });
    assert_eq!(sink.take(), vec![]);
    // The command stays in flight and completes normally afterwards.
    f.read_done(conn, h(3), &[7]);
    assert_matches!(sink.take().as_slice(), [Event::ReadChar {
        status: Status::Ok,
        ..
    }]);
}

#[test]
fn queue_overflow_reported() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    for _ in 0..=QUEUE_DEPTH {
        f.read(conn, h(3));
    }
    assert_eq!(sink.take(), vec![]);
    f.read(conn, h(3));
    assert_eq!(sink.take(), vec![Event::QueueFull { conn }]);
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
}

#[test]
fn prepare_write_no_interleave() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::PrepareWrite {
        conn,
        handle: h(3),
        offset: 0,
        value: vec![1],
        auth: AuthReq::None,
    });
    assert_eq!(f.tr.take(), vec![Call::PrepareWrite {
        handle: h(3),
        offset: 0,
    }]);
    f.eng.dispatch(Msg::PrepareWrite {
        conn,
        handle: h(3),
        offset: 1,
        value: vec![2],
        auth: AuthReq::None,
    });
    assert_eq!(sink.take(), vec![Event::PrepareWrite {
        conn,
        status: Status::Congested,
        handle: h(3),
    }]);
}

#[test]
fn mtu_negotiation() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::ConfigureMtu { conn, mtu: 185 });
    assert_eq!(f.tr.take(), vec![Call::ConfigureMtu { mtu: 185 }]);
    f.eng.dispatch(Msg::OpComplete {
        conn,
        op: OpKind::ConfigMtu,
        status: Status::Ok,
        value: Some(OpValue::Mtu { mtu: 185 }),
    });
    assert_eq!(sink.take(), vec![Event::ConfigureMtu {
        conn,
        status: Status::Ok,
        mtu: 185,
    }]);
}

#[test]
fn congestion_reported() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::Congest {
        conn,
        congested: true,
    });
    assert_eq!(sink.take(), vec![Event::Congested {
        conn,
        congested: true,
    }]);
}

#[test]
fn congestion_defers_submission() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::Congest {
        conn,
        congested: true,
    });
    sink.take();
    f.read(conn, h(3));
    assert_eq!(f.tr.take(), vec![]);
    f.eng.dispatch(Msg::Congest {
        conn,
        congested: false,
    });
    // Clearing congestion releases the held command.
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
    f.read_done(conn, h(3), &[3]);
    assert_matches!(sink.take().as_slice(), [
        Event::Congested {
            congested: false,
            ..
        },
        Event::ReadChar {
            status: Status::Ok,
            ..
        },
    ]);
}

// Rediscovery

#[test]
fn refresh_connected_rediscovers() {
    let mut f = fix();
    let (_cif, _sink, _conn) = f.connected_app();
    f.eng.dispatch(Msg::Refresh { peer: PEER });
    assert_eq!(f.tr.take(), vec![Call::Discover {
        kind: DiscKind::Primary,
        range: HandleRange::ALL,
    }]);
}

#[test]
fn refresh_disconnected_resets_store() {
    let mut f = fix();
    f.eng.dispatch(Msg::Refresh { peer: PEER });
    f.eng.dispatch(Msg::Refresh { peer: PEER });
    assert_eq!(f.st.take(), vec![
        StoreCall::Reset(PEER),
        StoreCall::Reset(PEER),
    ]);
}

#[test]
fn commands_deferred_during_rediscovery() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::Refresh { peer: PEER });
    f.tr.take();
    f.read(conn, h(3));
    // Nothing reaches the transport while the cache is being rebuilt.
    assert_eq!(f.tr.take(), vec![]);
    f.discover_battery(conn);
    // The deferred command is reissued against the fresh cache.
    assert!(f.tr.take().contains(&Call::Read { conn, handle: h(3) }));
    f.read_done(conn, h(3), &[9]);
    assert_matches!(sink.take().as_slice(), [Event::ReadChar {
        status: Status::Ok,
        ..
    }]);
}

// Notifications

#[test]
fn notify_delivery() {
    let mut f = fix();
    let (cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::RegisterNotify {
        cif,
        peer: PEER,
        handle: h(3),
    });
    assert_matches!(sink.take().as_slice(), [Event::NotifyRegistered {
        status: Status::Ok,
        ..
    }]);
    f.eng.dispatch(Msg::Notify {
        conn,
        handle: h(3),
        value: vec![0x42],
        indication: false,
    });
    assert_eq!(sink.take(), vec![Event::Notify {
        cif,
        conn,
        peer: PEER,
        handle: h(3),
        value: vec![0x42],
        indication: false,
    }]);
    assert_eq!(f.tr.take(), vec![]);
}

#[test]
fn unwanted_indication_confirmed() {
    let mut f = fix();
    let (_cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::Notify {
        conn,
        handle: h(3),
        value: vec![1],
        indication: true,
    });
    assert_eq!(sink.take(), vec![]);
    assert_eq!(f.tr.take(), vec![Call::Confirm { conn, handle: h(3) }]);
}

#[test]
fn notify_allocates_session_on_demand() {
    let mut f = fix();
    let (_cif1, _sink1, conn) = f.connected_app();
    let (cif2, sink2) = f.app();
    f.eng.dispatch(Msg::RegisterNotify {
        cif: cif2,
        peer: PEER,
        handle: h(3),
    });
    sink2.take();
    // The second application never opened; its link exists at the
    // transport level.
    let conn2 = cid(0xC2);
    f.tr.add_conn(ifc(2), PEER, conn2);
    f.eng.dispatch(Msg::Notify {
        conn,
        handle: h(3),
        value: vec![5],
        indication: false,
    });
    assert_eq!(sink2.take(), vec![Event::Notify {
        cif: cif2,
        conn: conn2,
        peer: PEER,
        handle: h(3),
        value: vec![5],
        indication: false,
    }]);
}

#[test]
fn deregister_notify_removes_interest() {
    let mut f = fix();
    let (cif, sink, conn) = f.connected_app();
    f.eng.dispatch(Msg::RegisterNotify {
        cif,
        peer: PEER,
        handle: h(3),
    });
    f.eng.dispatch(Msg::DeregisterNotify {
        cif,
        peer: PEER,
        handle: h(3),
    });
    sink.take();
    f.eng.dispatch(Msg::Notify {
        conn,
        handle: h(3),
        value: vec![1],
        indication: false,
    });
    assert_eq!(sink.take(), vec![]);
}

// Service change

#[test]
fn stale_response_after_service_change() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    f.discover_gatt(conn);
    f.settle_ccc(conn);
    sink.take();
    f.tr.take();

    f.read(conn, h(3));
    assert_eq!(f.tr.take(), vec![Call::Read { conn, handle: h(3) }]);
    // Service change arrives while the read is outstanding.
    f.eng.dispatch(Msg::Notify {
        conn,
        handle: h(0x12),
        value: vec![0x01, 0x00, 0xFF, 0xFF],
        indication: true,
    });
    assert_matches!(sink.take().as_slice(), [Event::ServiceChanged { .. }]);
    assert_eq!(f.tr.take(), vec![Call::Confirm {
        conn,
        handle: h(0x12),
    }]);
    // The response was issued against the old cache; it is reported as
    // failed and rediscovery starts.
    f.read_done(conn, h(3), &[0x64]);
    assert_eq!(sink.take(), vec![Event::ReadChar {
        conn,
        status: Status::Error,
        handle: h(3),
        value: vec![],
    }]);
    assert!((f.tr.take().iter()).any(|c| matches!(c, Call::Discover {
        kind: DiscKind::Primary,
        ..
    })));
}

#[test]
fn service_change_rediscovers_after_all_apps_told() {
    let mut f = fix();
    let (cif1, sink1) = f.app();
    f.open(cif1);
    let conn1 = f.link_up(1, 0xC1);
    f.discover_gatt(conn1);
    f.settle_ccc(conn1);
    let (cif2, sink2) = f.app();
    f.open(cif2);
    let conn2 = f.link_up(2, 0xC2);
    f.settle_ccc(conn2);
    sink1.take();
    sink2.take();
    f.tr.take();

    f.eng.dispatch(Msg::Notify {
        conn: conn1,
        handle: h(0x12),
        value: vec![],
        indication: true,
    });
    assert_matches!(sink1.take().as_slice(), [Event::ServiceChanged { .. }]);
    // One application still untold: no rebuild yet.
    assert!((f.tr.take().iter()).all(|c| !matches!(c, Call::Discover { .. })));
    f.eng.dispatch(Msg::Notify {
        conn: conn2,
        handle: h(0x12),
        value: vec![],
        indication: true,
    });
    assert_matches!(sink2.take().as_slice(), [Event::ServiceChanged { .. }]);
    assert!((f.tr.take().iter()).any(|c| matches!(c, Call::Discover {
        kind: DiscKind::Primary,
        ..
    })));
}

// Service-change configuration watchdog

#[test]
fn ccc_write_after_discovery() {
    let mut f = fix();
    let (cif, _sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    // The cache is not settled yet: the first poll is transient.
    assert!(matches!(f.tm.take().as_slice(), [(Msg::CccTick { .. }, _)]));
    f.discover_gatt(conn);
    // Settled cache with the descriptor present: enable indications.
    let calls = f.tr.take();
    assert!(calls.contains(&Call::Write {
        conn,
        handle: h(0x13),
        value: vec![0x02, 0x00],
    }));
    f.settle_ccc(conn);
    // Configured; no further retries scheduled.
    assert_eq!(f.tm.take().len(), 0);
}

#[test]
fn ccc_write_retry_on_failure() {
    let mut f = fix();
    let (cif, _sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    f.discover_gatt(conn);
    f.tm.take();
    f.tr.take();
    f.eng.dispatch(Msg::OpComplete {
        conn,
        op: OpKind::Write,
        status: Status::Error,
        value: None,
    });
    let mut sched = f.tm.take();
    assert_eq!(sched.len(), 1);
    let (msg, delay) = sched.pop().unwrap();
    assert_eq!(delay, Duration::from_millis(200));
    // The tick retries the write.
    f.eng.dispatch(msg);
    assert!(f.tr.take().contains(&Call::Write {
        conn,
        handle: h(0x13),
        value: vec![0x02, 0x00],
    }));
}

#[test]
fn ccc_gives_up_when_absent_twice() {
    let mut f = fix();
    let (cif, _sink) = f.app();
    f.open(cif);
    let conn = f.link_up(1, 0xC1);
    f.tm.take();
    f.discover_battery(conn);
    // Battery-only table: the settled poll records the absence and
    // schedules one retry.
    let mut sched = f.tm.take();
    assert_eq!(sched.len(), 1);
    let (msg, delay) = sched.pop().unwrap();
    assert_eq!(delay, Duration::from_millis(1000));
    f.eng.dispatch(msg);
    // Identical verdict twice in a row: the watchdog stops.
    assert_eq!(f.tm.take().len(), 0);
}

#[test]
fn ccc_polling_bounded() {
    let mut f = fix();
    let (cif, _sink) = f.app();
    f.open(cif);
    f.link_up(1, 0xC1);
    f.tr.take();
    f.st.take();
    // Discovery never completes, so every poll finds the cache unsettled
    // and burns one retry attempt.
    for _ in 0..notify::CCC_ATTEMPTS {
        let mut sched = f.tm.take();
        assert_eq!(sched.len(), 1);
        let (msg, delay) = sched.pop().unwrap();
        assert_eq!(delay, Duration::from_millis(1000));
        assert!(matches!(msg, Msg::CccTick { .. }));
        f.eng.dispatch(msg);
    }
    // Out of attempts: the watchdog disarms without writing anything.
    assert_eq!(f.tm.take().len(), 0);
    assert_eq!(f.tr.take(), vec![]);
}

// Listen

#[test]
fn listen_toggle() {
    let mut f = fix();
    let (cif, sink) = f.app();
    f.tr.take();
    f.eng.dispatch(Msg::Listen { cif, start: true });
    assert_eq!(f.tr.take(), vec![Call::Listen { start: true }]);
    assert_eq!(sink.take(), vec![Event::Listen {
        cif,
        status: Status::Ok,
    }]);
    f.eng.dispatch(Msg::Listen { cif, start: false });
    assert_eq!(f.tr.take(), vec![Call::Listen { start: false }]);
    assert_eq!(sink.take(), vec![Event::Listen {
        cif,
        status: Status::Ok,
    }]);
}
