//! Value report routing and the service-change configuration watchdog.

use std::time::Duration;

use tracing::{debug, warn};

use crate::att::{Ccc, Handle, Status};
use crate::client::queue::{Command, Enqueue};
use crate::client::server::SrvState;
use crate::client::session::{Defer, SessionState};
use crate::client::{ClientIf, Engine, Event, Msg, TimerGuard, MAX_NOTIFY};
use crate::le::Addr;
use crate::transport::ConnId;
use crate::util::Slot;

/// One application's interest in value reports from a peer attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct NotifReg {
    pub peer: Addr,
    pub handle: Handle,
}

pub(super) const CCC_ATTEMPTS: u8 = 10;
const CCC_RETRY: Duration = Duration::from_millis(1000);
const CCC_WRITE_RETRY: Duration = Duration::from_millis(200);

/// Watchdog driving the peer's Service Changed characteristic toward an
/// indication-enabled client configuration.
pub(super) struct CccWatch {
    pub conn: ConnId,
    attempts: u8,
    last: Option<Absence>,
    timer: Option<TimerGuard>,
}

/// What was missing from a settled cache on the last poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Absence {
    Char,
    Descr,
}

impl Engine {
    // Interest registration

    pub(super) fn register_notify(&mut self, cif: ClientIf, peer: Addr, handle: Handle) {
        let Some(rcb) = self.rcb.get_mut(cif.0) else {
            warn!("Notification registration from unknown {cif:?}");
            return;
        };
        let reg = NotifReg { peer, handle };
        let status = if rcb.notif.contains(&reg) {
            Status::Ok
        } else if rcb.notif.len() >= MAX_NOTIFY {
            Status::NoResources
        } else {
            rcb.notif.push(reg);
            Status::Ok
        };
        self.send(cif.0, Event::NotifyRegistered {
            cif,
            peer,
            handle,
            status,
        });
    }

    pub(super) fn deregister_notify(&mut self, cif: ClientIf, peer: Addr, handle: Handle) {
        let Some(rcb) = self.rcb.get_mut(cif.0) else {
            warn!("Notification deregistration from unknown {cif:?}");
            return;
        };
        let reg = NotifReg { peer, handle };
        let status = match rcb.notif.iter().position(|r| *r == reg) {
            Some(i) => {
                rcb.notif.swap_remove(i);
                Status::Ok
            }
            None => Status::Error,
        };
        self.send(cif.0, Event::NotifyDeregistered {
            cif,
            peer,
            handle,
            status,
        });
    }

    // Incoming reports

    pub(super) fn process_notify(
        &mut self,
        conn: ConnId,
        handle: Handle,
        value: Vec<u8>,
        indication: bool,
    ) {
        let Some((iface, peer, link)) = self.tr.conn_info(conn) else {
            warn!("Report on unknown {conn:?} dropped");
            if indication {
                self.tr.confirm(conn, handle);
            }
            return;
        };
        let ch = (self.srcb.find(|v| v.peer == peer))
            .and_then(|s| self.srcb.get(s))
            .and_then(|v| v.cache.as_ref())
            .and_then(|db| db.service_changed());
        if ch == Some(handle) {
            self.service_changed(iface, peer, conn, handle, indication);
            return;
        }
        let interested: Vec<Slot> = (self.rcb.iter())
            .filter(|(_, r)| r.notif.contains(&NotifReg { peer, handle }))
            .map(|(id, _)| id)
            .collect();
        let mut delivered = false;
        for cif in interested {
            let id = self.clcb_by_pair(cif, peer).or_else(|| {
                // Unsolicited report for a registered interest: attach a
                // session on demand so it can be attributed to a
                // connection.
                let iface = self.rcb.get(cif)?.iface;
                let conn = self.tr.conn_id(iface, peer, link)?;
                let id = self.alloc_session(cif, peer, link)?;
                if let Some(c) = self.clcb.get_mut(id) {
                    c.state = SessionState::Conn;
                    c.conn = Some(conn);
                }
                Some(id)
            });
            let Some(conn) = id.and_then(|id| self.clcb.get(id)).and_then(|c| c.conn) else {
                continue;
            };
            self.send(cif, Event::Notify {
                cif: ClientIf(cif),
                conn,
                peer,
                handle,
                value: value.clone(),
                indication,
            });
            delivered = true;
        }
        if !delivered {
            debug!("No registration for report from {peer} on {handle:?}");
        }
        // An indication is confirmed exactly once whether or not anyone
        // wanted it; an unconfirmed indication stalls the peer.
        if indication {
            self.tr.confirm(conn, handle);
        }
    }

    fn service_changed(
        &mut self,
        iface: crate::transport::Iface,
        peer: Addr,
        conn: ConnId,
        handle: Handle,
        indication: bool,
    ) {
        let Some(s) = self.srcb.find(|v| v.peer == peer) else {
            if indication {
                self.tr.confirm(conn, handle);
            }
            return;
        };
        debug!("Service change indicated by {peer}");
        if let Some(v) = self.srcb.get_mut(s) {
            v.srvc_chg = true;
        }
        // The reporting application's interests in this peer are stale now.
        if let Some(cif) = self.rcb_by_iface(iface) {
            if let Some(rcb) = self.rcb.get_mut(cif) {
                rcb.notif.retain(|r| r.peer != peer);
            }
            self.send(cif, Event::ServiceChanged {
                cif: ClientIf(cif),
                peer,
            });
            if let Some(v) = self.srcb.get_mut(s) {
                v.update_count += 1;
            }
        }
        // Rebuild once every registered application has been told.
        let told = self.srcb.get(s).map_or(0, |v| usize::from(v.update_count));
        if told >= self.rcb.len() {
            if let Some(v) = self.srcb.get_mut(s) {
                v.update_count = 0;
            }
            self.kick_rediscovery(s, conn);
        }
        if indication {
            self.tr.confirm(conn, handle);
        }
    }

    /// Starts a rediscovery over an idle session, or defers it behind the
    /// in-flight command of a busy one.
    fn kick_rediscovery(&mut self, s: Slot, fallback: ConnId) {
        let idle = (self.clcb.iter())
            .find(|(_, c)| c.srcb == s && c.conn.is_some() && c.queue.inflight().is_none())
            .map(|(id, c)| (id, c.conn));
        if let Some((_, Some(conn))) = idle {
            self.start_discovery(s, conn);
            return;
        }
        let busy = (self.clcb.iter())
            .find(|(_, c)| c.srcb == s && c.conn.is_some() && c.queue.inflight().is_some())
            .map(|(id, _)| id);
        match busy {
            Some(id) => {
                if let Some(c) = self.clcb.get_mut(id) {
                    c.defer = Defer::Discovery;
                }
            }
            None => self.start_discovery(s, fallback),
        }
    }

    // Service-change configuration watchdog

    /// Arms the watchdog for a freshly connected LE link.
    pub(super) fn arm_ccc(&mut self, s: Slot, conn: ConnId) {
        let Some(v) = self.srcb.get_mut(s) else { return };
        if v.ccc.is_some() {
            return;
        }
        v.ccc = Some(CccWatch {
            conn,
            attempts: 0,
            last: None,
            timer: None,
        });
        self.ccc_poll(s);
    }

    /// One watchdog evaluation. A cache that is still loading or being
    /// rebuilt yields no verdict; absence verdicts only count from a
    /// settled cache, and two identical ones in a row conclude that the
    /// peer does not support service change indications.
    pub(super) fn ccc_poll(&mut self, s: Slot) {
        let Some(v) = self.srcb.get(s) else { return };
        let Some(w) = v.ccc.as_ref() else { return };
        let conn = w.conn;
        if w.attempts >= CCC_ATTEMPTS {
            warn!("Giving up on service change configuration for {}", v.peer);
            if let Some(v) = self.srcb.get_mut(s) {
                v.ccc = None;
            }
            return;
        }
        if !matches!(v.state, SrvState::On) {
            self.ccc_retry(s, None, CCC_RETRY);
            return;
        }
        let cache = v.cache.as_ref();
        let Some(ch) = cache.and_then(|db| db.service_changed()) else {
            self.ccc_verdict(s, Absence::Char);
            return;
        };
        let Some(descr) = cache.and_then(|db| db.ccc_of(ch)) else {
            self.ccc_verdict(s, Absence::Descr);
            return;
        };
        let Some(id) = self.clcb.find(|c| c.conn == Some(conn)) else {
            self.ccc_retry(s, None, CCC_RETRY);
            return;
        };
        let cmd = Command::WriteCcc {
            handle: descr,
            value: Ccc::INDICATE,
        };
        match self.clcb.get_mut(id).map(|c| c.queue.enqueue(cmd, false)) {
            Some(Enqueue::Submit) => {
                self.submit(id);
            }
            Some(Enqueue::Queued) => {}
            _ => self.ccc_retry_keep(s, CCC_WRITE_RETRY),
        }
    }

    pub(super) fn ccc_tick(&mut self, s: Slot) {
        let Some(w) = self.srcb.get_mut(s).and_then(|v| v.ccc.as_mut()) else {
            return;
        };
        w.timer = None;
        self.ccc_poll(s);
    }

    /// Outcome of the watchdog's pending client configuration write.
    pub(super) fn ccc_write_done(&mut self, s: Slot, status: Status) {
        if self.srcb.get(s).and_then(|v| v.ccc.as_ref()).is_none() {
            return;
        }
        if status.is_ok() {
            debug!("Service change indications configured");
            if let Some(v) = self.srcb.get_mut(s) {
                v.ccc = None;
            }
        } else {
            // Encryption may still be pending; retry shortly without
            // burning an attempt.
            self.ccc_retry_keep(s, CCC_WRITE_RETRY);
        }
    }

    /// Drops the watchdog when its link goes away. Releasing the timer
    /// guard cancels any pending tick.
    pub(super) fn ccc_link_down(&mut self, s: Slot, conn: ConnId) {
        if let Some(v) = self.srcb.get_mut(s) {
            if v.ccc.as_ref().is_some_and(|w| w.conn == conn) {
                v.ccc = None;
            }
        }
    }

    fn ccc_verdict(&mut self, s: Slot, kind: Absence) {
        let prev = (self.srcb.get(s)).and_then(|v| v.ccc.as_ref()).and_then(|w| w.last);
        if prev == Some(kind) {
            debug!("Peer has no service change {kind:?}; not configuring");
            if let Some(v) = self.srcb.get_mut(s) {
                v.ccc = None;
            }
            return;
        }
        self.ccc_retry(s, Some(kind), CCC_RETRY);
    }

    fn ccc_retry(&mut self, s: Slot, last: Option<Absence>, delay: Duration) {
        let timer = self.timers.schedule(Msg::CccTick { srcb: s }, delay);
        let Some(w) = self.srcb.get_mut(s).and_then(|v| v.ccc.as_mut()) else {
            return;
        };
        w.attempts += 1;
        w.last = last;
        w.timer = Some(timer);
    }

    fn ccc_retry_keep(&mut self, s: Slot, delay: Duration) {
        let timer = self.timers.schedule(Msg::CccTick { srcb: s }, delay);
        if let Some(w) = self.srcb.get_mut(s).and_then(|v| v.ccc.as_mut()) {
            w.timer = Some(timer);
        }
    }
}
