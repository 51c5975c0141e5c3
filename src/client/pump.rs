//! Tokio message pump.
//!
//! [`channel`] splits the engine into a cloneable [`Handle`] for message
//! submission and a [`Driver`] that owns the engine and runs it to
//! completion on one task. Timer fires re-enter through the same channel,
//! so the engine never observes concurrent mutation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::att::{AuthReq, Handle as AttHandle, WriteType};
use crate::client::{ClientIf, Engine, Error, EventSink, Msg, TimerGuard, Timers};
use crate::le::{Addr, LinkType};
use crate::store::CacheStore;
use crate::transport::{ConnId, Transport};
use crate::uuid::Uuid;

/// Creates a connected handle/driver pair. The engine starts when
/// [`Driver::run`] is awaited.
#[must_use]
pub fn channel() -> (Handle, Driver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Handle { tx: tx.clone() }, Driver { rx, tx })
}

/// Cloneable submission handle. Transport and storage implementations use
/// [`Handle::send`] to post their call-in messages.
#[derive(Clone, Debug)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Handle {
    /// Posts one message to the engine.
    pub fn send(&self, msg: Msg) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::Closed)
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) -> Result<(), Error> {
        self.send(Msg::Register { sink })
    }

    pub fn deregister(&self, cif: ClientIf) -> Result<(), Error> {
        self.send(Msg::Deregister { cif })
    }

    pub fn open(
        &self,
        cif: ClientIf,
        peer: Addr,
        link: LinkType,
        direct: bool,
    ) -> Result<(), Error> {
        self.send(Msg::Open {
            cif,
            peer,
            link,
            direct,
        })
    }

    pub fn cancel_open(&self, cif: ClientIf, peer: Addr, direct: bool) -> Result<(), Error> {
        self.send(Msg::CancelOpen { cif, peer, direct })
    }

    pub fn close(&self, conn: ConnId) -> Result<(), Error> {
        self.send(Msg::Close { conn })
    }

    /// Discards cached state for `peer` and rediscovers it if connected.
    pub fn refresh(&self, peer: Addr) -> Result<(), Error> {
        self.send(Msg::Refresh { peer })
    }

    pub fn search(&self, conn: ConnId, uuid: Option<Uuid>) -> Result<(), Error> {
        self.send(Msg::Search { conn, uuid })
    }

    pub fn read_char(&self, conn: ConnId, handle: AttHandle, auth: AuthReq) -> Result<(), Error> {
        self.send(Msg::ReadChar { conn, handle, auth })
    }

    pub fn read_descr(&self, conn: ConnId, handle: AttHandle, auth: AuthReq) -> Result<(), Error> {
        self.send(Msg::ReadDescr { conn, handle, auth })
    }

    pub fn read_multiple(
        &self,
        conn: ConnId,
        handles: Vec<AttHandle>,
        auth: AuthReq,
    ) -> Result<(), Error> {
        self.send(Msg::ReadMultiple {
            conn,
            handles,
            auth,
        })
    }

    pub fn write_char(
        &self,
        conn: ConnId,
        handle: AttHandle,
        typ: WriteType,
        value: Vec<u8>,
        auth: AuthReq,
    ) -> Result<(), Error> {
        self.send(Msg::WriteChar {
            conn,
            handle,
            typ,
            value,
            auth,
        })
    }

    pub fn write_descr(
        &self,
        conn: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        auth: AuthReq,
    ) -> Result<(), Error> {
        self.send(Msg::WriteDescr {
            conn,
            handle,
            value,
            auth,
        })
    }

    pub fn prepare_write(
        &self,
        conn: ConnId,
        handle: AttHandle,
        offset: u16,
        value: Vec<u8>,
        auth: AuthReq,
    ) -> Result<(), Error> {
        self.send(Msg::PrepareWrite {
            conn,
            handle,
            offset,
            value,
            auth,
        })
    }

    pub fn execute_write(&self, conn: ConnId, execute: bool) -> Result<(), Error> {
        self.send(Msg::ExecuteWrite { conn, execute })
    }

    pub fn configure_mtu(&self, conn: ConnId, mtu: u16) -> Result<(), Error> {
        self.send(Msg::ConfigureMtu { conn, mtu })
    }

    /// Confirms an indication the application chose to confirm itself.
    pub fn confirm(&self, conn: ConnId, handle: AttHandle) -> Result<(), Error> {
        self.send(Msg::Confirm { conn, handle })
    }

    pub fn register_notify(
        &self,
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
    ) -> Result<(), Error> {
        self.send(Msg::RegisterNotify { cif, peer, handle })
    }

    pub fn deregister_notify(
        &self,
        cif: ClientIf,
        peer: Addr,
        handle: AttHandle,
    ) -> Result<(), Error> {
        self.send(Msg::DeregisterNotify { cif, peer, handle })
    }

    pub fn listen(&self, cif: ClientIf, start: bool) -> Result<(), Error> {
        self.send(Msg::Listen { cif, start })
    }

    /// Stops the driver after the messages already queued are handled.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(Msg::Shutdown)
    }
}

impl crate::store::StoreSink for Handle {
    fn complete(&self, msg: crate::store::StoreMsg) {
        use crate::store::StoreMsg;
        let msg = match msg {
            StoreMsg::Opened { conn, status } => Msg::StoreOpened { conn, status },
            StoreMsg::Loaded { conn, status, recs } => Msg::StoreLoaded { conn, status, recs },
            StoreMsg::Saved { conn, status } => Msg::StoreSaved { conn, status },
        };
        // A send failure only means the pump already stopped.
        let _ = self.send(msg);
    }
}

/// Owns the engine and its receive loop.
#[derive(Debug)]
pub struct Driver {
    rx: mpsc::UnboundedReceiver<Msg>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl Driver {
    /// Runs the engine until [`Handle::shutdown`] or the last handle is
    /// dropped.
    pub async fn run(mut self, tr: Arc<dyn Transport>, store: Arc<dyn CacheStore>) {
        let timers = Arc::new(TokioTimers {
            tx: self.tx.clone(),
        });
        let mut engine = Engine::new(tr, store, timers);
        while let Some(msg) = self.rx.recv().await {
            if matches!(msg, Msg::Shutdown) {
                break;
            }
            engine.dispatch(msg);
        }
        debug!("Client engine stopped");
    }
}

/// Timer implementation that re-enters the pump, keeping fires serialized
/// with every other message.
struct TokioTimers {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Timers for TokioTimers {
    fn schedule(&self, msg: Msg, delay: Duration) -> TimerGuard {
        let ct = CancellationToken::new();
        let guard = ct.clone();
        let tx = self.tx.clone();
        tokio::task::spawn(async move {
            tokio::select! {
                () = ct.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    // A send failure only means the pump already stopped.
                    let _ = tx.send(msg);
                }
            }
        });
        TimerGuard::new(guard)
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use crate::att::Status;
    use crate::client::tests::{Call, FakeSink, FakeStore, FakeTransport};
    use crate::client::Event;
    use crate::le::RawAddr;
    use crate::transport::Iface;

    use super::*;

    #[tokio::test]
    async fn handle_round_trip() {
        let tr = Arc::new(FakeTransport::default());
        let sink = Arc::new(FakeSink::default());
        let (h, d) = channel();
        let driver = tokio::task::spawn(d.run(tr.clone(), Arc::new(FakeStore::default())));
        h.register(sink.clone()).unwrap();
        tokio::task::yield_now().await;
        let cif = match sink.take().as_slice() {
            [Event::Register {
                status: Status::Ok,
                cif: Some(cif),
            }] => *cif,
            e => panic!("unexpected registration outcome: {e:?}"),
        };
        let peer = Addr::Public(RawAddr::from_le_bytes([6, 5, 4, 3, 2, 1]));
        h.open(cif, peer, LinkType::Le, true).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(tr.take(), vec![Call::Register, Call::Connect {
            iface: Iface::new(1).unwrap(),
            direct: true,
        }]);
        h.shutdown().unwrap();
        driver.await.unwrap();
        // The pump is gone; submission reports it.
        assert_matches!(h.send(Msg::Shutdown), Err(Error::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_guard_cancels_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimers { tx };
        drop(timers.schedule(Msg::Shutdown, Duration::from_millis(50)));
        let kept = timers.schedule(Msg::Shutdown, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only the kept timer fires; the dropped guard cancelled the other.
        assert!(matches!(rx.try_recv(), Ok(Msg::Shutdown)));
        assert!(rx.try_recv().is_err());
        drop(kept);
    }
}
