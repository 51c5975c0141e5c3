//! Per-session command serialization.
//!
//! Each session owns at most one in-flight ATT command; everything else
//! waits on a bounded auxiliary list. Prepare-write sequences must not
//! interleave, so a prepare-write that would queue behind another
//! prepare-write or an execute-write is rejected outright.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::att::{AuthReq, Ccc, Handle, OpKind, Status, WriteType};
use crate::client::QUEUE_DEPTH;

/// One serialized ATT command. The variant records which API call produced
/// it, which in turn selects the completion event kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum Command {
    ReadChar {
        handle: Handle,
        auth: AuthReq,
    },
    ReadDescr {
        handle: Handle,
        auth: AuthReq,
    },
    ReadMultiple {
        handles: SmallVec<[Handle; 4]>,
        auth: AuthReq,
    },
    WriteChar {
        handle: Handle,
        typ: WriteType,
        value: Vec<u8>,
        auth: AuthReq,
    },
    WriteDescr {
        handle: Handle,
        value: Vec<u8>,
        auth: AuthReq,
    },
    PrepareWrite {
        handle: Handle,
        offset: u16,
        value: Vec<u8>,
        auth: AuthReq,
    },
    ExecuteWrite {
        execute: bool,
    },
    ConfigureMtu {
        mtu: u16,
    },
    /// Service-change watchdog CCC write. Completes into the watchdog, not
    /// an application event.
    WriteCcc {
        handle: Handle,
        value: Ccc,
    },
}

impl Command {
    /// Returns the transport operation class this command completes as.
    pub fn kind(&self) -> OpKind {
        match *self {
            Self::ReadChar { .. } | Self::ReadDescr { .. } | Self::ReadMultiple { .. } => {
                OpKind::Read
            }
            Self::WriteChar { .. }
            | Self::WriteDescr { .. }
            | Self::PrepareWrite { .. }
            | Self::WriteCcc { .. } => OpKind::Write,
            Self::ExecuteWrite { .. } => OpKind::ExecWrite,
            Self::ConfigureMtu { .. } => OpKind::ConfigMtu,
        }
    }

    fn blocks_prepare(&self) -> bool {
        matches!(self, Self::PrepareWrite { .. } | Self::ExecuteWrite { .. })
    }
}

/// Outcome of [`CmdQueue::enqueue`].
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Enqueue {
    /// The command occupies the in-flight slot; submit it now.
    Submit,
    /// The command was appended to the auxiliary list.
    Queued,
    /// The command was rejected; complete it with this status.
    Reject(Command, Status),
}

/// Outcome of [`CmdQueue::finish`].
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Finish {
    /// The in-flight command, freed from the slot.
    Done(Command),
    /// The completion's operation class does not match the in-flight
    /// command; nothing was freed.
    Mismatch,
    /// No command was in flight.
    Idle,
}

#[derive(Debug, Default)]
pub(super) struct CmdQueue {
    inflight: Option<Command>,
    pending: VecDeque<Command>,
}

impl CmdQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inflight(&self) -> Option<&Command> {
        self.inflight.as_ref()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inflight.is_none() && self.pending.is_empty()
    }

    /// Accepts a command for submission or queueing. With `defer` set
    /// (discovery in progress), the in-flight slot is not used and every
    /// accepted command queues.
    pub fn enqueue(&mut self, cmd: Command, defer: bool) -> Enqueue {
        if matches!(cmd, Command::PrepareWrite { .. })
            && (self.inflight.iter().chain(&self.pending)).any(Command::blocks_prepare)
        {
            return Enqueue::Reject(cmd, Status::Congested);
        }
        if self.inflight.is_none() && self.pending.is_empty() && !defer {
            self.inflight = Some(cmd);
            return Enqueue::Submit;
        }
        if self.pending.len() >= QUEUE_DEPTH {
            return Enqueue::Reject(cmd, Status::QueueFull);
        }
        self.pending.push_back(cmd);
        Enqueue::Queued
    }

    /// Completes the in-flight command against a transport completion of
    /// class `op`.
    pub fn finish(&mut self, op: OpKind) -> Finish {
        match self.inflight.take() {
            None => Finish::Idle,
            Some(cmd) if cmd.kind() != op => {
                self.inflight = Some(cmd);
                Finish::Mismatch
            }
            Some(cmd) => Finish::Done(cmd),
        }
    }

    /// Moves the next queued command into the free in-flight slot.
    /// Returns `None` if a command is still in flight or nothing is queued.
    pub fn advance(&mut self) -> Option<&Command> {
        if self.inflight.is_some() {
            return None;
        }
        self.inflight = self.pending.pop_front();
        self.inflight.as_ref()
    }

    /// Removes the in-flight command after a synchronous submission
    /// failure.
    pub fn abort(&mut self) -> Option<Command> {
        self.inflight.take()
    }

    /// Drains every owned command for terminal completion on teardown.
    pub fn flush(&mut self) -> Vec<Command> {
        let mut v = Vec::with_capacity(usize::from(self.inflight.is_some()) + self.pending.len());
        v.extend(self.inflight.take());
        v.extend(self.pending.drain(..));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn read(v: u16) -> Command {
        Command::ReadChar {
            handle: h(v),
            auth: AuthReq::None,
        }
    }

    fn prep(v: u16) -> Command {
        Command::PrepareWrite {
            handle: h(v),
            offset: 0,
            value: vec![1],
            auth: AuthReq::None,
        }
    }

    #[test]
    fn single_inflight() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(read(1), false), Enqueue::Submit);
        assert_eq!(q.enqueue(read(2), false), Enqueue::Queued);
        assert_eq!(q.inflight(), Some(&read(1)));
        assert_eq!(q.finish(OpKind::Read), Finish::Done(read(1)));
        assert_eq!(q.advance(), Some(&read(2)));
        assert_eq!(q.advance(), None);
    }

    #[test]
    fn mismatch_keeps_command() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(read(1), false), Enqueue::Submit);
        assert_eq!(q.finish(OpKind::Write), Finish::Mismatch);
        assert_eq!(q.inflight(), Some(&read(1)));
        assert_eq!(q.finish(OpKind::Read), Finish::Done(read(1)));
        assert_eq!(q.finish(OpKind::Read), Finish::Idle);
    }

    #[test]
    fn prepare_no_interleave() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(prep(1), false), Enqueue::Submit);
        assert_eq!(
            q.enqueue(prep(2), false),
            Enqueue::Reject(prep(2), Status::Congested)
        );
        // A plain read may still queue behind a prepare-write.
        assert_eq!(q.enqueue(read(3), false), Enqueue::Queued);
        // An execute-write queues, and then also blocks further prepares.
        assert_eq!(
            q.enqueue(Command::ExecuteWrite { execute: true }, false),
            Enqueue::Queued
        );
        assert_eq!(q.finish(OpKind::Write), Finish::Done(prep(1)));
        // The queued execute-write keeps blocking prepares even while the
        // in-flight slot is free.
        assert_eq!(
            q.enqueue(prep(4), false),
            Enqueue::Reject(prep(4), Status::Congested)
        );
        // Commands queued ahead keep their place.
        assert_eq!(q.enqueue(read(5), false), Enqueue::Queued);
    }

    #[test]
    fn bounded_pending() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(read(1), false), Enqueue::Submit);
        for i in 0..QUEUE_DEPTH {
            #[allow(clippy::cast_possible_truncation)]
            let cmd = read(i as u16 + 2);
            assert_eq!(q.enqueue(cmd, false), Enqueue::Queued);
        }
        assert_eq!(
            q.enqueue(read(99), false),
            Enqueue::Reject(read(99), Status::QueueFull)
        );
    }

    #[test]
    fn defer_queues_everything() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(read(1), true), Enqueue::Queued);
        assert!(q.inflight().is_none());
        assert_eq!(q.advance(), Some(&read(1)));
    }

    #[test]
    fn flush_drains_all() {
        let mut q = CmdQueue::new();
        assert_eq!(q.enqueue(read(1), false), Enqueue::Submit);
        assert_eq!(q.enqueue(read(2), false), Enqueue::Queued);
        let all = q.flush();
        assert_eq!(all, vec![read(1), read(2)]);
        assert!(q.is_idle());
    }
}
