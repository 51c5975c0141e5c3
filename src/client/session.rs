use crate::client::queue::CmdQueue;
use crate::le::{Addr, LinkType};
use crate::transport::ConnId;
use crate::util::Slot;

/// Session state. An unallocated pool slot is the implicit idle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum SessionState {
    /// Open requested; waiting for the link to come up.
    WaitConn,
    /// Link up, cache settled; commands are submitted as they arrive.
    Conn,
    /// Cache load or discovery in progress; commands are deferred.
    Discover,
}

/// Discovery-deferral flag ordering rediscovery against the command queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Defer {
    None,
    /// A service change wants rediscovery once the in-flight command
    /// completes.
    Discovery,
    /// Commands were enqueued during discovery and must be reissued when it
    /// completes.
    Reissue,
}

/// Connection control block: one logical session between a registered
/// application and a peer. Owns the session state machine and the single
/// in-flight command; references its registration and server record by
/// slot.
#[derive(Debug)]
pub(super) struct Clcb {
    pub cif: Slot,
    pub srcb: Slot,
    pub peer: Addr,
    pub link: LinkType,
    pub conn: Option<ConnId>,
    pub state: SessionState,
    pub queue: CmdQueue,
    pub defer: Defer,
    /// Transport congestion on this link; new submissions are held back
    /// until it clears.
    pub congested: bool,
}

impl Clcb {
    pub fn new(cif: Slot, srcb: Slot, peer: Addr, link: LinkType) -> Self {
        Self {
            cif,
            srcb,
            peer,
            link,
            conn: None,
            state: SessionState::WaitConn,
            queue: CmdQueue::new(),
            defer: Defer::None,
            congested: false,
        }
    }
}
