//! Attribute-layer vocabulary shared by the client engine and its
//! collaborators ([Vol 3] Part F).

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;
use std::ops::{Bound, RangeBounds};

use crate::util::name_of;

/// Attribute handle ([Vol 3] Part F, Section 3.2.2).
#[allow(clippy::unsafe_derive_deserialize)]
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    pub(crate) const MIN: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0x0001) },
    );
    pub(crate) const MAX: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0xFFFF) },
    );

    /// Wraps a raw handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the next handle or `None` if the maximum handle was reached.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }

    /// Returns the previous handle or `None` for the minimum handle.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_sub(1))
    }
}

impl Debug for Handle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Handle), self.0.get())
    }
}

impl Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

impl From<Handle> for usize {
    #[inline]
    fn from(h: Handle) -> Self {
        Self::from(h.0.get())
    }
}

/// Inclusive range of attribute handles. This is a `Copy` version of
/// `RangeInclusive<Handle>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[must_use]
pub struct HandleRange {
    start: Handle,
    end: Handle,
}

impl HandleRange {
    /// Handle range that includes all possible handles.
    pub const ALL: Self = Self {
        start: Handle::MIN,
        end: Handle::MAX,
    };

    /// Creates a new handle range `start..=end`.
    #[inline]
    pub const fn new(start: Handle, end: Handle) -> Self {
        assert!(start.0.get() <= end.0.get());
        Self { start, end }
    }

    /// Returns the starting handle.
    #[inline(always)]
    #[must_use]
    pub const fn start(self) -> Handle {
        self.start
    }

    /// Returns the ending handle.
    #[inline(always)]
    #[must_use]
    pub const fn end(self) -> Handle {
        self.end
    }
}

impl RangeBounds<Handle> for HandleRange {
    #[inline]
    fn start_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.start)
    }

    #[inline]
    fn end_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.end)
    }

    #[inline]
    fn contains<U>(&self, item: &U) -> bool
    where
        Handle: PartialOrd<U>,
        U: ?Sized + PartialOrd<Handle>,
    {
        self.start <= *item && *item <= self.end
    }
}

impl Default for HandleRange {
    /// Returns a handle range that includes all possible handles.
    #[inline(always)]
    fn default() -> Self {
        Self::ALL
    }
}

/// Operation status delivered with every asynchronous completion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[must_use]
#[non_exhaustive]
pub enum Status {
    #[default]
    Ok,
    /// Malformed caller input, rejected before any transport activity.
    IllegalParameter,
    /// Pool or allocation exhaustion.
    NoResources,
    /// The session already has an operation outstanding.
    Busy,
    /// Transient backpressure; retry later.
    Congested,
    /// The per-session auxiliary command list is at capacity.
    QueueFull,
    /// Request is not valid in the session's current state.
    WrongState,
    /// An open was requested for a session that is already open.
    AlreadyOpen,
    /// Transport or peer fault.
    Error,
    /// Logic fault within the engine.
    InternalError,
    /// User-initiated abort.
    Cancel,
    /// Partial-batch continuation; more records follow. Not a failure.
    More,
}

impl Status {
    /// Returns whether the status is [`Status::Ok`].
    #[inline(always)]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl Display for Status {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

bitflags::bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_CMD = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const SIGNED_WRITE_CMD = 1 << 6;
        const EXT_PROPS = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Ccc: u16 {
        const NOTIFY = 1 << 0;
        const INDICATE = 1 << 1;
    }
}

/// Authentication requirement attached to read and write requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthReq {
    #[default]
    None,
    NoMitm,
    Mitm,
    SignedNoMitm,
    SignedMitm,
}

/// Write flavor carried by a characteristic write request
/// ([Vol 3] Part G, Section 4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WriteType {
    /// Write Command; no response from the peer.
    NoResponse,
    /// Write Request; peer responds with success or an error.
    Request,
}

/// ATT operation classes reported by transport completion call-ins.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpKind {
    Read,
    Write,
    ExecWrite,
    ConfigMtu,
}
