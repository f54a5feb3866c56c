//! `Listener`: the per-connection state the engine reads and writes.
//! Normally owned by an external HTTP/connection layer; since none exists
//! in this crate, the engine keeps listeners in an id-indexed registry
//! instead.

use bitflags::bitflags;
use std::collections::VecDeque;

use crate::handle::HandleId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ListenerFlags: u32 {
        const AUTHENTICATED     = 0b00001;
        const HAS_INTRO_CONTENT = 0b00010;
        const IN_FSERVE         = 0b00100;
        const WANTS_FLV         = 0b01000;
        const KEEPALIVE         = 0b10000;
    }
}

/// Stable listener identity, independent of the HTTP connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

/// A queued intro-content buffer: HTTP/format-level bytes queued before the
/// file body begins. `is_header` mirrors `BUFFER_CONTAINS_HDR` and routes
/// through the format's header writer instead of the generic content writer.
#[derive(Debug, Clone)]
pub struct IntroBuffer {
    pub data: Vec<u8>,
    pub is_header: bool,
}

/// Which of the three sender state machines currently drives this listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    PreFile,
    Unthrottled,
    Throttled,
}

/// Outcome of one `tick()` call, interpreted by the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Keep ticking immediately (used internally; workers normally see
    /// `RescheduleIn`).
    Continue,
    /// Call `tick` again no earlier than this many milliseconds from now.
    RescheduleIn(i64),
    /// The listener is done; detach and drop it.
    Terminate,
    /// Migrate to a new binding (override in progress).
    Migrate(crate::binding::FileBinding),
}

#[derive(Debug, Clone)]
pub struct Listener {
    pub id: ListenerId,
    /// Non-owning back-reference to the FH this listener is attached to.
    pub shared_data: Option<HandleId>,
    pub refbufs: VecDeque<IntroBuffer>,
    /// Byte offset within the current head-of-queue refbuf.
    pub pos: usize,
    /// File offset to resume reading from (frame_start_pos on loop).
    pub intro_offset: u64,
    /// Bytes sent since `timer_start`, used by the throttled sender's rate calc.
    pub counter: u64,
    /// Wall-clock start (ms) of the current throttling window.
    pub timer_start: i64,
    /// Next wake time requested by the active sender (ms, worker clock).
    pub schedule_ms: i64,
    /// Per-tick throttle delay hint the sender last computed (ms).
    pub throttle: i64,
    pub ops: SenderState,
    pub flags: ListenerFlags,
    pub worker_id: Option<u32>,
    pub mount: Option<String>,
    /// Set once a response code has been decided (e.g. by a prior 404/416).
    pub response_code: Option<u16>,
    /// Set by admin kill / connection-layer errors; observed on next tick.
    pub error: bool,
    /// Whether the request was a `GET` rather than a `HEAD`; auth-release on
    /// detach only applies to `GET`s on a real (non-admin) mount.
    pub is_get: bool,
}

impl Listener {
    pub fn new(id: ListenerId) -> Self {
        Listener {
            id,
            shared_data: None,
            refbufs: VecDeque::new(),
            pos: 0,
            intro_offset: 0,
            counter: 0,
            timer_start: 0,
            schedule_ms: 0,
            throttle: 0,
            ops: SenderState::PreFile,
            flags: ListenerFlags::empty(),
            worker_id: None,
            mount: None,
            response_code: None,
            error: false,
            is_get: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.flags.contains(ListenerFlags::AUTHENTICATED)
    }

    /// Mirrors `fserve.c`'s admin-path carve-out: `/admin` requests never go
    /// through the authenticated-release accounting a real mount gets.
    pub fn is_admin_path(&self) -> bool {
        self.mount.as_deref().is_some_and(|m| m.starts_with("/admin"))
    }
}
