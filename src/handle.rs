//! `FileHandle` (FH): a cache entry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::binding::{BindingFlags, FileBinding};
use crate::format::FormatPlugin;
use crate::listener::ListenerId;
use crate::pread::PositionalFile;
use crate::rate::RateEstimator;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a `FileHandle`, distinct from its Arc's address.
/// Used for logging and for comparing "is this the same handle" across a
/// cache detach/replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cache key: `(mount, FALLBACK-bit)`. A `None` mount is the
/// sentinel, which orders before every named entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub mount: Option<String>,
    pub is_fallback: bool,
}

impl CacheKey {
    pub fn sentinel() -> Self {
        CacheKey {
            mount: None,
            is_fallback: false,
        }
    }

    pub fn for_binding(binding: &FileBinding) -> Self {
        if binding.is_sentinel() {
            CacheKey::sentinel()
        } else {
            CacheKey {
                mount: Some(binding.mount.clone()),
                is_fallback: binding.is_fallback(),
            }
        }
    }
}

/// Mutable state of a `FileHandle`, protected by the FH's own lock
/// (acquired after the cache lock is released, never the other way around).
#[derive(Debug)]
pub struct FhState {
    pub binding: FileBinding,
    pub file: Option<Arc<PositionalFile>>,
    pub format: Option<Arc<dyn FormatPlugin>>,
    pub refcount: i64,
    pub peak: i64,
    pub clients: BTreeSet<ListenerId>,
    pub out_bitrate: RateEstimator,
    pub frame_start_pos: u64,
    /// Absolute deadline (ms) after which an idle entry is eligible for
    /// deletion; `None` means "never".
    pub expire: Option<i64>,
    pub stats_handle: Option<String>,
    pub prev_count: i64,
    pub stats_update_at: i64,
}

impl FhState {
    pub fn is_sentinel(&self) -> bool {
        self.binding.is_sentinel()
    }

    /// refcount must equal |clients| for named entries, |clients|+1 for the
    /// sentinel (the permanent self-reference). Logged, not asserted; branch
    /// on "is sentinel" explicitly rather than "mount is null".
    pub fn check_refcount_invariant(&self, handle_id: HandleId) {
        let expected = if self.is_sentinel() {
            self.clients.len() as i64 + 1
        } else {
            self.clients.len() as i64
        };
        if self.refcount != expected {
            log::error!(
                "refcount invariant violated on handle {:?} ({}): refcount={} clients={}",
                handle_id,
                self.binding.mount,
                self.refcount,
                self.clients.len()
            );
        }
    }
}

#[derive(Debug)]
pub struct FileHandle {
    pub id: HandleId,
    pub state: Mutex<FhState>,
}

impl FileHandle {
    pub fn new(binding: FileBinding) -> Arc<Self> {
        let out_bitrate = RateEstimator::default();
        Arc::new(FileHandle {
            id: HandleId::next(),
            state: Mutex::new(FhState {
                binding,
                file: None,
                format: None,
                refcount: 0,
                peak: 0,
                clients: BTreeSet::new(),
                out_bitrate,
                frame_start_pos: 0,
                expire: None,
                stats_handle: None,
                prev_count: -1,
                stats_update_at: 0,
            }),
        })
    }

    /// Construct the distinguished sentinel FH: empty mount, permanent
    /// self-reference, never expires.
    pub fn sentinel() -> Arc<Self> {
        let mut binding = FileBinding::new("");
        binding.flags = BindingFlags::empty();
        let fh = FileHandle::new(binding);
        {
            let mut st = fh.state.lock();
            st.refcount = 1;
            st.expire = None;
        }
        fh
    }
}
