//! File Handle Cache: the keyed store of open files with refcounts, expiry,
//! and the override chain.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::binding::{BindingFlags, FileBinding, FormatType};
use crate::config::MountConfig;
use crate::error::FserveError;
use crate::format::{FormatPlugin, GenericFormat};
use crate::handle::{CacheKey, FhState, FileHandle};
use crate::listener::ListenerId;
use crate::mime::MimeRegistry;
use crate::pread::PositionalFile;
use crate::rate::RateEstimator;
use crate::stats::StatsSink;

/// Idle grace period before a vacated named entry is deleted.
const EXPIRE_GRACE_MS: i64 = 120_000;
/// Short preflight timeout used by the `query_count` materializer path.
const PREFLIGHT_EXPIRE_MS: i64 = 20_000;
/// Stats refresh interval for rate-limited entries.
const STATS_REFRESH_MS: i64 = 5_000;
/// Bitrate sanity-check tolerance before logging a mismatch warning.
const BITRATE_TOLERANCE: f64 = 0.10;

fn format_type_for_content_type(content_type: &str) -> FormatType {
    match content_type {
        "audio/mpeg" => FormatType::Mp3,
        "application/ogg" => FormatType::Ogg,
        "audio/aac" | "audio/aacp" => FormatType::Aac,
        _ => FormatType::Undefined,
    }
}

/// Stand-in plugin for a known container format. Real MP3/Ogg/AAC framing
/// is out of scope; this still reports the right `format_type` so the
/// fallback format-mismatch check has something to compare
/// against, and reads generically otherwise.
#[derive(Debug)]
struct TypedFormat {
    format_type: FormatType,
    content_type: String,
}

impl FormatPlugin for TypedFormat {
    fn format_type(&self) -> FormatType {
        self.format_type
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn probe(&self, _file: &PositionalFile) -> crate::format::FormatProbe {
        crate::format::FormatProbe {
            frame_start_pos: 0,
            bitrate_bits_per_sec: None,
            detected_type: self.format_type,
        }
    }

    fn read_frame(
        &self,
        file: &PositionalFile,
        offset: u64,
        buf: &mut Vec<u8>,
    ) -> crate::format::FormatReadOutcome {
        GenericFormat::new(self.content_type.clone()).read_frame(file, offset, buf)
    }
}

fn plugin_for(format_type: FormatType, content_type: String) -> Arc<dyn FormatPlugin> {
    if format_type == FormatType::Undefined {
        Arc::new(GenericFormat::new(content_type))
    } else {
        Arc::new(TypedFormat {
            format_type,
            content_type,
        })
    }
}

/// Resolves a logical mount to a filesystem path and looks up content
/// types. Bundled so `open_or_find` doesn't need five separate parameters.
pub struct OpenContext<'a> {
    pub root_dir: &'a Path,
    pub mime: &'a MimeRegistry,
}

/// Outcome of `remove_from_fh` that the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Entry stays in the cache (or, if DELETE was set, simply has its Arc
    /// dropped by the caller once all references are released).
    Kept,
}

#[derive(Debug)]
pub struct FileHandleCache {
    cache: RwLock<BTreeMap<CacheKey, Arc<FileHandle>>>,
    sentinel: Arc<FileHandle>,
}

impl FileHandleCache {
    pub fn new() -> Self {
        let sentinel = FileHandle::sentinel();
        let mut map = BTreeMap::new();
        map.insert(CacheKey::sentinel(), sentinel.clone());
        FileHandleCache {
            cache: RwLock::new(map),
            sentinel,
        }
    }

    pub fn sentinel(&self) -> Arc<FileHandle> {
        self.sentinel.clone()
    }

    /// Probe without blocking; `None` means "would block", mirroring
    /// `fserve_contains`'s -1 case.
    pub fn try_contains(&self, raw_mount: &str) -> Option<bool> {
        let guard = self.cache.try_read()?;
        let (mount, flags) = FileBinding::normalize_lookup_key(raw_mount, BindingFlags::empty());
        let key = CacheKey {
            mount: Some(mount),
            is_fallback: flags.contains(BindingFlags::FALLBACK),
        };
        Some(guard.contains_key(&key))
    }

    /// `find`: strips `fallback-`/`file-` prefixes from the
    /// lookup key, then probes the ordered map under a read lock.
    pub fn find(&self, finfo: &FileBinding) -> Option<Arc<FileHandle>> {
        let (mount, flags) = FileBinding::normalize_lookup_key(&finfo.mount, finfo.flags);
        let key = if mount.is_empty() {
            CacheKey::sentinel()
        } else {
            CacheKey {
                mount: Some(mount),
                is_fallback: flags.contains(BindingFlags::FALLBACK),
            }
        };
        self.cache.read().get(&key).cloned()
    }

    /// `open_or_find`: returns the cached entry if present,
    /// otherwise opens the file, probes its format, and inserts it.
    pub fn open_or_find(
        &self,
        finfo: &FileBinding,
        _mount_cfg: &MountConfig,
        ctx: &OpenContext,
    ) -> Result<Arc<FileHandle>, FserveError> {
        let key = CacheKey::for_binding(finfo);
        {
            let guard = self.cache.read();
            if let Some(existing) = guard.get(&key) {
                if finfo.is_fallback() {
                    let st = existing.state.lock();
                    if st.binding.format_type != finfo.format_type
                        && finfo.format_type != FormatType::Undefined
                        && st.binding.format_type != FormatType::Undefined
                    {
                        return Err(FserveError::FormatMismatch(finfo.mount.clone()));
                    }
                }
                return Ok(existing.clone());
            }
        }

        // Not present: build, open, and insert under the write lock so two
        // racing openers can't both create an entry for the same key.
        let mut guard = self.cache.write();
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }

        let mut binding = finfo.clone();
        let relative = binding.mount.trim_start_matches('/');
        let full_path = ctx.root_dir.join(relative);

        let content_type = ctx.mime.content_type_for(&binding.mount);
        let detected_type = format_type_for_content_type(&content_type);
        if binding.format_type == FormatType::Undefined {
            binding.format_type = detected_type;
        }
        if binding.is_fallback()
            && binding.format_type != detected_type
            && detected_type != FormatType::Undefined
            && binding.format_type != FormatType::Undefined
        {
            return Err(FserveError::FormatMismatch(binding.mount.clone()));
        }

        let file = PositionalFile::open(&full_path)
            .map_err(|_| FserveError::NotFound(binding.mount.clone()))?;
        let fsize = file.len().unwrap_or(0);
        binding.fsize = fsize;

        let format: Arc<dyn FormatPlugin> = if binding.format_type != FormatType::Undefined {
            let plugin = plugin_for(binding.format_type, content_type);
            if fsize == 0 {
                return Err(FserveError::FormatInit(binding.mount.clone()));
            }
            plugin
        } else {
            Arc::new(GenericFormat::new(content_type))
        };

        let probe = format.probe(&file);
        if binding.limit > 0 {
            if let Some(bitrate) = probe.bitrate_bits_per_sec {
                let ratio = binding.limit as f64 / (bitrate as f64 / 8.0);
                if !(1.0 - BITRATE_TOLERANCE..=1.0 + BITRATE_TOLERANCE).contains(&ratio) {
                    log::warn!(
                        "bitrate mismatch for {}: advertised {} bits/sec, detected {} bits/sec",
                        binding.mount,
                        binding.limit * 8,
                        bitrate
                    );
                }
            }
        }

        let fh = FileHandle::new(binding.clone());
        {
            let mut st = fh.state.lock();
            st.file = Some(Arc::new(file));
            st.format = Some(format);
            st.frame_start_pos = probe.frame_start_pos;
            st.expire = if binding.is_fallback() { None } else { None };
            st.out_bitrate = if binding.limit > 0 {
                RateEstimator::default()
            } else {
                RateEstimator::new(1)
            };
        }
        guard.insert(key, fh.clone());
        Ok(fh)
    }

    /// `set_override`: atomically detach the existing entry
    /// with `DELETE | ~FALLBACK` and a stored override destination, and
    /// insert a fresh empty entry under the original key. Returns `true` on
    /// success, `false` if `src_mount` wasn't cached.
    pub fn set_override(&self, src_mount: &str, dst_mount: &str, format_type: FormatType, stats: &dyn StatsSink) -> bool {
        let probe_binding = FileBinding {
            mount: src_mount.to_string(),
            flags: BindingFlags::FALLBACK,
            limit: 0,
            format_type,
            override_mount: None,
            fsize: 0,
        };
        let mut guard = self.cache.write();
        let key = CacheKey::for_binding(&probe_binding);
        let Some(existing) = guard.get(&key).cloned() else {
            return false;
        };

        let mut st = existing.state.lock();
        let stats_name = st.stats_handle.take();

        let mut fresh_binding = FileBinding::new(src_mount.to_string());
        fresh_binding.flags |= BindingFlags::FALLBACK;
        let fresh = FileHandle::new(fresh_binding);
        guard.insert(key, fresh);

        st.binding.flags |= BindingFlags::DELETE;
        st.binding.flags &= !BindingFlags::FALLBACK;
        st.binding.override_mount = Some(dst_mount.to_string());
        st.binding.format_type = format_type;
        st.file = None;
        st.format = None;

        if let Some(name) = stats_name {
            stats.clear(&name);
        }
        true
    }

    /// `fh_add_client`. The first
    /// attach on a rate-limited entry opens a stats handle; `scan` pushes
    /// the actual listener count/bitrate on its next pass.
    pub fn fh_add_client(&self, fh: &Arc<FileHandle>, listener_id: ListenerId) {
        let mut st = fh.state.lock();
        if st.refcount == 0 && st.binding.limit > 0 {
            if let Some(name) = stats_handle_name(&st) {
                st.prev_count = -1;
                st.stats_handle = Some(name);
            }
        }
        st.clients.insert(listener_id);
        st.refcount += 1;
        if st.refcount > st.peak {
            st.peak = st.refcount;
        }
        st.check_refcount_invariant(fh.id);
    }

    /// `remove_from_fh`. `now_ms` is used
    /// to set the 120s expiry grace period.
    pub fn remove_from_fh(&self, fh: &Arc<FileHandle>, listener_id: ListenerId, now_ms: i64, stats: &dyn StatsSink) -> DetachOutcome {
        let mut st = fh.state.lock();
        st.refcount -= 1;
        st.clients.remove(&listener_id);
        st.check_refcount_invariant(fh.id);

        if st.refcount == 0 && !st.is_sentinel() {
            if st.binding.is_fallback() {
                if let Some(name) = st.stats_handle.take() {
                    stats.clear(&name);
                }
            } else if st.binding.flags.contains(BindingFlags::DELETE) {
                // Already unlinked from the cache; nothing further to do
                // here, the Arc is destroyed once the last reference drops.
            } else {
                st.expire = Some(now_ms + EXPIRE_GRACE_MS);
                st.out_bitrate = RateEstimator::default();
            }
        }
        DetachOutcome::Kept
    }

    /// `query_count`. For a fallback with a nonzero limit
    /// this also materializes the entry (opening the file if necessary).
    pub fn query_count(
        &self,
        finfo: &FileBinding,
        mount_cfg: &MountConfig,
        ctx: &OpenContext,
        now_ms: i64,
    ) -> Option<i64> {
        if finfo.is_fallback() && finfo.limit > 0 {
            let fh = self.open_or_find(finfo, mount_cfg, ctx).ok()?;
            let mut st = fh.state.lock();
            let count = st.refcount;
            if count == 0 {
                st.expire = Some(now_ms + PREFLIGHT_EXPIRE_MS);
            }
            Some(count)
        } else {
            let fh = self.find(finfo)?;
            let st = fh.state.lock();
            Some(st.refcount)
        }
    }

    /// `scan`. `shutting_down` forces every entry's expiry
    /// to the immediate past so the *next* scan deletes it.
    pub fn scan(&self, now_ms: i64, shutting_down: bool, stats: &dyn StatsSink) {
        let mut guard = self.cache.write();
        let mut to_delete = Vec::new();

        for (key, fh) in guard.iter() {
            let mut st = fh.state.lock();
            if shutting_down {
                st.expire = Some(0);
                continue;
            }

            if st.binding.limit > 0 {
                if let Some(name) = st.stats_handle.clone() {
                    if st.prev_count != st.refcount {
                        st.prev_count = st.refcount;
                        stats.set_listeners(&name, st.refcount, st.peak);
                    }
                    if st.stats_update_at <= now_ms {
                        st.stats_update_at = now_ms + STATS_REFRESH_MS;
                        let kbps = (8 * st.out_bitrate.avg() as i64) / 1024;
                        stats.set_outgoing_kbitrate(&name, kbps);
                    }
                }
            }

            if st.refcount == 0 {
                if let Some(expire) = st.expire {
                    if now_ms >= expire && !st.is_sentinel() {
                        to_delete.push(key.clone());
                    }
                }
            }
        }

        for key in to_delete {
            guard.remove(&key);
        }
    }
}

impl Default for FileHandleCache {
    fn default() -> Self {
        Self::new()
    }
}

fn stats_handle_name(st: &FhState) -> Option<String> {
    if st.binding.mount.is_empty() {
        return None;
    }
    Some(format!(
        "{}-{}",
        if st.binding.is_fallback() { "fallback" } else { "file" },
        st.binding.mount
    ))
}
