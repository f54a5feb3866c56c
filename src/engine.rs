//! `Engine`: wires the File Handle Cache, MIME registry, worker pool, auth
//! hook, and stats sink together and exposes the entry points an HTTP
//! layer would call: attach, detach, override, kill, list, query, contains,
//! and the periodic scan. Also owns the listener registry, standing in for
//! the external connection layer this crate doesn't implement.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::admin::{self, KillOutcome};
use crate::auth::{AuthHook, PermissiveAuth};
use crate::binding::{BindingFlags, FileBinding, FormatType};
use crate::cache::{FileHandleCache, OpenContext};
use crate::config::{EngineConfig, MountConfig};
use crate::error::FserveError;
use crate::listener::{Listener, ListenerId};
use crate::mime::MimeRegistry;
use crate::playlist::{self, ClientCreateOutcome};
use crate::stats::{NullStats, StatsSink};
use crate::worker::WorkerPool;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Everything `fserve_setup_client_fb`/`fserve_client_create` need to decide
/// how to attach a listener.
pub struct AttachRequest {
    pub mount: String,
    pub is_fallback: bool,
    pub limit: u64,
    pub format_type: FormatType,
    /// Client's declared `Range: bytes=N-` start, if any. Checked against
    /// the FH's available bytes before the refcount is touched.
    pub range_start: Option<u64>,
    /// Whether the request was a `GET` (as opposed to `HEAD`); gates
    /// auth-release on detach along with the admin-path check.
    pub is_get: bool,
}

pub struct Engine {
    cache: FileHandleCache,
    mime: MimeRegistry,
    workers: WorkerPool,
    config: RwLock<EngineConfig>,
    root_dir: PathBuf,
    auth: Box<dyn AuthHook>,
    stats: Box<dyn StatsSink>,
    listeners: RwLock<FxHashMap<ListenerId, Arc<Mutex<Listener>>>>,
}

impl Engine {
    pub fn new(root_dir: PathBuf, config: EngineConfig, worker_count: u32) -> Self {
        Engine {
            cache: FileHandleCache::new(),
            mime: MimeRegistry::new(),
            workers: WorkerPool::new(worker_count.max(1)),
            config: RwLock::new(config),
            root_dir,
            auth: Box::new(PermissiveAuth),
            stats: Box::new(NullStats),
            listeners: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn with_auth(mut self, auth: Box<dyn AuthHook>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_stats(mut self, stats: Box<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn cache(&self) -> &FileHandleCache {
        &self.cache
    }

    pub fn mime(&self) -> &MimeRegistry {
        &self.mime
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Looks up a listener by id for the HTTP layer to drive via `sender::tick`.
    pub fn listener_handle(&self, id: ListenerId) -> Option<Arc<Mutex<Listener>>> {
        self.listeners.read().get(&id).cloned()
    }

    pub fn mimetypes_fn(&self) -> Option<String> {
        self.config.read().mimetypes_fn.clone()
    }

    /// `mimetypes_fn` reload: `content` is the file's
    /// text if `mimetypes_fn` is configured and readable.
    pub fn reload_mime(&self, content: Option<&str>) {
        self.mime.reload(content);
    }

    fn open_ctx(&self) -> OpenContext<'_> {
        OpenContext {
            root_dir: &self.root_dir,
            mime: &self.mime,
        }
    }

    /// `fserve_setup_client_fb`: validate against
    /// `max_listeners`/duplicate-login, then attach to (or open) the named
    /// cache entry. Returns the new listener's id.
    pub fn attach(&self, req: AttachRequest, now_ms: i64) -> Result<ListenerId, FserveError> {
        let cfg = self.config.read();
        if !cfg.fileserve && !req.is_fallback {
            return Err(FserveError::NotFound(req.mount));
        }
        let mount_cfg = cfg.mount_config(&req.mount);
        drop(cfg);

        // A fallback with no throttle limit has nothing to loop against.
        if req.is_fallback && req.limit == 0 {
            return Err(FserveError::forbidden("fallback requires a nonzero limit", true));
        }

        let mut binding = FileBinding::new(req.mount.clone());
        if req.is_fallback {
            binding.flags |= BindingFlags::FALLBACK;
        }
        binding.limit = req.limit;
        binding.format_type = req.format_type;

        let fh = self.cache.open_or_find(&binding, &mount_cfg, &self.open_ctx())?;

        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        let mut listener = Listener::new(id);
        listener.mount = Some(req.mount.clone());
        listener.shared_data = Some(fh.id);
        listener.is_get = req.is_get;

        {
            let st = fh.state.lock();
            if mount_cfg.max_listeners >= 0 && st.refcount >= mount_cfg.max_listeners {
                return Err(FserveError::forbidden("max listeners reached", true));
            }
            if !self.auth.check_duplicate_login(&req.mount, &listener, &mount_cfg) {
                return Err(FserveError::forbidden("duplicate login", false));
            }
            // A declared range past the available bytes is refused before
            // the refcount is touched, not unwound afterwards.
            if let Some(range_start) = req.range_start {
                let available = st.binding.fsize.saturating_sub(st.frame_start_pos);
                if range_start >= available {
                    return Err(FserveError::RangeNotSatisfiable);
                }
                listener.intro_offset = range_start;
            }
        }

        listener.worker_id = self.workers.least_loaded().map(|w| w.0);
        if let Some(worker) = listener.worker_id.map(crate::worker::WorkerId) {
            self.workers.assign(worker);
        }

        self.cache.fh_add_client(&fh, id);
        self.listeners.write().insert(id, Arc::new(Mutex::new(listener)));
        let _ = now_ms;
        Ok(id)
    }

    /// `fserve_client_create`:
    /// classify a missing-file request before falling back to a plain 404.
    pub fn classify_missing(&self, mount: &str) -> ClientCreateOutcome {
        let fileserve_redirect = self.config.read().fileserve_redirect;
        playlist::classify_missing_file(mount, fileserve_redirect)
    }

    /// Detach a listener: release its cache slot, notify the auth hook
    /// (only for an authenticated GET on a real mount), and drop it from
    /// the listener registry once nothing else claims it.
    pub fn detach(&self, id: ListenerId, now_ms: i64) {
        let Some(listener_arc) = self.listeners.read().get(&id).cloned() else {
            return;
        };

        let (mount, worker_id, handle_id, wants_auth_release) = {
            let listener = listener_arc.lock();
            let wants_auth_release =
                listener.is_authenticated() && listener.is_get && !listener.is_admin_path();
            (
                listener.mount.clone().unwrap_or_default(),
                listener.worker_id,
                listener.shared_data,
                wants_auth_release,
            )
        };

        if let Some(worker) = worker_id.map(crate::worker::WorkerId) {
            self.workers.unassign(worker);
        }

        let mut destroy_listener = true;
        if let Some(fh) = self.find_by_mount_and_handle(&mount, handle_id) {
            if wants_auth_release {
                let mount_cfg = self.config.read().mount_config(&mount);
                let listener_ref = listener_arc.lock();
                let outcome = self.auth.auth_release_listener(&listener_ref, &mount, Some(&mount_cfg));
                drop(listener_ref);
                destroy_listener = matches!(outcome, crate::auth::ReleaseOutcome::NoFurtherOwner);
            }
            self.cache.remove_from_fh(&fh, id, now_ms, self.stats.as_ref());
        }

        if destroy_listener {
            self.listeners.write().remove(&id);
        }
    }

    /// Looks up the FH a detaching listener was attached to. The cache is
    /// keyed by `(mount, FALLBACK-bit)`, not handle id, so this tries the
    /// plain entry first and falls back to the FALLBACK entry, confirming
    /// the handle id matches in case the mount has since been overridden.
    fn find_by_mount_and_handle(
        &self,
        mount: &str,
        handle_id: Option<crate::handle::HandleId>,
    ) -> Option<Arc<crate::handle::FileHandle>> {
        for is_fallback in [false, true] {
            let mut binding = FileBinding::new(mount.to_string());
            if is_fallback {
                binding.flags |= BindingFlags::FALLBACK;
            }
            if let Some(fh) = self.cache.find(&binding) {
                if handle_id.is_none() || Some(fh.id) == handle_id {
                    return Some(fh);
                }
            }
        }
        None
    }

    /// `fserve_set_override`.
    pub fn set_override(&self, src_mount: &str, dst_mount: &str, format_type: FormatType) -> bool {
        self.cache.set_override(src_mount, dst_mount, format_type, self.stats.as_ref())
    }

    /// `fserve_kill_client`: two-pass lookup
    /// (plain, then fallback) matching `fserve.c`'s own loop.
    pub fn kill_client(&self, mount: &str, id: u64) -> KillOutcome {
        let target = ListenerId(id);
        for is_fallback in [false, true] {
            let mut binding = FileBinding::new(mount.to_string());
            if is_fallback {
                binding.flags |= BindingFlags::FALLBACK;
            }
            if let Some(fh) = self.cache.find(&binding) {
                let has_client = fh.state.lock().clients.contains(&target);
                if has_client {
                    if let Some(listener) = self.listeners.read().get(&target) {
                        listener.lock().error = true;
                        return KillOutcome::Removed;
                    }
                }
            }
        }
        KillOutcome::NotFound
    }

    /// `fserve_list_clients`: listener ids currently attached
    /// to `mount`, checking the plain entry and the fallback entry.
    pub fn list_clients(&self, mount: &str) -> Vec<u64> {
        let mut ids = Vec::new();
        for is_fallback in [false, true] {
            let mut binding = FileBinding::new(mount.to_string());
            if is_fallback {
                binding.flags |= BindingFlags::FALLBACK;
            }
            if let Some(fh) = self.cache.find(&binding) {
                ids.extend(fh.state.lock().clients.iter().map(|id| id.0));
            }
        }
        ids
    }

    pub fn list_clients_xml(&self, mount: &str) -> String {
        admin::list_clients_xml(mount, &self.list_clients(mount)).render()
    }

    pub fn kill_client_xml(&self, mount: &str, id: u64) -> String {
        admin::kill_response_xml(id, self.kill_client(mount, id)).render()
    }

    /// `fserve_query_count`.
    pub fn query_count(&self, mount: &str, is_fallback: bool, limit: u64, now_ms: i64) -> Option<i64> {
        let mut binding = FileBinding::new(mount.to_string());
        if is_fallback {
            binding.flags |= BindingFlags::FALLBACK;
        }
        binding.limit = limit;
        let mount_cfg = self.config.read().mount_config(mount);
        self.cache.query_count(&binding, &mount_cfg, &self.open_ctx(), now_ms)
    }

    /// `fserve_contains`: non-blocking probe, `None` on "would
    /// block, try later".
    pub fn contains(&self, raw_mount: &str) -> Option<bool> {
        self.cache.try_contains(raw_mount)
    }

    /// `fserve_scan`: periodic expiry/stats sweep. Pass
    /// `now_ms == 0` to force shutdown-style expiry of every idle entry.
    pub fn scan(&self, now_ms: i64) {
        self.cache.scan(now_ms, now_ms == 0, self.stats.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) {
        let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(content).unwrap();
    }

    #[test]
    fn attach_and_detach_round_trip() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 2);
        let id = engine
            .attach(
                AttachRequest {
                    mount: "/a.mp3".to_string(),
                    is_fallback: false,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: None,
                    is_get: true,
                },
                0,
            )
            .unwrap();
        assert_eq!(engine.list_clients("/a.mp3"), vec![id.0]);
        engine.detach(id, 1_000);
        assert!(engine.list_clients("/a.mp3").is_empty());
    }

    #[test]
    fn attach_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        let err = engine
            .attach(
                AttachRequest {
                    mount: "/nope.mp3".to_string(),
                    is_fallback: false,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: None,
                    is_get: true,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, FserveError::NotFound(_)));
    }

    #[test]
    fn attach_respects_max_listeners() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let mut config = EngineConfig::default();
        config.mounts.insert(
            "/a.mp3".to_string(),
            MountConfig {
                max_listeners: 1,
                auth_required: false,
            },
        );
        let engine = Engine::new(dir.path().to_path_buf(), config, 1);
        let req = || AttachRequest {
            mount: "/a.mp3".to_string(),
            is_fallback: false,
            limit: 0,
            format_type: FormatType::Undefined,
            range_start: None,
            is_get: true,
        };
        engine.attach(req(), 0).unwrap();
        let err = engine.attach(req(), 0).unwrap_err();
        assert!(matches!(err, FserveError::Forbidden { redirect: true, .. }));
    }

    #[test]
    fn attach_refuses_a_zero_limit_fallback() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        let err = engine
            .attach(
                AttachRequest {
                    mount: "/a.mp3".to_string(),
                    is_fallback: true,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: None,
                    is_get: true,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, FserveError::Forbidden { redirect: true, .. }));
        assert!(engine.cache().find(&FileBinding::new("/a.mp3")).is_none());
    }

    #[test]
    fn attach_refuses_a_range_past_available_bytes_without_touching_refcount() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        let err = engine
            .attach(
                AttachRequest {
                    mount: "/a.mp3".to_string(),
                    is_fallback: false,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: Some(1_000),
                    is_get: true,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, FserveError::RangeNotSatisfiable));

        let fh = engine.cache().find(&FileBinding::new("/a.mp3")).unwrap();
        assert_eq!(fh.state.lock().refcount, 0);
        assert!(engine.list_clients("/a.mp3").is_empty());
    }

    #[test]
    fn kill_client_marks_listener_error() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        let id = engine
            .attach(
                AttachRequest {
                    mount: "/a.mp3".to_string(),
                    is_fallback: false,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: None,
                    is_get: true,
                },
                0,
            )
            .unwrap();
        assert_eq!(engine.kill_client("/a.mp3", id.0), KillOutcome::Removed);
        assert_eq!(engine.kill_client("/a.mp3", 99_999), KillOutcome::NotFound);
    }

    #[test]
    fn classify_missing_m3u_synthesizes_playlist() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        let outcome = engine.classify_missing("/radio.m3u");
        assert!(matches!(outcome, ClientCreateOutcome::SynthesizePlaylist(_)));
    }

    #[test]
    fn set_override_reaches_into_cache() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.mp3", b"hello world");
        let engine = Engine::new(dir.path().to_path_buf(), EngineConfig::default(), 1);
        engine
            .attach(
                AttachRequest {
                    mount: "/a.mp3".to_string(),
                    is_fallback: true,
                    limit: 0,
                    format_type: FormatType::Undefined,
                    range_start: None,
                    is_get: true,
                },
                0,
            )
            .unwrap();
        assert!(engine.set_override("/a.mp3", "/b.mp3", FormatType::Mp3));
    }
}
