//! MIME Registry: extension <-> content-type map, reloadable
//! as a whole under a single small lock (the "MIME lock", a leaf lock that
//! always nests inside any other lock taken in this crate).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const DEFAULT_TABLE: &[(&str, &str)] = &[
    ("m3u", "audio/x-mpegurl"),
    ("pls", "audio/x-scpls"),
    ("xspf", "application/xspf+xml"),
    ("ogg", "application/ogg"),
    ("xml", "text/xml"),
    ("mp3", "audio/mpeg"),
    ("aac", "audio/aac"),
    ("aacp", "audio/aacp"),
    ("css", "text/css"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("jpg", "image/jpg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
];

const DEFAULT_UNKNOWN: &str = "application/octet-stream";

/// Built once and cloned on every reload/`new()` rather than rebuilt from
/// `DEFAULT_TABLE` each time.
static DEFAULTS: Lazy<BTreeMap<String, String>> = Lazy::new(|| {
    let mut by_ext = BTreeMap::new();
    for (ext, ty) in DEFAULT_TABLE {
        by_ext.insert((*ext).to_string(), (*ty).to_string());
    }
    by_ext
});

/// An immutable generation of the ext -> content-type map. Ordered so that
/// `extension_for` has a deterministic "first registered extension" answer.
#[derive(Debug, Default)]
struct MimeMap {
    by_ext: BTreeMap<String, String>,
}

impl MimeMap {
    fn defaults() -> Self {
        MimeMap {
            by_ext: DEFAULTS.clone(),
        }
    }

    fn with_overlay(config_text: &str) -> Self {
        let mut by_ext = Self::defaults().by_ext;
        for line in config_text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let ty = match parts.next() {
                Some(t) => t,
                None => continue,
            };
            for ext in parts {
                // config overrides defaults: last-write-wins, later lines beat earlier.
                by_ext.insert(ext.to_string(), ty.to_string());
            }
        }
        MimeMap { by_ext }
    }
}

impl std::ops::Deref for MimeMap {
    type Target = BTreeMap<String, String>;
    fn deref(&self) -> &Self::Target {
        &self.by_ext
    }
}

/// Atomically reloadable MIME registry. `reload` builds a fresh map and
/// swaps the pointer; old maps are dropped once their last reader is gone.
#[derive(Debug)]
pub struct MimeRegistry {
    current: Mutex<Arc<MimeMap>>,
}

impl Default for MimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MimeRegistry {
    pub fn new() -> Self {
        MimeRegistry {
            current: Mutex::new(Arc::new(MimeMap::defaults())),
        }
    }

    /// Build a fresh map from the built-in defaults overlaid with the
    /// contents of a plain-text MIME file, then atomically replace the live
    /// map. `config_text` is `None` when no `mimetypes_fn` is configured.
    pub fn reload(&self, config_text: Option<&str>) {
        let fresh = match config_text {
            Some(text) => MimeMap::with_overlay(text),
            None => MimeMap::defaults(),
        };
        let mut guard = self.current.lock();
        *guard = Arc::new(fresh);
    }

    /// Returns the registered content-type for the extension of `path`, the
    /// default unknown type if the extension isn't registered, or
    /// `text/html` if `path` has no extension at all.
    pub fn content_type_for(&self, path: &str) -> String {
        let ext = Path::new(path).extension().and_then(|e| e.to_str());
        let ext = match ext {
            Some(e) => e,
            None => return "text/html".to_string(),
        };
        let map = self.current.lock().clone();
        map.get(ext)
            .cloned()
            .unwrap_or_else(|| DEFAULT_UNKNOWN.to_string())
    }

    /// Writes the first registered extension mapping to `mimetype` into
    /// `out`. Parameters after a `;` are ignored. Leaves `out` untouched if
    /// no mapping is found.
    pub fn extension_for(&self, mimetype: &str, out: &mut String) {
        let base = mimetype.split([';', ' ']).next().unwrap_or(mimetype);
        if base.is_empty() {
            return;
        }
        let map = self.current.lock().clone();
        for (ext, ty) in map.iter() {
            if ty == base {
                out.clear();
                out.push_str(ext);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extension_lookup() {
        let reg = MimeRegistry::new();
        assert_eq!(reg.content_type_for("song.mp3"), "audio/mpeg");
        assert_eq!(reg.content_type_for("index.html"), "text/html");
    }

    #[test]
    fn unknown_extension_falls_back() {
        let reg = MimeRegistry::new();
        assert_eq!(reg.content_type_for("blob.weird"), "application/octet-stream");
    }

    #[test]
    fn no_extension_is_html() {
        let reg = MimeRegistry::new();
        assert_eq!(reg.content_type_for("README"), "text/html");
    }

    #[test]
    fn reload_is_idempotent() {
        // Loading the same config twice yields identical lookup results.
        let reg = MimeRegistry::new();
        let cfg = "application/x-custom cst\naudio/mpeg mp3\n";
        reg.reload(Some(cfg));
        let first = reg.content_type_for("a.cst");
        reg.reload(Some(cfg));
        let second = reg.content_type_for("a.cst");
        assert_eq!(first, second);
        assert_eq!(first, "application/x-custom");
    }

    #[test]
    fn config_overrides_defaults() {
        let reg = MimeRegistry::new();
        assert_eq!(reg.content_type_for("a.mp3"), "audio/mpeg");
        reg.reload(Some("audio/x-special mp3\n"));
        assert_eq!(reg.content_type_for("a.mp3"), "audio/x-special");
    }

    #[test]
    fn unmodified_default_extension_survives_reload() {
        let reg = MimeRegistry::new();
        reg.reload(Some("audio/x-special mp3\n"));
        assert_eq!(reg.content_type_for("a.png"), "image/png");
    }

    #[test]
    fn later_definition_wins_within_same_reload() {
        let reg = MimeRegistry::new();
        reg.reload(Some("type/a foo\ntype/b foo\n"));
        assert_eq!(reg.content_type_for("x.foo"), "type/b");
    }

    #[test]
    fn extension_for_ignores_parameters() {
        let reg = MimeRegistry::new();
        let mut out = String::new();
        reg.extension_for("audio/mpeg; charset=binary", &mut out);
        assert_eq!(out, "mp3");
    }

    #[test]
    fn extension_for_missing_type_leaves_out_untouched() {
        let reg = MimeRegistry::new();
        let mut out = "unchanged".to_string();
        reg.extension_for("application/does-not-exist", &mut out);
        assert_eq!(out, "unchanged");
    }
}
