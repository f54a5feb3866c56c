//! `FileBinding` (FB): the identity of a served artifact.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindingFlags: u32 {
        /// This binding is a fallback (looped, paced) rather than a plain file.
        const FALLBACK  = 0b0001;
        /// The cache entry has been detached from the cache and is pending
        /// destruction once its refcount reaches zero.
        const DELETE    = 0b0010;
        /// A previous lookup for this binding failed to find the file.
        const MISSING   = 0b0100;
        /// Path resolution should use the admin file root, not the normal one.
        const USE_ADMIN = 0b1000;
    }
}

/// Format tag for a served file. `Undefined` defers to the generic writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatType {
    #[default]
    Undefined,
    Mp3,
    Ogg,
    Aac,
}

/// Identity of a served artifact: a logical mount, its flags, its pacing
/// target, its format, and (if migration has been requested) an override
/// destination mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBinding {
    /// Logical path; empty denotes the sentinel "no-file" binding.
    pub mount: String,
    pub flags: BindingFlags,
    /// Target bytes/sec; 0 means unthrottled.
    pub limit: u64,
    pub format_type: FormatType,
    /// Migration destination, set by `set_override`.
    pub override_mount: Option<String>,
    /// File byte length.
    pub fsize: u64,
}

impl FileBinding {
    pub fn new(mount: impl Into<String>) -> Self {
        FileBinding {
            mount: mount.into(),
            flags: BindingFlags::empty(),
            limit: 0,
            format_type: FormatType::Undefined,
            override_mount: None,
            fsize: 0,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.flags.contains(BindingFlags::FALLBACK)
    }

    pub fn is_sentinel(&self) -> bool {
        self.mount.is_empty()
    }

    /// Strips a `fallback-` or `file-` prefix from a lookup key, returning
    /// the bare mount and, for `fallback-`, forcing the FALLBACK bit on.
    /// Mirrors `find_fh`'s key normalization in `fserve.c`.
    pub fn normalize_lookup_key(raw_mount: &str, flags: BindingFlags) -> (String, BindingFlags) {
        if let Some(stripped) = raw_mount.strip_prefix("fallback-") {
            (stripped.to_string(), flags | BindingFlags::FALLBACK)
        } else if let Some(stripped) = raw_mount.strip_prefix("file-") {
            (stripped.to_string(), flags)
        } else {
            (raw_mount.to_string(), flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fallback_prefix_and_sets_flag() {
        let (mount, flags) = FileBinding::normalize_lookup_key("fallback-/live.mp3", BindingFlags::empty());
        assert_eq!(mount, "/live.mp3");
        assert!(flags.contains(BindingFlags::FALLBACK));
    }

    #[test]
    fn normalize_strips_file_prefix() {
        let (mount, flags) = FileBinding::normalize_lookup_key("file-/a.mp3", BindingFlags::empty());
        assert_eq!(mount, "/a.mp3");
        assert!(!flags.contains(BindingFlags::FALLBACK));
    }

    #[test]
    fn normalize_passes_through_plain_mount() {
        let (mount, _) = FileBinding::normalize_lookup_key("/a.mp3", BindingFlags::empty());
        assert_eq!(mount, "/a.mp3");
    }
}
