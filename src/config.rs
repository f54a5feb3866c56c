//! Configuration: recognized keys, loaded with `serde`+`toml`, scaled down
//! to the keys this engine actually consumes.

use std::collections::HashMap;

use serde::Deserialize;

/// Per-mount configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// `>= 0` caps listeners; `0` refuses all attaches; negative means
    /// unlimited. Absent means unlimited.
    #[serde(default = "default_max_listeners")]
    pub max_listeners: i64,
    /// Whether duplicate-login checks apply to this mount.
    #[serde(default)]
    pub auth_required: bool,
}

fn default_max_listeners() -> i64 {
    -1
}

impl MountConfig {
    pub fn unlimited() -> Self {
        MountConfig {
            max_listeners: -1,
            auth_required: false,
        }
    }
}

// `#[serde(default = "...")]` only governs missing-field deserialization; it
// has no bearing on a derived `Default` impl, which would otherwise silently
// give `max_listeners` a 0 value (refuse everyone) instead of -1 (unlimited).
impl Default for MountConfig {
    fn default() -> Self {
        MountConfig::unlimited()
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Path to a MIME text file; absent means defaults only.
    pub mimetypes_fn: Option<String>,
    /// `false` disables on-demand file serving.
    #[serde(default = "default_true")]
    pub fileserve: bool,
    /// `false` disables 302-to-peer fallback for missing files.
    #[serde(default = "default_true")]
    pub fileserve_redirect: bool,
    #[serde(default)]
    pub mounts: HashMap<String, MountConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mimetypes_fn: None,
            fileserve: true,
            fileserve_redirect: true,
            mounts: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn mount_config(&self, mount: &str) -> MountConfig {
        self.mounts.get(mount).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing_fields() {
        let cfg = EngineConfig::parse("").unwrap();
        assert!(cfg.fileserve);
        assert!(cfg.fileserve_redirect);
        assert!(cfg.mimetypes_fn.is_none());
    }

    #[test]
    fn parses_mount_table() {
        let text = r#"
            fileserve = true
            fileserve_redirect = false

            [mounts."/live.mp3"]
            max_listeners = 5
            auth_required = true
        "#;
        let cfg = EngineConfig::parse(text).unwrap();
        assert!(!cfg.fileserve_redirect);
        let mount = cfg.mount_config("/live.mp3");
        assert_eq!(mount.max_listeners, 5);
        assert!(mount.auth_required);
    }

    #[test]
    fn unconfigured_mount_is_unlimited() {
        let cfg = EngineConfig::parse("").unwrap();
        let mount = cfg.mount_config("/anything");
        assert_eq!(mount.max_listeners, -1);
    }
}
