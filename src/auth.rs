//! Authentication/authorization boundary: an opaque
//! listener-release hook. Actual auth/authz is out of scope for this crate.

use crate::config::MountConfig;
use crate::listener::Listener;

/// Outcome of releasing an authenticated listener from a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Someone else still owns the listener; leave it alone.
    Retained,
    /// Nothing else owns the listener; the engine should destroy it.
    NoFurtherOwner,
}

/// Consulted by detach after a listener's last byte has
/// gone out. The engine treats this purely as an opaque hook: it does not
/// interpret credentials, sessions, or duplicate-login state itself (that
/// lives in `mount_info`/`DuplicateLoginCheck`, also out of scope beyond
/// the single boolean the attach path consults).
pub trait AuthHook: Send + Sync {
    fn auth_release_listener(&self, listener: &Listener, mount: &str, mount_info: Option<&MountConfig>) -> ReleaseOutcome;

    /// Duplicate-login check consulted during attach.
    /// Returns `false` if the login should be refused.
    fn check_duplicate_login(&self, _mount: &str, _listener: &Listener, _mount_info: &MountConfig) -> bool {
        true
    }
}

/// Default hook: always releases, never refuses logins. Used by tests and
/// by deployments that don't need auth.
#[derive(Debug, Default)]
pub struct PermissiveAuth;

impl AuthHook for PermissiveAuth {
    fn auth_release_listener(&self, _listener: &Listener, _mount: &str, _mount_info: Option<&MountConfig>) -> ReleaseOutcome {
        ReleaseOutcome::Retained
    }
}
