//! `.m3u`/`.xspf` playlist classification, mirroring `fserve_client_create`'s
//! handling of a missing file. The engine only classifies the request;
//! synthesizing the playlist body is the HTTP layer's job.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    M3u,
    Xspf,
}

pub fn classify(path: &str) -> Option<PlaylistKind> {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("m3u") => Some(PlaylistKind::M3u),
        Some(ext) if ext.eq_ignore_ascii_case("xspf") => Some(PlaylistKind::Xspf),
        _ => None,
    }
}

/// What `fserve_client_create` should do once it knows whether the
/// underlying file exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCreateOutcome {
    /// Stat succeeded on a regular file: proceed to the normal attach path.
    ProceedToAttach,
    /// File is missing but the path asked for a playlist: synthesize one
    /// referencing the (possibly extensionless) underlying stream name.
    SynthesizePlaylist(PlaylistKind),
    /// File missing, not a playlist request, redirects are enabled: try a
    /// peer redirect before giving up.
    TryRedirectThenNotFound,
    /// File missing, no playlist, no redirect: plain 404.
    NotFound,
    /// On-demand file serving is disabled for non-regular files.
    ServingDisabled,
}

pub fn classify_missing_file(path: &str, fileserve_redirect: bool) -> ClientCreateOutcome {
    match classify(path) {
        Some(kind) => ClientCreateOutcome::SynthesizePlaylist(kind),
        None if fileserve_redirect => ClientCreateOutcome::TryRedirectThenNotFound,
        None => ClientCreateOutcome::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_m3u_and_xspf() {
        assert_eq!(classify("/stream.m3u"), Some(PlaylistKind::M3u));
        assert_eq!(classify("/stream.xspf"), Some(PlaylistKind::Xspf));
        assert_eq!(classify("/stream.mp3"), None);
    }

    #[test]
    fn missing_playlist_file_synthesizes() {
        let outcome = classify_missing_file("/radio.m3u", true);
        assert_eq!(outcome, ClientCreateOutcome::SynthesizePlaylist(PlaylistKind::M3u));
    }

    #[test]
    fn missing_plain_file_with_redirect_enabled() {
        let outcome = classify_missing_file("/missing.txt", true);
        assert_eq!(outcome, ClientCreateOutcome::TryRedirectThenNotFound);
    }

    #[test]
    fn missing_plain_file_with_redirect_disabled() {
        let outcome = classify_missing_file("/missing.txt", false);
        assert_eq!(outcome, ClientCreateOutcome::NotFound);
    }
}
