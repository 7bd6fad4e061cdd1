//! Minimal session-control stubs (spec §6 "Session control").
//!
//! Authentication and a user/permission model are explicit non-goals of
//! this repository (spec §1: "authentication service, user/permission
//! model" is an external collaborator). `login`/`logout` exist here only
//! so the data-plane API surface named by spec §6 is complete; they never
//! reject a credential and carry no permission checks. A real deployment
//! sits an auth service in front of this crate and only ever calls
//! `Concourse` once a caller is already authenticated.

use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Opaque handle returned by [`crate::Concourse::login`]. Carries no
/// permission scope — see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessToken(Uuid);

impl std::fmt::Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logged-in session. `login` always succeeds; `logout` just flips the
/// `live` flag so a stale token is rejected by anything that checks it.
pub struct Session {
    token: AccessToken,
    live: AtomicBool,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            token: AccessToken(Uuid::new_v4()),
            live: AtomicBool::new(true),
        }
    }

    /// This session's token.
    pub fn token(&self) -> AccessToken {
        self.token
    }

    /// Whether `logout` has been called on this session.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_live_until_ended() {
        let session = Session::new();
        assert!(session.is_live());
        session.end();
        assert!(!session.is_live());
    }
}
