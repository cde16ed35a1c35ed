//! Sign-in state and the signed-in identity

mod types;

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub use types::*;

/// What is known about the current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No determination has been made yet
    Pending,
    SignedIn(Identity),
    SignedOut,
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::SignedIn(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Tracks sign-in state and bounds how long callers wait for the first
/// determination.
///
/// The fallback fires at most once. After it fired, [`AuthGate::ready`]
/// answers immediately, treating a still-pending state as signed out; a later
/// sign-in is still published to every subscriber.
pub struct AuthGate {
    state: watch::Sender<AuthState>,
    fallback: Duration,
    fallback_fired: AtomicBool,
}

impl AuthGate {
    pub fn new(fallback: Duration) -> Self {
        let (state, _) = watch::channel(AuthState::Pending);
        Self {
            state,
            fallback,
            fallback_fired: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn sign_in(&self, identity: Identity) {
        info!("Signed in as {}", identity);
        self.state.send_replace(AuthState::SignedIn(identity));
    }

    pub fn sign_out(&self) {
        info!("Signed out");
        self.state.send_replace(AuthState::SignedOut);
    }

    /// Waits for the first sign-in determination, or for the fallback timer.
    pub async fn ready(&self) -> AuthState {
        let mut rx = self.state.subscribe();
        if self.fallback_fired.load(Ordering::SeqCst) {
            return settled(rx.borrow().clone());
        }

        let determined =
            tokio::time::timeout(self.fallback, rx.wait_for(|s| *s != AuthState::Pending)).await;
        match determined {
            Ok(Ok(state)) => state.clone(),
            // The sender lives as long as the gate.
            Ok(Err(_)) => AuthState::SignedOut,
            Err(_) => {
                if !self.fallback_fired.swap(true, Ordering::SeqCst) {
                    info!(
                        "No sign-in determination after {:?}; continuing as signed out",
                        self.fallback
                    );
                }
                let current = self.state();
                debug!("Auth state at fallback: {:?}", current);
                settled(current)
            }
        }
    }
}

fn settled(state: AuthState) -> AuthState {
    match state {
        AuthState::Pending => AuthState::SignedOut,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_resolves_on_sign_in() {
        let gate = Arc::new(AuthGate::new(Duration::from_secs(5)));
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.ready().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        gate.sign_in(Identity::new("u1").unwrap());

        let state = waiter.await.unwrap();
        assert_eq!(state.identity().map(Identity::uid), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_fires_once_and_does_not_block_later_sign_in() {
        let gate = AuthGate::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        assert_eq!(gate.ready().await, AuthState::SignedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));

        // Second call answers without waiting again.
        let again = tokio::time::Instant::now();
        assert_eq!(gate.ready().await, AuthState::SignedOut);
        assert!(again.elapsed() < Duration::from_secs(1));

        let mut rx = gate.subscribe();
        gate.sign_in(Identity::new("late").unwrap());
        rx.changed().await.unwrap();
        assert_eq!(gate.ready().await.identity().map(Identity::uid), Some("late"));
    }
}
