use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chat::ChatConnector;
use crate::config::SeedTokens;
use crate::credentials::{Credentials, RefreshPayload};
use crate::storage::CredentialStore;

/// How long bootstrap waits for the chat provider to confirm registration.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not obtain credentials for role '{role}': {reason}")]
    StorageUnavailable { role: String, reason: String },
    #[error("chat session for role '{role}' did not register within {timeout:?}")]
    ConnectTimeout { role: String, timeout: Duration },
    #[error("chat session for role '{role}' failed: {source}")]
    Connect {
        role: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Owns the credential pair for one role ("bot", "streamer"): loads or seeds
/// it at initialization, hands it to the chat provider at connect time, and
/// persists every pair the provider rotates.
///
/// One instance per role for the lifetime of the process. A failed
/// initialization aborts only this role; other roles are untouched.
#[derive(Debug)]
pub struct CredentialSupervisor<S: CredentialStore> {
    role: String,
    store: Arc<S>,
    current: Arc<Mutex<Credentials>>,
    connect_timeout: Duration,
}

impl<S: CredentialStore> CredentialSupervisor<S> {
    /// Looks up the stored record for `role`, seeding one from configuration
    /// if none exists. The store upserts atomically on the role key, so a
    /// role ends up with exactly one record no matter how often this runs.
    pub fn initialize(role: &str, seeds: &SeedTokens, store: Arc<S>) -> Result<Self, SupervisorError> {
        let credentials = match store.find_by_key(role) {
            Ok(Some(found)) => {
                tracing::debug!(role, "loaded stored credentials");
                found
            }
            Ok(None) => {
                tracing::info!(role, "no stored credentials, seeding from configuration");
                let seeded = Credentials::seeded(&seeds.access_token, &seeds.refresh_token);
                store.upsert(role, &seeded).map_err(|e| {
                    tracing::error!(role, "failed to persist seed credentials: {e}");
                    SupervisorError::StorageUnavailable {
                        role: role.to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
            Err(e) => {
                tracing::error!(role, "credential lookup failed: {e}");
                return Err(SupervisorError::StorageUnavailable {
                    role: role.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Ok(CredentialSupervisor {
            role: role.to_string(),
            store,
            current: Arc::new(Mutex::new(credentials)),
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn credentials(&self) -> Credentials {
        self.current.lock().clone()
    }

    /// Hands the current pair to the chat provider and resolves once the
    /// provider confirms protocol-level registration. The refresh channel is
    /// registered here, exactly once per session; rotated pairs are persisted
    /// off the provider's path so a refresh never blocks message handling.
    pub async fn connect<C: ChatConnector>(&self, connector: &C) -> Result<C::Session, SupervisorError> {
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        tokio::spawn(refresh_loop(
            self.role.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.current),
            refresh_rx,
        ));

        let credentials = self.credentials();
        match tokio::time::timeout(self.connect_timeout, connector.connect(credentials, refresh_tx)).await {
            Err(_) => Err(SupervisorError::ConnectTimeout {
                role: self.role.clone(),
                timeout: self.connect_timeout,
            }),
            Ok(Err(source)) => Err(SupervisorError::Connect {
                role: self.role.clone(),
                source,
            }),
            Ok(Ok(session)) => Ok(session),
        }
    }
}

async fn refresh_loop<S: CredentialStore>(
    role: String,
    store: Arc<S>,
    current: Arc<Mutex<Credentials>>,
    mut refreshes: mpsc::Receiver<RefreshPayload>,
) {
    while let Some(payload) = refreshes.recv().await {
        handle_refresh(&role, &store, &current, payload).await;
    }
}

/// Persistence policy for one rotated pair. A null token never overwrites the
/// stored record; empty tokens and zero expiries are logged loudly but stored
/// so the anomaly leaves a trail. A failed write keeps the live session going
/// on the in-memory pair; the next rotation retries persistence.
async fn handle_refresh<S: CredentialStore>(
    role: &str,
    store: &Arc<S>,
    current: &Arc<Mutex<Credentials>>,
    payload: RefreshPayload,
) {
    if payload.access_token.is_none() || payload.refresh_token.is_none() {
        tracing::error!(role, "token refresh reported a null token, keeping the stored pair");
        return;
    }
    if payload.access_token.as_deref() == Some("")
        || payload.refresh_token.as_deref() == Some("")
        || payload.expires_in == 0
    {
        tracing::error!(role, "token refresh reported an empty token or zero expiry, persisting anyway");
    }

    let Some(credentials) = payload.into_credentials() else {
        return;
    };

    *current.lock() = credentials.clone();

    let store = Arc::clone(store);
    let owned_role = role.to_string();
    let write = tokio::task::spawn_blocking(move || store.upsert(&owned_role, &credentials)).await;
    match write {
        Ok(Ok(_)) => tracing::debug!(role, "refreshed credentials persisted"),
        Ok(Err(e)) => tracing::error!(role, "failed to persist refreshed credentials: {e}"),
        Err(e) => tracing::error!(role, "credential persistence task panicked: {e}"),
    }
}
