use std::sync::Arc;

use shared::protocol::SyncProgress;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    progress::SYNC_PATH,
    transport::{get_json, Credentials, QueryParams, RequestOptions, Transport},
};

pub const MISSING_KEY_MESSAGE: &str = "API key is required";
pub const INVALID_KEY_MESSAGE: &str = "invalid API key";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub credentials: Credentials,
    pub error: Option<String>,
    pub loading: bool,
}

impl AuthState {
    pub fn needs_auth(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Session-scoped admin key. Nothing is persisted.
pub struct AdminAuth {
    transport: Arc<dyn Transport>,
    state: watch::Sender<AuthState>,
}

impl AdminAuth {
    pub fn new(transport: Arc<dyn Transport>, initial: Credentials) -> Self {
        let (state, _) = watch::channel(AuthState {
            credentials: initial,
            ..AuthState::default()
        });
        Self { transport, state }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn needs_auth(&self) -> bool {
        self.state.borrow().needs_auth()
    }

    pub fn credentials(&self) -> Credentials {
        self.state.borrow().credentials.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Checks `key` against the admin endpoint and keeps it when accepted.
    pub async fn validate(&self, key: &str) -> bool {
        let candidate = Credentials::api_key(key);
        if candidate.is_empty() {
            self.state
                .send_modify(|state| state.error = Some(MISSING_KEY_MESSAGE.to_string()));
            return false;
        }

        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });

        let options = RequestOptions::new().with_credentials(&candidate);
        let result = get_json::<SyncProgress>(
            self.transport.as_ref(),
            SYNC_PATH,
            &QueryParams::new(),
            options,
        )
        .await;

        let error = match result {
            Ok(_) => None,
            // No job on record yet, but the key got past authentication.
            Err(err) if err.is_not_found() => None,
            Err(err) if err.is_unauthorized() => Some(INVALID_KEY_MESSAGE.to_string()),
            Err(err) => Some(err.to_string()),
        };

        let accepted = error.is_none();
        if accepted {
            info!("auth: admin key accepted");
        } else {
            warn!(error = ?error, "auth: admin key rejected");
        }
        self.state.send_modify(|state| {
            state.loading = false;
            if accepted {
                state.credentials = candidate;
            }
            state.error = error;
        });
        accepted
    }

    /// Forgets the key after the server answered 401.
    pub fn on_unauthorized(&self) {
        self.state.send_modify(|state| {
            state.credentials = Credentials::default();
            state.error = None;
        });
        info!("auth: admin key cleared");
    }
}
