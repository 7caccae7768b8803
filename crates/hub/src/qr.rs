// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! QR login sessions.
//!
//! A pending login is an in-memory record with a one-time secret and a
//! five-minute TTL. The confirming (already authenticated) caller binds its
//! namespace; the polling device then reads the access token exactly once.
//! Every later poll of the same id reports `expired`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use rand::Rng;

/// How long a pending login stays valid.
pub const QR_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum QrState {
    Pending,
    Confirmed { access_token: String },
    /// Token already handed out (or TTL passed); the id is burned.
    Consumed,
}

#[derive(Debug)]
struct QrSession {
    secret: String,
    created_at: Instant,
    state: QrState,
}

/// Poll outcome for a login id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrPoll {
    Pending,
    Confirmed { access_token: String },
    Expired,
}

/// In-memory QR login registry.
pub struct QrLogin {
    sessions: Mutex<HashMap<String, QrSession>>,
    ttl: Duration,
}

impl Default for QrLogin {
    fn default() -> Self {
        Self::new(QR_TTL)
    }
}

/// Generate a URL-safe random secret.
fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl QrLogin {
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), ttl }
    }

    /// Start a login; returns `(id, secret)` for the QR payload.
    pub fn create(&self) -> (String, String) {
        let id = uuid::Uuid::new_v4().to_string();
        let secret = random_secret();
        self.sessions.lock().insert(
            id.clone(),
            QrSession { secret: secret.clone(), created_at: Instant::now(), state: QrState::Pending },
        );
        (id, secret)
    }

    /// Poll a login. A confirmed token is returned exactly once.
    pub fn poll(&self, id: &str, secret: &str) -> QrPoll {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return QrPoll::Expired;
        };
        if session.secret != secret || session.created_at.elapsed() > self.ttl {
            return QrPoll::Expired;
        }
        match session.state.clone() {
            QrState::Pending => QrPoll::Pending,
            QrState::Confirmed { access_token } => {
                session.state = QrState::Consumed;
                QrPoll::Confirmed { access_token }
            }
            QrState::Consumed => QrPoll::Expired,
        }
    }

    /// Confirm a login, binding the caller's access token. Returns whether
    /// the login was pending and valid.
    pub fn confirm(&self, id: &str, secret: &str, access_token: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        if session.secret != secret
            || session.created_at.elapsed() > self.ttl
            || session.state != QrState::Pending
        {
            return false;
        }
        session.state = QrState::Confirmed { access_token: access_token.to_owned() };
        true
    }

    /// Drop sessions past their TTL (and consumed ones).
    pub fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| {
            s.created_at.elapsed() <= self.ttl && s.state != QrState::Consumed
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "qr_tests.rs"]
mod tests;
