//! Security-relevant events raised by the login path.

use super::types::LoginStage;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditEvent {
    LoginSucceeded {
        user_id: i64,
        username: String,
        ip: String,
    },
    LoginRejected {
        username: String,
        ip: String,
        stage: LoginStage,
        code: &'static str,
    },
    NewDevice {
        user_id: i64,
        ip: String,
        fingerprint: String,
    },
    AutoBanned {
        ip: String,
        failures: i64,
        seconds: u64,
    },
    Registered {
        user_id: i64,
        username: String,
        ip: String,
    },
    TokenRefreshed {
        user_id: i64,
    },
    LoggedOut {
        user_id: i64,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes events as structured `tracing` records under the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::LoginSucceeded {
                user_id,
                username,
                ip,
            } => info!(target: "audit", user_id, username = %username, ip = %ip, "login succeeded"),
            AuditEvent::LoginRejected {
                username,
                ip,
                stage,
                code,
            } => warn!(target: "audit", username = %username, ip = %ip, stage = %stage, code, "login rejected"),
            AuditEvent::NewDevice {
                user_id,
                ip,
                fingerprint,
            } => info!(target: "audit", user_id, ip = %ip, fingerprint = %fingerprint, "login from new device"),
            AuditEvent::AutoBanned { ip, failures, seconds } => {
                warn!(target: "audit", ip = %ip, failures, seconds, "ip address auto-banned");
            }
            AuditEvent::Registered {
                user_id,
                username,
                ip,
            } => info!(target: "audit", user_id, username = %username, ip = %ip, "account registered"),
            AuditEvent::TokenRefreshed { user_id } => {
                info!(target: "audit", user_id, "token refreshed");
            }
            AuditEvent::LoggedOut { user_id } => info!(target: "audit", user_id, "logged out"),
        }
    }
}

/// Keeps every event in memory, for assertions.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
