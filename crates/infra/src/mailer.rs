//! Outbound mail for registration activation.

use std::sync::RwLock;

use tracing::info;

use crate::providers::ProviderError;

/// A rendered message ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Mailer: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<(), ProviderError>;
}

/// Writes messages to the log instead of delivering them. Intended for dev.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &MailMessage) -> Result<(), ProviderError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            "mail not delivered (log mailer)"
        );
        Ok(())
    }
}

/// Keeps every sent message. Intended for tests.
#[derive(Debug, Default)]
pub struct InMemoryMailer {
    sent: RwLock<Vec<MailMessage>>,
    failing: RwLock<bool>,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `send` fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.write() {
            *f = failing;
        }
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.read().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Mailer for InMemoryMailer {
    fn send(&self, message: &MailMessage) -> Result<(), ProviderError> {
        if self.failing.read().map(|f| *f).unwrap_or(false) {
            return Err(ProviderError::Fatal("smtp unavailable".into()));
        }
        self.sent
            .write()
            .map_err(|_| ProviderError::Fatal("mailbox lock poisoned".into()))?
            .push(message.clone());
        Ok(())
    }
}
