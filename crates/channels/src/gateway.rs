//! The message gateway seam between the journey executor and delivery
//! providers.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::config::ChannelsConfig;
use cadence_core::error::GatewayError;
use cadence_core::types::Channel;

use crate::email::EmailProvider;
use crate::sms::SmsProvider;

/// A fully rendered message ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub enrollment_id: Uuid,
    pub customer_id: Uuid,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub channel: Channel,
    pub accepted_at: DateTime<Utc>,
}

/// Sends one message through whichever provider handles its channel.
pub trait MessageGateway: Send + Sync {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<SendReceipt, GatewayError>> + Send;
}

impl<T: MessageGateway> MessageGateway for Arc<T> {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<SendReceipt, GatewayError>> + Send {
        (**self).send(message)
    }
}

/// Routes email and SMS to their providers.
pub struct ProviderGateway {
    email: EmailProvider,
    sms: SmsProvider,
}

impl ProviderGateway {
    pub fn new(email: EmailProvider, sms: SmsProvider) -> Self {
        Self { email, sms }
    }

    pub fn from_config(config: &ChannelsConfig) -> Self {
        Self::new(
            EmailProvider::new(config.from_email.clone(), config.from_name.clone()),
            SmsProvider::new(config.from_number.clone()),
        )
    }

    pub fn email(&self) -> &EmailProvider {
        &self.email
    }

    pub fn sms(&self) -> &SmsProvider {
        &self.sms
    }
}

impl MessageGateway for ProviderGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let result = match message.channel {
            Channel::Email => self.email.send(message),
            Channel::Sms => self.sms.send(message),
        };
        let outcome = if result.is_ok() { "accepted" } else { "failed" };
        metrics::counter!(
            "gateway.messages",
            "channel" => message.channel.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }
}

/// In-memory gateway that records every message and fails on demand.
#[derive(Default)]
pub struct CaptureGateway {
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: Mutex<usize>,
    fail_all: Mutex<Option<GatewayError>>,
    failing_recipients: Mutex<HashSet<String>>,
}

impl CaptureGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent send fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<GatewayError>) {
        *self.fail_all.lock() = error;
    }

    /// Sends to `recipient` fail with `GatewayError::Rejected`.
    pub fn fail_recipient(&self, recipient: impl Into<String>) {
        self.failing_recipients.lock().insert(recipient.into());
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    /// Number of `send` calls, accepted or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

impl MessageGateway for CaptureGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        *self.attempts.lock() += 1;
        if let Some(error) = self.fail_all.lock().clone() {
            return Err(error);
        }
        if self.failing_recipients.lock().contains(&message.recipient) {
            return Err(GatewayError::Rejected(format!(
                "recipient {} refused",
                message.recipient
            )));
        }
        self.sent.lock().push(message.clone());
        Ok(SendReceipt {
            provider_message_id: format!("capture-{}", Uuid::new_v4()),
            channel: message.channel,
            accepted_at: Utc::now(),
        })
    }
}
