//! SendGrid email delivery for journey email steps.
//!
//! Builds the v3 mail-send payload and records every accepted message so
//! delivery can be audited per enrollment.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_core::error::GatewayError;
use cadence_core::types::Channel;

use crate::gateway::{OutboundMessage, SendReceipt};

/// A message accepted by the email provider.
#[derive(Debug, Clone, Serialize)]
pub struct EmailRecord {
    pub provider_message_id: String,
    pub enrollment_id: Uuid,
    pub to: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub accepted_at: DateTime<Utc>,
}

/// SendGrid email provider.
pub struct EmailProvider {
    from_email: String,
    from_name: String,
    /// Accepted messages keyed by provider message id.
    sent: DashMap<String, EmailRecord>,
}

impl EmailProvider {
    pub fn new(from_email: String, from_name: String) -> Self {
        info!(from = %from_email, "SendGrid provider initialized");
        Self {
            from_email,
            from_name,
            sent: DashMap::new(),
        }
    }

    /// Send an email. In production: POST to https://api.sendgrid.com/v3/mail/send
    pub fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let to = message.recipient.trim();
        if !is_plausible_email(to) {
            warn!(enrollment_id = %message.enrollment_id, to = %to, "rejecting malformed email address");
            return Err(GatewayError::Rejected(format!("malformed email address: {to}")));
        }
        let subject = message.subject.clone().unwrap_or_default();

        debug!(
            enrollment_id = %message.enrollment_id,
            to = %to,
            subject = %subject,
            "Sending email via SendGrid"
        );

        let payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": to}],
                "custom_args": {
                    "enrollment_id": message.enrollment_id,
                    "customer_id": message.customer_id
                }
            }],
            "from": {
                "email": self.from_email,
                "name": self.from_name
            },
            "subject": subject,
            "content": [{
                "type": "text/html",
                "value": message.body
            }]
        });

        let provider_message_id = format!("sg-{}", Uuid::new_v4());
        let accepted_at = Utc::now();
        self.sent.insert(
            provider_message_id.clone(),
            EmailRecord {
                provider_message_id: provider_message_id.clone(),
                enrollment_id: message.enrollment_id,
                to: to.to_string(),
                subject,
                payload,
                accepted_at,
            },
        );

        metrics::counter!("sendgrid.emails_sent").increment(1);

        Ok(SendReceipt {
            provider_message_id,
            channel: Channel::Email,
            accepted_at,
        })
    }

    pub fn get(&self, provider_message_id: &str) -> Option<EmailRecord> {
        self.sent.get(provider_message_id).map(|r| r.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

fn is_plausible_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !address.contains(' ')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EmailProvider {
        EmailProvider::new("no-reply@shop.example".into(), "Shop".into())
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Email,
            recipient: to.into(),
            subject: Some("Your visit".into()),
            body: "<p>Thanks!</p>".into(),
            enrollment_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_send_records_payload() {
        let provider = provider();
        let receipt = provider.send(&message("ana@example.com")).unwrap();
        let record = provider.get(&receipt.provider_message_id).unwrap();

        assert_eq!(record.to, "ana@example.com");
        assert_eq!(record.payload["subject"], "Your visit");
        assert_eq!(record.payload["from"]["name"], "Shop");
        assert_eq!(provider.sent_count(), 1);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let provider = provider();
        for bad in ["", "ana", "ana@", "@example.com", "ana@localhost", "a na@x.com"] {
            assert!(provider.send(&message(bad)).is_err(), "{bad:?} accepted");
        }
        assert_eq!(provider.sent_count(), 0);
    }
}
