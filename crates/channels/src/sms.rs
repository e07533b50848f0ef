//! Twilio SMS delivery for journey SMS steps, with segment calculation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use cadence_core::error::GatewayError;
use cadence_core::types::Channel;

use crate::gateway::{OutboundMessage, SendReceipt};

/// Characters of the GSM 03.38 basic set that fit in one 7-bit septet.
const GSM_BASIC: &str = "@£$¥èéùìòÇØøÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà\n\r";

/// An SMS accepted by the provider.
#[derive(Debug, Clone, Serialize)]
pub struct SmsRecord {
    pub provider_message_id: String,
    pub enrollment_id: Uuid,
    pub to: String,
    pub from: String,
    pub body: String,
    pub segments: u32,
    pub accepted_at: DateTime<Utc>,
}

/// Twilio SMS provider with an in-memory message log.
pub struct SmsProvider {
    from_number: String,
    sent: DashMap<String, SmsRecord>,
}

impl SmsProvider {
    pub fn new(from_number: String) -> Self {
        tracing::info!(from = %from_number, "Twilio SMS provider initialized");
        Self {
            from_number,
            sent: DashMap::new(),
        }
    }

    /// Send an SMS. In production: POST to the Twilio Messages resource.
    pub fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let to = normalize_number(&message.recipient).ok_or_else(|| {
            GatewayError::Rejected(format!("invalid phone number: {}", message.recipient))
        })?;
        if message.body.is_empty() {
            return Err(GatewayError::Rejected("empty SMS body".into()));
        }

        let provider_message_id = format!("SM{}", Uuid::new_v4().simple());
        let segments = Self::calculate_segments(&message.body);
        let accepted_at = Utc::now();

        tracing::info!(
            enrollment_id = %message.enrollment_id,
            provider_id = %provider_message_id,
            segments,
            "SMS message queued"
        );
        metrics::counter!("sms.messages_sent").increment(1);
        metrics::counter!("sms.segments_sent").increment(u64::from(segments));

        self.sent.insert(
            provider_message_id.clone(),
            SmsRecord {
                provider_message_id: provider_message_id.clone(),
                enrollment_id: message.enrollment_id,
                to,
                from: self.from_number.clone(),
                body: message.body.clone(),
                segments,
                accepted_at,
            },
        );

        Ok(SendReceipt {
            provider_message_id,
            channel: Channel::Sms,
            accepted_at,
        })
    }

    /// Number of SMS segments for a body: 160/153 characters per segment for
    /// GSM 7-bit text, 70/67 for anything needing UCS-2.
    pub fn calculate_segments(body: &str) -> u32 {
        let chars = body.chars().count() as u32;
        let (single, multi) = if body.chars().all(|c| GSM_BASIC.contains(c)) {
            (160, 153)
        } else {
            (70, 67)
        };
        if chars <= single {
            1
        } else {
            chars.div_ceil(multi)
        }
    }

    pub fn get(&self, provider_message_id: &str) -> Option<SmsRecord> {
        self.sent.get(provider_message_id).map(|r| r.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

/// Strip formatting and require an E.164-shaped number (`+` and 8–15 digits).
fn normalize_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let rest = digits.strip_prefix('+')?;
    if (8..=15).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_digit()) {
        Some(digits)
    } else {
        None
    }
}
