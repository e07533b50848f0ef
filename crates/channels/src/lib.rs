//! Outbound message delivery for journey steps.
//!
//! `MessageGateway` is the seam the executor sends through; `ProviderGateway`
//! routes email to the SendGrid-style provider and SMS to the Twilio-style
//! provider.

pub mod email;
pub mod gateway;
pub mod sms;

pub use email::EmailProvider;
pub use gateway::{CaptureGateway, MessageGateway, OutboundMessage, ProviderGateway, SendReceipt};
pub use sms::SmsProvider;
