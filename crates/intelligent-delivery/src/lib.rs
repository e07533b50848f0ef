//! Intelligent delivery — message-safety gating (opt-outs, bounces, contact
//! cooldown) and send-time optimization for journey messages.

pub mod safety;
pub mod send_time;

pub use safety::{BlockReason, SafetyDecision, SafetyGate};
pub use send_time::{SendTimeAdjustment, SendTimePlanner, SendWindow};
