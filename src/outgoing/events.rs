//! Observable events emitted while driving a send.

use crate::address::Address;
use crate::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-shot the application resolves to consent to (or reject) a key change
/// before the send pipeline retries. Replaces the JS "Error.accepted" mutable
/// flag pattern with an explicit decision object.
#[derive(Clone)]
pub struct KeyChangeDecision {
    accepted: Arc<AtomicBool>,
}

impl KeyChangeDecision {
    pub fn new() -> Self {
        Self { accepted: Arc::new(AtomicBool::new(false)) }
    }

    /// Called by the application's event listener to consent to the new identity key.
    pub fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Default for KeyChangeDecision {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SendError {
    pub addr: Address,
    pub reason: String,
    pub underlying: Arc<Error>,
}

#[derive(Clone)]
pub enum SendEvent {
    Sent { timestamp: i64, addr: Address },
    Error(SendError),
    KeyChange { addr: Address, identity_key: [u8; 32], decision: KeyChangeDecision },
}

pub type SendEventSender = tokio::sync::mpsc::UnboundedSender<SendEvent>;
pub type SendEventReceiver = tokio::sync::mpsc::UnboundedReceiver<SendEvent>;

pub fn channel() -> (SendEventSender, SendEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
