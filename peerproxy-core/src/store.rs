use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::consent::{ConsentAction, ConsentState};
use crate::contact::ContactId;
use crate::error::Result;

/// Emitted for every successful consent mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentChange {
    pub contact: ContactId,
    /// `None` when the state was reset because the contact was removed.
    pub action: Option<ConsentAction>,
    pub old: ConsentState,
    pub new: ConsentState,
}

/// Owns the [`ConsentState`] of every contact.
///
/// Dependents call [`subscribe`](ConsentStore::subscribe) and receive a
/// [`ConsentChange`] for each successful [`apply`](ConsentStore::apply), in
/// the order the changes were applied.
#[derive(Debug, Default)]
pub struct ConsentStore {
    states: HashMap<ContactId, ConsentState>,
    subscribers: Vec<mpsc::UnboundedSender<ConsentChange>>,
}

impl ConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for state changes.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConsentChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Returns the state for `contact`, creating the default on first access.
    pub fn get(&mut self, contact: &ContactId) -> ConsentState {
        *self.states.entry(contact.clone()).or_default()
    }

    /// Returns the state for `contact` without creating it.
    pub fn peek(&self, contact: &ContactId) -> Option<ConsentState> {
        self.states.get(contact).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContactId, &ConsentState)> {
        self.states.iter()
    }

    /// Applies `action` to the state of `contact`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidTransition`](crate::error::ProxyError::InvalidTransition)
    /// when the precondition fails; the stored state is left unchanged and
    /// no change is emitted.
    pub fn apply(&mut self, contact: &ContactId, action: ConsentAction) -> Result<ConsentChange> {
        let old = self.get(contact);
        let new = old.apply(action)?;
        self.states.insert(contact.clone(), new);

        debug!(contact = %contact, action = %action, "Consent changed");
        let change = ConsentChange {
            contact: contact.clone(),
            action: Some(action),
            old,
            new,
        };
        self.emit(&change);
        Ok(change)
    }

    /// Restores the default state for a permanently removed contact.
    ///
    /// Returns the change when the state was not already the default.
    pub fn reset(&mut self, contact: &ContactId) -> Option<ConsentChange> {
        let old = self.states.remove(contact)?;
        if old == ConsentState::default() {
            return None;
        }
        let change = ConsentChange {
            contact: contact.clone(),
            action: None,
            old,
            new: ConsentState::default(),
        };
        self.emit(&change);
        Some(change)
    }

    fn emit(&mut self, change: &ConsentChange) {
        self.subscribers.retain(|tx| {
            let delivered = tx.send(change.clone()).is_ok();
            if !delivered {
                trace!("Dropping closed consent subscriber");
            }
            delivered
        });
    }
}
