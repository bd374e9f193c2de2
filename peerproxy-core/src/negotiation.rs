use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::consent::{ConsentAction, ConsentState, RemoteAction, RemoteConsent, UserAction};
use crate::contact::{ContactId, Role};
use crate::error::Result;
use crate::store::{ConsentChange, ConsentStore};

/// Edge of the mutual-consent condition for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentEvent {
    /// Consent for `role` went from not mutual to mutual.
    Reached { contact: ContactId, role: Role },
    /// Consent for `role` went from mutual to not mutual.
    Withdrawn { contact: ContactId, role: Role },
}

/// Translates user and remote intents into [`ConsentStore`] actions and
/// detects when mutual consent is reached or withdrawn.
///
/// Detection is edge-triggered: [`observe`](Self::observe) only reports a
/// role when its mutual-consent condition differs between the old and the
/// new state of a change, so a session manager reacting to these events acts
/// once per transition.
#[derive(Debug)]
pub struct ConsentStateMachine {
    store: ConsentStore,
}

impl ConsentStateMachine {
    pub fn new(store: ConsentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConsentStore {
        &self.store
    }

    /// Subscribes to raw changes of the underlying store.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConsentChange> {
        self.store.subscribe()
    }

    pub fn get(&mut self, contact: &ContactId) -> ConsentState {
        self.store.get(contact)
    }

    pub fn is_mutual(&self, contact: &ContactId, role: Role) -> bool {
        self.store
            .peek(contact)
            .is_some_and(|state| state.is_mutual(role))
    }

    /// Applies a local user action.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the action is not legal in the current state.
    pub fn apply_user(&mut self, contact: &ContactId, action: UserAction) -> Result<ConsentChange> {
        self.store.apply(contact, ConsentAction::User(action))
    }

    /// Applies a single change announced by the remote peer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the announced change is a no-op.
    pub fn apply_remote(
        &mut self,
        contact: &ContactId,
        action: RemoteAction,
    ) -> Result<ConsentChange> {
        self.store.apply(contact, ConsentAction::Remote(action))
    }

    /// Brings the remote half of the state in line with a full announcement
    /// from the peer. Returns the applied changes; empty when the
    /// announcement matches what is already known.
    ///
    /// # Errors
    ///
    /// Propagates a rejected remote action. Diffing only produces legal
    /// actions, so this indicates a bug in the caller.
    pub fn sync_remote(
        &mut self,
        contact: &ContactId,
        announced: RemoteConsent,
    ) -> Result<Vec<ConsentChange>> {
        let current = self.store.get(contact);
        announced
            .actions_against(&current)
            .into_iter()
            .map(|action| self.apply_remote(contact, action))
            .collect()
    }

    /// Forgets a permanently removed contact, restoring its default state.
    pub fn forget(&mut self, contact: &ContactId) -> Option<ConsentChange> {
        info!(contact = %contact, "Resetting consent for removed contact");
        self.store.reset(contact)
    }

    /// Computes the mutual-consent edges produced by `change`.
    pub fn observe(change: &ConsentChange) -> Vec<ConsentEvent> {
        let mut events = Vec::new();
        for role in [Role::Getter, Role::Sharer] {
            let before = change.old.is_mutual(role);
            let after = change.new.is_mutual(role);
            let contact = change.contact.clone();
            match (before, after) {
                (false, true) => {
                    debug!(contact = %contact, role = %role, "Mutual consent reached");
                    events.push(ConsentEvent::Reached { contact, role });
                }
                (true, false) => {
                    debug!(contact = %contact, role = %role, "Mutual consent withdrawn");
                    events.push(ConsentEvent::Withdrawn { contact, role });
                }
                _ => {}
            }
        }
        events
    }
}

impl Default for ConsentStateMachine {
    fn default() -> Self {
        Self::new(ConsentStore::new())
    }
}
