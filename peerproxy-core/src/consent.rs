//! Per-contact consent state and its pure transition function.
//!
//! Each direction of the relationship is an explicit enum rather than a
//! pair of booleans, so "requested and ignoring the offer at the same time"
//! cannot be represented.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::contact::Role;
use crate::error::{ProxyError, Result};

/// Local side of the GET direction (local consuming the remote's connection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GetStance {
    #[default]
    Unset,
    /// `localRequestsAccess`
    Requested,
    /// `ignoringRemoteOffer`
    IgnoringOffer,
}

/// Local side of the SHARE direction (local providing its connection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShareStance {
    #[default]
    Unset,
    /// `localOffersAccess`
    Offered,
    /// `ignoringRemoteRequest`
    IgnoringRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsentState {
    pub get: GetStance,
    pub share: ShareStance,
    pub remote_requests_access: bool,
    pub remote_offers_access: bool,
}

/// Flat view of a [`ConsentState`] using the flag names the UI binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct ConsentFlags {
    pub local_requests_access: bool,
    pub local_offers_access: bool,
    pub remote_requests_access: bool,
    pub remote_offers_access: bool,
    pub ignoring_remote_offer: bool,
    pub ignoring_remote_request: bool,
}

/// What the local instance tells a peer about its own consent.
///
/// This is the payload of a consent update on the wire; the receiver
/// turns it into remote actions with [`RemoteConsent::actions_against`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConsent {
    pub requests_access: bool,
    pub offers_access: bool,
}

/// Actions the local user can take on a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserAction {
    Request,
    CancelRequest,
    Offer,
    CancelOffer,
    IgnoreOffer,
    UnignoreOffer,
    IgnoreRequest,
    UnignoreRequest,
}

impl UserAction {
    pub const ALL: [Self; 8] = [
        Self::Request,
        Self::CancelRequest,
        Self::Offer,
        Self::CancelOffer,
        Self::IgnoreOffer,
        Self::UnignoreOffer,
        Self::IgnoreRequest,
        Self::UnignoreRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::CancelRequest => "CANCEL_REQUEST",
            Self::Offer => "OFFER",
            Self::CancelOffer => "CANCEL_OFFER",
            Self::IgnoreOffer => "IGNORE_OFFER",
            Self::UnignoreOffer => "UNIGNORE_OFFER",
            Self::IgnoreRequest => "IGNORE_REQUEST",
            Self::UnignoreRequest => "UNIGNORE_REQUEST",
        }
    }
}

/// Changes announced by the remote peer about its own consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteAction {
    Request,
    CancelRequest,
    Offer,
    CancelOffer,
}

impl RemoteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::CancelRequest => "CANCEL_REQUEST",
            Self::Offer => "OFFER",
            Self::CancelOffer => "CANCEL_OFFER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentAction {
    User(UserAction),
    Remote(RemoteAction),
}

impl fmt::Display for ConsentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(a) => f.write_str(a.as_str()),
            Self::Remote(a) => write!(f, "remote {}", a.as_str()),
        }
    }
}

impl ConsentState {
    pub fn local_requests_access(&self) -> bool {
        self.get == GetStance::Requested
    }

    pub fn local_offers_access(&self) -> bool {
        self.share == ShareStance::Offered
    }

    pub fn ignoring_remote_offer(&self) -> bool {
        self.get == GetStance::IgnoringOffer
    }

    pub fn ignoring_remote_request(&self) -> bool {
        self.share == ShareStance::IgnoringRequest
    }

    /// Whether both sides agree on a session where the local instance plays `role`.
    pub fn is_mutual(&self, role: Role) -> bool {
        match role {
            Role::Getter => self.local_requests_access() && self.remote_offers_access,
            Role::Sharer => self.remote_requests_access && self.local_offers_access(),
        }
    }

    pub fn flags(&self) -> ConsentFlags {
        ConsentFlags {
            local_requests_access: self.local_requests_access(),
            local_offers_access: self.local_offers_access(),
            remote_requests_access: self.remote_requests_access,
            remote_offers_access: self.remote_offers_access,
            ignoring_remote_offer: self.ignoring_remote_offer(),
            ignoring_remote_request: self.ignoring_remote_request(),
        }
    }

    /// The local half of this state, as announced to the peer.
    pub fn local_view(&self) -> RemoteConsent {
        RemoteConsent {
            requests_access: self.local_requests_access(),
            offers_access: self.local_offers_access(),
        }
    }

    /// Computes the state after `action`.
    ///
    /// This is a pure function: the same `(state, action)` pair always gives
    /// the same result, and `self` is never modified.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidTransition`] when the action's
    /// precondition does not hold.
    pub fn apply(&self, action: ConsentAction) -> Result<Self> {
        let reject = |reason| ProxyError::InvalidTransition { action, reason };
        let mut next = *self;

        match action {
            ConsentAction::User(user) => match user {
                UserAction::Request => {
                    if self.local_requests_access() {
                        return Err(reject("access is already requested"));
                    }
                    next.get = GetStance::Requested;
                }
                UserAction::CancelRequest => {
                    if !self.local_requests_access() {
                        return Err(reject("access was not requested"));
                    }
                    next.get = GetStance::Unset;
                }
                UserAction::IgnoreOffer => {
                    if !self.remote_offers_access {
                        return Err(reject("there is no offer to ignore"));
                    }
                    if self.get != GetStance::Unset {
                        return Err(reject("offer is already requested or ignored"));
                    }
                    next.get = GetStance::IgnoringOffer;
                }
                UserAction::UnignoreOffer => {
                    if !self.ignoring_remote_offer() {
                        return Err(reject("offer is not ignored"));
                    }
                    next.get = GetStance::Unset;
                }
                UserAction::Offer => {
                    if self.local_offers_access() {
                        return Err(reject("access is already offered"));
                    }
                    next.share = ShareStance::Offered;
                }
                UserAction::CancelOffer => {
                    if !self.local_offers_access() {
                        return Err(reject("access was not offered"));
                    }
                    next.share = ShareStance::Unset;
                }
                UserAction::IgnoreRequest => {
                    if !self.remote_requests_access {
                        return Err(reject("there is no request to ignore"));
                    }
                    if self.share != ShareStance::Unset {
                        return Err(reject("request is already answered or ignored"));
                    }
                    next.share = ShareStance::IgnoringRequest;
                }
                UserAction::UnignoreRequest => {
                    if !self.ignoring_remote_request() {
                        return Err(reject("request is not ignored"));
                    }
                    next.share = ShareStance::Unset;
                }
            },
            ConsentAction::Remote(remote) => match remote {
                RemoteAction::Request => {
                    if self.remote_requests_access {
                        return Err(reject("remote already requests access"));
                    }
                    next.remote_requests_access = true;
                }
                RemoteAction::CancelRequest => {
                    if !self.remote_requests_access {
                        return Err(reject("remote does not request access"));
                    }
                    next.remote_requests_access = false;
                }
                RemoteAction::Offer => {
                    if self.remote_offers_access {
                        return Err(reject("remote already offers access"));
                    }
                    next.remote_offers_access = true;
                }
                RemoteAction::CancelOffer => {
                    if !self.remote_offers_access {
                        return Err(reject("remote does not offer access"));
                    }
                    next.remote_offers_access = false;
                }
            },
        }

        Ok(next)
    }
}

impl RemoteConsent {
    /// Remote actions that bring `state` in line with this announcement.
    /// Empty when nothing changed.
    pub fn actions_against(&self, state: &ConsentState) -> Vec<RemoteAction> {
        let mut actions = Vec::new();
        match (state.remote_requests_access, self.requests_access) {
            (false, true) => actions.push(RemoteAction::Request),
            (true, false) => actions.push(RemoteAction::CancelRequest),
            _ => {}
        }
        match (state.remote_offers_access, self.offers_access) {
            (false, true) => actions.push(RemoteAction::Offer),
            (true, false) => actions.push(RemoteAction::CancelOffer),
            _ => {}
        }
        actions
    }
}
