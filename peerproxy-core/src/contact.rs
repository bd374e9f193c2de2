use std::fmt;

use serde::{Deserialize, Serialize};

/// The local login on one social network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Network name, e.g. `"GMail"` or `"direct"`.
    pub name: String,
    /// The *local* user id on that network.
    pub user_id: String,
}

/// Identifies a remote contact as seen from one local network login.
///
/// This is the `path` the UI boundary uses when addressing consent
/// commands: `{ network: { name, userId }, userId }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId {
    pub network: NetworkInfo,
    /// The *remote* user id.
    pub user_id: String,
}

impl ContactId {
    pub fn new(
        network_name: impl Into<String>,
        local_user_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            network: NetworkInfo {
                name: network_name.into(),
                user_id: local_user_id.into(),
            },
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network.name, self.user_id)
    }
}

/// One running client of a contact: the addressing tuple of the social
/// channel (network, user, instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerRef {
    pub contact: ContactId,
    pub instance_id: String,
}

impl PeerRef {
    pub fn new(contact: ContactId, instance_id: impl Into<String>) -> Self {
        Self {
            contact,
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.contact, self.instance_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// A contact as reported by the social-network collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub display_name: String,
    pub presence: Presence,
    /// Running clients of this contact, in the order the network reported them.
    pub instance_ids: Vec<String>,
}

impl Contact {
    pub fn is_online(&self) -> bool {
        self.presence == Presence::Online
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.instance_ids.iter().any(|id| id == instance_id)
    }

    /// Every known instance of this contact as a channel address.
    pub fn peers(&self) -> impl Iterator<Item = PeerRef> + '_ {
        self.instance_ids
            .iter()
            .map(|instance| PeerRef::new(self.id.clone(), instance.clone()))
    }
}

/// The local identity an engine runs as on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub network: String,
    pub user_id: String,
    pub instance_id: String,
    pub display_name: String,
}

impl LocalIdentity {
    /// How a peer logged in as `viewer_user_id` addresses this instance.
    pub fn as_seen_by(&self, viewer_user_id: &str) -> PeerRef {
        PeerRef::new(
            ContactId::new(&self.network, viewer_user_id, &self.user_id),
            &self.instance_id,
        )
    }

    /// The contact id of `user_id` from this identity's point of view.
    pub fn contact(&self, user_id: impl Into<String>) -> ContactId {
        ContactId::new(&self.network, &self.user_id, user_id)
    }
}

/// Which side of a proxying relationship the local instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Local consumes the peer's connection.
    Getter,
    /// Local provides its connection to the peer.
    Sharer,
}

impl Role {
    #[must_use]
    pub fn complement(self) -> Self {
        match self {
            Self::Getter => Self::Sharer,
            Self::Sharer => Self::Getter,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Getter => f.write_str("getter"),
            Self::Sharer => f.write_str("sharer"),
        }
    }
}
