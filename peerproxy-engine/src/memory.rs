//! In-process social network joining several engines.
//!
//! Every joined instance sees every other user of the network as a contact.
//! Delivery is immediate and ordered; an offline instance can neither send
//! nor receive, and a silenced one swallows everything sent to it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use peerproxy_core::channel::{NetworkEvent, SocialChannel};
use peerproxy_core::contact::{Contact, LocalIdentity, PeerRef, Presence};

struct Member {
    identity: LocalIdentity,
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
    online: bool,
    silent: bool,
}

#[derive(Clone)]
pub struct LoopbackNetwork {
    name: String,
    members: Arc<Mutex<Vec<Member>>>,
}

impl LoopbackNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an online instance of `user_id`. Inbound events for it are
    /// delivered on `network_tx`.
    pub fn join(
        &self,
        user_id: &str,
        instance_id: &str,
        network_tx: mpsc::UnboundedSender<NetworkEvent>,
    ) -> LoopbackChannel {
        let identity = LocalIdentity {
            network: self.name.clone(),
            user_id: user_id.to_string(),
            instance_id: instance_id.to_string(),
            display_name: user_id.to_string(),
        };
        debug!(network = %self.name, user = user_id, instance = instance_id, "Joining loopback network");

        let mut members = self.lock();
        members.push(Member {
            identity: identity.clone(),
            network_tx: network_tx.clone(),
            online: true,
            silent: false,
        });
        show_roster(&members, user_id, &network_tx);
        announce(&members, user_id);

        LoopbackChannel {
            network: self.clone(),
            identity,
        }
    }

    pub fn set_online(&self, user_id: &str, instance_id: &str, online: bool) {
        let mut members = self.lock();
        let Some(member) = find_mut(&mut members, user_id, instance_id) else {
            return;
        };
        member.online = online;
        if online {
            let network_tx = member.network_tx.clone();
            show_roster(&members, user_id, &network_tx);
        }
        announce(&members, user_id);
    }

    /// Messages sent to a silent instance are accepted and dropped.
    pub fn set_silent(&self, user_id: &str, instance_id: &str, silent: bool) {
        if let Some(member) = find_mut(&mut self.lock(), user_id, instance_id) {
            member.silent = silent;
        }
    }

    /// Removes `user_id` from the roster of every instance of `viewer_id`.
    pub fn remove_contact(&self, viewer_id: &str, user_id: &str) {
        let members = self.lock();
        for viewer in members.iter().filter(|m| m.identity.user_id == viewer_id) {
            let contact = viewer.identity.contact(user_id);
            let _ = viewer.network_tx.send(NetworkEvent::ContactRemoved(contact));
        }
    }
}

fn find_mut<'a>(members: &'a mut [Member], user_id: &str, instance_id: &str) -> Option<&'a mut Member> {
    members
        .iter_mut()
        .find(|m| m.identity.user_id == user_id && m.identity.instance_id == instance_id)
}

/// How `viewer_id` currently sees `user_id`.
fn contact_view(members: &[Member], viewer_id: &str, user_id: &str) -> Option<Contact> {
    let instances: Vec<&Member> = members
        .iter()
        .filter(|m| m.identity.user_id == user_id)
        .collect();
    let first = instances.first()?;
    let online: Vec<String> = instances
        .iter()
        .filter(|m| m.online)
        .map(|m| m.identity.instance_id.clone())
        .collect();
    Some(Contact {
        id: first.identity.as_seen_by(viewer_id).contact,
        display_name: first.identity.display_name.clone(),
        presence: if online.is_empty() {
            Presence::Offline
        } else {
            Presence::Online
        },
        instance_ids: online,
    })
}

/// Sends `viewer_id` the presence of every other user.
fn show_roster(members: &[Member], viewer_id: &str, network_tx: &mpsc::UnboundedSender<NetworkEvent>) {
    let mut seen: Vec<&str> = Vec::new();
    for member in members {
        let user = member.identity.user_id.as_str();
        if user == viewer_id || seen.contains(&user) {
            continue;
        }
        seen.push(user);
        if let Some(contact) = contact_view(members, viewer_id, user) {
            let _ = network_tx.send(NetworkEvent::Presence(contact));
        }
    }
}

/// Pushes the current view of `user_id` to every other user's online instances.
fn announce(members: &[Member], user_id: &str) {
    for viewer in members
        .iter()
        .filter(|m| m.online && m.identity.user_id != user_id)
    {
        if let Some(contact) = contact_view(members, &viewer.identity.user_id, user_id) {
            let _ = viewer.network_tx.send(NetworkEvent::Presence(contact));
        }
    }
}

/// One instance's handle on a [`LoopbackNetwork`].
pub struct LoopbackChannel {
    network: LoopbackNetwork,
    identity: LocalIdentity,
}

impl LoopbackChannel {
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }
}

impl SocialChannel for LoopbackChannel {
    fn send<'a>(
        &'a self,
        to: &'a PeerRef,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            let members = self.network.lock();
            let me = &self.identity;
            let sender_online = members.iter().any(|m| {
                m.online
                    && m.identity.user_id == me.user_id
                    && m.identity.instance_id == me.instance_id
            });
            if !sender_online {
                bail!("{} is offline", me.instance_id);
            }
            let Some(target) = members.iter().find(|m| {
                m.identity.user_id == to.contact.user_id && m.identity.instance_id == to.instance_id
            }) else {
                bail!("peer {to} is unreachable");
            };
            if !target.online {
                bail!("peer {to} is unreachable");
            }
            if target.silent {
                trace!(peer = %to, "Dropping frame for silent instance");
                return Ok(());
            }
            let from = me.as_seen_by(&target.identity.user_id);
            if target
                .network_tx
                .send(NetworkEvent::Message { from, payload })
                .is_err()
            {
                bail!("peer {to} has left the network");
            }
            Ok(())
        }
    }
}
