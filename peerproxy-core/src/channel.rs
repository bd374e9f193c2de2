//! Collaborators the engine talks to but does not implement: the social
//! network that carries signaling, and the platform VPN device.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::contact::{Contact, ContactId, PeerRef};

/// Opaque bidirectional message channel provided by a social network.
///
/// Delivery is best effort and ordered per destination instance. Login,
/// roster management and message framing on the network itself are the
/// adapter's business.
pub trait SocialChannel: Send + Sync + 'static {
    /// Sends one encoded frame to a single instance of a contact.
    fn send<'a>(
        &'a self,
        to: &'a PeerRef,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;
}

/// Inbound events from the social network adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A contact appeared or its presence or instance list changed.
    Presence(Contact),
    /// A frame arrived from one instance of a contact.
    Message { from: PeerRef, payload: Bytes },
    /// The contact was removed from the roster for good.
    ContactRemoved(ContactId),
}

/// A VPN-capable device that routes system traffic through a local proxy
/// port.
pub trait VpnDevice: Send + Sync + 'static {
    /// Starts routing through `proxy_port`. The device fires
    /// `on_disconnect` with a reason if it goes down on its own.
    ///
    /// Returns a human-readable status message.
    fn start(
        &self,
        proxy_port: u16,
        on_disconnect: oneshot::Sender<String>,
    ) -> impl Future<Output = anyhow::Result<String>> + Send + '_;

    /// Stops routing. Returns a human-readable status message.
    fn stop(&self) -> impl Future<Output = anyhow::Result<String>> + Send + '_;
}
