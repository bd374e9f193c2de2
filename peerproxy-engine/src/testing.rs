//! Fakes shared by the engine's unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use peerproxy_core::channel::{SocialChannel, VpnDevice};
use peerproxy_core::contact::PeerRef;
use peerproxy_core::protocol::Signal;
use peerproxy_core::transport::{Connection, Listener, ListenerFactory};

use crate::tcp::TcpListenerFactory;

/// A social channel that decodes and records every frame sent through it.
pub struct RecordingChannel {
    sent: mpsc::UnboundedSender<(PeerRef, Signal)>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(PeerRef, Signal)>) {
        let (sent, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            sent,
            failing: AtomicBool::new(false),
        });
        (channel, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl SocialChannel for RecordingChannel {
    fn send<'a>(
        &'a self,
        to: &'a PeerRef,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "channel down");
            let signal = Signal::from_bytes(&payload)?;
            let _ = self.sent.send((to.clone(), signal));
            Ok(())
        }
    }
}

/// Waits for the next recorded signal matching `pred`.
pub async fn next_signal(
    rx: &mut mpsc::UnboundedReceiver<(PeerRef, Signal)>,
    pred: impl Fn(&Signal) -> bool,
) -> Signal {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some((_, signal)) if pred(&signal) => return signal,
                Some(_) => {}
                None => panic!("channel recorder closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for signal")
}

/// A VPN device that records calls and can be told to fail or drop.
#[derive(Default)]
pub struct FakeVpn {
    pub fail_stop: AtomicBool,
    pub starts: Mutex<Vec<u16>>,
    pub stops: AtomicUsize,
    on_disconnect: Mutex<Option<oneshot::Sender<String>>>,
}

impl FakeVpn {
    /// Simulates the device going down on its own.
    pub fn disconnect(&self, reason: &str) {
        if let Some(tx) = self.on_disconnect.lock().unwrap().take() {
            let _ = tx.send(reason.to_string());
        }
    }
}

impl VpnDevice for FakeVpn {
    fn start(
        &self,
        proxy_port: u16,
        on_disconnect: oneshot::Sender<String>,
    ) -> impl Future<Output = anyhow::Result<String>> + Send + '_ {
        async move {
            self.starts.lock().unwrap().push(proxy_port);
            *self.on_disconnect.lock().unwrap() = Some(on_disconnect);
            Ok(format!("routing via {proxy_port}"))
        }
    }

    fn stop(&self) -> impl Future<Output = anyhow::Result<String>> + Send + '_ {
        async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.on_disconnect.lock().unwrap().take();
            anyhow::ensure!(!self.fail_stop.load(Ordering::SeqCst), "device wedged");
            Ok("stopped".to_string())
        }
    }
}

/// Binds a TCP echo server on localhost and returns its port.
pub async fn echo_server() -> u16 {
    let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
    let port = port_of(&listener.local_addr());
    tokio::spawn(async move {
        while let Ok(mut conn) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = conn.shutdown().await;
            });
        }
    });
    port
}

pub fn port_of(addr: &str) -> u16 {
    addr.rsplit(':').next().unwrap().parse().unwrap()
}
