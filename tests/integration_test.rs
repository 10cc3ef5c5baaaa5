//! Two transport managers talking to each other over an in-memory radio.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::duplex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

use gamelink_bt::bluetooth::{
    BtPlatform, Collaborators, Invite, KeyValueStore, PeerSocket, RemoteDevice, RetryTimer,
    RfcommAcceptor, ScanListener, SecurityMode, ServiceRecord, TransportEvent, TransportManager,
    TransportSettings, MAX_PACKET_LEN, PAYLOAD_HEADER_LEN,
};
use gamelink_bt::state::{Direction, StatusBoard};
use gamelink_bt::storage::{Inbox, KvStore};

/// Listening endpoints by (address, mode).
#[derive(Default)]
struct Air {
    listeners: Mutex<HashMap<(String, SecurityMode), mpsc::UnboundedSender<PeerSocket>>>,
}

struct AirPlatform {
    air: Arc<Air>,
    me: RemoteDevice,
    bonded: Mutex<Vec<RemoteDevice>>,
}

impl AirPlatform {
    fn new(air: &Arc<Air>, me: RemoteDevice) -> Self {
        Self {
            air: air.clone(),
            me,
            bonded: Mutex::new(Vec::new()),
        }
    }

    fn bond(&self, other: &RemoteDevice) {
        self.bonded.lock().push(other.clone());
    }
}

struct AirAcceptor {
    rx: mpsc::UnboundedReceiver<PeerSocket>,
}

#[async_trait]
impl RfcommAcceptor for AirAcceptor {
    async fn accept(&mut self) -> io::Result<PeerSocket> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

#[async_trait]
impl BtPlatform for AirPlatform {
    fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool {
        true
    }

    fn has_permissions(&self) -> bool {
        true
    }

    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>> {
        Ok(self.bonded.lock().clone())
    }

    async fn remote_device(&self, address: &str) -> io::Result<Option<RemoteDevice>> {
        Ok(self
            .bonded
            .lock()
            .iter()
            .find(|d| d.address == address)
            .cloned())
    }

    async fn connect(
        &self,
        device: &RemoteDevice,
        mode: SecurityMode,
        _service: &ServiceRecord,
    ) -> io::Result<PeerSocket> {
        let listeners = self.air.listeners.lock();
        let tx = listeners
            .get(&(device.address.clone(), mode))
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (ours, theirs) = duplex(8192);
        tx.send(PeerSocket::new(theirs, self.me.clone()))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(PeerSocket::new(ours, device.clone()))
    }

    async fn listen(
        &self,
        mode: SecurityMode,
        _service: &ServiceRecord,
    ) -> io::Result<Box<dyn RfcommAcceptor>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.air
            .listeners
            .lock()
            .insert((self.me.address.clone(), mode), tx);
        Ok(Box::new(AirAcceptor { rx }))
    }

    fn adapter_name(&self) -> Option<String> {
        self.me.name.clone()
    }
}

struct Node {
    manager: Arc<TransportManager>,
    inbox: Arc<Inbox>,
    kv: Arc<KvStore>,
    status: Arc<StatusBoard>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    _dir: TempDir,
}

impl Node {
    fn new(platform: Arc<AirPlatform>) -> Self {
        let dir = TempDir::new().unwrap();
        let inbox = Arc::new(Inbox::new(dir.path()).unwrap());
        let kv = Arc::new(KvStore::new(dir.path()).unwrap());
        let status = StatusBoard::new();
        let (tx, events) = mpsc::unbounded_channel();
        let manager = TransportManager::new(
            platform,
            Collaborators {
                game: inbox.clone(),
                status: status.clone(),
                store: kv.clone(),
                retry: Arc::new(RetryTimer::new()),
            },
            TransportSettings::default(),
            tx,
            Handle::current(),
        );
        manager.init();
        Self {
            manager,
            inbox,
            kv,
            status,
            events,
            _dir: dir,
        }
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn alice_dev() -> RemoteDevice {
    RemoteDevice::new("Alice", "AA:AA:AA:AA:AA:01")
}

fn bob_dev() -> RemoteDevice {
    RemoteDevice::new("Bob", "BB:BB:BB:BB:BB:02")
}

async fn pair() -> (Node, Node) {
    let air = Arc::new(Air::default());
    let alice = Arc::new(AirPlatform::new(&air, alice_dev()));
    let bob = Arc::new(AirPlatform::new(&air, bob_dev()));
    alice.bond(&bob_dev());
    bob.bond(&alice_dev());

    let nodes = (Node::new(alice), Node::new(bob));
    // let both listeners come up
    tokio::time::sleep(Duration::from_millis(50)).await;
    nodes
}

#[tokio::test(start_paused = true)]
async fn test_message_delivery_and_mac_discovery() {
    let (mut alice, bob) = pair().await;
    bob.inbox.add_game(42, "Friday game").unwrap();
    assert_eq!(alice.manager.local_mac(), None);

    assert!(
        alice
            .manager
            .send_packet("Bob", None, 42, b"e2e4", Some("m1"))
            .await
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let messages = bob.inbox.messages_for(42).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"e2e4");
    assert_eq!(messages[0].from_addr, "AA:AA:AA:AA:AA:01");

    // Bob answered MAC_ASK with the address it saw us connect from
    assert_eq!(alice.manager.local_mac().as_deref(), Some("AA:AA:AA:AA:AA:01"));
    assert_eq!(
        alice.kv.cached_local_mac().unwrap().as_deref(),
        Some("AA:AA:AA:AA:AA:01")
    );

    assert_eq!(
        alice.drain_events(),
        vec![TransportEvent::MessageAccepted {
            game_id: 42,
            peer: "Bob".to_string()
        }]
    );
    assert!(alice.status.stats(Direction::Outbound).is_healthy());
    assert!(bob.status.stats(Direction::Inbound).is_healthy());
    assert_eq!(alice.manager.registry().get("Bob").unwrap().queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_largest_message_delivered() {
    let (mut alice, bob) = pair().await;
    alice
        .manager
        .context()
        .state()
        .load_local_mac(Some("AA:AA:AA:AA:AA:01".to_string()));
    bob.inbox.add_game(5, "Long game").unwrap();

    // MESG_SEND costs its body plus 9 bytes; this fills the queue
    let body = vec![b'x'; MAX_PACKET_LEN - PAYLOAD_HEADER_LEN - 9 - 1];
    assert!(alice.manager.send_packet("Bob", None, 5, &body, None).await);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let messages = bob.inbox.messages_for(5).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, body);
    assert_eq!(
        alice.drain_events(),
        vec![TransportEvent::MessageAccepted {
            game_id: 5,
            peer: "Bob".to_string()
        }]
    );
    assert_eq!(alice.manager.registry().get("Bob").unwrap().queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_game_reported_gone() {
    let (mut alice, _bob) = pair().await;

    alice.manager.send_packet("Bob", None, 9, b"move", None).await;
    alice.manager.ping_host("Bob", None, 10).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        alice.drain_events(),
        vec![
            TransportEvent::MessageNoGame {
                game_id: 9,
                via_peer: Some("Bob".to_string())
            },
            TransportEvent::MessageNoGame {
                game_id: 10,
                via_peer: None
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invitation_then_duplicate() {
    let (mut alice, mut bob) = pair().await;
    let invite = Invite::new(7, "Rematch", "en").with_dict("CollegeEng");

    assert!(alice.manager.send_invite("Bob", None, &invite).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        alice.drain_events(),
        vec![TransportEvent::NewGameSuccess { game_id: 7 }]
    );

    let received = bob.inbox.invites().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].invite, invite);
    assert!(bob.inbox.has_game(7).unwrap());

    // the queue is empty again, so the same invite goes out a second time
    assert!(alice.manager.send_invite("Bob", None, &invite).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        alice.drain_events(),
        vec![TransportEvent::NewGameFailure { game_id: 7 }]
    );
    assert!(bob.drain_events().is_empty());

    // Bob can now talk back about the game
    bob.manager.game_died("Alice", None, 7).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        alice.drain_events(),
        vec![TransportEvent::MessageNoGame {
            game_id: 7,
            via_peer: Some("Bob".to_string())
        }]
    );
}

#[derive(Default)]
struct Seen {
    names: Mutex<Vec<String>>,
    done: Notify,
}

impl ScanListener for Seen {
    fn on_device_scanned(&self, device: &RemoteDevice) {
        self.names.lock().push(device.display_name().to_string());
    }

    fn on_scan_done(&self) {
        self.done.notify_one();
    }
}

#[tokio::test(start_paused = true)]
async fn test_scan_finds_peer() {
    let (alice, bob) = pair().await;
    alice
        .manager
        .context()
        .state()
        .load_local_mac(Some("AA:AA:AA:AA:AA:01".to_string()));

    let alice_seen = Arc::new(Seen::default());
    let bob_seen = Arc::new(Seen::default());
    alice.manager.add_scan_listener(alice_seen.clone());
    bob.manager.add_scan_listener(bob_seen.clone());

    assert_eq!(alice.manager.scan(Some(Duration::from_secs(5))).await, 1);
    alice_seen.done.notified().await;

    assert_eq!(*alice_seen.names.lock(), vec!["Bob".to_string()]);
    // the pinged side sees the inbound ping too
    assert_eq!(*bob_seen.names.lock(), vec!["Alice".to_string()]);
    assert!(alice.manager.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_keeps_queue() {
    let (alice, bob) = pair().await;
    alice
        .manager
        .context()
        .state()
        .load_local_mac(Some("AA:AA:AA:AA:AA:01".to_string()));
    bob.manager.stop();

    alice.manager.ping_host("Bob", None, 3).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let sender = alice.manager.registry().get("Bob").unwrap();
    assert_eq!(sender.queue_len(), 1);
    assert!(sender.fail_count() >= 1);
    assert!(!alice.status.stats(Direction::Outbound).is_healthy());

    // Bob comes back; the next attempt delivers
    bob.manager.on_resume();
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.manager.ping_host("Bob", None, 3).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sender.queue_len(), 0);
    assert_eq!(sender.fail_count(), 0);
}
