//! Presentation-facing facade.
//!
//! [`Client`] wires the connection state machine to the poll engine: a ready
//! link is handed to the poller, a lost one detaches it. All calls return
//! immediately; progress is observed through the watch receivers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, LinkEvent};
use crate::device::Device;
use crate::errors::Result;
use crate::platform::{BlePlatform, DeviceId, PlatformEvent};
use crate::poller::{SharedCommander, TargetConfig, TargetManager};
use crate::protocol::Commander;

pub struct Client {
    manager: ConnectionManager,
    targets: Arc<Mutex<TargetManager>>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock(targets: &Mutex<TargetManager>) -> MutexGuard<'_, TargetManager> {
    targets.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Build the client and spawn its event loops on the current runtime.
    ///
    /// `events` must be the receiving end of the channel `platform` reports on.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
        config: &ClientConfig,
    ) -> Self {
        let (manager, links) = ConnectionManager::new(platform, config);
        let mut targets = TargetManager::new(&config.poller, config.link.response_timeout());
        for seed in &config.targets {
            targets.add_target(&seed.target, &seed.request);
        }
        let targets = Arc::new(Mutex::new(targets));

        let tasks = vec![
            tokio::spawn(manager.clone().run(events)),
            tokio::spawn(forward_links(links, targets.clone())),
        ];
        Self {
            manager,
            targets,
            tasks,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.subscribe_status()
    }

    pub fn devices(&self) -> watch::Receiver<Vec<Device>> {
        self.manager.devices().subscribe()
    }

    pub fn targets(&self) -> watch::Receiver<Vec<TargetConfig>> {
        lock(&self.targets).targets().subscribe()
    }

    /// Completed poll passes since start-up.
    pub fn poll_passes(&self) -> u64 {
        lock(&self.targets).poller().passes()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.targets).poller().is_running()
    }

    pub fn add_target(&self, target: &str, request: &str) -> Uuid {
        lock(&self.targets).add_target(target, request)
    }

    pub fn remove_target(&self, id: Uuid) -> bool {
        lock(&self.targets).remove_target(id)
    }

    pub fn edit_target(&self, id: Uuid, target: &str, request: &str) -> bool {
        lock(&self.targets).edit_target(id, target, request)
    }

    pub fn connect(&self, id: &DeviceId) -> Result<()> {
        self.manager.connect(id)
    }

    pub fn cancel_connection(&self) {
        self.manager.cancel_connection();
    }

    pub fn set_scanning(&self, enabled: bool) {
        self.manager.set_scanning(enabled);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        lock(&self.targets).detach();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_links(
    mut links: mpsc::UnboundedReceiver<LinkEvent>,
    targets: Arc<Mutex<TargetManager>>,
) {
    while let Some(event) = links.recv().await {
        match event {
            LinkEvent::Ready { id, protocol } => {
                if protocol.scope().is_cancelled() {
                    debug!("link to {} was torn down before polling began", id);
                    continue;
                }
                info!("polling over {}", id);
                let boxed: Box<dyn Commander> = Box::new(protocol);
                let commander: SharedCommander = Arc::new(tokio::sync::Mutex::new(boxed));
                lock(&targets).attach(commander);
            }
            LinkEvent::Lost { id } => {
                info!("link to {} lost, polling stopped", id);
                lock(&targets).detach();
            }
        }
    }
    debug!("link event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollerConfig, TargetSeed};
    use crate::framer::LineFramer;
    use crate::poller::NO_DATA;
    use crate::protocol::CommandProtocol;
    use crate::scope::Scope;
    use crate::sim::{ScriptedSink, SimResponder, SimulatedAdapter};
    use crate::transport::ByteTransport;
    use std::time::Duration;

    const ADAPTER: &str = "88:1B:99:0F:2A:11";

    fn config() -> ClientConfig {
        let mut config = ClientConfig::with_default_targets();
        config.handshake.flush_delay_ms = 5;
        config.handshake.status_timeout_ms = 500;
        config.link.response_timeout_ms = 200;
        config
    }

    fn client(config: &ClientConfig) -> (Client, Arc<SimulatedAdapter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sim = Arc::new(
            SimulatedAdapter::new(tx, config.link.clone()).with_peripheral(
                ADAPTER,
                Some("OBDLink CX"),
                -58,
            ),
        );
        let client = Client::new(sim.clone(), rx, config);
        (client, sim)
    }

    async fn wait_for<T: Clone>(
        rx: &mut watch::Receiver<T>,
        mut f: impl FnMut(&T) -> bool,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|v| f(v)))
            .await
            .expect("timed out")
            .expect("sender dropped")
            .clone()
    }

    #[tokio::test]
    async fn seeded_targets_start_with_no_data() {
        let (client, _sim) = client(&config());
        let targets = client.targets().borrow().clone();
        assert_eq!(targets.len(), 3);
        assert!(targets.iter().all(|t| t.response == NO_DATA));
        assert!(!client.is_polling());
    }

    #[tokio::test]
    async fn connected_link_fills_in_responses() {
        let (client, sim) = client(&config());
        let mut devices = client.devices();
        sim.power_on();
        wait_for(&mut devices, |d| !d.is_empty()).await;

        client.connect(&ADAPTER.into()).unwrap();

        let mut targets = client.targets();
        let targets = wait_for(&mut targets, |t| t.iter().all(|t| t.response != NO_DATA)).await;
        let responses: Vec<&str> = targets.iter().map(|t| t.response.as_str()).collect();
        assert_eq!(responses, ["41 0C 1A F8", "41 0C 1A F8", "41 0D 32"]);
        assert!(sim.commands().iter().any(|c| c == "ATSH 7E2"));
        assert!(client.is_polling());
    }

    #[tokio::test]
    async fn cancelling_stops_polling() {
        let (client, sim) = client(&config());
        let mut devices = client.devices();
        let mut status = client.status();
        sim.power_on();
        wait_for(&mut devices, |d| !d.is_empty()).await;
        client.connect(&ADAPTER.into()).unwrap();
        wait_for(&mut status, |s| *s == ConnectionStatus::Connected).await;
        let mut targets = client.targets();
        wait_for(&mut targets, |t| t.iter().any(|t| t.response != NO_DATA)).await;

        client.cancel_connection();

        wait_for(&mut status, |s| *s == ConnectionStatus::NotConnected).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_polling() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("poller still running");
        assert!(sim.connected().is_none());
        assert!(sim.is_scanning());
    }

    #[tokio::test]
    async fn targets_added_while_connected_are_polled() {
        let config = ClientConfig {
            targets: Vec::new(),
            ..config()
        };
        let (client, sim) = client(&config);
        let mut devices = client.devices();
        let mut status = client.status();
        sim.power_on();
        wait_for(&mut devices, |d| !d.is_empty()).await;
        client.connect(&ADAPTER.into()).unwrap();
        wait_for(&mut status, |s| *s == ConnectionStatus::Connected).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !lock(&client.targets).poller().is_attached() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("link never handed to the poller");
        assert!(!client.is_polling());

        let id = client.add_target(" 7E0 ", "010D1");
        assert!(client.is_polling());

        let mut targets = client.targets();
        let targets = wait_for(&mut targets, |t| t.iter().any(|t| t.response != NO_DATA)).await;
        assert_eq!(targets[0].id, id);
        assert_eq!(targets[0].target, "7E0");
        assert_eq!(targets[0].response, "41 0D 32");

        assert!(client.remove_target(id));
        assert!(!client.is_polling());
    }

    #[tokio::test]
    async fn seeds_come_from_configuration() {
        let config = ClientConfig {
            targets: vec![TargetSeed {
                target: "7E8".into(),
                request: "0105".into(),
            }],
            ..ClientConfig::default()
        };
        let (client, _sim) = client(&config);
        let targets = client.targets().borrow().clone();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].request, "0105");
    }

    fn idle_protocol() -> CommandProtocol {
        let sink = ScriptedSink::new(SimResponder::demo(), 20);
        let (transport, handle) = ByteTransport::new(sink.clone(), Duration::from_secs(1));
        sink.attach(handle);
        CommandProtocol::new(LineFramer::new(transport), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn torn_down_link_is_never_handed_to_the_poller() {
        let targets = Arc::new(Mutex::new(TargetManager::new(
            &PollerConfig::default(),
            Duration::from_secs(1),
        )));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut protocol = idle_protocol();
        let session = Scope::new();
        protocol.set_scope(session.clone());
        session.cancel();

        tx.send(LinkEvent::Ready {
            id: ADAPTER.into(),
            protocol,
        })
        .unwrap();
        drop(tx);
        forward_links(rx, targets.clone()).await;

        assert!(!lock(&targets).poller().is_attached());
    }

    #[tokio::test]
    async fn ready_link_is_attached_until_lost() {
        let targets = Arc::new(Mutex::new(TargetManager::new(
            &PollerConfig::default(),
            Duration::from_secs(1),
        )));
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_links(rx, targets.clone()));

        tx.send(LinkEvent::Ready {
            id: ADAPTER.into(),
            protocol: idle_protocol(),
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !lock(&targets).poller().is_attached() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("link never attached");

        tx.send(LinkEvent::Lost { id: ADAPTER.into() }).unwrap();
        drop(tx);
        forwarder.await.unwrap();
        assert!(!lock(&targets).poller().is_attached());
    }
}
