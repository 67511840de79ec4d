// Bounded concurrent network traversal
//
// A fixed pool of workers drains a FIFO of pending targets. Each worker runs
// the blocking probe/fingerprint/collect sequence for one device under a
// per-device wall clock, feeds discovered neighbor addresses back into the
// queue, and merges the finished device into the in-progress map. All shared
// state sits behind one coarse mutex; per-target work is network-bound so
// contention stays negligible.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collector::{NeighborCollector, NeighborTable, Protocol};
use crate::error::{DiscoveryError, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::normalize::Platform;
use crate::template::TemplateEngine;
use crate::transport::{Credentials, SessionFactory, PROBE_TIMEOUT};

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_MAX_DEVICES: usize = 100;
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cooperative shutdown signal shared by every worker
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checked between phases; a cancelled worker abandons its device
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DiscoveryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One link endpoint pair as asserted by the owning device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub local_port: String,
    pub remote_port: String,
    pub protocol: Protocol,
    pub neighbor_ip: Option<String>,
    pub neighbor_platform: Option<String>,
}

/// A fingerprinted device and the claims it makes about its peers
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub hostname: String,
    pub ip: String,
    pub platform: String,
    pub serial: String,
    pub connections: BTreeMap<String, Vec<Connection>>,
}

/// Work-queue entry
#[derive(Debug, Clone)]
pub struct PendingTarget {
    pub address: String,
    pub credentials: Credentials,
    pub platform_hint: Option<Platform>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    pub devices_discovered: usize,
    pub devices_failed: usize,
    pub devices_queued: usize,
    pub devices_visited: usize,
    pub unreachable_hosts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Processing,
    Success,
    Failed,
    Complete,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Processing => "processing",
            CrawlStatus::Success => "success",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Complete => "complete",
        }
    }
}

/// Progress event pushed after every state change. Delivery is best-effort:
/// the channel holds one slot and overflow is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub ip: Option<String>,
    pub status: CrawlStatus,
    #[serde(flatten)]
    pub stats: CrawlStats,
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub seed: String,
    pub credentials: Credentials,
    pub alternate: Option<Credentials>,
    pub max_devices: usize,
    pub timeout_per_device: Duration,
    pub exclude: Vec<String>,
    pub blacklist: Vec<String>,
    pub max_workers: usize,
}

impl CrawlOptions {
    pub fn new(seed: impl Into<String>, credentials: Credentials) -> CrawlOptions {
        CrawlOptions {
            seed: seed.into(),
            credentials,
            alternate: None,
            max_devices: DEFAULT_MAX_DEVICES,
            timeout_per_device: DEFAULT_DEVICE_TIMEOUT,
            exclude: Vec::new(),
            blacklist: Vec::new(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Everything the crawler accumulated by the time it went quiescent
#[derive(Debug)]
pub struct CrawlOutcome {
    pub devices: Vec<Device>,
    pub stats: CrawlStats,
    pub failures: BTreeMap<String, String>,
    pub visited: Vec<String>,
    pub unreachable: Vec<String>,
    pub cancelled: bool,
}

#[derive(Default)]
struct CrawlState {
    pending: VecDeque<PendingTarget>,
    pending_addrs: HashSet<String>,
    visited: HashSet<String>,
    failed: HashSet<String>,
    unreachable: HashSet<String>,
    network_map: BTreeMap<String, Device>,
    failures: BTreeMap<String, String>,
    active: usize,
}

enum NextAction {
    Work(PendingTarget),
    Skip,
    Idle,
    Shutdown,
}

pub struct Crawler {
    opts: CrawlOptions,
    engine: Arc<TemplateEngine>,
    factory: Arc<dyn SessionFactory>,
    cancel: CancelFlag,
    state: Mutex<CrawlState>,
    events: Option<mpsc::Sender<ProgressEvent>>,
}

impl Crawler {
    pub fn new(
        opts: CrawlOptions,
        engine: Arc<TemplateEngine>,
        factory: Arc<dyn SessionFactory>,
        cancel: CancelFlag,
    ) -> Crawler {
        let mut state = CrawlState::default();
        let seed = PendingTarget {
            address: opts.seed.clone(),
            credentials: opts.credentials.clone(),
            platform_hint: None,
        };
        state.pending_addrs.insert(seed.address.clone());
        state.pending.push_back(seed);
        Crawler {
            opts,
            engine,
            factory,
            cancel,
            state: Mutex::new(state),
            events: None,
        }
    }

    /// Single-slot progress channel; events are dropped when the consumer
    /// lags (state is always reconstructible from the stats)
    pub fn progress_channel(&mut self) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(1);
        self.events = Some(tx);
        rx
    }

    pub fn stats(&self) -> CrawlStats {
        let st = self.state.lock();
        CrawlStats {
            devices_discovered: st.network_map.len(),
            devices_failed: st.failed.len(),
            devices_queued: st.pending.len(),
            devices_visited: st.visited.len(),
            unreachable_hosts: st.unreachable.len(),
        }
    }

    /// Drive the worker pool to quiescence, device budget, or cancellation
    pub async fn run(self) -> CrawlOutcome {
        let worker_count = self.opts.max_workers.max(1);
        let crawler = Arc::new(self);
        info!(
            seed = %crawler.opts.seed,
            workers = worker_count,
            max_devices = crawler.opts.max_devices,
            "starting crawl"
        );

        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                let worker = Arc::clone(&crawler);
                tokio::spawn(async move { worker.worker_loop().await })
            })
            .collect();
        futures::future::join_all(handles).await;

        crawler.emit(None, CrawlStatus::Complete);
        let stats = crawler.stats();
        let cancelled = crawler.cancel.is_cancelled();
        let mut st = crawler.state.lock();

        let mut visited: Vec<String> = st.visited.iter().cloned().collect();
        visited.sort();
        let mut unreachable: Vec<String> = st.unreachable.iter().cloned().collect();
        unreachable.sort();

        CrawlOutcome {
            devices: st.network_map.values().cloned().collect(),
            stats,
            failures: std::mem::take(&mut st.failures),
            visited,
            unreachable,
            cancelled,
        }
    }

    async fn worker_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let action = {
                let mut st = self.state.lock();
                if st.network_map.len() >= self.opts.max_devices.saturating_sub(1) {
                    NextAction::Shutdown
                } else if let Some(target) = st.pending.pop_front() {
                    st.pending_addrs.remove(&target.address);
                    if st.visited.contains(&target.address)
                        || st.failed.contains(&target.address)
                        || st.unreachable.contains(&target.address)
                    {
                        NextAction::Skip
                    } else {
                        st.visited.insert(target.address.clone());
                        st.active += 1;
                        NextAction::Work(target)
                    }
                } else if st.active == 0 {
                    NextAction::Shutdown
                } else {
                    NextAction::Idle
                }
            };
            match action {
                NextAction::Work(target) => {
                    self.process_target(target).await;
                    self.state.lock().active -= 1;
                }
                NextAction::Skip => continue,
                NextAction::Idle => tokio::time::sleep(Duration::from_millis(100)).await,
                NextAction::Shutdown => return,
            }
        }
    }

    async fn process_target(&self, target: PendingTarget) {
        let address = target.address.clone();
        self.emit(Some(address.clone()), CrawlStatus::Processing);

        // Reachability gate; nothing beyond a TCP connect
        let factory = Arc::clone(&self.factory);
        let probe_host = address.clone();
        let reachable =
            tokio::task::spawn_blocking(move || factory.probe(&probe_host, 22, PROBE_TIMEOUT))
                .await
                .unwrap_or(false);
        if !reachable {
            warn!(host = %address, "SSH port not reachable");
            {
                let mut st = self.state.lock();
                st.visited.remove(&address);
                st.unreachable.insert(address.clone());
            }
            self.emit(Some(address), CrawlStatus::Failed);
            return;
        }

        let job = SurveyJob {
            address: address.clone(),
            credentials: target.credentials,
            alternate: self.opts.alternate.clone(),
            engine: Arc::clone(&self.engine),
            factory: Arc::clone(&self.factory),
            cancel: self.cancel.clone(),
            blacklist: self.opts.blacklist.clone(),
        };
        let wall = self.opts.timeout_per_device;
        let outcome =
            match tokio::time::timeout(wall, tokio::task::spawn_blocking(move || job.run())).await
            {
                Err(_) => Err(DiscoveryError::DeviceTimeout {
                    host: address.clone(),
                    seconds: wall.as_secs(),
                }),
                Ok(Err(join_err)) => Err(DiscoveryError::Transport {
                    host: address.clone(),
                    reason: join_err.to_string(),
                }),
                Ok(Ok(result)) => result,
            };

        match outcome {
            Ok(survey) => {
                info!(host = %address, hostname = %survey.fingerprint.hostname, "device surveyed");
                self.merge_survey(&address, survey);
                self.emit(Some(address), CrawlStatus::Success);
            }
            Err(DiscoveryError::Cancelled) => {
                // Partial records from cancelled workers are discarded
                let mut st = self.state.lock();
                st.visited.remove(&address);
            }
            Err(e) => {
                warn!(host = %address, error = %e, "device failed");
                {
                    let mut st = self.state.lock();
                    st.visited.remove(&address);
                    st.failed.insert(address.clone());
                    st.failures.insert(address.clone(), e.kind().to_string());
                }
                self.emit(Some(address), CrawlStatus::Failed);
            }
        }
    }

    /// Fold a finished survey into shared state: record connections, enqueue
    /// fresh peer addresses, and insert or merge the device
    fn merge_survey(&self, address: &str, survey: Survey) {
        let fp = &survey.fingerprint;
        let mut device = Device {
            hostname: fp.hostname.clone(),
            ip: address.to_string(),
            platform: fp.platform.as_str().to_string(),
            serial: fp.serials.first().cloned().unwrap_or_default(),
            connections: BTreeMap::new(),
        };

        let mut st = self.state.lock();
        let tables = [
            (Protocol::Cdp, &survey.neighbors.cdp),
            (Protocol::Lldp, &survey.neighbors.lldp),
        ];
        for (protocol, table) in tables {
            for (peer_id, record) in table.iter() {
                let excluded = self
                    .opts
                    .exclude
                    .iter()
                    .any(|e| !e.is_empty() && peer_id.contains(e.as_str()));

                // The connection is recorded even for excluded peers
                for (local, remote) in &record.connections {
                    add_connection(
                        &mut device,
                        peer_id,
                        Connection {
                            local_port: local.clone(),
                            remote_port: remote.clone(),
                            protocol,
                            neighbor_ip: non_empty(&record.ip),
                            neighbor_platform: non_empty(&record.platform),
                        },
                    );
                }

                if excluded {
                    debug!(peer = %peer_id, "peer matches exclude pattern, not enqueued");
                    continue;
                }
                if record.ip.is_empty() {
                    continue;
                }
                let ip = record.ip.clone();
                if !st.visited.contains(&ip)
                    && !st.failed.contains(&ip)
                    && !st.unreachable.contains(&ip)
                    && !st.pending_addrs.contains(&ip)
                {
                    debug!(peer = %peer_id, ip = %ip, "queued neighbor");
                    st.pending_addrs.insert(ip.clone());
                    st.pending.push_back(PendingTarget {
                        address: ip,
                        credentials: self.opts.credentials.clone(),
                        platform_hint: Some(Platform::from_label(&record.platform)),
                    });
                }
            }
        }

        if st.network_map.len() >= self.opts.max_devices {
            debug!(host = %address, "device budget reached, discarding surveyed device");
            return;
        }
        match st.network_map.get_mut(&device.hostname) {
            Some(existing) => merge_device(existing, device),
            None => {
                st.network_map.insert(device.hostname.clone(), device);
            }
        }
    }

    fn emit(&self, ip: Option<String>, status: CrawlStatus) {
        let Some(tx) = &self.events else {
            return;
        };
        let event = ProgressEvent {
            ip,
            status,
            stats: self.stats(),
        };
        let _ = tx.try_send(event);
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Append a connection unless the port pair already exists for the peer.
/// A duplicate seen over the other protocol backfills missing peer details.
fn add_connection(device: &mut Device, peer_id: &str, conn: Connection) {
    let conns = device.connections.entry(peer_id.to_string()).or_default();
    for existing in conns.iter_mut() {
        if existing.local_port == conn.local_port && existing.remote_port == conn.remote_port {
            if existing.protocol != conn.protocol {
                if existing.neighbor_ip.is_none() {
                    existing.neighbor_ip = conn.neighbor_ip.clone();
                }
                if existing.neighbor_platform.is_none()
                    || existing.neighbor_platform.as_deref() == Some("unknown")
                {
                    existing.neighbor_platform = conn.neighbor_platform.clone();
                }
            }
            return;
        }
    }
    conns.push(conn);
}

/// Field-wise merge when one hostname is reached through two addresses
fn merge_device(existing: &mut Device, incoming: Device) {
    let keep = |cur: &str| !cur.is_empty() && cur != "unknown";
    if !keep(&existing.ip) && keep(&incoming.ip) {
        existing.ip = incoming.ip;
    }
    if !keep(&existing.platform) && keep(&incoming.platform) {
        existing.platform = incoming.platform;
    }
    if !keep(&existing.serial) && keep(&incoming.serial) {
        existing.serial = incoming.serial;
    }
    for (peer, conns) in incoming.connections {
        for conn in conns {
            add_connection(existing, &peer, conn);
        }
    }
}

/// The blocking per-device sequence, run inside `spawn_blocking`
struct SurveyJob {
    address: String,
    credentials: Credentials,
    alternate: Option<Credentials>,
    engine: Arc<TemplateEngine>,
    factory: Arc<dyn SessionFactory>,
    cancel: CancelFlag,
    blacklist: Vec<String>,
}

pub struct Survey {
    pub fingerprint: Fingerprint,
    pub neighbors: NeighborTable,
}

impl SurveyJob {
    fn run(&self) -> Result<Survey> {
        self.cancel.check()?;
        let mut session = match self.factory.open(&self.address, &self.credentials) {
            Ok(session) => session,
            Err(e) if e.is_auth_failure() && self.alternate.is_some() => {
                info!(host = %self.address, "auth rejected, retrying with alternate credentials");
                self.factory
                    .open(&self.address, self.alternate.as_ref().unwrap())?
            }
            Err(e) => return Err(e),
        };
        let result = self.survey_session(session.as_mut());
        session.close();
        result
    }

    fn survey_session(
        &self,
        session: &mut dyn crate::transport::DeviceSession,
    ) -> Result<Survey> {
        let fingerprinter = Fingerprinter::new(&self.engine, &self.blacklist, &self.cancel);
        let fingerprint = fingerprinter.run(session, &self.address)?;

        let neighbors = if fingerprint.platform == Platform::Unknown {
            NeighborTable::default()
        } else {
            self.cancel.check()?;
            NeighborCollector::new(&self.engine, &self.cancel).collect(
                session,
                &self.address,
                &fingerprint.prompt,
                fingerprint.platform,
            )?
        };

        Ok(Survey {
            fingerprint,
            neighbors,
        })
    }
}
