//! ReplicatedKv: el meta-store replicado usado por los managers.
//! Implementa propose/complete de dos fases sobre un conjunto de
//! maquinas (`cluster`), un log particionado en baldes por
//! `uid.hi / 16`, y el protocolo de sincronizacion inicial.
use crate::status::StatusTracker;
use addressing::{BlockId, ServiceAddress, Uid};
use logger::Logger;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use wire::reply::{KvBundleEntry, KvBundlePayload};
use wire::{Command, Role, Transport};

const BUCKET_DIVISOR: u64 = 16;
const LOG_BUNDLE_SIZE: usize = 32;
const LOG_REWIND: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    KeyValue { key: String, value: String },
    BlockServers { block_id: BlockId, servers: Vec<u64> },
}

impl From<Payload> for KvBundlePayload {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::KeyValue { key, value } => KvBundlePayload::KeyValue { key, value },
            Payload::BlockServers { block_id, servers } => KvBundlePayload::BlockServers { block_id, servers },
        }
    }
}

impl From<KvBundlePayload> for Payload {
    fn from(payload: KvBundlePayload) -> Self {
        match payload {
            KvBundlePayload::KeyValue { key, value } => Payload::KeyValue { key, value },
            KvBundlePayload::BlockServers { block_id, servers } => Payload::BlockServers { block_id, servers },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LogRecord {
    uid: Uid,
    payload: Payload,
}

#[derive(Debug, PartialEq, Eq)]
pub enum KvError {
    MajorityUnavailable,
    NotConnected,
    Fatal(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::MajorityUnavailable => write!(f, "majority not available"),
            KvError::NotConnected => write!(f, "service not connected"),
            KvError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

/// Estado aplicado localmente: UIDs ya vistos (particionados en
/// baldes), indice de claves y de block_id -> servidores.
#[derive(Default)]
struct AppliedState {
    buckets: HashMap<u64, Vec<LogRecord>>,
    applied_uids: BTreeSet<Uid>,
    keys: BTreeMap<String, String>,
    block_servers: BTreeMap<BlockId, Vec<u64>>,
}

impl AppliedState {
    fn has_applied(&self, uid: &Uid) -> bool {
        self.applied_uids.contains(uid)
    }

    fn apply(&mut self, uid: Uid, payload: Payload) {
        if self.has_applied(&uid) {
            return;
        }
        self.applied_uids.insert(uid);
        match &payload {
            Payload::KeyValue { key, value } => {
                self.keys.insert(key.clone(), value.clone());
            }
            Payload::BlockServers { block_id, servers } => {
                self.block_servers.insert(*block_id, servers.clone());
            }
        }
        let bucket = uid.hi() / BUCKET_DIVISOR;
        self.buckets.entry(bucket).or_default().push(LogRecord { uid, payload });
    }
}

pub struct ReplicatedKv {
    self_addr: ServiceAddress,
    cluster: RwLock<Vec<ServiceAddress>>,
    state: RwLock<AppliedState>,
    pending: RwLock<HashMap<ServiceAddress, Vec<LogRecord>>>,
    connected: RwLock<bool>,
    transport: Arc<dyn Transport>,
    tracker: Arc<StatusTracker>,
    logger: Arc<Logger>,
}

impl ReplicatedKv {
    pub fn new(
        self_addr: ServiceAddress,
        transport: Arc<dyn Transport>,
        tracker: Arc<StatusTracker>,
        logger: Arc<Logger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_addr,
            cluster: RwLock::new(vec![self_addr]),
            state: RwLock::new(AppliedState::default()),
            pending: RwLock::new(HashMap::new()),
            connected: RwLock::new(false),
            transport,
            tracker,
            logger,
        })
    }

    pub fn add_machine(&self, addr: ServiceAddress) {
        let mut cluster = self.cluster.write().unwrap();
        if !cluster.contains(&addr) {
            cluster.push(addr);
        }
    }

    pub fn remove_machine(&self, addr: ServiceAddress) {
        self.cluster.write().unwrap().retain(|a| *a != addr);
    }

    pub fn clear_all_machines(&self) {
        let mut cluster = self.cluster.write().unwrap();
        cluster.clear();
        cluster.push(self.self_addr);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read().unwrap()
    }

    pub fn check_connected(&self) -> Result<(), KvError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(KvError::NotConnected)
        }
    }

    fn majority_threshold(&self) -> usize {
        self.cluster.read().unwrap().len() / 2
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.state.read().unwrap().keys.get(key).cloned()
    }

    pub fn get_all_keys(&self, prefix: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn get_block_id_server_map(&self, block_id: BlockId) -> Option<Vec<u64>> {
        self.state.read().unwrap().block_servers.get(&block_id).cloned()
    }

    pub fn get_last_block_id(&self) -> Option<BlockId> {
        self.state.read().unwrap().block_servers.keys().next_back().copied()
    }

    pub fn has_applied_uid(&self, uid: &Uid) -> bool {
        self.state.read().unwrap().has_applied(uid)
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<(), KvError> {
        let uid = Uid::generate();
        self.propose_and_complete(uid, Payload::KeyValue { key: key.to_string(), value: value.to_string() })
    }

    pub fn set_block_id_server_map(&self, block_id: BlockId, servers: Vec<u64>) -> Result<(), KvError> {
        let uid = Uid::generate();
        self.propose_and_complete(uid, Payload::BlockServers { block_id, servers })
    }

    fn propose_and_complete(&self, uid: Uid, payload: Payload) -> Result<(), KvError> {
        let targets: Vec<ServiceAddress> =
            self.cluster.read().unwrap().iter().filter(|a| **a != self.self_addr).copied().collect();
        let mut successes = 1; // self counts toward the majority
        let cmd = propose_command(uid, &payload);
        for target in &targets {
            if !self.tracker.state_of(*target, Role::Manager).is_up() {
                self.enqueue_pending(*target, uid, payload.clone());
                continue;
            }
            match self.transport.call(*target, Role::Manager, cmd.clone()) {
                Ok(_) => successes += 1,
                Err(fault) if fault.is_connection_fault() => {
                    self.enqueue_pending(*target, uid, payload.clone());
                }
                Err(fault) => return Err(KvError::Fatal(fault.to_string())),
            }
        }

        if successes <= self.majority_threshold() {
            return Err(KvError::MajorityUnavailable);
        }

        self.state.write().unwrap().apply(uid, payload.clone());

        let complete_cmd = complete_command(uid, &payload);
        for target in &targets {
            if self.tracker.state_of(*target, Role::Manager).is_up() {
                let _ = self.transport.call(*target, Role::Manager, complete_cmd.clone());
            }
        }
        Ok(())
    }

    fn enqueue_pending(&self, target: ServiceAddress, uid: Uid, payload: Payload) {
        self.pending
            .write()
            .unwrap()
            .entry(target)
            .or_default()
            .push(LogRecord { uid, payload });
    }

    /// Aplica una Complete recibida de un peer (o de si mismo durante la
    /// inicializacion), bajo el lock de escritura, de forma idempotente.
    pub fn receive_complete(&self, uid: Uid, payload: Payload) {
        self.state.write().unwrap().apply(uid, payload);
    }

    /// Recorre los peers del cluster pidiendo el log desde
    /// `last_applied_uid` propio. Si los peers sincronizados (incl. self)
    /// superan la mitad del cluster, marca `connected := true`.
    pub fn initialize(&self) {
        let last_applied = self
            .state
            .read()
            .unwrap()
            .applied_uids
            .iter()
            .next_back()
            .copied()
            .unwrap_or(Uid::new(0, 0));

        let peers: Vec<ServiceAddress> =
            self.cluster.read().unwrap().iter().filter(|a| **a != self.self_addr).copied().collect();
        let mut synced = 1;
        for peer in peers {
            match self.fetch_log_bundle(peer, last_applied, true) {
                Ok(records) => {
                    for record in records {
                        self.receive_complete(record.uid, record.payload);
                    }
                    synced += 1;
                }
                Err(_) => {
                    self.logger.warn(&format!("fallo sincronizando con {peer}"), "REPLICATED_KV");
                }
            }
        }
        if synced > self.majority_threshold() {
            *self.connected.write().unwrap() = true;
        }
    }

    fn fetch_log_bundle(&self, peer: ServiceAddress, since: Uid, initial: bool) -> Result<Vec<LogRecord>, ()> {
        let cmd = Command::InternalFetchLogBundle { uid: since, initial };
        match self.transport.call(peer, Role::Manager, cmd) {
            Ok(Ok(wire::ReplyValue::KvLogEntries(entries))) => {
                Ok(entries.into_iter().map(|e| LogRecord { uid: e.uid, payload: e.payload.into() }).collect())
            }
            Ok(Ok(_)) => Err(()),
            _ => Err(()),
        }
    }

    /// Implementacion local de `internalFetchLogBundle`: busca el balde
    /// relevante, y devuelve hasta `LOG_BUNDLE_SIZE` registros a partir de
    /// `uid`, retrocediendo `LOG_REWIND` posiciones si `initial`.
    pub fn local_log_bundle(&self, uid: Uid, initial: bool) -> Vec<(Uid, Payload)> {
        let state = self.state.read().unwrap();
        let bucket = uid.hi() / BUCKET_DIVISOR;
        let records = match state.buckets.get(&bucket) {
            Some(records) => records,
            None => return Vec::new(),
        };
        let pos = records.iter().position(|r| r.uid >= uid).unwrap_or(records.len());
        let start = if initial { pos.saturating_sub(LOG_REWIND) } else { pos };
        records
            .iter()
            .skip(start)
            .take(LOG_BUNDLE_SIZE)
            .map(|r| (r.uid, r.payload.clone()))
            .collect()
    }

    /// Igual que `local_log_bundle`, pero empaquetado como lo espera el
    /// lado de red de `internalFetchLogBundle`.
    pub fn local_kv_bundle_entries(&self, uid: Uid, initial: bool) -> Vec<KvBundleEntry> {
        self.local_log_bundle(uid, initial)
            .into_iter()
            .map(|(uid, payload)| KvBundleEntry { uid, payload: payload.into() })
            .collect()
    }
}

fn propose_command(uid: Uid, payload: &Payload) -> Command {
    match payload {
        Payload::KeyValue { key, value } => {
            Command::InternalKvProposal { uid, key: key.clone(), value: value.clone() }
        }
        Payload::BlockServers { block_id, servers } => {
            Command::InternalBsProposal { uid, block_id: *block_id, servers: servers.clone() }
        }
    }
}

fn complete_command(uid: Uid, payload: &Payload) -> Command {
    match payload {
        Payload::KeyValue { key, value } => {
            Command::InternalKvComplete { uid, key: key.clone(), value: value.clone() }
        }
        Payload::BlockServers { block_id, servers } => {
            Command::InternalBsComplete { uid, block_id: *block_id, servers: servers.clone() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use wire::{FakeTransport, ReplyValue};

    fn addr(n: u8) -> ServiceAddress {
        ServiceAddress::from(Ipv4Addr::new(127, 0, 0, n))
    }

    fn single_node_kv() -> Arc<ReplicatedKv> {
        let transport = Arc::new(FakeTransport::new());
        let logger = Arc::new(Logger::null());
        let tracker = StatusTracker::new(transport.clone(), logger.clone());
        ReplicatedKv::new(addr(1), transport, tracker, logger)
    }

    #[test]
    fn test01_set_and_get_value_single_node() {
        let kv = single_node_kv();
        kv.set_value("foo", "bar").unwrap();
        assert_eq!(kv.get_value("foo"), Some("bar".to_string()));
    }

    #[test]
    fn test02_get_all_keys_by_prefix() {
        let kv = single_node_kv();
        kv.set_value("path/a", "1").unwrap();
        kv.set_value("path/b", "2").unwrap();
        kv.set_value("other", "3").unwrap();
        let mut keys = kv.get_all_keys("path/");
        keys.sort();
        assert_eq!(keys, vec!["path/a".to_string(), "path/b".to_string()]);
    }

    #[test]
    fn test03_block_id_server_map_roundtrip() {
        let kv = single_node_kv();
        let block_id = BlockId::new(42);
        kv.set_block_id_server_map(block_id, vec![1, 2, 3]).unwrap();
        assert_eq!(kv.get_block_id_server_map(block_id), Some(vec![1, 2, 3]));
        assert_eq!(kv.get_last_block_id(), Some(block_id));
    }

    #[test]
    fn test04_majority_unavailable_when_peer_down_and_only_two_nodes() {
        let transport = Arc::new(FakeTransport::new());
        let logger = Arc::new(Logger::null());
        let tracker = StatusTracker::new(transport.clone(), logger.clone());
        let kv = ReplicatedKv::new(addr(1), transport, tracker.clone(), logger);
        kv.add_machine(addr(2));
        tracker.watch(addr(2), Role::Manager);
        tracker.report_client_failure(addr(2), Role::Manager);
        let result = kv.set_value("foo", "bar");
        assert_eq!(result.unwrap_err(), KvError::MajorityUnavailable);
    }

    #[test]
    fn test05_majority_succeeds_with_responsive_peer() {
        let transport = Arc::new(FakeTransport::new());
        transport.register(addr(2), Role::Manager, |_| Ok(ReplyValue::Ack));
        let logger = Arc::new(Logger::null());
        let tracker = StatusTracker::new(transport.clone(), logger.clone());
        let kv = ReplicatedKv::new(addr(1), transport, tracker, logger);
        kv.add_machine(addr(2));
        let result = kv.set_value("foo", "bar");
        assert!(result.is_ok());
        assert_eq!(kv.get_value("foo"), Some("bar".to_string()));
    }

    #[test]
    fn test06_has_applied_uid_is_idempotent() {
        let kv = single_node_kv();
        let uid = Uid::generate();
        kv.receive_complete(uid, Payload::KeyValue { key: "a".into(), value: "1".into() });
        assert!(kv.has_applied_uid(&uid));
        kv.receive_complete(uid, Payload::KeyValue { key: "a".into(), value: "2".into() });
        assert_eq!(kv.get_value("a"), Some("1".to_string()));
    }

    #[test]
    fn test08_initialize_replays_peer_log_bundle_and_connects() {
        let transport = Arc::new(FakeTransport::new());
        let logger = Arc::new(Logger::null());
        let tracker = StatusTracker::new(transport.clone(), logger.clone());
        let peer_kv = ReplicatedKv::new(addr(2), transport.clone(), tracker.clone(), logger.clone());
        peer_kv.set_value("k1", "v1").unwrap();
        peer_kv.set_value("k2", "v2").unwrap();

        transport.register(addr(2), Role::Manager, move |cmd| match cmd {
            Command::InternalFetchLogBundle { uid, initial } => {
                Ok(ReplyValue::KvLogEntries(peer_kv.local_kv_bundle_entries(uid, initial)))
            }
            _ => Ok(ReplyValue::Ack),
        });

        let kv = ReplicatedKv::new(addr(1), transport, tracker, logger);
        kv.add_machine(addr(2));
        kv.initialize();

        assert!(kv.is_connected());
        assert_eq!(kv.get_value("k1"), Some("v1".to_string()));
        assert_eq!(kv.get_value("k2"), Some("v2".to_string()));
    }

    #[test]
    fn test07_local_log_bundle_rewinds_on_initial() {
        let kv = single_node_kv();
        let mut uids = Vec::new();
        for i in 0..20u64 {
            let uid = Uid::new(i, 0);
            kv.receive_complete(uid, Payload::KeyValue { key: format!("k{i}"), value: "v".into() });
            uids.push(uid);
        }
        let bundle = kv.local_log_bundle(uids[18], true);
        assert!(bundle.len() >= LOG_REWIND.min(19));
    }
}
