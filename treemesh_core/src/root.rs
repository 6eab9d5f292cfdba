//! RootCore: custodia el log de versiones de cada path servido por este
//! proceso, publica nuevas raices via la funcion de consenso, y
//! sincroniza el log con los demas replicas del path.
use crate::consensus::{ConsensusProcessor, ConsensusRegistry};
use crate::status::StatusTracker;
use addressing::{BlockId, DataAddress, PathInfo, ServiceAddress, Uid};
use logger::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use wire::{Command, ReplyValue, Role, Transport};

const DEDUP_SCAN_WINDOW: usize = 256;
const BUNDLE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Created,
    Initializing,
    Synchronized,
    NotAvailable,
}

#[derive(Debug)]
pub enum RootError {
    InvalidPathInfo { expected_version: u32 },
    NotLeader,
    CommitRejected(String),
    NotSynchronized,
}

impl std::fmt::Display for RootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootError::InvalidPathInfo { expected_version } => {
                write!(f, "invalid path info, expected version {expected_version}")
            }
            RootError::NotLeader => write!(f, "not the root leader for this path"),
            RootError::CommitRejected(reason) => write!(f, "commit rejected: {reason}"),
            RootError::NotSynchronized => write!(f, "path not synchronized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogEntry {
    uid: Uid,
    root: DataAddress,
}

/// Estado de un path servido localmente.
struct PathAccess {
    path_info: PathInfo,
    log: Vec<LogEntry>,
    pending_proposals: Vec<LogEntry>,
    state: PathState,
    consensus: Box<dyn ConsensusProcessor>,
}

impl PathAccess {
    fn last_root(&self) -> Option<DataAddress> {
        self.log.last().map(|e| e.root)
    }

    /// Busca `uid` en las ultimas `DEDUP_SCAN_WINDOW` entradas antes de
    /// apendear, para no duplicar una notificacion ya aplicada.
    fn append_if_absent(&mut self, uid: Uid, root: DataAddress) -> bool {
        let tail_start = self.log.len().saturating_sub(DEDUP_SCAN_WINDOW);
        if self.log[tail_start..].iter().any(|e| e.uid == uid) {
            return false;
        }
        self.log.push(LogEntry { uid, root });
        true
    }
}

pub struct RootCore {
    self_addr: ServiceAddress,
    paths: RwLock<HashMap<String, Mutex<PathAccess>>>,
    registry: ConsensusRegistry,
    transport: Arc<dyn Transport>,
    tracker: Arc<StatusTracker>,
    logger: Arc<Logger>,
}

impl RootCore {
    pub fn new(self_addr: ServiceAddress, transport: Arc<dyn Transport>, tracker: Arc<StatusTracker>, logger: Arc<Logger>) -> Self {
        Self {
            self_addr,
            paths: RwLock::new(HashMap::new()),
            registry: ConsensusRegistry::default(),
            transport,
            tracker,
            logger,
        }
    }

    /// Da de alta un path servido localmente, en estado `Created`, y
    /// dispara `load_path_info` para iniciar la sincronizacion.
    pub fn initialize_path(&self, path_info: PathInfo) {
        let consensus = self
            .registry
            .get(path_info.consensus_fn_name())
            .unwrap_or_else(|| self.registry.get("echo").expect("echo siempre registrada"));
        let path_name = path_info.path_name().to_string();
        let access = PathAccess {
            path_info,
            log: Vec::new(),
            pending_proposals: Vec::new(),
            state: PathState::Created,
            consensus,
        };
        self.paths.write().unwrap().insert(path_name.clone(), Mutex::new(access));
        self.load_path_info(&path_name);
    }

    pub fn path_state(&self, path: &str) -> Option<PathState> {
        let paths = self.paths.read().unwrap();
        paths.get(path).map(|access| access.lock().unwrap().state)
    }

    pub fn get_path_now(&self, path: &str, path_info_version: u32) -> Result<Option<DataAddress>, RootError> {
        let paths = self.paths.read().unwrap();
        let access = paths.get(path).ok_or(RootError::NotSynchronized)?.lock().unwrap();
        if access.path_info.version() != path_info_version {
            return Err(RootError::InvalidPathInfo { expected_version: access.path_info.version() });
        }
        if access.state != PathState::Synchronized {
            return Err(RootError::NotSynchronized);
        }
        Ok(access.last_root())
    }

    /// Solo el lider acepta. Rechaza con InvalidPathInfo si la version
    /// no coincide con la actual.
    pub fn commit(&self, path: &str, path_info_version: u32, proposal: DataAddress) -> Result<DataAddress, RootError> {
        let paths = self.paths.read().unwrap();
        let mut access = paths.get(path).ok_or(RootError::NotSynchronized)?.lock().unwrap();

        if access.path_info.version() != path_info_version {
            return Err(RootError::InvalidPathInfo { expected_version: access.path_info.version() });
        }
        if access.path_info.root_leader() != self.self_addr {
            return Err(RootError::NotLeader);
        }

        let current_root = access.last_root();
        let new_root = access
            .consensus
            .commit(current_root, proposal)
            .map_err(|e| RootError::CommitRejected(e.0))?;

        let uid = Uid::generate();
        access.append_if_absent(uid, new_root);
        let replicas = access.path_info.root_servers().to_vec();
        let path_owned = path.to_string();
        drop(access);
        drop(paths);

        for replica in replicas {
            if replica == self.self_addr {
                continue;
            }
            let cmd = Command::NotifyNewProposal { path: path_owned.clone(), uid, root: new_root };
            let _ = self.transport.call(replica, Role::Root, cmd);
        }

        Ok(new_root)
    }

    /// Recibe `notifyNewProposal`: si el path esta sincronizado, apendea
    /// de inmediato (con dedup); si no, encola para el replay posterior.
    pub fn notify_new_proposal(&self, path: &str, uid: Uid, root: DataAddress) {
        let paths = self.paths.read().unwrap();
        let mut access = match paths.get(path) {
            Some(access) => access.lock().unwrap(),
            None => return,
        };
        if access.state == PathState::Synchronized {
            access.append_if_absent(uid, root);
        } else {
            access.pending_proposals.push(LogEntry { uid, root });
        }
    }

    /// Procedimiento de sincronizacion de `loadPathInfo`: para cada
    /// replica UP, pide repetidamente `fetch_path_data_bundle` a partir
    /// del ultimo `(uid, addr)` propio hasta agotar el log remoto, y
    /// cuenta cuantas replicas (incluyendose) terminaron sin error. Si
    /// esa cuenta supera la mitad, reproduce las propuestas encoladas y
    /// marca el path Synchronized.
    pub fn load_path_info(&self, path: &str) {
        let paths = self.paths.read().unwrap();
        let mut access = match paths.get(path) {
            Some(access) => access.lock().unwrap(),
            None => return,
        };
        access.state = PathState::Initializing;

        let replicas = access.path_info.root_servers().to_vec();
        let others: Vec<ServiceAddress> = replicas.iter().filter(|a| **a != self.self_addr).copied().collect();

        let mut since_uid = access.log.last().map(|e| e.uid).unwrap_or(Uid::new(0, 0));
        let mut since_addr = access.log.last().map(|e| e.root).unwrap_or_else(|| DataAddress::from(BlockId::zero(), 0).unwrap());

        let mut synced_count = 1; // self siempre cuenta
        for peer in &others {
            if !self.tracker.state_of(*peer, Role::Root).is_up() {
                continue;
            }
            if self.pull_path_data_bundle(&mut access, *peer, path, &mut since_uid, &mut since_addr) {
                synced_count += 1;
            }
        }

        for proposal in std::mem::take(&mut access.pending_proposals) {
            access.append_if_absent(proposal.uid, proposal.root);
        }

        if synced_count > replicas.len() / 2 {
            access.state = PathState::Synchronized;
            self.logger.info(&format!("path {path} sincronizado"), "ROOT");
        } else {
            access.state = PathState::NotAvailable;
        }
    }

    /// Trae y aplica lotes de `peer` hasta que devuelve menos de
    /// `BUNDLE_SIZE` entradas (fin del log remoto). Devuelve `false` si
    /// la llamada fallo o la respuesta no fue la esperada, sin reintentar.
    fn pull_path_data_bundle(
        &self,
        access: &mut PathAccess,
        peer: ServiceAddress,
        path: &str,
        since_uid: &mut Uid,
        since_addr: &mut DataAddress,
    ) -> bool {
        loop {
            let cmd = Command::InternalFetchPathDataBundle {
                path: path.to_string(),
                since_uid: *since_uid,
                since_addr: *since_addr,
                bundle_size: BUNDLE_SIZE as u32,
            };
            match self.transport.call(peer, Role::Root, cmd) {
                Ok(Ok(ReplyValue::LogEntries(entries))) => {
                    let got = entries.len();
                    for entry in &entries {
                        access.append_if_absent(entry.uid, entry.root);
                        *since_uid = entry.uid;
                        *since_addr = entry.root;
                    }
                    if got < BUNDLE_SIZE {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Ante la caida de un peer root, recalcula si el path sigue con
    /// mayoria; si no, pasa a NotAvailable y se reencola para sync.
    pub fn on_peer_down(&self, path: &str) {
        let paths = self.paths.read().unwrap();
        let access = match paths.get(path) {
            Some(access) => access.lock().unwrap(),
            None => return,
        };
        let replicas = access.path_info.root_servers().to_vec();
        let others: Vec<ServiceAddress> = replicas.iter().filter(|a| **a != self.self_addr).copied().collect();
        let up_count = 1 + others.iter().filter(|a| self.tracker.state_of(**a, Role::Root).is_up()).count();
        drop(access);
        if up_count <= replicas.len() / 2 {
            self.load_path_info(path);
        }
    }

    /// Busqueda aproximada por rango de tiempo: devuelve la raiz vigente
    /// en algun instante dentro de `[t0_ms, t1_ms]`, tomando la ultima
    /// entrada del log cuyo timestamp no supere `t1_ms`. Es aproximada
    /// porque el log no indexa por tiempo, solo por orden de llegada.
    pub fn get_path_historical(
        &self,
        path: &str,
        path_info_version: u32,
        t0_ms: u64,
        t1_ms: u64,
    ) -> Result<Option<DataAddress>, RootError> {
        let paths = self.paths.read().unwrap();
        let access = paths.get(path).ok_or(RootError::NotSynchronized)?.lock().unwrap();
        if access.path_info.version() != path_info_version {
            return Err(RootError::InvalidPathInfo { expected_version: access.path_info.version() });
        }
        if access.state != PathState::Synchronized {
            return Err(RootError::NotSynchronized);
        }
        let in_range = access.log.iter().filter(|e| e.uid.timestamp_ms() >= t0_ms && e.uid.timestamp_ms() <= t1_ms).next_back();
        Ok(in_range.map(|e| e.root))
    }

    /// Implementacion local de `fetch_path_data_bundle`: busca binaria
    /// por `(uid, addr)` dentro del log, y devuelve hasta `bundle_size`
    /// registros siguientes (con fallback lineal si no hay match exacto).
    pub fn fetch_path_data_bundle(&self, path: &str, since_uid: Uid, bundle_size: usize) -> Vec<(Uid, DataAddress)> {
        let paths = self.paths.read().unwrap();
        let access = match paths.get(path) {
            Some(access) => access.lock().unwrap(),
            None => return Vec::new(),
        };
        let start = access.log.partition_point(|e| e.uid < since_uid);
        access
            .log
            .iter()
            .skip(start)
            .take(bundle_size.min(BUNDLE_SIZE))
            .map(|e| (e.uid, e.root))
            .collect()
    }
}
