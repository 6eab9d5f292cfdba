//! ManagerCore: registro de servidores, asignacion de rangos de
//! direcciones (allocator) y seleccion de replicas para bloques nuevos.
use crate::replicated_kv::ReplicatedKv;
use crate::status::StatusTracker;
use addressing::{BlockId, DataAddress, PathInfo, ServiceAddress};
use logger::Logger;
use rand::rng;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use wire::{Command, ReplyValue, Role, Transport};

pub const DATA_IDS_PER_BLOCK: u32 = 16384;
const BLOCK_ADVANCE: u128 = 1024;
const BLOCK_ALIGN_BITS: u32 = 8;
const MAX_MANAGER_UNIQUE_ID: u32 = 200;
const DEFAULT_REPLICA_COUNT: usize = 3;
const BLOCK_NOTIFIER_PERIOD_MS: i64 = 5 * 60 * 1000;
const BLOCK_NOTIFIER_JITTER_MS: i64 = 30 * 1000;
const BLOCK_NOTIFIER_FIRST_RUN_MIN_MS: u64 = 15_000;
const BLOCK_NOTIFIER_FIRST_RUN_MAX_MS: u64 = 23_000;

#[derive(Debug)]
pub enum ManagerError {
    NoBlockServersAvailable,
    ServerGuidRpcFailed,
    Kv(crate::replicated_kv::KvError),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::NoBlockServersAvailable => write!(f, "no block servers available"),
            ManagerError::ServerGuidRpcFailed => write!(f, "failed to fetch server guid from block server"),
            ManagerError::Kv(e) => write!(f, "{e}"),
        }
    }
}

impl From<crate::replicated_kv::KvError> for ManagerError {
    fn from(e: crate::replicated_kv::KvError) -> Self {
        ManagerError::Kv(e)
    }
}

struct AllocationState {
    current_block_id: Option<BlockId>,
    next_data_id: u16,
    current_block_id_servers: Vec<u64>,
}

pub struct ManagerCore {
    kv: Arc<ReplicatedKv>,
    tracker: Arc<StatusTracker>,
    transport: Arc<dyn Transport>,
    logger: Arc<Logger>,
    manager_unique_id: u32,
    block_servers: RwLock<HashMap<u64, ServiceAddress>>,
    root_servers: RwLock<Vec<ServiceAddress>>,
    manager_servers: RwLock<Vec<ServiceAddress>>,
    paths: RwLock<HashMap<String, PathInfo>>,
    allocation: Mutex<AllocationState>,
    notifier_cursor: Mutex<u64>,
    notifier_running: Arc<AtomicBool>,
}

impl ManagerCore {
    pub fn new(kv: Arc<ReplicatedKv>, tracker: Arc<StatusTracker>, transport: Arc<dyn Transport>, logger: Arc<Logger>, manager_unique_id: u32) -> Self {
        Self {
            kv,
            tracker,
            transport,
            logger,
            manager_unique_id: manager_unique_id.min(MAX_MANAGER_UNIQUE_ID),
            block_servers: RwLock::new(HashMap::new()),
            root_servers: RwLock::new(Vec::new()),
            manager_servers: RwLock::new(Vec::new()),
            paths: RwLock::new(HashMap::new()),
            allocation: Mutex::new(AllocationState {
                current_block_id: None,
                next_data_id: 0,
                current_block_id_servers: Vec::new(),
            }),
            notifier_cursor: Mutex::new(0),
            notifier_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pide al propio block server su guid (el manager no los inventa
    /// localmente), lo registra, y espeja ambos sentidos
    /// guid <-> direccion en el KV replicado para que cualquier otro
    /// manager pueda traducir un guid que no registro el mismo.
    pub fn register_block_server(&self, addr: ServiceAddress) -> Result<u64, ManagerError> {
        let guid = match self.transport.call(addr, Role::Block, Command::ServerGuid) {
            Ok(Ok(ReplyValue::Guid(guid))) => guid,
            _ => return Err(ManagerError::ServerGuidRpcFailed),
        };
        self.block_servers.write().unwrap().insert(guid, addr);
        self.tracker.watch(addr, Role::Block);
        self.kv.set_value(&format!("block.sguid.{guid}"), &addr.to_string())?;
        self.kv.set_value(&format!("block.addr.{addr}"), &guid.to_string())?;
        Ok(guid)
    }

    /// Traduce un guid a direccion: primero contra el registro local,
    /// y si no esta (lo registro otro manager) contra el KV replicado.
    pub fn resolve_guid(&self, guid: u64) -> Option<ServiceAddress> {
        if let Some(addr) = self.block_servers.read().unwrap().get(&guid).copied() {
            return Some(addr);
        }
        self.kv
            .get_value(&format!("block.sguid.{guid}"))
            .and_then(|s| ServiceAddress::from_str(&s).ok())
    }

    /// Da de alta la informacion de un path servido por la red, para
    /// que `perform_commit` pueda resolver su lider sin redondear por
    /// los root servers.
    pub fn add_path(&self, info: PathInfo) {
        self.paths.write().unwrap().insert(info.path_name().to_string(), info);
    }

    pub fn get_path_info(&self, path: &str) -> Option<PathInfo> {
        self.paths.read().unwrap().get(path).cloned()
    }

    pub fn deregister_block_server(&self, guid: u64) {
        self.block_servers.write().unwrap().remove(&guid);
        self.check_and_fix_allocation_servers();
    }

    pub fn deregister_all_block_servers(&self) {
        self.block_servers.write().unwrap().clear();
    }

    pub fn register_root_server(&self, addr: ServiceAddress) {
        let mut roots = self.root_servers.write().unwrap();
        if !roots.contains(&addr) {
            roots.push(addr);
        }
        self.tracker.watch(addr, Role::Root);
    }

    pub fn deregister_root_server(&self, addr: ServiceAddress) {
        self.root_servers.write().unwrap().retain(|a| *a != addr);
    }

    pub fn deregister_all_root_servers(&self) {
        self.root_servers.write().unwrap().clear();
    }

    pub fn register_manager_servers(&self, addrs: Vec<ServiceAddress>) {
        let mut managers = self.manager_servers.write().unwrap();
        for addr in addrs {
            if !managers.contains(&addr) {
                managers.push(addr);
            }
        }
    }

    pub fn deregister_manager_server(&self, addr: ServiceAddress) {
        self.manager_servers.write().unwrap().retain(|a| *a != addr);
    }

    pub fn get_server_list(&self, block_id: BlockId) -> Vec<(ServiceAddress, bool)> {
        let guids = self.kv.get_block_id_server_map(block_id).unwrap_or_default();
        guids
            .into_iter()
            .filter_map(|guid| self.resolve_guid(guid))
            .map(|addr| (addr, self.tracker.state_of(addr, Role::Block).is_up()))
            .collect()
    }

    /// Selecciona replicas entre los block servers actualmente UP: si
    /// hay <= 3, todas; si no, 3 al azar sin reemplazo.
    fn select_replicas(&self) -> Vec<u64> {
        let registry = self.block_servers.read().unwrap();
        let up_guids: Vec<u64> = registry
            .iter()
            .filter(|(_, addr)| self.tracker.state_of(**addr, Role::Block).is_up())
            .map(|(guid, _)| *guid)
            .collect();
        if up_guids.len() <= DEFAULT_REPLICA_COUNT {
            return up_guids;
        }
        let mut generator = rng();
        up_guids.into_iter().choose_multiple(&mut generator, DEFAULT_REPLICA_COUNT)
    }

    fn allocate_new_block(&self, block_id: BlockId) -> Result<Vec<u64>, ManagerError> {
        let replicas = self.select_replicas();
        if replicas.is_empty() {
            return Err(ManagerError::NoBlockServersAvailable);
        }
        self.kv.set_block_id_server_map(block_id, replicas.clone())?;
        Ok(replicas)
    }

    /// Asigna `(block_id, data_id)` para un nodo nuevo de `size` bytes
    /// (el tamano en si no afecta la asignacion: cada nodo ocupa un solo
    /// `data_id`, la capacidad del nodo la gestiona la capa de bloque).
    pub fn allocate_node(&self, _size: u16) -> Result<DataAddress, ManagerError> {
        let mut allocation = self.allocation.lock().unwrap();
        if allocation.current_block_id.is_none() {
            let seed = match self.kv.get_last_block_id() {
                Some(last) => last
                    .add(BLOCK_ADVANCE as u64)
                    .clear_low_bits(BLOCK_ALIGN_BITS)
                    .with_low_bits(256 + self.manager_unique_id as u128, BLOCK_ALIGN_BITS),
                None => BlockId::zero().with_low_bits(256 + self.manager_unique_id as u128, BLOCK_ALIGN_BITS),
            };
            allocation.current_block_id_servers = self.allocate_new_block(seed)?;
            allocation.current_block_id = Some(seed);
            allocation.next_data_id = 0;
        }

        let block_id = allocation.current_block_id.unwrap();
        let data_id = allocation.next_data_id;
        let addr = DataAddress::from(block_id, data_id).expect("data_id siempre < 16384 por construccion");

        if data_id as u32 + 1 >= DATA_IDS_PER_BLOCK {
            let next_block = block_id.add(256).clear_low_bits(BLOCK_ALIGN_BITS);
            allocation.current_block_id_servers = self.allocate_new_block(next_block)?;
            self.notify_current_block_sealed(&allocation.current_block_id_servers, block_id);
            allocation.current_block_id = Some(next_block);
            allocation.next_data_id = 0;
        } else {
            allocation.next_data_id = data_id + 1;
        }

        Ok(addr)
    }

    fn notify_current_block_sealed(&self, _servers: &[u64], _sealed_block: BlockId) {
        self.logger.info("bloque sellado, nuevos servidores pre-asignados", "MANAGER");
    }

    /// Lanza el hilo de fondo que cada ~5 min +/- 30 s (primer disparo a
    /// los 15-23 s) elige un block server por turno y le informa el
    /// `current_block_id` vigente, para que pueda compactar o sellar
    /// bloques viejos.
    pub fn start_block_notifier(self: &Arc<Self>) {
        if self.notifier_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let running = Arc::clone(&self.notifier_running);
        thread::spawn(move || {
            let first_run = rng().random_range(BLOCK_NOTIFIER_FIRST_RUN_MIN_MS..=BLOCK_NOTIFIER_FIRST_RUN_MAX_MS);
            thread::sleep(Duration::from_millis(first_run));
            while running.load(Ordering::SeqCst) {
                manager.notify_next_block_server();
                let jitter = rng().random_range(-BLOCK_NOTIFIER_JITTER_MS..=BLOCK_NOTIFIER_JITTER_MS);
                let delay = (BLOCK_NOTIFIER_PERIOD_MS + jitter).max(0) as u64;
                thread::sleep(Duration::from_millis(delay));
            }
        });
    }

    pub fn stop_block_notifier(&self) {
        self.notifier_running.store(false, Ordering::SeqCst);
    }

    fn notify_next_block_server(&self) {
        let current_block_id = match self.allocation.lock().unwrap().current_block_id {
            Some(id) => id,
            None => return,
        };
        let registry = self.block_servers.read().unwrap();
        if registry.is_empty() {
            return;
        }
        let mut guids: Vec<u64> = registry.keys().copied().collect();
        guids.sort_unstable();
        let mut cursor = self.notifier_cursor.lock().unwrap();
        let idx = (*cursor as usize) % guids.len();
        *cursor += 1;
        let guid = guids[idx];
        let addr = registry[&guid];
        drop(registry);
        let cmd = Command::NotifyCurrentBlockId { block_id: current_block_id };
        if self.transport.call(addr, Role::Block, cmd).is_err() {
            self.logger.warn(&format!("notifyCurrentBlockId fallo contra {addr}"), "MANAGER");
        }
    }

    /// Reconsulta el mapeo block_id -> servidores; si menos replicas
    /// estan UP que el conteo almacenado, avanza el allocator.
    pub fn check_and_fix_allocation_servers(&self) {
        let mut allocation = self.allocation.lock().unwrap();
        let current_block = match allocation.current_block_id {
            Some(id) => id,
            None => return,
        };
        let stored = self.kv.get_block_id_server_map(current_block).unwrap_or_default();
        let registry = self.block_servers.read().unwrap();
        let up_count = stored
            .iter()
            .filter_map(|guid| registry.get(guid))
            .filter(|addr| self.tracker.state_of(**addr, Role::Block).is_up())
            .count();
        if up_count < stored.len() {
            let next_block = current_block.add(256).clear_low_bits(BLOCK_ALIGN_BITS);
            if let Ok(replicas) = self.allocate_new_block(next_block) {
                allocation.current_block_id_servers = replicas;
                allocation.current_block_id = Some(next_block);
                allocation.next_data_id = 0;
            }
        }
    }
}
