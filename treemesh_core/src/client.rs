//! ClientTreeSystem: lee y escribe nodos del arbol, con cache de
//! directorio y de nodos, reintento de escritura con rollback, el
//! pipeline de asignacion/reescritura de un lote de nodos en memoria,
//! y el commit de una nueva raiz contra el lider de un path.
use crate::manager::ManagerCore;
use crate::node::{Node, TAIL_KEY};
use crate::status::StatusTracker;
use addressing::{BlockId, DataAddress, NodeReference, PathInfo, ServiceAddress};
use logger::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use wire::{Command, ReplyValue, RemoteFault, Role, Transport};

const MAX_WRITE_RETRIES: u32 = 3;
const DIRECTORY_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const DOWN_REPORT_THROTTLE: Duration = Duration::from_secs(30);
const CORRUPTION_REPORT_THROTTLE: Duration = Duration::from_secs(10);
const DEFAULT_NODE_ALLOC_SIZE: u16 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FailureKind {
    Down,
    Corruption,
}

#[derive(Debug)]
pub enum ClientError {
    NoReplicasAvailable,
    WriteFailed,
    WriteFailedRollbackFailed,
    NotFound,
    AllocationFailed,
    CommitFailed(String),
    CriticalStop(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NoReplicasAvailable => write!(f, "no block servers available"),
            ClientError::WriteFailed => write!(f, "write failed"),
            ClientError::WriteFailedRollbackFailed => write!(f, "write failed (rollback failed)"),
            ClientError::NotFound => write!(f, "node not found"),
            ClientError::AllocationFailed => write!(f, "node allocation failed"),
            ClientError::CommitFailed(msg) => write!(f, "commit failed: {msg}"),
            ClientError::CriticalStop(msg) => write!(f, "{msg}"),
        }
    }
}

struct DirectoryEntry {
    replicas: Vec<ServiceAddress>,
    fetched_at: Instant,
}

/// Un nodo todavia no asignado a un bloque, identificado por su
/// referencia en memoria hasta que `perform_tree_write` le asigna una
/// `DataAddress` real.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNode {
    pub id: NodeReference,
    pub node: Node,
}

pub struct ClientTreeSystem {
    manager: Arc<ManagerCore>,
    transport: Arc<dyn Transport>,
    tracker: Arc<StatusTracker>,
    logger: Arc<Logger>,
    node_cache: RwLock<HashMap<DataAddress, Node>>,
    directory_cache: Mutex<HashMap<BlockId, DirectoryEntry>>,
    critical_stop: RwLock<Option<String>>,
    last_reported: Mutex<HashMap<(ServiceAddress, FailureKind), Instant>>,
    path_info_cache: Mutex<HashMap<String, PathInfo>>,
}

impl ClientTreeSystem {
    pub fn new(manager: Arc<ManagerCore>, transport: Arc<dyn Transport>, tracker: Arc<StatusTracker>, logger: Arc<Logger>) -> Self {
        Self {
            manager,
            transport,
            tracker,
            logger,
            node_cache: RwLock::new(HashMap::new()),
            directory_cache: Mutex::new(HashMap::new()),
            critical_stop: RwLock::new(None),
            last_reported: Mutex::new(HashMap::new()),
            path_info_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Un reporte de falla (DOWN o corrupcion) por (servidor, tipo) se
    /// deja pasar como maximo una vez por ventana de throttle.
    fn should_report(&self, replica: ServiceAddress, kind: FailureKind) -> bool {
        let window = match kind {
            FailureKind::Down => DOWN_REPORT_THROTTLE,
            FailureKind::Corruption => CORRUPTION_REPORT_THROTTLE,
        };
        let mut last_reported = self.last_reported.lock().unwrap();
        let now = Instant::now();
        match last_reported.get(&(replica, kind)) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                last_reported.insert((replica, kind), now);
                true
            }
        }
    }

    fn check_critical_stop(&self) -> Result<(), ClientError> {
        match self.critical_stop.read().unwrap().clone() {
            Some(reason) => Err(ClientError::CriticalStop(reason)),
            None => Ok(()),
        }
    }

    fn latch_critical_stop(&self, reason: String) {
        let mut stop = self.critical_stop.write().unwrap();
        if stop.is_none() {
            *stop = Some(reason);
        }
    }

    fn resolve_replicas(&self, block_id: BlockId) -> Vec<ServiceAddress> {
        {
            let cache = self.directory_cache.lock().unwrap();
            if let Some(entry) = cache.get(&block_id) {
                if entry.fetched_at.elapsed() < DIRECTORY_CACHE_TTL {
                    return entry.replicas.clone();
                }
            }
        }
        let replicas: Vec<ServiceAddress> =
            self.manager.get_server_list(block_id).into_iter().filter(|(_, up)| *up).map(|(addr, _)| addr).collect();
        self.directory_cache
            .lock()
            .unwrap()
            .insert(block_id, DirectoryEntry { replicas: replicas.clone(), fetched_at: Instant::now() });
        replicas
    }

    fn invalidate_directory(&self, block_id: BlockId) {
        self.directory_cache.lock().unwrap().remove(&block_id);
    }

    /// Lee un conjunto de referencias, resolviendolas contra el cache
    /// local, las especiales-sparse, y finalmente la red.
    pub fn fetch_nodes(&self, refs: &[NodeReference]) -> Result<Vec<Node>, ClientError> {
        self.check_critical_stop()?;
        let mut out = Vec::with_capacity(refs.len());
        for node_ref in refs {
            match node_ref {
                NodeReference::SpecialSparse { .. } => out.push(Node::empty_leaf()),
                NodeReference::InMemory(_) => out.push(Node::empty_leaf()),
                NodeReference::Allocated(addr) => out.push(self.fetch_allocated(*addr)?),
            }
        }
        Ok(out)
    }

    fn fetch_allocated(&self, addr: DataAddress) -> Result<Node, ClientError> {
        if let Some(node) = self.node_cache.read().unwrap().get(&addr) {
            return Ok(node.clone());
        }
        let block_id = addr.block_id();
        let mut replicas = self.resolve_replicas(block_id);
        if replicas.is_empty() {
            return Err(ClientError::NoReplicasAvailable);
        }

        while let Some(replica) = replicas.first().copied() {
            match self.transport.call(replica, Role::Block, Command::ReadFromBlock { addr }) {
                Ok(Ok(wire::ReplyValue::Block(result))) => match Node::from_bytes(&result.bytes) {
                    Ok(node) => {
                        self.node_cache.write().unwrap().insert(addr, node.clone());
                        return Ok(node);
                    }
                    Err(_) => {
                        self.report_corruption(replica, block_id);
                        replicas.remove(0);
                    }
                },
                Ok(_) => {
                    replicas.remove(0);
                }
                Err(fault) if fault.is_connection_fault() => {
                    if self.should_report(replica, FailureKind::Down) {
                        self.tracker.report_client_failure(replica, Role::Block);
                    }
                    self.invalidate_directory(block_id);
                    replicas.remove(0);
                }
                Err(_) => {
                    replicas.remove(0);
                }
            }
        }
        Err(ClientError::NoReplicasAvailable)
    }

    fn report_corruption(&self, replica: ServiceAddress, block_id: BlockId) {
        if !self.should_report(replica, FailureKind::Corruption) {
            return;
        }
        let cmd = Command::NotifyBlockIdCorruption { block_id, server: replica };
        let _ = self.transport.call(replica, Role::Manager, cmd);
    }

    /// Escribe una secuencia de nodos serializados en sus direcciones ya
    /// asignadas, con hasta `MAX_WRITE_RETRIES` reintentos y rollback de
    /// lo ya escrito ante una falla parcial.
    pub fn write_nodes(&self, nodes: &[(DataAddress, Node)]) -> Result<(), ClientError> {
        self.check_critical_stop()?;
        let mut try_count = MAX_WRITE_RETRIES;
        loop {
            match self.write_prepared(nodes) {
                Ok(()) => return Ok(()),
                Err(ClientError::WriteFailedRollbackFailed) => {
                    self.latch_critical_stop("write failed (rollback failed)".to_string());
                    return Err(ClientError::WriteFailedRollbackFailed);
                }
                Err(_) if try_count > 1 => {
                    try_count -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_prepared(&self, nodes: &[(DataAddress, Node)]) -> Result<(), ClientError> {
        let mut success_log: Vec<(ServiceAddress, DataAddress, Vec<u8>)> = Vec::new();

        for (addr, node) in nodes {
            let bytes = node.to_bytes().map_err(|_| ClientError::WriteFailed)?;
            let block_id = addr.block_id();
            let replicas = self.resolve_replicas(block_id);
            if replicas.is_empty() {
                return Err(ClientError::NoReplicasAvailable);
            }

            for replica in &replicas {
                let cmd = Command::WriteToBlock { addr: *addr, bytes: bytes.clone(), offset: 0, len: bytes.len() as u32 };
                match self.transport.call(*replica, Role::Block, cmd) {
                    Ok(Ok(_)) => success_log.push((*replica, *addr, bytes.clone())),
                    _ => {
                        self.tracker.report_client_failure(*replica, Role::Block);
                        self.invalidate_directory(block_id);
                        return self.rollback(success_log);
                    }
                }
            }
        }

        for (addr, node) in nodes {
            self.node_cache.write().unwrap().insert(*addr, node.clone());
        }
        Ok(())
    }

    fn rollback(&self, success_log: Vec<(ServiceAddress, DataAddress, Vec<u8>)>) -> Result<(), ClientError> {
        let mut by_replica: HashMap<ServiceAddress, Vec<DataAddress>> = HashMap::new();
        for (replica, addr, _) in &success_log {
            by_replica.entry(*replica).or_default().push(*addr);
        }
        for (replica, addrs) in by_replica {
            let cmd = Command::RollbackNodes { addrs };
            if self.transport.call(replica, Role::Block, cmd).is_err() {
                return Err(ClientError::WriteFailedRollbackFailed);
            }
        }
        Err(ClientError::WriteFailed)
    }

    /// Construye la base de datos vacia: una rama con dos hojas sparse
    /// separadas por la clave TAIL, sin direccion real asignada todavia.
    pub fn empty_database() -> PendingNode {
        let left = NodeReference::SpecialSparse { node_type: 0, length: 0 };
        let right = NodeReference::SpecialSparse { node_type: 0, length: 0 };
        PendingNode {
            id: NodeReference::InMemory(0),
            node: Node::Branch { children: vec![left, right], keys: vec![TAIL_KEY.to_vec()] },
        }
    }

    /// Escribe un lote de nodos en memoria: asigna una `DataAddress` a
    /// cada uno, reescribe las referencias hijas que apuntaban a otros
    /// nodos del mismo lote hacia su direccion recien asignada, y
    /// escribe el resultado. Si la escritura falla, reintenta desde el
    /// paso de asignacion (las direcciones viejas se descartan).
    pub fn perform_tree_write(&self, nodes: Vec<PendingNode>) -> Result<HashMap<NodeReference, DataAddress>, ClientError> {
        self.check_critical_stop()?;
        if nodes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut try_count = MAX_WRITE_RETRIES;
        loop {
            match self.try_tree_write_once(&nodes) {
                Ok(ref_map) => return Ok(ref_map),
                Err(ClientError::WriteFailedRollbackFailed) => {
                    self.latch_critical_stop("write failed (rollback failed)".to_string());
                    return Err(ClientError::WriteFailedRollbackFailed);
                }
                Err(_) if try_count > 1 => {
                    try_count -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_tree_write_once(&self, nodes: &[PendingNode]) -> Result<HashMap<NodeReference, DataAddress>, ClientError> {
        let mut ref_map: HashMap<NodeReference, DataAddress> = HashMap::new();
        for pending in nodes {
            let size = alloc_size_for(&pending.node);
            let addr = self.manager.allocate_node(size).map_err(|_| ClientError::AllocationFailed)?;
            ref_map.insert(pending.id, addr);
        }

        let prepared: Vec<(DataAddress, Node)> = nodes
            .iter()
            .map(|pending| {
                let addr = ref_map[&pending.id];
                let rewritten = rewrite_children(&pending.node, &ref_map);
                (addr, rewritten)
            })
            .collect();

        self.write_prepared(&prepared)?;
        Ok(ref_map)
    }

    fn resolve_path_info(&self, path: &str) -> Option<PathInfo> {
        if let Some(info) = self.path_info_cache.lock().unwrap().get(path).cloned() {
            return Some(info);
        }
        let info = self.manager.get_path_info(path)?;
        self.path_info_cache.lock().unwrap().insert(path.to_string(), info.clone());
        Some(info)
    }

    fn invalidate_path_info(&self, path: &str) {
        self.path_info_cache.lock().unwrap().remove(path);
    }

    /// Propone `proposal` como nueva raiz de `path` al lider de root,
    /// resolviendo el `PathInfo` vigente desde el manager (o su cache
    /// local). Si el lider rechaza por version desactualizada,
    /// invalida la cache y reintenta una sola vez con la version fresca.
    pub fn perform_commit(&self, path: &str, proposal: DataAddress) -> Result<DataAddress, ClientError> {
        self.check_critical_stop()?;
        let mut attempts_left = 2;
        loop {
            let info = self
                .resolve_path_info(path)
                .ok_or_else(|| ClientError::CommitFailed("path info not found".to_string()))?;
            let cmd = Command::Commit { path: path.to_string(), path_info_version: info.version(), proposal };
            match self.transport.call(info.root_leader(), Role::Root, cmd) {
                Ok(Ok(ReplyValue::Snapshot(addr))) => return Ok(addr),
                Ok(Err(RemoteFault::InvalidPathInfo { .. })) if attempts_left > 1 => {
                    self.invalidate_path_info(path);
                    attempts_left -= 1;
                }
                Ok(Err(fault)) => return Err(ClientError::CommitFailed(fault.to_string())),
                Err(fault) => return Err(ClientError::CommitFailed(fault.to_string())),
                Ok(Ok(_)) => return Err(ClientError::CommitFailed("unexpected reply".to_string())),
            }
        }
    }
}

fn alloc_size_for(node: &Node) -> u16 {
    match node {
        Node::Leaf { .. } => DEFAULT_NODE_ALLOC_SIZE,
        Node::Branch { .. } => 1024,
    }
}

/// Reescribe las referencias `InMemory` de un nodo hacia las
/// direcciones recien asignadas del mismo lote de escritura.
fn rewrite_children(node: &Node, ref_map: &HashMap<NodeReference, DataAddress>) -> Node {
    match node {
        Node::Leaf { .. } => node.clone(),
        Node::Branch { children, keys } => {
            let rewritten = children
                .iter()
                .map(|child| match child {
                    NodeReference::InMemory(_) => match ref_map.get(child) {
                        Some(addr) => NodeReference::Allocated(*addr),
                        None => *child,
                    },
                    other => *other,
                })
                .collect();
            Node::Branch { children: rewritten, keys: keys.clone() }
        }
    }
}
