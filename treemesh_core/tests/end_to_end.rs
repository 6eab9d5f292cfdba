//! Pruebas de extremo a extremo que atraviesan varios modulos de core
//! via FakeTransport, tal como lo haria una red real de manager/root/
//! block servers.
use addressing::{BlockId, DataAddress, NodeReference, PathInfo, ServiceAddress};
use treemesh_core::{ClientTreeSystem, ManagerCore, Node, PathState, ReplicatedKv, RootCore, RootError, StatusTracker};
use logger::Logger;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use wire::{Command, FakeTransport, Reply, ReplyValue, Role, Transport};

fn addr(n: u8) -> ServiceAddress {
    ServiceAddress::from(Ipv4Addr::new(127, 0, 0, n))
}

/// Registra en `transport` un block server en memoria que atiende
/// ServerGuid/WriteToBlock/ReadFromBlock/RollbackNodes contra un store
/// compartido.
fn register_fake_block_server(transport: &FakeTransport, server: ServiceAddress, guid: u64) {
    let store: Arc<Mutex<std::collections::HashMap<DataAddress, Vec<u8>>>> = Arc::new(Mutex::new(std::collections::HashMap::new()));
    transport.register(server, Role::Block, move |cmd| -> Reply {
        match cmd {
            Command::ServerGuid => Ok(ReplyValue::Guid(guid)),
            Command::WriteToBlock { addr, bytes, .. } => {
                store.lock().unwrap().insert(addr, bytes);
                Ok(ReplyValue::Ack)
            }
            Command::ReadFromBlock { addr } => match store.lock().unwrap().get(&addr) {
                Some(bytes) => Ok(ReplyValue::Block(wire::reply::BlockReadResult { bytes: bytes.clone() })),
                None => Err(wire::RemoteFault::NotFound("block not found".to_string())),
            },
            Command::RollbackNodes { addrs } => {
                let mut guard = store.lock().unwrap();
                for addr in addrs {
                    guard.remove(&addr);
                }
                Ok(ReplyValue::Ack)
            }
            _ => Ok(ReplyValue::Ack),
        }
    });
}

/// Escenario 1 del spec: base vacia -> commit -> lectura de la raiz.
#[test]
fn scenario01_empty_db_commit_read_back() {
    let transport = Arc::new(FakeTransport::new());
    let logger = Arc::new(Logger::null());
    let tracker = StatusTracker::new(transport.clone(), logger.clone());

    let block_server = addr(10);
    register_fake_block_server(&transport, block_server, 1);

    let kv = ReplicatedKv::new(addr(1), transport.clone() as Arc<dyn Transport>, tracker.clone(), logger.clone());
    let manager = Arc::new(ManagerCore::new(kv, tracker.clone(), transport.clone() as Arc<dyn Transport>, logger.clone(), 1));
    manager.register_block_server(block_server).unwrap();

    let root_leader = addr(20);
    let root = Arc::new(RootCore::new(root_leader, transport.clone() as Arc<dyn Transport>, tracker.clone(), logger.clone()));
    let path_info = PathInfo::new("p".to_string(), "echo".to_string(), 1, root_leader, vec![root_leader]).unwrap();
    root.initialize_path(path_info.clone());
    assert_eq!(root.path_state("p"), Some(PathState::Synchronized));
    manager.add_path(path_info.clone());

    // El lider de root debe aceptar el commit para este path.
    transport.register(root_leader, Role::Root, {
        let root = root.clone();
        move |cmd| match cmd {
            Command::Commit { path, path_info_version, proposal } => {
                match root.commit(&path, path_info_version, proposal) {
                    Ok(addr) => Ok(ReplyValue::Snapshot(addr)),
                    Err(RootError::InvalidPathInfo { expected_version }) => {
                        Err(wire::RemoteFault::InvalidPathInfo { expected_version })
                    }
                    Err(_) => Err(wire::RemoteFault::Other("commit failed".to_string())),
                }
            }
            _ => Ok(ReplyValue::Ack),
        }
    });

    let client = ClientTreeSystem::new(manager.clone(), transport.clone() as Arc<dyn Transport>, tracker.clone(), logger.clone());

    let empty = ClientTreeSystem::empty_database();
    let ref_map = client.perform_tree_write(vec![empty.clone()]).unwrap();
    let a0 = ref_map[&empty.id];
    match &client.fetch_nodes(&[NodeReference::Allocated(a0)]).unwrap()[0] {
        Node::Branch { children, .. } => assert_eq!(children.len(), 2),
        other => panic!("expected branch, got {other:?}"),
    }

    let a1 = client.perform_commit("p", a0).unwrap();
    assert_eq!(a1, a0);
    assert_eq!(root.get_path_now("p", path_info.version()).unwrap(), Some(a1));
}

/// Escenario 4 del spec: con solo un manager UP de tres, setValue falla
/// por falta de mayoria; al recuperar uno de los otros dos, reintenta y
/// tiene exito.
#[test]
fn scenario04_replicated_kv_majority_loss_then_recovery() {
    let transport = Arc::new(FakeTransport::new());
    let logger = Arc::new(Logger::null());
    let tracker = StatusTracker::new(transport.clone(), logger.clone());

    let m1 = addr(1);
    let m2 = addr(2);
    let m3 = addr(3);
    let kv = ReplicatedKv::new(m1, transport.clone() as Arc<dyn Transport>, tracker.clone(), logger.clone());
    kv.add_machine(m2);
    kv.add_machine(m3);

    // m2 y m3 no estan registrados en el transporte => ServiceNotConnected.
    let result = kv.set_value("k", "v");
    assert!(result.is_err());
    assert!(kv.get_value("k").is_none());

    // m2 vuelve: registrar su manejador de Complete/Propose.
    let applied = Arc::new(Mutex::new(Vec::new()));
    let applied_clone = applied.clone();
    transport.register(m2, Role::Manager, move |cmd| -> Reply {
        match cmd {
            Command::InternalKvProposal { .. } => Ok(ReplyValue::Ack),
            Command::InternalKvComplete { uid, .. } => {
                applied_clone.lock().unwrap().push(uid);
                Ok(ReplyValue::Ack)
            }
            _ => Ok(ReplyValue::Ack),
        }
    });

    let result = kv.set_value("k", "v");
    assert!(result.is_ok());
    assert_eq!(kv.get_value("k"), Some("v".to_string()));
    assert_eq!(applied.lock().unwrap().len(), 1);
}

/// Escenario 5 del spec: version de PathInfo desactualizada es
/// rechazada; tras refrescar a la version nueva, el commit tiene exito.
#[test]
fn scenario05_path_info_version_bump_rejects_stale_then_succeeds() {
    let transport = Arc::new(FakeTransport::new());
    let logger = Arc::new(Logger::null());
    let tracker = StatusTracker::new(transport.clone(), logger.clone());
    let root_leader = addr(1);
    let root = RootCore::new(root_leader, transport.clone() as Arc<dyn Transport>, tracker.clone(), logger.clone());

    let path_info_v2 = PathInfo::new("p".to_string(), "echo".to_string(), 2, root_leader, vec![root_leader]).unwrap();
    root.initialize_path(path_info_v2);

    let proposal = DataAddress::from(BlockId::new(1), 0).unwrap();
    let stale_result = root.commit("p", 1, proposal);
    assert!(matches!(stale_result, Err(RootError::InvalidPathInfo { expected_version: 2 })));

    let fresh = root.commit("p", 2, proposal).unwrap();
    assert_eq!(fresh, proposal);
}
