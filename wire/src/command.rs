//! Este modulo enumera los comandos conocidos del protocolo de control
//! (manager / root / block), con sus argumentos tipados.
use addressing::{BlockId, DataAddress, PathInfo, ServiceAddress, Uid};

/// Un servidor remoto, identificado por un guid numerico local al
/// manager (ver ManagerCore::register_block_server).
pub type ServerGuid = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // -- comun a todos los roles --
    Poll { tag: String },

    // -- manager --
    GetServerList { block_id: BlockId },
    AllocateNode { size: u16 },
    RegisterBlockServer { addr: ServiceAddress },
    DeregisterBlockServer { addr: ServiceAddress },
    DeregisterAllBlockServers,
    RegisterRootServer { addr: ServiceAddress },
    DeregisterRootServer { addr: ServiceAddress },
    DeregisterAllRootServers,
    RegisterManagerServers { addrs: Vec<ServiceAddress> },
    DeregisterManagerServer { addr: ServiceAddress },
    AddPathToNetwork {
        path: String,
        consensus_fn: String,
        leader: ServiceAddress,
        replicas: Vec<ServiceAddress>,
    },
    RemovePathFromNetwork { path: String },
    GetPathInfoForPath { path: String },
    GetAllPaths,
    GetUniqueId,
    InternalKvProposal { uid: Uid, key: String, value: String },
    InternalKvComplete { uid: Uid, key: String, value: String },
    InternalBsProposal { uid: Uid, block_id: BlockId, servers: Vec<ServerGuid> },
    InternalBsComplete { uid: Uid, block_id: BlockId, servers: Vec<ServerGuid> },
    InternalFetchLogBundle { uid: Uid, initial: bool },
    NotifyBlockServerFailure { addr: ServiceAddress },
    NotifyBlockIdCorruption { block_id: BlockId, server: ServiceAddress },

    // -- root --
    PublishPath { path: String, path_info_version: u32, proposal: DataAddress },
    GetPathNow { path: String, path_info_version: u32 },
    GetPathHistorical { path: String, path_info_version: u32, t0_ms: u64, t1_ms: u64 },
    Commit { path: String, path_info_version: u32, proposal: DataAddress },
    GetConsensusProcessor { path: String },
    Initialize { path: String },
    GetPathStats { path: String },
    GetSnapshotStats { path: String, addr: DataAddress },
    LoadPathInfo { path: String },
    NotifyNewProposal { path: String, uid: Uid, root: DataAddress },
    InternalSetPathInfo { path_info: PathInfo },
    InternalFetchPathDataBundle {
        path: String,
        since_uid: Uid,
        since_addr: DataAddress,
        bundle_size: u32,
    },
    InformOfManagers { addrs: Vec<ServiceAddress> },
    ClearOfManagers,

    // -- block --
    ReadFromBlock { addr: DataAddress },
    WriteToBlock { addr: DataAddress, bytes: Vec<u8>, offset: u32, len: u32 },
    RollbackNodes { addrs: Vec<DataAddress> },
    ServerGuid,
    NotifyCurrentBlockId { block_id: BlockId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_poll_tag_roundtrips_through_debug() {
        let cmd = Command::Poll { tag: "heartbeatM".into() };
        let printed = format!("{cmd:?}");
        assert!(printed.contains("heartbeatM"));
    }
}
