//! Resultados tipados de cada comando, y el contenedor `Reply` que un
//! manejador remoto devuelve.
use crate::command::ServerGuid;
use crate::fault::RemoteFault;
use addressing::{BlockId, DataAddress, NodeReference, PathInfo, Uid};

/// Carga util de una entrada del log replicado de KV, tal como viaja
/// por la red (espejo de `treemesh_core::replicated_kv::Payload`, que
/// no puede cruzar hacia este crate sin crear una dependencia circular).
#[derive(Debug, Clone, PartialEq)]
pub enum KvBundlePayload {
    KeyValue { key: String, value: String },
    BlockServers { block_id: BlockId, servers: Vec<ServerGuid> },
}

/// Una entrada del log replicado de KV devuelta por
/// `internalFetchLogBundle`.
#[derive(Debug, Clone, PartialEq)]
pub struct KvBundleEntry {
    pub uid: Uid,
    pub payload: KvBundlePayload,
}

/// Lista de guids de servidor asociados a un bloque, tal como la
/// devuelve el manager ante `GetServerList`.
pub type ServerGuidList = Vec<ServerGuid>;

/// Un bloque de bytes leido de un block server, junto con el offset en
/// que empieza dentro del nodo pedido.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReadResult {
    pub bytes: Vec<u8>,
}

/// Una entrada del log de un path: (uid, referencia de raiz).
#[derive(Debug, Clone, PartialEq)]
pub struct PathLogEntry {
    pub uid: Uid,
    pub root: DataAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyValue {
    Ack,
    Pong,
    Guid(ServerGuid),
    Uid(Uid),
    BlockId(BlockId),
    NodeRef(NodeReference),
    ServerList(ServerGuidList),
    PathInfo(PathInfo),
    Paths(Vec<String>),
    Block(BlockReadResult),
    LogEntries(Vec<PathLogEntry>),
    KvLogEntries(Vec<KvBundleEntry>),
    Stats(String),
    Snapshot(DataAddress),
    Empty,
}

pub type Reply = Result<ReplyValue, RemoteFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_reply_is_plain_result() {
        let ok: Reply = Ok(ReplyValue::Pong);
        let err: Reply = Err(RemoteFault::MajorityUnavailable);
        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
