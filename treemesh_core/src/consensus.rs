//! ConsensusProcessor: logica de fusion por path, invocada por el root
//! leader al commitear una propuesta. La implementacion real de cada
//! funcion de consenso es un colaborador externo (fuera de alcance);
//! este modulo solo define el trait y un registro estatico por nombre,
//! reemplazando la carga dinamica de clases de la fuente original.
use addressing::DataAddress;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, PartialEq, Eq)]
pub struct CommitRejected(pub String);

pub trait ConsensusProcessor: Send + Sync {
    /// Resuelve la propuesta contra la raiz actual del path y devuelve
    /// la nueva raiz, o rechaza el commit.
    fn commit(&self, current_root: Option<DataAddress>, proposal: DataAddress) -> Result<DataAddress, CommitRejected>;
}

/// Funcion de consenso trivial: la propuesta del cliente siempre se
/// acepta como nueva raiz. Util para pruebas de extremo a extremo y
/// como placeholder hasta que un colaborador externo registre la
/// funcion real con este mismo nombre.
pub struct EchoConsensus;

impl ConsensusProcessor for EchoConsensus {
    fn commit(&self, _current_root: Option<DataAddress>, proposal: DataAddress) -> Result<DataAddress, CommitRejected> {
        Ok(proposal)
    }
}

pub struct ConsensusRegistry {
    factories: RwLock<HashMap<String, fn() -> Box<dyn ConsensusProcessor>>>,
}

impl Default for ConsensusRegistry {
    fn default() -> Self {
        let mut registry = Self { factories: RwLock::new(HashMap::new()) };
        registry.register("echo", || Box::new(EchoConsensus));
        registry
    }
}

impl ConsensusRegistry {
    pub fn register(&mut self, name: &str, factory: fn() -> Box<dyn ConsensusProcessor>) {
        self.factories.write().unwrap().insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Box<dyn ConsensusProcessor>> {
        self.factories.read().unwrap().get(name).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_echo_consensus_accepts_proposal_verbatim() {
        let registry = ConsensusRegistry::default();
        let processor = registry.get("echo").unwrap();
        let proposal = DataAddress::from(addressing::BlockId::new(1), 0).unwrap();
        assert_eq!(processor.commit(None, proposal).unwrap(), proposal);
    }

    #[test]
    fn test02_unknown_function_name_returns_none() {
        let registry = ConsensusRegistry::default();
        assert!(registry.get("nonexistent").is_none());
    }
}
