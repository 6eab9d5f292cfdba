//! Este modulo implementa NodeReference: el identificador de 128 bits
//! que la capa de arbol usa para referenciar un nodo, ya sea uno
//! alojado en un bloque, un placeholder de hoja vacia, o un nodo
//! en memoria aun no asignado.
use crate::data_address::DataAddress;
use std::sync::atomic::{AtomicU64, Ordering};

/// Referencia a un nodo del arbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeReference {
    /// Nodo ya asignado y persistido en un bloque.
    Allocated(DataAddress),
    /// Placeholder de hoja vacia: no ocupa espacio en disco.
    SpecialSparse { node_type: u8, length: u32 },
    /// Nodo residente en memoria, todavia no asignado a un bloque.
    /// El id es unico por ClientTreeSystem, no globalmente.
    InMemory(u64),
}

impl NodeReference {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, NodeReference::InMemory(_))
    }

    pub fn is_special_sparse(&self) -> bool {
        matches!(self, NodeReference::SpecialSparse { .. })
    }

    pub fn as_allocated(&self) -> Option<DataAddress> {
        match self {
            NodeReference::Allocated(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// Generador de ids de nodos en memoria, unico por sistema de arbol
/// de cliente.
#[derive(Debug, Default)]
pub struct InMemoryIdGenerator {
    next: AtomicU64,
}

impl InMemoryIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_ref(&self) -> NodeReference {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        NodeReference::InMemory(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_id::BlockId;

    #[test]
    fn test01_in_memory_ids_are_unique_and_increasing() {
        let gen = InMemoryIdGenerator::new();
        let a = gen.next_ref();
        let b = gen.next_ref();
        assert_ne!(a, b);
        assert!(a.is_in_memory());
    }

    #[test]
    fn test02_allocated_roundtrip() {
        let addr = DataAddress::from(BlockId::new(1), 0).unwrap();
        let node_ref = NodeReference::Allocated(addr);
        assert_eq!(node_ref.as_allocated(), Some(addr));
    }

    #[test]
    fn test03_special_sparse_is_not_allocated() {
        let node_ref = NodeReference::SpecialSparse {
            node_type: 0,
            length: 0,
        };
        assert!(node_ref.is_special_sparse());
        assert_eq!(node_ref.as_allocated(), None);
    }
}
