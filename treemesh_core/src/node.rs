//! Formato binario de los nodos del arbol: hoja y rama, con CRC32
//! cubriendo todo menos la cabecera de tipo/crc. Los hijos de una rama
//! son referencias de nodo tipadas (no palabras u64 opacas), seguidas
//! de las claves separadoras entre ellos.
use addressing::{BlockId, DataAddress, NodeReference};

const LEAF_TYPE: u16 = 0x019E0;
const BRANCH_TYPE: u16 = 0x022E0;
pub const BRANCH_FANOUT_CAP: usize = 14;
pub const LEAF_PAYLOAD_CAP: usize = 6134;
const DATA_ID_BITS: u32 = 14;
const CHILD_WORD_BYTES: usize = 24;

/// Clave separadora sentinela que marca el extremo superior del
/// espacio de claves; es la unica separadora de la base de datos vacia.
pub const TAIL_KEY: &[u8] = &[0xFF; 8];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf { payload: Vec<u8> },
    Branch { children: Vec<NodeReference>, keys: Vec<Vec<u8>> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum NodeError {
    LeafTooLarge,
    BranchTooWide,
    UnknownType(u16),
    UnknownChildTag(u64),
    InvalidChildRef,
    CrcMismatch,
    Truncated,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::LeafTooLarge => write!(f, "leaf payload exceeds capacity"),
            NodeError::BranchTooWide => write!(f, "branch exceeds fanout cap"),
            NodeError::UnknownType(t) => write!(f, "unknown node type {t:#06x}"),
            NodeError::UnknownChildTag(t) => write!(f, "unknown child ref tag {t}"),
            NodeError::InvalidChildRef => write!(f, "invalid child data address"),
            NodeError::CrcMismatch => write!(f, "crc mismatch"),
            NodeError::Truncated => write!(f, "node bytes truncated"),
        }
    }
}

impl Node {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NodeError> {
        match self {
            Node::Leaf { payload } => {
                if payload.len() > LEAF_PAYLOAD_CAP {
                    return Err(NodeError::LeafTooLarge);
                }
                let mut body = Vec::with_capacity(4 + payload.len());
                body.extend((payload.len() as u32).to_be_bytes());
                body.extend(payload);
                Ok(frame(LEAF_TYPE, &body))
            }
            Node::Branch { children, keys } => {
                if children.len() > BRANCH_FANOUT_CAP {
                    return Err(NodeError::BranchTooWide);
                }
                let mut body = Vec::with_capacity(4 + children.len() * CHILD_WORD_BYTES);
                body.extend((children.len() as u32).to_be_bytes());
                for child in children {
                    let (tag, hi, lo) = encode_ref(child);
                    body.extend(tag.to_be_bytes());
                    body.extend(hi.to_be_bytes());
                    body.extend(lo.to_be_bytes());
                }
                body.extend((keys.len() as u32).to_be_bytes());
                for key in keys {
                    body.extend((key.len() as u32).to_be_bytes());
                    body.extend(key);
                }
                Ok(frame(BRANCH_TYPE, &body))
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() < 12 {
            return Err(NodeError::Truncated);
        }
        let node_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let crc = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if crc32c::crc32c(&bytes[8..]) != crc {
            return Err(NodeError::CrcMismatch);
        }
        let count = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let rest = &bytes[12..];
        match node_type {
            t if t == LEAF_TYPE => {
                if rest.len() < count {
                    return Err(NodeError::Truncated);
                }
                Ok(Node::Leaf { payload: rest[..count].to_vec() })
            }
            t if t == BRANCH_TYPE => {
                let children_bytes = count.checked_mul(CHILD_WORD_BYTES).ok_or(NodeError::Truncated)?;
                if rest.len() < children_bytes + 4 {
                    return Err(NodeError::Truncated);
                }
                let mut children = Vec::with_capacity(count);
                for i in 0..count {
                    let base = i * CHILD_WORD_BYTES;
                    let tag = u64::from_be_bytes(rest[base..base + 8].try_into().unwrap());
                    let hi = u64::from_be_bytes(rest[base + 8..base + 16].try_into().unwrap());
                    let lo = u64::from_be_bytes(rest[base + 16..base + 24].try_into().unwrap());
                    children.push(decode_ref(tag, hi, lo)?);
                }
                if children.len() > BRANCH_FANOUT_CAP {
                    return Err(NodeError::BranchTooWide);
                }

                let mut offset = children_bytes;
                if rest.len() < offset + 4 {
                    return Err(NodeError::Truncated);
                }
                let key_count = u32::from_be_bytes(rest[offset..offset + 4].try_into().unwrap()) as usize;
                offset += 4;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    if rest.len() < offset + 4 {
                        return Err(NodeError::Truncated);
                    }
                    let key_len = u32::from_be_bytes(rest[offset..offset + 4].try_into().unwrap()) as usize;
                    offset += 4;
                    if rest.len() < offset + key_len {
                        return Err(NodeError::Truncated);
                    }
                    keys.push(rest[offset..offset + key_len].to_vec());
                    offset += key_len;
                }
                Ok(Node::Branch { children, keys })
            }
            other => Err(NodeError::UnknownType(other)),
        }
    }

    pub fn empty_leaf() -> Self {
        Node::Leaf { payload: Vec::new() }
    }
}

/// Empaqueta una `NodeReference` en `(tag, hi, lo)`: 0=Allocated (valor
/// de 124 bits partido en dos u64), 1=SpecialSparse (node_type, length),
/// 2=InMemory (id).
fn encode_ref(r: &NodeReference) -> (u64, u64, u64) {
    match r {
        NodeReference::Allocated(addr) => {
            let value = addr.value();
            (0, (value >> 64) as u64, value as u64)
        }
        NodeReference::SpecialSparse { node_type, length } => (1, *node_type as u64, *length as u64),
        NodeReference::InMemory(id) => (2, 0, *id),
    }
}

fn decode_ref(tag: u64, hi: u64, lo: u64) -> Result<NodeReference, NodeError> {
    match tag {
        0 => {
            let value = ((hi as u128) << 64) | lo as u128;
            let block_id = BlockId::new(value).clear_low_bits(DATA_ID_BITS);
            let data_id = (value & ((1u128 << DATA_ID_BITS) - 1)) as u16;
            DataAddress::from(block_id, data_id).map(NodeReference::Allocated).map_err(|_| NodeError::InvalidChildRef)
        }
        1 => Ok(NodeReference::SpecialSparse { node_type: hi as u8, length: lo as u32 }),
        2 => Ok(NodeReference::InMemory(lo)),
        other => Err(NodeError::UnknownChildTag(other)),
    }
}

fn frame(node_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend(node_type.to_be_bytes());
    out.extend(0u16.to_be_bytes());
    let crc = crc32c::crc32c(body);
    out.extend(crc.to_be_bytes());
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse(node_type: u8) -> NodeReference {
        NodeReference::SpecialSparse { node_type, length: 0 }
    }

    #[test]
    fn test01_leaf_roundtrip() {
        let node = Node::Leaf { payload: vec![1, 2, 3, 4] };
        let bytes = node.to_bytes().unwrap();
        assert_eq!(Node::from_bytes(&bytes).unwrap(), node);
    }

    #[test]
    fn test02_branch_roundtrip_with_mixed_child_kinds() {
        let addr = DataAddress::from(BlockId::new(257), 3).unwrap();
        let node = Node::Branch {
            children: vec![sparse(0), NodeReference::Allocated(addr), NodeReference::InMemory(9)],
            keys: vec![b"a".to_vec(), TAIL_KEY.to_vec()],
        };
        let bytes = node.to_bytes().unwrap();
        assert_eq!(Node::from_bytes(&bytes).unwrap(), node);
    }

    #[test]
    fn test03_corrupted_crc_detected() {
        let node = Node::Leaf { payload: vec![9, 9, 9] };
        let mut bytes = node.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(Node::from_bytes(&bytes).unwrap_err(), NodeError::CrcMismatch);
    }

    #[test]
    fn test04_leaf_over_capacity_rejected() {
        let node = Node::Leaf { payload: vec![0; LEAF_PAYLOAD_CAP + 1] };
        assert_eq!(node.to_bytes().unwrap_err(), NodeError::LeafTooLarge);
    }

    #[test]
    fn test05_branch_over_fanout_rejected() {
        let node = Node::Branch { children: vec![sparse(0); BRANCH_FANOUT_CAP + 1], keys: Vec::new() };
        assert_eq!(node.to_bytes().unwrap_err(), NodeError::BranchTooWide);
    }

    #[test]
    fn test06_type_tags_match_spec_constants() {
        assert_eq!(LEAF_TYPE, 0x019E0);
        assert_eq!(BRANCH_TYPE, 0x022E0);
    }
}
