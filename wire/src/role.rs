//! Este modulo define los roles de servidor reconocidos por el
//! protocolo: manager, root y block.
use crate::protocol_trait::{DeserializeWire, SerializeWire};
use std::fmt;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Block,
    Root,
    Manager,
}

impl Role {
    /// Tag de heartbeat usado por el poller del StatusTracker
    /// (`heartbeatB`/`heartbeatR`/`heartbeatM`).
    pub fn heartbeat_tag(&self) -> &'static str {
        match self {
            Role::Block => "heartbeatB",
            Role::Root => "heartbeatR",
            Role::Manager => "heartbeatM",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Block => write!(f, "block"),
            Role::Root => write!(f, "root"),
            Role::Manager => write!(f, "manager"),
        }
    }
}

impl SerializeWire for Role {
    fn serialize(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl DeserializeWire for Role {
    fn deserialize<T: Read>(stream: &mut T) -> std::io::Result<Self> {
        let byte = crate::protocol_trait::read_exact::<1, T>(stream)?[0];
        match byte {
            0 => Ok(Role::Block),
            1 => Ok(Role::Root),
            2 => Ok(Role::Manager),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "rol desconocido",
            )),
        }
    }
}
