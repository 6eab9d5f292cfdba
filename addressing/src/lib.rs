//! Este modulo contiene los tipos de direccionamiento compartidos por
//! manager, root, block y client: `BlockId`, `DataAddress`,
//! `NodeReference`, `ServiceAddress`, `Uid` y `PathInfo`.

pub mod block_id;
pub mod data_address;
pub mod node_reference;
pub mod path_info;
pub mod service_address;
pub mod uid;

pub use block_id::BlockId;
pub use data_address::DataAddress;
pub use node_reference::NodeReference;
pub use path_info::PathInfo;
pub use service_address::ServiceAddress;
pub use uid::Uid;
