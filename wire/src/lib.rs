pub mod command;
pub mod fault;
pub mod protocol_trait;
pub mod reply;
pub mod role;
pub mod transport;

pub use command::Command;
pub use fault::{RemoteFault, TransportFault};
pub use protocol_trait::{read_exact, DeserializeWire, SerializeWire};
pub use reply::{Reply, ReplyValue};
pub use role::Role;
pub use transport::{FakeTransport, Transport};
