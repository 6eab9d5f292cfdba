//! El trait `Transport` abstrae el envio de un `Command` a un servidor
//! remoto. La implementacion real (framing TCP, reconexion, colas de
//! reintento) vive en `core::messaging`; este crate solo define el
//! contrato y una doble de prueba en memoria.
use crate::command::Command;
use crate::fault::TransportFault;
use crate::reply::Reply;
use crate::role::Role;
use addressing::ServiceAddress;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Transport: Send + Sync {
    fn call(&self, addr: ServiceAddress, role: Role, cmd: Command) -> Result<Reply, TransportFault>;
}

type Handler = Box<dyn Fn(Command) -> Reply + Send + Sync>;

/// Transporte en memoria usado por las pruebas de extremo a extremo:
/// enruta cada llamada directamente al handler registrado para
/// `(addr, role)`, sin pasar por sockets.
#[derive(Default)]
pub struct FakeTransport {
    handlers: Mutex<HashMap<(ServiceAddress, Role), Handler>>,
    down: Mutex<std::collections::HashSet<(ServiceAddress, Role)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            down: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn register<F>(&self, addr: ServiceAddress, role: Role, handler: F)
    where
        F: Fn(Command) -> Reply + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().insert((addr, role), Box::new(handler));
    }

    /// Marca un destino como caido: las llamadas subsiguientes devuelven
    /// `ConnectionRefused` hasta que se llame `bring_up`.
    pub fn take_down(&self, addr: ServiceAddress, role: Role) {
        self.down.lock().unwrap().insert((addr, role));
    }

    pub fn bring_up(&self, addr: ServiceAddress, role: Role) {
        self.down.lock().unwrap().remove(&(addr, role));
    }
}

impl Transport for FakeTransport {
    fn call(&self, addr: ServiceAddress, role: Role, cmd: Command) -> Result<Reply, TransportFault> {
        if self.down.lock().unwrap().contains(&(addr, role)) {
            return Err(TransportFault::ConnectionRefused);
        }
        let handlers = self.handlers.lock().unwrap();
        match handlers.get(&(addr, role)) {
            Some(handler) => Ok(handler(cmd)),
            None => Err(TransportFault::ServiceNotConnected),
        }
    }
}
