//! MessageQueue / Communicator: entrega best-effort de comandos con
//! cola de reintento por destino, drenada cuando el StatusTracker
//! reporta la vuelta a UP de un servicio.
use crate::status::{ServiceState, StatusTracker};
use addressing::ServiceAddress;
use common::thread_pool::ThreadPool;
use logger::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;
use wire::{Command, Role, Transport};

const REPLAY_DELAY_MS: u64 = 500;
const REPLAY_POOL_SIZE: usize = 4;

type PendingBatch = Vec<(Role, Command)>;

/// Comunicador con cola de reintento: una llamada que falla por una
/// falla de conexion se encola para ese destino en lugar de perderse;
/// cuando el tracker ve ese destino volver a UP, se dispara un trabajo
/// en el `ThreadPool` de reintento que reintenta el lote completo.
pub struct Communicator {
    transport: Arc<dyn Transport>,
    logger: Arc<Logger>,
    queues: Mutex<HashMap<ServiceAddress, PendingBatch>>,
    replay_pool: ThreadPool,
}

impl Communicator {
    pub fn new(transport: Arc<dyn Transport>, logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            logger,
            queues: Mutex::new(HashMap::new()),
            replay_pool: ThreadPool::new(REPLAY_POOL_SIZE),
        })
    }

    /// Intenta enviar `cmd` a `(addr, role)`. Si la falla es de conexion,
    /// el mensaje se encola para reintento posterior y se devuelve el
    /// error igualmente al llamador (best-effort: no bloquea al emisor).
    pub fn send(&self, addr: ServiceAddress, role: Role, cmd: Command) -> wire::Reply {
        match self.transport.call(addr, role, cmd.clone()) {
            Ok(reply) => reply,
            Err(fault) => {
                if fault.is_connection_fault() {
                    self.enqueue(addr, role, cmd);
                }
                Err(wire::RemoteFault::Other(fault.to_string()))
            }
        }
    }

    fn enqueue(&self, addr: ServiceAddress, role: Role, cmd: Command) {
        self.queues.lock().unwrap().entry(addr).or_default().push((role, cmd));
    }

    /// Registra en el tracker un listener que, ante una transicion a UP,
    /// dispara el drenado diferido de la cola de ese destino.
    pub fn attach_to_tracker(self: &Arc<Self>, tracker: &Arc<StatusTracker>) {
        let communicator = Arc::clone(self);
        tracker.add_listener(Box::new(move |addr, _role, state| {
            if state == ServiceState::Up {
                communicator.schedule_replay(addr);
            }
        }));
    }

    fn schedule_replay(self: &Arc<Self>, addr: ServiceAddress) {
        let communicator = Arc::clone(self);
        let submitted = self.replay_pool.execute(move || {
            sleep(Duration::from_millis(REPLAY_DELAY_MS));
            communicator.drain(addr);
        });
        if submitted.is_err() {
            self.logger.warn(&format!("no se pudo programar el replay para {addr}"), "MESSAGING");
        }
    }

    fn drain(&self, addr: ServiceAddress) {
        let batch = match self.queues.lock().unwrap().remove(&addr) {
            Some(batch) if !batch.is_empty() => batch,
            _ => return,
        };
        let mut still_pending = Vec::new();
        for (role, cmd) in batch {
            match self.transport.call(addr, role, cmd.clone()) {
                Ok(_) => {}
                Err(fault) if fault.is_connection_fault() => still_pending.push((role, cmd)),
                Err(_) => {}
            }
        }
        if !still_pending.is_empty() {
            self.logger.warn(
                &format!("{} mensajes siguen pendientes para {addr}", still_pending.len()),
                "MESSAGING",
            );
            self.queues.lock().unwrap().entry(addr).or_default().extend(still_pending);
        }
    }

    pub fn pending_count(&self, addr: ServiceAddress) -> usize {
        self.queues.lock().unwrap().get(&addr).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use wire::{FakeTransport, ReplyValue};

    fn addr(n: u8) -> ServiceAddress {
        ServiceAddress::from(Ipv4Addr::new(127, 0, 0, n))
    }

    #[test]
    fn test01_connection_fault_enqueues_message() {
        let transport = Arc::new(FakeTransport::new());
        let communicator = Communicator::new(transport, Arc::new(Logger::null()));
        let result = communicator.send(addr(1), Role::Manager, Command::GetUniqueId);
        assert!(result.is_err());
        assert_eq!(communicator.pending_count(addr(1)), 1);
    }

    #[test]
    fn test02_successful_send_does_not_enqueue() {
        let transport = Arc::new(FakeTransport::new());
        transport.register(addr(1), Role::Manager, |_| Ok(ReplyValue::Pong));
        let communicator = Communicator::new(transport, Arc::new(Logger::null()));
        let result = communicator.send(addr(1), Role::Manager, Command::GetUniqueId);
        assert!(result.is_ok());
        assert_eq!(communicator.pending_count(addr(1)), 0);
    }

    #[test]
    fn test03_drain_resends_and_clears_on_success() {
        let transport = Arc::new(FakeTransport::new());
        let communicator = Communicator::new(Arc::clone(&transport) as Arc<dyn Transport>, Arc::new(Logger::null()));
        let _ = communicator.send(addr(2), Role::Root, Command::GetUniqueId);
        assert_eq!(communicator.pending_count(addr(2)), 1);
        transport.register(addr(2), Role::Root, |_| Ok(ReplyValue::Pong));
        communicator.drain(addr(2));
        assert_eq!(communicator.pending_count(addr(2)), 0);
    }
}
