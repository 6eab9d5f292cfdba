//! StatusTracker: mantiene el estado UP/DOWN de cada servicio conocido
//! (manager/root/block), sondeando en segundo plano y avisando a los
//! listeners registrados ante cualquier cambio.
use addressing::ServiceAddress;
use logger::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{sleep, spawn};
use std::time::Duration;
use wire::{Command, Role, Transport};

const POLL_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Up,
    DownClientReport,
    DownShutdown,
    DownHeartbeat,
}

impl ServiceState {
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceState::Up)
    }
}

pub type StatusListener = Box<dyn Fn(ServiceAddress, Role, ServiceState) + Send + Sync>;

/// Llave del mapa de estados: un servicio se identifica por su
/// direccion y su rol (un mismo proceso puede exponer mas de un rol).
type ServiceKey = (ServiceAddress, Role);

pub struct StatusTracker {
    transport: Arc<dyn Transport>,
    logger: Arc<Logger>,
    states: RwLock<HashMap<ServiceKey, ServiceState>>,
    listeners: RwLock<Vec<StatusListener>>,
    running: Arc<AtomicBool>,
}

impl StatusTracker {
    pub fn new(transport: Arc<dyn Transport>, logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            logger,
            states: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Un servicio ausente del mapa se considera implicitamente UP.
    pub fn state_of(&self, addr: ServiceAddress, role: Role) -> ServiceState {
        self.states
            .read()
            .unwrap()
            .get(&(addr, role))
            .copied()
            .unwrap_or(ServiceState::Up)
    }

    pub fn add_listener(&self, listener: StatusListener) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn watch(&self, addr: ServiceAddress, role: Role) {
        self.states
            .write()
            .unwrap()
            .entry((addr, role))
            .or_insert(ServiceState::Up);
    }

    pub fn report_client_failure(&self, addr: ServiceAddress, role: Role) {
        self.set_state(addr, role, ServiceState::DownClientReport);
    }

    pub fn report_shutdown(&self, addr: ServiceAddress, role: Role) {
        self.set_state(addr, role, ServiceState::DownShutdown);
    }

    fn set_state(&self, addr: ServiceAddress, role: Role, state: ServiceState) {
        let changed = {
            let mut states = self.states.write().unwrap();
            let previous = states.insert((addr, role), state);
            previous != Some(state)
        };
        if changed {
            self.logger.info(
                &format!("{addr} ({role}) -> {state:?}"),
                "STATUS",
            );
            for listener in self.listeners.read().unwrap().iter() {
                listener(addr, role, state);
            }
        }
        if state.is_up() {
            self.states.write().unwrap().remove(&(addr, role));
        }
    }

    /// Lanza el hilo de sondeo en segundo plano. Cada `POLL_INTERVAL_MS`
    /// recorre los servicios observados y les manda un `Poll`; si la
    /// llamada falla por una falla de conexion se marca el servicio
    /// como `DownHeartbeat`, si responde se restaura a UP.
    pub fn start_polling(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        spawn(move || {
            while tracker.running.load(Ordering::Relaxed) {
                sleep(Duration::from_millis(POLL_INTERVAL_MS));
                tracker.poll_once();
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Una caida por shutdown es definitiva hasta que el servicio vuelva
    /// a registrarse explicitamente: un sondeo de rutina nunca la
    /// resucita ni la reetiqueta.
    fn poll_once(&self) {
        let watched: Vec<ServiceKey> = self.states.read().unwrap().keys().copied().collect();
        for (addr, role) in watched {
            let prior = self.state_of(addr, role);
            let cmd = Command::Poll { tag: role.heartbeat_tag().to_string() };
            match self.transport.call(addr, role, cmd) {
                Ok(_) => {
                    if matches!(prior, ServiceState::DownClientReport | ServiceState::DownHeartbeat) {
                        self.set_state(addr, role, ServiceState::Up);
                    }
                }
                Err(fault) if fault.is_connection_fault() => {
                    if matches!(prior, ServiceState::Up | ServiceState::DownClientReport) {
                        self.set_state(addr, role, ServiceState::DownHeartbeat);
                    }
                }
                Err(_) => {}
            }
        }
    }
}
