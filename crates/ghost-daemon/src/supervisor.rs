//! Supervisor / command processor (C7): owns the per-process lifecycle state
//! machine and dispatches `ping|register|start|stop|restart|status`
//! commands arriving on the `commands` channel.
//!
//! Commands on distinct process ids run concurrently; commands on the same
//! id are serialized through a per-process `tokio::sync::Mutex` looked up in
//! a `DashMap`, the same per-key-lock shape the teacher used for its
//! in-flight message bookkeeping.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use ghost_bus::{Bus, Delivery};
use ghost_common::{Command, Payload, PeerStatus, Priority, ProcessInfo, Response, SystemEvent, SystemEventType};
use ghost_store::DataStore;

use crate::registry::PeerRegistry;

/// Graceful-stop wait before escalating to a forced kill (§4.7, §5 timeouts).
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Key under which registered `ProcessInfo` is persisted to the `DataStore`
/// (§6 "persisted state (supervisor, abstract)"), as a single JSON map of id
/// to `ProcessInfo`, so a supervisor restart can recover what it was
/// watching. A single key keeps the feature usable through the `get`/`set`
/// contract alone, with no dependency on the SQL-like `query`/`execute`
/// surface the core treats as unspecified.
const PROCESSES_KEY: &str = "process:registered";

pub struct Supervisor {
    bus: Arc<dyn Bus>,
    registry: Arc<PeerRegistry>,
    children: DashMap<String, Arc<Mutex<Child>>>,
    process_locks: DashMap<String, Arc<Mutex<()>>>,
    stop_grace_period: Duration,
    shutdown_tx: broadcast::Sender<()>,
    store: Option<Arc<dyn DataStore>>,
    self_weak: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<PeerRegistry>, stop_grace_period: Duration) -> Arc<Self> {
        Self::with_store(bus, registry, stop_grace_period, None)
    }

    pub fn with_default_grace_period(bus: Arc<dyn Bus>, registry: Arc<PeerRegistry>) -> Arc<Self> {
        Self::new(bus, registry, DEFAULT_STOP_GRACE)
    }

    /// Same as [`Supervisor::new`], but registrations are persisted to
    /// `store` under `process:{id}` and can be recovered with
    /// [`Supervisor::restore_registrations`].
    pub fn with_store(
        bus: Arc<dyn Bus>,
        registry: Arc<PeerRegistry>,
        stop_grace_period: Duration,
        store: Option<Arc<dyn DataStore>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new_cyclic(|weak| Self {
            bus,
            registry,
            children: DashMap::new(),
            process_locks: DashMap::new(),
            stop_grace_period,
            shutdown_tx,
            store,
            self_weak: weak.clone(),
        })
    }

    /// An owning handle to this supervisor, for tasks spawned from a `&self`
    /// method (the per-child exit monitor). Always upgradeable: every task
    /// holding it is itself reachable only from a live `Arc<Supervisor>`.
    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("Supervisor dropped while a method on it was still running")
    }

    /// Reload `ProcessInfo` entries persisted by a previous run. Call once
    /// at startup, before subscribing to the commands channel. Entries that
    /// fail to deserialize are logged and skipped rather than aborting
    /// startup.
    pub async fn restore_registrations(&self) {
        let Some(store) = &self.store else { return };
        let processes = match Self::load_processes(store).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "failed to load persisted process registrations");
                return;
            }
        };
        for (id, info) in processes {
            info!(process_id = %id, "restored registration from persisted state");
            self.registry.upsert_registered(info);
        }
    }

    async fn load_processes(
        store: &Arc<dyn DataStore>,
    ) -> Result<std::collections::HashMap<String, ProcessInfo>, ghost_store::StoreError> {
        match store.get(PROCESSES_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(std::collections::HashMap::new()),
        }
    }

    async fn persist_registration(&self, info: &ProcessInfo) {
        let Some(store) = &self.store else { return };
        let mut processes = match Self::load_processes(store).await {
            Ok(map) => map,
            Err(e) => {
                warn!(process_id = %info.id, error = %e, "failed to read persisted process table");
                return;
            }
        };
        processes.insert(info.id.clone(), info.clone());
        match serde_json::to_vec(&processes) {
            Ok(bytes) => {
                if let Err(e) = store.set(PROCESSES_KEY, bytes).await {
                    warn!(process_id = %info.id, error = %e, "failed to persist process registration");
                }
            }
            Err(e) => warn!(process_id = %info.id, error = %e, "failed to serialize process registration table"),
        }
    }

    pub async fn start(self: Arc<Self>) -> ghost_bus::Result<tokio::task::JoinHandle<()>> {
        let mut sub = self.bus.clone().subscribe("commands").await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = sub.next() => {
                        match delivery {
                            Some(d) => {
                                let supervisor = self.clone();
                                tokio::spawn(async move { supervisor.handle_delivery(d).await; });
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("supervisor command loop shutting down");
                        break;
                    }
                }
            }
        }))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let Payload::Command(command) = delivery.payload else {
            return;
        };
        let response_channel = command.response_channel().map(str::to_string);
        let response = self.dispatch(command.clone()).await;
        if let Some(channel) = response_channel {
            if let Err(e) = self
                .bus
                .publish_with_priority(&channel, Payload::Response(response), Priority::High)
                .await
            {
                warn!(command_id = %command.command_id, error = %e, "failed to publish command response");
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Response {
        match command.command_type.as_str() {
            "ping" => Response::ok(command.command_id),
            "register" => self.handle_register(command).await,
            "start" => self.handle_start(command).await,
            "stop" => self.handle_stop(command).await,
            "restart" => self.handle_restart(command).await,
            "status" => self.handle_status(command),
            other => Response::error(command.command_id, format!("unknown command type {other:?}")),
        }
    }

    async fn handle_register(&self, command: Command) -> Response {
        let Some(data) = &command.data else {
            return Response::error(command.command_id, "register requires ProcessInfo data");
        };
        match serde_json::from_slice::<ProcessInfo>(data) {
            Ok(info) => {
                self.persist_registration(&info).await;
                self.registry.upsert_registered(info);
                Response::ok(command.command_id)
            }
            Err(e) => Response::error(command.command_id, format!("malformed ProcessInfo: {e}")),
        }
    }

    fn process_lock(&self, process_id: &str) -> Arc<Mutex<()>> {
        self.process_locks
            .entry(process_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn handle_start(&self, command: Command) -> Response {
        let Some(process_id) = command.target_process_id.clone() else {
            return Response::error(command.command_id, "start requires targetProcessId");
        };
        let lock = self.process_lock(&process_id);
        let _guard = lock.lock().await;

        match self.registry.status(&process_id) {
            Some(status) if status.is_transient() => {
                return Response::error(command.command_id, "ConflictingState");
            }
            Some(PeerStatus::Running) => {
                return Response::error(command.command_id, "ConflictingState");
            }
            _ => {}
        }

        let Some(record) = self.registry.get(&process_id) else {
            return Response::error(command.command_id, format!("unknown process {process_id}"));
        };

        self.registry.set_status(&process_id, PeerStatus::Starting);
        let info = record.metadata;
        let mut builder = ProcessCommand::new(&info.executable_path);
        builder.args(&info.args).envs(&info.environment);
        if !info.working_dir.is_empty() {
            builder.current_dir(&info.working_dir);
        }

        match builder.spawn() {
            Ok(child) => {
                let child = Arc::new(Mutex::new(child));
                self.children.insert(process_id.clone(), child.clone());
                self.registry.set_status(&process_id, PeerStatus::Running);
                info!(process_id = %process_id, "process started");
                tokio::spawn(self.arc().monitor_child(process_id.clone(), child));
                Response::ok(command.command_id)
            }
            Err(e) => {
                self.registry.set_status(&process_id, PeerStatus::Crashed);
                error!(process_id = %process_id, error = %e, "process spawn failed");
                self.emit_crashed(&process_id);
                Response::error(command.command_id, format!("spawn failed: {e}"))
            }
        }
    }

    /// Watches a started child for a spontaneous exit (§4.7): a non-zero or
    /// signal-terminated exit that the supervisor did not itself request
    /// through `stop_process` transitions the process to `Crashed` and emits
    /// `process.crashed`. `stop_process` removes the entry from `children`
    /// before it waits on the same child, so if this task loses the race and
    /// finds the entry already gone (or reassigned to a later `start` of the
    /// same id) it treats the exit as solicited and does nothing.
    async fn monitor_child(self: Arc<Self>, process_id: String, child: Arc<Mutex<Child>>) {
        let status = loop {
            let mut guard = child.lock().await;
            match guard.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            drop(guard);
            tokio::time::sleep(Duration::from_millis(300)).await;
        };

        let still_watched = self
            .children
            .remove_if(&process_id, |_, c| Arc::ptr_eq(c, &child))
            .is_some();
        if !still_watched {
            return;
        }

        match status {
            Ok(status) if status.success() => {
                debug!(process_id = %process_id, "process exited cleanly");
                self.registry.set_status(&process_id, PeerStatus::Stopped);
            }
            Ok(status) => {
                warn!(process_id = %process_id, code = ?status.code(), "process exited unexpectedly; marking crashed");
                self.registry.mark_crashed(&process_id);
                self.emit_crashed(&process_id);
            }
            Err(e) => {
                error!(process_id = %process_id, error = %e, "failed to wait on child process");
                self.registry.mark_crashed(&process_id);
                self.emit_crashed(&process_id);
            }
        }
    }

    async fn handle_stop(&self, command: Command) -> Response {
        let Some(process_id) = command.target_process_id.clone() else {
            return Response::error(command.command_id, "stop requires targetProcessId");
        };
        let lock = self.process_lock(&process_id);
        let _guard = lock.lock().await;
        self.stop_process(&process_id).await;
        Response::ok(command.command_id)
    }

    /// Wait up to the grace period for the child to exit on its own, then
    /// escalate to a forced kill. This implementation has no portable
    /// signal-send primitive available, so "graceful" means "give the child
    /// a chance to exit first" rather than delivering SIGTERM explicitly.
    async fn stop_process(&self, process_id: &str) {
        match self.registry.status(process_id) {
            Some(status) if status.is_transient() => return,
            Some(PeerStatus::Running) => {}
            _ => return,
        }
        self.registry.set_status(process_id, PeerStatus::Stopping);

        if let Some((_, child)) = self.children.remove(process_id) {
            let mut guard = child.lock().await;
            let waited = tokio::time::timeout(self.stop_grace_period, guard.wait()).await;
            match waited {
                Ok(Ok(_)) => debug!(process_id, "child exited during grace period"),
                _ => {
                    warn!(process_id, "grace period elapsed; forcing termination");
                    let _ = guard.kill().await;
                }
            }
        }

        self.registry.set_status(process_id, PeerStatus::Stopped);
        let event = SystemEvent::new(SystemEventType::ProcessStopped, process_id.to_string());
        let _ = self
            .bus
            .publish_with_priority("events", Payload::Event(event), Priority::High)
            .await;
    }

    async fn handle_restart(&self, command: Command) -> Response {
        let Some(process_id) = command.target_process_id.clone() else {
            return Response::error(command.command_id, "restart requires targetProcessId");
        };
        let lock = self.process_lock(&process_id);
        let _guard = lock.lock().await;

        self.stop_process(&process_id).await;
        drop(_guard);
        self.handle_start(command).await
    }

    fn handle_status(&self, command: Command) -> Response {
        let data = match &command.target_process_id {
            Some(id) => match self.registry.get(id) {
                Some(record) => serde_json::to_vec(&record).ok(),
                None => return Response::error(command.command_id, format!("unknown process {id}")),
            },
            None => serde_json::to_vec(&self.registry.list()).ok(),
        };
        let mut response = Response::ok(command.command_id);
        response.data = data;
        response
    }

    fn emit_crashed(&self, process_id: &str) {
        let event = SystemEvent::new(SystemEventType::ProcessCrashed, process_id.to_string());
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let _ = bus
                .publish_with_priority("events", Payload::Event(event), Priority::High)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_bus::InMemoryBus;
    use std::collections::HashMap;

    fn process_info(id: &str) -> ProcessInfo {
        ProcessInfo {
            id: id.to_string(),
            name: id.to_string(),
            process_type: "worker".to_string(),
            version: "1.0".to_string(),
            executable_path: "/bin/true".to_string(),
            args: vec![],
            working_dir: String::new(),
            environment: HashMap::new(),
            configuration: HashMap::new(),
        }
    }

    fn command(command_type: &str, target: Option<&str>) -> Command {
        Command {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.to_string(),
            target_process_id: target.map(str::to_string),
            parameters: HashMap::new(),
            data: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn ping_replies_immediately() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let supervisor = Supervisor::with_default_grace_period(bus, registry);
        let response = supervisor.dispatch(command("ping", None)).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn start_on_unregistered_process_fails() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let supervisor = Supervisor::with_default_grace_period(bus, registry);
        let response = supervisor.dispatch(command("start", Some("svc-1"))).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn start_then_second_start_is_conflicting_state() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert_registered(process_info("svc-1"));
        let supervisor = Supervisor::with_default_grace_period(bus, registry);

        let first = supervisor.dispatch(command("start", Some("svc-1"))).await;
        assert!(first.success);

        let second = supervisor.dispatch(command("start", Some("svc-1"))).await;
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("ConflictingState"));
    }

    #[tokio::test]
    async fn status_with_no_target_lists_all_peers() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert_registered(process_info("svc-1"));
        registry.upsert_registered(process_info("svc-2"));
        let supervisor = Supervisor::with_default_grace_period(bus, registry);
        let response = supervisor.dispatch(command("status", None)).await;
        assert!(response.success);
        let peers: Vec<ghost_common::PeerRecord> =
            serde_json::from_slice(&response.data.unwrap()).unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn register_persists_and_survives_a_fresh_registry() {
        let store: Arc<dyn DataStore> = Arc::new(ghost_store::InMemoryStore::new());

        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let supervisor = Supervisor::with_store(bus, registry, DEFAULT_STOP_GRACE, Some(store.clone()));
        let mut register = command("register", None);
        register.data = Some(serde_json::to_vec(&process_info("svc-1")).unwrap());
        let response = supervisor.dispatch(register).await;
        assert!(response.success);

        let bus2 = Arc::new(InMemoryBus::new());
        let fresh_registry = Arc::new(PeerRegistry::new());
        let restarted = Supervisor::with_store(bus2, fresh_registry.clone(), DEFAULT_STOP_GRACE, Some(store));
        restarted.restore_registrations().await;
        assert!(fresh_registry.contains("svc-1"));
    }

    #[tokio::test]
    async fn unsolicited_nonzero_exit_marks_crashed_and_emits_event() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let mut info = process_info("svc-1");
        info.executable_path = "/bin/false".to_string();
        registry.upsert_registered(info);
        let supervisor = Supervisor::with_default_grace_period(bus.clone(), registry.clone());

        let mut events = bus.clone().subscribe("events").await.unwrap();

        let start = supervisor.dispatch(command("start", Some("svc-1"))).await;
        assert!(start.success);

        let delivery = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("timed out waiting for process.crashed")
            .expect("bus closed before an event arrived");
        let Payload::Event(event) = delivery.payload else {
            panic!("expected an event payload");
        };
        assert_eq!(event.event_type, SystemEventType::ProcessCrashed);
        assert_eq!(registry.status("svc-1"), Some(PeerStatus::Crashed));
    }

    #[tokio::test]
    async fn stop_requested_exit_is_not_reported_as_a_crash() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let mut info = process_info("svc-1");
        info.executable_path = "/bin/sleep".to_string();
        info.args = vec!["5".to_string()];
        registry.upsert_registered(info);
        let supervisor = Supervisor::with_default_grace_period(bus, registry.clone());

        let start = supervisor.dispatch(command("start", Some("svc-1"))).await;
        assert!(start.success);

        let stop = supervisor.dispatch(command("stop", Some("svc-1"))).await;
        assert!(stop.success);
        assert_eq!(registry.status("svc-1"), Some(PeerStatus::Stopped));

        // Give the exit-monitor task a chance to observe the already-removed
        // child entry and confirm it does not overwrite the Stopped status.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.status("svc-1"), Some(PeerStatus::Stopped));
    }
}
