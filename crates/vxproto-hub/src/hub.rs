//! The hub: registry of agents, modules, routes and topics, and the packet
//! dispatch engine.
//!
//! # Locking
//!
//! All registry maps live in one [`HubState`] behind a `RwLock`. Public
//! methods of [`VxProto`] take the lock, copy out what they need and release
//! it before any await. Methods of `HubState` never lock; they require the
//! caller to hold the guard they are called through. Nothing awaits while
//! holding the guard. The closed flag is kept apart so shutdown checks never
//! contend with the registry.

use crate::agent::AgentSocket;
use crate::app::HubApp;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::file::FileAssembler;
use crate::module::ModuleSocket;
use crate::queue::DeferredQueue;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vxproto_token::TokenCipher;
use vxproto_types::{AgentInfo, Control, ControlMsgType, Packet, Payload};

type Closer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Identifies a closer registered with [`VxProto::add_closer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloserHandle(u64);

#[derive(Default)]
struct Closers {
    next: u64,
    entries: BTreeMap<u64, Closer>,
}

/// Registry maps. Every method assumes the caller holds the hub lock.
#[derive(Default)]
pub(crate) struct HubState {
    agents: HashMap<String, Arc<AgentSocket>>,
    /// name -> group id -> socket
    modules: HashMap<String, HashMap<String, Arc<ModuleSocket>>>,
    imc_tokens: HashMap<String, Arc<ModuleSocket>>,
    /// dst -> connection token the dst is reached through
    routes: HashMap<String, String>,
    /// topic token -> subscriber tokens, in subscription order
    pub(crate) topics: HashMap<String, Vec<String>>,
}

impl HubState {
    /// Connection a packet for `dst` leaves through, directly or via a route.
    fn agent_for(&self, dst: &str) -> Option<Arc<AgentSocket>> {
        self.agents
            .get(dst)
            .or_else(|| self.routes.get(dst).and_then(|src| self.agents.get(src)))
            .cloned()
    }

    /// Module for a packet from a connection in `group_id`: the exact group,
    /// then the group-less module, then the only module of that name when
    /// the connection has no group.
    fn module_for(&self, name: &str, group_id: &str) -> Option<Arc<ModuleSocket>> {
        let groups = self.modules.get(name)?;
        if let Some(m) = groups.get(group_id).or_else(|| groups.get("")) {
            return Some(Arc::clone(m));
        }
        if group_id.is_empty() && groups.len() == 1 {
            return groups.values().next().cloned();
        }
        None
    }

    pub(crate) fn module_by_imc_token(&self, token: &str) -> Option<Arc<ModuleSocket>> {
        self.imc_tokens.get(token).cloned()
    }

    fn interested_modules(&self, group_id: &str) -> Vec<Arc<ModuleSocket>> {
        self.modules
            .values()
            .flat_map(|groups| groups.values())
            .filter(|m| m.is_interested_in(group_id))
            .cloned()
            .collect()
    }

    /// Drops `token` from every topic, deleting topics left empty.
    pub(crate) fn unsubscribe_everywhere(&mut self, token: &str) {
        self.topics.retain(|_, subscribers| {
            subscribers.retain(|s| s != token);
            !subscribers.is_empty()
        });
    }

    fn remove_routes_through(&mut self, token: &str) {
        self.routes.retain(|dst, src| dst != token && src != token);
    }
}

pub(crate) struct Inner {
    pub(crate) app: Arc<dyn HubApp>,
    pub(crate) cipher: TokenCipher,
    config: HubConfig,
    state: RwLock<HubState>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    recv_deferred: DeferredQueue,
    send_deferred: DeferredQueue,
    files: Arc<FileAssembler>,
    closers: Mutex<Closers>,
}

impl Inner {
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, HubState> {
        self.state.read().unwrap_or_else(|poisoned| {
            tracing::error!("hub state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(|poisoned| {
            tracing::error!("hub state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn closers(&self) -> std::sync::MutexGuard<'_, Closers> {
        self.closers.lock().unwrap_or_else(|poisoned| {
            tracing::error!("closer registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    Recv,
    Send,
}

/// The protocol hub. Cheap to clone; clones share one registry.
///
/// Must be created inside a tokio runtime: the deferred queues are replayed
/// by background tasks.
#[derive(Clone)]
pub struct VxProto {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VxProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VxProto")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl VxProto {
    pub fn new(app: Arc<dyn HubApp>, cipher: TokenCipher, config: HubConfig) -> Self {
        let inner = Arc::new(Inner {
            app,
            cipher,
            recv_deferred: DeferredQueue::new("recv", config.deferred_capacity),
            send_deferred: DeferredQueue::new("send", config.deferred_capacity),
            files: Arc::new(FileAssembler::new(config.files_dir.clone())),
            config,
            state: RwLock::new(HubState::default()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            closers: Mutex::new(Closers::default()),
        });

        for kind in [QueueKind::Recv, QueueKind::Send] {
            tokio::spawn(replay_loop(
                Arc::downgrade(&inner),
                kind,
                inner.config.deferred_tick,
                inner.shutdown.clone(),
            ));
        }

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }

    pub fn app(&self) -> &Arc<dyn HubApp> {
        &self.inner.app
    }

    pub fn cipher(&self) -> &TokenCipher {
        &self.inner.cipher
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), HubError> {
        if self.is_closed() {
            Err(HubError::Closed)
        } else {
            Ok(())
        }
    }

    // Dispatch

    /// Dispatches a packet read from an agent connection.
    ///
    /// An unknown destination or missing module is not an error: the packet
    /// is deferred and replayed until the TTL expires.
    pub async fn recv_packet(&self, packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        self.dispatch_recv(packet, None).await
    }

    /// Writes a packet to the agent connection its destination resolves to,
    /// deferring it while no such connection exists.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        self.dispatch_send(packet, None).await
    }

    async fn dispatch_recv(&self, mut packet: Packet, since: Option<Instant>) -> Result<(), HubError> {
        let (forward, agent, module) = {
            let state = self.inner.read_state();
            if state.routes.contains_key(&packet.dst) {
                (true, None, None)
            } else {
                match state.agents.get(&packet.dst) {
                    Some(agent) => {
                        let module = state.module_for(&packet.module, &agent.group_id());
                        (false, Some(Arc::clone(agent)), module)
                    }
                    None => (false, None, None),
                }
            }
        };

        if forward {
            return self.dispatch_send(packet, since).await;
        }
        let Some(agent) = agent else {
            self.defer(QueueKind::Recv, packet, since);
            return Ok(());
        };

        agent.policy().check_inbound(&packet)?;
        packet.src = agent.token().to_string();

        let Some(module) = module else {
            self.defer(QueueKind::Recv, packet, since);
            return Ok(());
        };
        match since {
            None => module.recv_packet(packet).await,
            // Replay never waits on a mailbox.
            Some(_) => {
                if let Some(packet) = module.offer(packet, &self.inner.shutdown).await? {
                    tracing::trace!(module = %module.name(), "mailbox full, keeping packet deferred");
                    self.defer(QueueKind::Recv, packet, since);
                }
                Ok(())
            }
        }
    }

    async fn dispatch_send(&self, mut packet: Packet, since: Option<Instant>) -> Result<(), HubError> {
        let agent = self.inner.read_state().agent_for(&packet.dst);
        let Some(agent) = agent else {
            self.defer(QueueKind::Send, packet, since);
            return Ok(());
        };

        agent.policy().check_outbound(&packet)?;
        if packet.src.is_empty() {
            packet.src = agent.local_token().to_string();
        }
        agent.send_packet(packet).await
    }

    fn queue(&self, kind: QueueKind) -> &DeferredQueue {
        match kind {
            QueueKind::Recv => &self.inner.recv_deferred,
            QueueKind::Send => &self.inner.send_deferred,
        }
    }

    fn defer(&self, kind: QueueKind, packet: Packet, since: Option<Instant>) {
        if since.is_none() {
            tracing::debug!(queue = ?kind, dst = %packet.dst, module = %packet.module, "destination unresolved, deferring");
        }
        self.queue(kind).push(packet, since.unwrap_or_else(Instant::now));
    }

    async fn replay(&self, kind: QueueKind) {
        let ttl = self.inner.config.deferred_ttl;
        for entry in self.queue(kind).take_all() {
            if entry.since.elapsed() > ttl {
                tracing::debug!(queue = ?kind, dst = %entry.packet.dst, "deferred packet expired");
                continue;
            }
            let result = match kind {
                QueueKind::Recv => self.dispatch_recv(entry.packet, Some(entry.since)).await,
                QueueKind::Send => self.dispatch_send(entry.packet, Some(entry.since)).await,
            };
            if let Err(e) = result {
                tracing::warn!(queue = ?kind, error = %e, "deferred packet dropped");
            }
        }
    }

    /// Number of packets waiting in the receive and send deferred queues.
    pub fn deferred_len(&self) -> (usize, usize) {
        (self.inner.recv_deferred.len(), self.inner.send_deferred.len())
    }

    // Agents

    /// Registers a connection and tells interested modules about it.
    pub fn add_agent(&self, agent: Arc<AgentSocket>) -> Result<(), HubError> {
        self.ensure_open()?;
        let info = agent.info();
        let modules = {
            let mut state = self.inner.write_state();
            if state.agents.contains_key(&info.token) {
                return Err(HubError::AgentExists(info.token));
            }
            state.agents.insert(info.token.clone(), agent);
            state.interested_modules(&info.group_id)
        };

        tracing::info!(
            agent_id = %info.id,
            agent_type = %info.agent_type,
            group_id = %info.group_id,
            token = %info.token,
            "agent connected"
        );
        self.notify_all(&modules, ControlMsgType::AgentConnected, &info);
        Ok(())
    }

    /// Unregisters a connection, drops the routes through it and tells
    /// interested modules.
    pub fn del_agent(&self, token: &str) -> Result<Arc<AgentSocket>, HubError> {
        let (agent, modules) = {
            let mut state = self.inner.write_state();
            let agent = state
                .agents
                .remove(token)
                .ok_or_else(|| HubError::AgentNotFound(token.to_string()))?;
            state.remove_routes_through(token);
            state.unsubscribe_everywhere(token);
            let modules = state.interested_modules(&agent.group_id());
            (agent, modules)
        };

        let info = agent.info();
        tracing::info!(agent_id = %info.id, token = %info.token, "agent disconnected");
        self.notify_all(&modules, ControlMsgType::AgentDisconnected, &info);
        Ok(agent)
    }

    /// Moves a connection to another group. Modules of the old group see a
    /// disconnect, modules of the new group a connect.
    pub fn move_agent(&self, token: &str, group_id: &str) -> Result<(), HubError> {
        self.ensure_open()?;
        let (agent, previous, old, new) = {
            let state = self.inner.write_state();
            let agent = state
                .agents
                .get(token)
                .cloned()
                .ok_or_else(|| HubError::AgentNotFound(token.to_string()))?;
            let previous = agent.group_id();
            if previous == group_id {
                return Ok(());
            }
            let old = state.interested_modules(&previous);
            agent.set_group_id(group_id);
            let new = state.interested_modules(group_id);
            (agent, previous, old, new)
        };

        let mut info = agent.info();
        tracing::info!(agent_id = %info.id, from = %previous, to = group_id, "agent moved");
        info.group_id = previous;
        self.notify_all(&old, ControlMsgType::AgentDisconnected, &info);
        info.group_id = group_id.to_string();
        self.notify_all(&new, ControlMsgType::AgentConnected, &info);
        Ok(())
    }

    pub fn agent(&self, token: &str) -> Option<Arc<AgentSocket>> {
        self.inner.read_state().agents.get(token).cloned()
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.inner
            .read_state()
            .agents
            .values()
            .map(|a| a.info())
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.inner.read_state().agents.len()
    }

    fn notify_all(&self, modules: &[Arc<ModuleSocket>], msg_type: ControlMsgType, info: &AgentInfo) {
        for module in modules {
            let mut packet = Packet::new(
                module.name(),
                module.imc_token(),
                Payload::Control(Control {
                    msg_type,
                    agent: Some(info.clone()),
                }),
            );
            packet.src = info.token.clone();
            module.notify(packet, &self.inner.shutdown);
        }
    }

    // Modules

    /// Creates an unregistered module socket.
    pub fn new_module(&self, name: &str, group_id: &str) -> Arc<ModuleSocket> {
        Arc::new(ModuleSocket::new(
            name.to_string(),
            group_id.to_string(),
            self.inner.cipher.make_imc_token(name, group_id),
            self.inner.config.mailbox_capacity,
            Arc::clone(&self.inner.files),
            Arc::clone(&self.inner.app),
            Arc::downgrade(&self.inner),
        ))
    }

    pub fn add_module(&self, module: &Arc<ModuleSocket>) -> Result<(), HubError> {
        self.ensure_open()?;
        {
            let mut state = self.inner.write_state();
            let groups = state.modules.entry(module.name().to_string()).or_default();
            if groups.contains_key(module.group_id()) {
                return Err(HubError::ModuleExists {
                    name: module.name().to_string(),
                    group_id: module.group_id().to_string(),
                });
            }
            groups.insert(module.group_id().to_string(), Arc::clone(module));
            state
                .imc_tokens
                .insert(module.imc_token().to_string(), Arc::clone(module));
        }
        tracing::info!(module = %module.name(), group_id = %module.group_id(), "module registered");
        Ok(())
    }

    /// Unregisters a module, removes its topic subscriptions, sends it a
    /// stop notification and closes its mailbox.
    pub fn del_module(&self, module: &ModuleSocket) -> Result<(), HubError> {
        {
            let mut state = self.inner.write_state();
            let removed = match state.modules.get_mut(module.name()) {
                Some(groups) => {
                    let removed = groups.remove(module.group_id()).is_some();
                    if groups.is_empty() {
                        state.modules.remove(module.name());
                    }
                    removed
                }
                None => false,
            };
            if !removed {
                return Err(HubError::ModuleNotFound {
                    name: module.name().to_string(),
                    group_id: module.group_id().to_string(),
                });
            }
            state.imc_tokens.remove(module.imc_token());
            state.unsubscribe_everywhere(module.imc_token());
        }

        let stop = Packet::new(
            module.name(),
            module.imc_token(),
            Payload::Control(Control {
                msg_type: ControlMsgType::StopModule,
                agent: None,
            }),
        );
        module.notify(stop, &self.inner.shutdown);
        module.close();
        tracing::info!(module = %module.name(), group_id = %module.group_id(), "module unregistered");
        Ok(())
    }

    pub fn module(&self, name: &str, group_id: &str) -> Option<Arc<ModuleSocket>> {
        self.inner
            .read_state()
            .modules
            .get(name)
            .and_then(|groups| groups.get(group_id))
            .cloned()
    }

    pub fn module_count(&self) -> usize {
        self.inner
            .read_state()
            .modules
            .values()
            .map(HashMap::len)
            .sum()
    }

    // Routes

    /// Makes `dst` reachable through the connection registered as `src`.
    pub fn add_route(&self, dst: &str, src: &str) {
        self.inner
            .write_state()
            .routes
            .insert(dst.to_string(), src.to_string());
        tracing::debug!(dst, src, "route added");
    }

    pub fn del_route(&self, dst: &str) -> Option<String> {
        self.inner.write_state().routes.remove(dst)
    }

    pub fn get_route(&self, dst: &str) -> Option<String> {
        self.inner.read_state().routes.get(dst).cloned()
    }

    // Shutdown

    /// Registers a hook run by [`VxProto::close`].
    pub fn add_closer<F, Fut>(&self, closer: F) -> CloserHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut closers = self.inner.closers();
        let id = closers.next;
        closers.next += 1;
        closers.entries.insert(id, Box::new(move || closer().boxed()));
        CloserHandle(id)
    }

    /// Unregisters a hook. Returns `false` if it was already removed or run.
    pub fn remove_closer(&self, handle: CloserHandle) -> bool {
        self.inner.closers().entries.remove(&handle.0).is_some()
    }

    /// Shuts the hub down: refuses further dispatch, stops background
    /// tasks, runs every registered closer, closes all module mailboxes and
    /// drops deferred packets. Only the first call has an effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let closers = std::mem::take(&mut self.inner.closers().entries);
        for (_, closer) in closers {
            closer().await;
        }

        let (modules, agents) = {
            let state = self.inner.read_state();
            let modules: Vec<_> = state.imc_tokens.values().cloned().collect();
            let agents: Vec<_> = state.agents.values().cloned().collect();
            (modules, agents)
        };
        for agent in agents {
            agent.close().await;
        }
        for module in modules {
            module.close();
        }

        self.inner.recv_deferred.clear();
        self.inner.send_deferred.clear();
        tracing::info!("hub closed");
    }
}

async fn replay_loop(
    hub: Weak<Inner>,
    kind: QueueKind,
    tick: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = hub.upgrade() else {
            break;
        };
        VxProto::from_inner(inner).replay(kind).await;
    }
    tracing::debug!(queue = ?kind, "deferred replay stopped");
}
