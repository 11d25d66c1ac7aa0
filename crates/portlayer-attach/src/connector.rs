//! Connector registry
//!
//! The connector accepts agent links, discovers the containers each link
//! hosts and keeps one live interactor per container id. Callers asking for
//! an id that has not arrived yet wait for it; concurrent callers for the
//! same id share a single resolution.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::config::AttachConfig;
use tether_core::{ConnectorError, ContainerId, SessionInteractor};
use tether_protocol::msgs;
use tether_protocol::{MuxHandle, OpenFailureReason};

use crate::connection::HealthMonitor;
use crate::interaction::Interactor;
use crate::server::{establish, AgentLink};

/// Registered interactors are shared between callers
pub type SharedInteractor = Arc<dyn SessionInteractor>;

type Resolution = Shared<BoxFuture<'static, Result<SharedInteractor, ConnectorError>>>;

/// Origin recorded for interactors registered by hand
const NO_LINK: u64 = 0;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Entry {
    interactor: SharedInteractor,
    /// Mux the interactor rides on
    origin: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of live interactions, fed by agent links
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    config: AttachConfig,
    interactions: RwLock<HashMap<ContainerId, Entry>>,
    inflight: Mutex<HashMap<ContainerId, Resolution>>,
    /// Signalled after every insertion
    arrivals: Notify,
    waiters: AtomicUsize,
    done: CancellationToken,
    links: Mutex<HashMap<u64, MuxHandle>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Counts a task parked in the wait loop
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Connector {
    /// Connector without a listener; links are handed in by the caller
    pub fn new(config: AttachConfig) -> Self {
        Self::build(config, None, None)
    }

    /// Connector that accepts agents on `listener` once started
    pub fn with_listener(listener: TcpListener, config: AttachConfig) -> std::io::Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self::build(config, Some(listener), Some(addr)))
    }

    fn build(
        config: AttachConfig,
        listener: Option<TcpListener>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                interactions: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                arrivals: Notify::new(),
                waiters: AtomicUsize::new(0),
                done: CancellationToken::new(),
                links: Mutex::new(HashMap::new()),
                listener: Mutex::new(listener),
                local_addr,
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Start accepting agents
    pub fn start(&self) -> Result<(), ConnectorError> {
        if self.inner.done.is_cancelled() {
            return Err(ConnectorError::Stopped);
        }

        let Some(listener) = lock(&self.inner.listener).take() else {
            return Ok(());
        };

        tracing::info!("Attach connector accepting on {}", self.url().unwrap_or_default());
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.accept_loop(listener).await });
        *lock(&self.inner.accept_task) = Some(task);
        Ok(())
    }

    /// Stop accepting, drop every link and release all waiters
    ///
    /// Processes inside containers are left alone.
    pub async fn stop(&self) {
        if self.inner.done.is_cancelled() {
            return;
        }
        tracing::info!("Stopping attach connector");
        self.inner.done.cancel();
        self.inner.arrivals.notify_waiters();

        let task = lock(&self.inner.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        lock(&self.inner.listener).take();

        let links: Vec<MuxHandle> = lock(&self.inner.links).drain().map(|(_, m)| m).collect();
        for mux in links {
            mux.close();
        }

        let entries: Vec<Entry> = self
            .inner
            .interactions
            .write()
            .await
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in entries {
            let _ = entry.interactor.close().await;
        }
        lock(&self.inner.inflight).clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// `tcp://host:port` of the bound listener
    pub fn url(&self) -> Option<String> {
        self.inner.local_addr.map(|addr| format!("tcp://{}", addr))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Live interactor for `id`, waiting for it to arrive if needed
    ///
    /// Returns once the interactor is registered, `cancel` fires, or the
    /// connector stops. The agent is sent an `unblock` before this returns.
    pub async fn interaction(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> Result<SharedInteractor, ConnectorError> {
        self.interaction_until(cancel, id, None).await
    }

    /// Like [`Connector::interaction`], giving up after `timeout`
    pub async fn interaction_within(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
        timeout: Duration,
    ) -> Result<SharedInteractor, ConnectorError> {
        self.interaction_until(cancel, id, Some(Instant::now() + timeout))
            .await
    }

    async fn interaction_until(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
        deadline: Option<Instant>,
    ) -> Result<SharedInteractor, ConnectorError> {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if self.inner.done.is_cancelled() {
            return Err(ConnectorError::Stopped);
        }

        let resolution = self.inner.join(id);
        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = resolution.clone() => {
                self.inner.forget(id, &resolution);
                result
            }
            _ = cancel.cancelled() => {
                tracing::debug!(container_id = %id, "Interaction wait cancelled");
                self.inner.forget(id, &resolution);
                Err(ConnectorError::Cancelled)
            }
            _ = expiry => {
                tracing::debug!(container_id = %id, "Interaction wait timed out");
                self.inner.forget(id, &resolution);
                Err(ConnectorError::Timeout)
            }
            _ = self.inner.done.cancelled() => Err(ConnectorError::Stopped),
        }
    }

    /// Single non-blocking lookup
    pub async fn lookup(&self, id: &ContainerId) -> Result<SharedInteractor, ConnectorError> {
        if self.inner.done.is_cancelled() {
            return Err(ConnectorError::Stopped);
        }
        match self.inner.live_entry(id).await {
            Some(interactor) => {
                self.inner.unblock(&interactor).await;
                Ok(interactor)
            }
            None => Err(ConnectorError::NotFound(id.clone())),
        }
    }

    /// Close and forget the interaction for `id`, if any
    pub async fn remove_interaction(&self, id: &ContainerId) {
        lock(&self.inner.inflight).remove(id);
        let removed = self.inner.interactions.write().await.remove(id);
        if let Some(entry) = removed {
            tracing::info!(container_id = %id, "Removing interaction");
            let _ = entry.interactor.close().await;
        }
    }

    /// Register an interactor not tied to any agent link
    pub async fn register(&self, interactor: SharedInteractor) {
        self.inner.insert(interactor, NO_LINK).await;
    }

    /// Establish and serve a link over an accepted stream
    pub fn serve_stream(&self, stream: TcpStream, peer: SocketAddr) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.serve_stream(stream, peer.to_string()).await })
    }

    /// Serve an already established link
    pub fn serve_link(&self, link: AgentLink) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.process_link(link).await })
    }

    /// Tasks currently parked waiting for an id to arrive
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Acquire)
    }

    /// Ids currently registered
    pub async fn ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.inner.interactions.read().await.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Number of agent links being served
    pub fn link_count(&self) -> usize {
        lock(&self.inner.links).len()
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("url", &self.url())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => {
                    tracing::info!("Attach listener shutting down");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((socket, peer)) => {
                        tracing::info!(peer = %peer, "Agent connection accepted");
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
                        }
                        let inner = self.clone();
                        tokio::spawn(async move { inner.serve_stream(socket, peer.to_string()).await });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn serve_stream(self: Arc<Self>, stream: TcpStream, peer: String) {
        let link = tokio::select! {
            _ = self.done.cancelled() => return,
            result = establish(stream, &self.config, peer.clone()) => result,
        };

        match link {
            Ok(link) => self.process_link(link).await,
            Err(e) => tracing::warn!(peer = %peer, "Dropping agent connection: {}", e),
        }
    }

    /// Join the in-flight resolution for `id`, starting one if needed
    fn join(self: &Arc<Self>, id: &ContainerId) -> Resolution {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(id) {
            return existing.clone();
        }

        let inner = self.clone();
        let key = id.clone();
        let resolution = async move { inner.resolve(key).await }.boxed().shared();
        inflight.insert(id.clone(), resolution.clone());
        resolution
    }

    /// Drop the in-flight entry if it is still `resolution`
    fn forget(&self, id: &ContainerId, resolution: &Resolution) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(id).is_some_and(|r| r.ptr_eq(resolution)) {
            inflight.remove(id);
        }
    }

    async fn resolve(self: Arc<Self>, id: ContainerId) -> Result<SharedInteractor, ConnectorError> {
        let interactor = match self.live_entry(&id).await {
            Some(interactor) => interactor,
            None => self.wait_for(&id).await?,
        };
        self.unblock(&interactor).await;
        Ok(interactor)
    }

    /// Registered interactor for `id` that still answers a ping
    ///
    /// A dead entry is removed and closed before this returns.
    async fn live_entry(&self, id: &ContainerId) -> Option<SharedInteractor> {
        let mut interactions = self.interactions.write().await;
        let interactor = interactions.get(id)?.interactor.clone();

        match interactor.ping().await {
            Ok(()) => Some(interactor),
            Err(e) => {
                tracing::info!(container_id = %id, "Dropping unresponsive interaction: {}", e);
                interactions.remove(id);
                drop(interactions);
                let _ = interactor.close().await;
                None
            }
        }
    }

    async fn wait_for(&self, id: &ContainerId) -> Result<SharedInteractor, ConnectorError> {
        let _waiter = WaiterGuard::new(&self.waiters);

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.done.is_cancelled() {
                return Err(ConnectorError::Stopped);
            }
            if let Some(entry) = self.interactions.read().await.get(id) {
                return Ok(entry.interactor.clone());
            }

            tracing::trace!(container_id = %id, "Waiting for interaction");
            tokio::select! {
                _ = &mut notified => {}
                _ = self.done.cancelled() => return Err(ConnectorError::Stopped),
            }
        }
    }

    async fn unblock(&self, interactor: &SharedInteractor) {
        // Liveness was already settled; a failed unblock is only logged
        if let Err(e) = interactor.unblock().await {
            tracing::debug!(container_id = %interactor.id(), "Unblock failed: {}", e);
        }
    }

    /// Insert, closing whatever held the id before
    async fn insert(&self, interactor: SharedInteractor, origin: u64) {
        let id = interactor.id().clone();
        {
            let mut interactions = self.interactions.write().await;
            if let Some(old) = interactions.remove(&id) {
                tracing::debug!(container_id = %id, "Replacing previous interaction");
                let _ = old.interactor.close().await;
            }
            interactions.insert(id.clone(), Entry { interactor, origin });
        }
        tracing::info!(container_id = %id, "Interaction registered");
        self.arrivals.notify_waiters();
    }

    /// Whether a live interactor already serves `id`
    async fn has_live(&self, id: &ContainerId) -> bool {
        let existing = self
            .interactions
            .read()
            .await
            .get(id)
            .map(|e| e.interactor.clone());
        match existing {
            Some(interactor) => interactor.ping().await.is_ok(),
            None => false,
        }
    }

    async fn process_link(self: Arc<Self>, link: AgentLink) {
        let AgentLink {
            mux,
            mut globals,
            mut opens,
            session,
            peer,
        } = link;

        if self.done.is_cancelled() {
            mux.close();
            AgentLink::disconnect(session).await;
            return;
        }
        lock(&self.links).insert(mux.id(), mux.clone());

        let ids = match discover(&mux).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(peer = %peer, "Container discovery failed: {}", e);
                mux.close();
                lock(&self.links).remove(&mux.id());
                AgentLink::disconnect(session).await;
                return;
            }
        };
        tracing::info!(peer = %peer, mux = mux.id(), "Agent hosts {} container(s)", ids.len());

        // Agents never open channels towards us
        tokio::spawn(async move {
            while let Some(open) = opens.recv().await {
                tracing::debug!("Rejecting {} channel from agent", open.channel_type());
                open.reject(OpenFailureReason::AdministrativelyProhibited, "not accepted");
            }
        });

        HealthMonitor::new(
            self.config.keepalive_interval,
            self.config.keepalive_timeout,
        )
        .spawn_monitor(mux.clone());

        let version = Arc::new(OnceCell::new());
        let mut droplist: HashSet<ContainerId> = ids.iter().cloned().collect();
        tokio::spawn(self.clone().register_ids(mux.clone(), ids, version.clone()));

        loop {
            tokio::select! {
                _ = mux.closed() => break,
                _ = self.done.cancelled() => break,
                req = globals.recv() => {
                    let Some(req) = req else { break };
                    match req.name() {
                        msgs::CONTAINERS_REQ => {
                            let announced = match msgs::decode_containers(req.payload()) {
                                Ok(ids) => ids,
                                Err(e) => {
                                    tracing::warn!(peer = %peer, "Bad container announcement: {}", e);
                                    continue;
                                }
                            };
                            req.reply(true, Bytes::new());

                            let fresh: Vec<ContainerId> = announced
                                .into_iter()
                                .map(ContainerId::new)
                                .filter(|id| !id.is_empty() && droplist.insert(id.clone()))
                                .collect();
                            if !fresh.is_empty() {
                                tracing::info!(peer = %peer, "Agent announced {} new container(s)", fresh.len());
                                tokio::spawn(self.clone().register_ids(mux.clone(), fresh, version.clone()));
                            }
                        }
                        msgs::FORK_REQ => {
                            tracing::info!(peer = %peer, "Agent is forking, closing link");
                            req.reply(true, Bytes::new());
                            mux.close();
                        }
                        other => tracing::debug!(peer = %peer, "Ignoring global request {}", other),
                    }
                }
            }
        }

        mux.close();
        lock(&self.links).remove(&mux.id());
        self.evict(&droplist, mux.id()).await;
        AgentLink::disconnect(session).await;
        tracing::info!(peer = %peer, mux = mux.id(), "Agent link closed");
    }

    /// Open and register an interactor for every id not already live
    async fn register_ids(
        self: Arc<Self>,
        mux: MuxHandle,
        ids: Vec<ContainerId>,
        version: Arc<OnceCell<u32>>,
    ) {
        for id in ids {
            if self.done.is_cancelled() || mux.is_closed() {
                return;
            }
            if self.has_live(&id).await {
                tracing::debug!(container_id = %id, "Interaction already live, skipping");
                continue;
            }

            let version = *version.get_or_init(|| agent_version(&mux)).await;
            match Interactor::open(&mux, id.clone(), version, self.config.ping_timeout).await {
                Ok(interactor) => self.insert(Arc::new(interactor), mux.id()).await,
                Err(e) => tracing::warn!(container_id = %id, "Failed to open attach channel: {}", e),
            }
        }
    }

    /// Remove every id still owned by the closing mux
    async fn evict(&self, droplist: &HashSet<ContainerId>, origin: u64) {
        let mut removed = Vec::new();
        {
            let mut interactions = self.interactions.write().await;
            for id in droplist {
                if interactions.get(id).is_some_and(|e| e.origin == origin) {
                    if let Some(entry) = interactions.remove(id) {
                        removed.push(entry.interactor);
                    }
                }
            }
        }

        for interactor in removed {
            tracing::info!(container_id = %interactor.id(), "Evicting interaction of closed link");
            let _ = interactor.close().await;
        }
    }
}

/// Ask the agent which containers it hosts
async fn discover(mux: &MuxHandle) -> anyhow::Result<Vec<ContainerId>> {
    let reply = mux
        .global_request(msgs::CONTAINERS_REQ, true, Bytes::new())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no reply to containers request"))?;
    if !reply.ok {
        anyhow::bail!("agent refused containers request");
    }

    Ok(msgs::decode_containers(&reply.payload)?
        .into_iter()
        .map(ContainerId::new)
        .filter(|id| !id.is_empty())
        .collect())
}

/// Agent protocol revision; agents that cannot answer are revision 0
async fn agent_version(mux: &MuxHandle) -> u32 {
    match mux.global_request(msgs::VERSION_REQ, true, Bytes::new()).await {
        Ok(Some(reply)) if reply.ok => {
            msgs::decode_u32(&reply.payload, msgs::VERSION_REQ).unwrap_or_else(|e| {
                tracing::debug!("Unreadable version reply: {}", e);
                0
            })
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tether_core::InteractionError;
    use tether_protocol::msgs::WindowSize;
    use tether_protocol::{Mux, NewChannel};
    use tokio::io::{duplex, AsyncRead, AsyncWrite};
    use tokio::sync::mpsc;

    /// In-memory agent hosting a fixed set of containers
    struct FakeAgent {
        mux: MuxHandle,
        unblocks: Arc<AtomicUsize>,
    }

    fn spawn_agent(hosted: &[&str], reject: &[&str]) -> (AgentLink, FakeAgent) {
        let (a, b) = duplex(256 * 1024);
        let link = AgentLink::from_mux(Mux::start(a), "fake");
        let (mux, mut globals, opens) = Mux::start(b);

        let hosted: Vec<String> = hosted.iter().map(|s| s.to_string()).collect();
        let reject: Vec<String> = reject.iter().map(|s| s.to_string()).collect();
        let unblocks = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            while let Some(req) = globals.recv().await {
                match req.name() {
                    msgs::CONTAINERS_REQ => {
                        let payload = msgs::encode_containers(&hosted[..]);
                        req.reply(true, payload);
                    }
                    msgs::VERSION_REQ => req.reply(true, msgs::encode_u32(1)),
                    _ => drop(req),
                }
            }
        });
        tokio::spawn(accept_attach(opens, reject, unblocks.clone()));

        (link, FakeAgent { mux, unblocks })
    }

    async fn accept_attach(
        mut opens: mpsc::UnboundedReceiver<NewChannel>,
        reject: Vec<String>,
        unblocks: Arc<AtomicUsize>,
    ) {
        while let Some(open) = opens.recv().await {
            let id = String::from_utf8_lossy(open.extra()).to_string();
            if reject.contains(&id) {
                open.reject(OpenFailureReason::ConnectFailed, "unknown container");
                continue;
            }
            let channel = open.accept().unwrap();
            let mut reqs = channel.take_requests().unwrap();
            let unblocks = unblocks.clone();
            tokio::spawn(async move {
                let _channel = channel;
                while let Some(req) = reqs.recv().await {
                    match req.name() {
                        msgs::PING_REQ => {
                            let echo = req.payload().clone();
                            req.reply(true, echo);
                        }
                        msgs::UNBLOCK_REQ => {
                            unblocks.fetch_add(1, Ordering::SeqCst);
                            req.reply(true, Bytes::new());
                        }
                        _ => req.reply(true, Bytes::new()),
                    }
                }
            });
        }
    }

    /// Interactor whose agent went away
    struct DeadInteractor {
        id: ContainerId,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SessionInteractor for DeadInteractor {
        fn id(&self) -> &ContainerId {
            &self.id
        }
        fn stdout(&self) -> Box<dyn AsyncRead + Send + Unpin> {
            Box::new(tokio::io::empty())
        }
        fn stderr(&self) -> Box<dyn AsyncRead + Send + Unpin> {
            Box::new(tokio::io::empty())
        }
        fn stdin(&self) -> Box<dyn AsyncWrite + Send + Unpin> {
            Box::new(tokio::io::sink())
        }
        async fn signal(&self, name: &str) -> Result<(), InteractionError> {
            Err(InteractionError::SignalFailed(name.into()))
        }
        async fn resize(&self, _size: WindowSize) -> Result<(), InteractionError> {
            Err(InteractionError::ResizeFailed)
        }
        async fn close_stdin(&self) -> Result<(), InteractionError> {
            Err(InteractionError::TransportClosed)
        }
        async fn ping(&self) -> Result<(), InteractionError> {
            Err(InteractionError::PingFailed("dead".into()))
        }
        async fn unblock(&self) -> Result<(), InteractionError> {
            Err(InteractionError::TransportClosed)
        }
        async fn exit_status(&self) -> Result<u32, InteractionError> {
            Err(InteractionError::TransportClosed)
        }
        async fn close(&self) -> Result<(), InteractionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn connector() -> Connector {
        Connector::new(AttachConfig {
            ping_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_interaction_after_link() {
        let connector = connector();
        let (link, agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        let interactor = connector.interaction(&cancel, &"c1".into()).await.unwrap();
        assert_eq!(interactor.id().as_str(), "c1");
        interactor.ping().await.unwrap();
        assert_eq!(agent.unblocks.load(Ordering::SeqCst), 1);
        assert_eq!(connector.ids().await, vec![ContainerId::from("c1")]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_resolution() {
        let connector = connector();
        let cancel = CancellationToken::new();

        let mut callers = Vec::new();
        for _ in 0..500 {
            let connector = connector.clone();
            let cancel = cancel.clone();
            callers.push(tokio::spawn(async move {
                connector.interaction(&cancel, &"c1".into()).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.waiters(), 1);

        let (link, agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let mut results = Vec::new();
        for caller in callers {
            results.push(caller.await.unwrap().unwrap());
        }
        let first = &results[0];
        assert!(results.iter().all(|r| Arc::ptr_eq(r, first)));
        assert_eq!(agent.unblocks.load(Ordering::SeqCst), 1);
        assert_eq!(connector.waiters(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_promptly() {
        let connector = connector();
        let cancel = CancellationToken::new();

        let waiter = {
            let connector = connector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.interaction(&cancel, &"cX".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.waiters(), 1);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.err(), Some(ConnectorError::Cancelled));
        assert_eq!(connector.waiters(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let connector = connector();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = connector.interaction(&cancel, &"c1".into()).await;
        assert_eq!(result.err(), Some(ConnectorError::Cancelled));
        assert_eq!(connector.waiters(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let connector = connector();
        let cancel = CancellationToken::new();
        let result = connector
            .interaction_within(&cancel, &"c1".into(), Duration::from_millis(50))
            .await;
        assert_eq!(result.err(), Some(ConnectorError::Timeout));
        assert_eq!(connector.waiters(), 0);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let connector = connector();
        let result = connector.lookup(&"c1".into()).await;
        assert_eq!(result.err(), Some(ConnectorError::NotFound("c1".into())));
    }

    #[tokio::test]
    async fn test_stale_entry_replaced() {
        let connector = connector();
        let dead = Arc::new(DeadInteractor {
            id: "c1".into(),
            closed: AtomicBool::new(false),
        });
        connector.register(dead.clone()).await;

        let (link, _agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        let interactor = connector.interaction(&cancel, &"c1".into()).await.unwrap();
        interactor.ping().await.unwrap();
        assert!(dead.is_closed());
        assert_eq!(connector.ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_link_close_evicts_ids() {
        let connector = connector();
        let (link, agent) = spawn_agent(&["c1", "c2"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        let c1 = connector.interaction(&cancel, &"c1".into()).await.unwrap();
        connector.interaction(&cancel, &"c2".into()).await.unwrap();

        agent.mux.close();
        wait_until(|| {
            let connector = connector.clone();
            async move { connector.ids().await.is_empty() }
        })
        .await;
        assert!(c1.is_closed());
        assert_eq!(connector.link_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_ids_moved_to_newer_link() {
        let connector = connector();
        let cancel = CancellationToken::new();

        let (old_link, old_agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(old_link);
        let first = connector.interaction(&cancel, &"c1".into()).await.unwrap();

        // Same container shows up on a new link while the old one lingers
        connector.remove_interaction(&"c1".into()).await;
        let (new_link, _new_agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(new_link);
        let second = connector.interaction(&cancel, &"c1".into()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        old_agent.mux.close();
        wait_until(|| {
            let connector = connector.clone();
            async move { connector.link_count() == 1 }
        })
        .await;

        let again = connector.lookup(&"c1".into()).await.unwrap();
        assert!(Arc::ptr_eq(&again, &second));
    }

    #[tokio::test]
    async fn test_rejected_open_does_not_block_others() {
        let connector = connector();
        let (link, _agent) = spawn_agent(&["c9", "c1"], &["c9"]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        connector.interaction(&cancel, &"c1".into()).await.unwrap();
        assert_eq!(connector.ids().await, vec![ContainerId::from("c1")]);
    }

    #[tokio::test]
    async fn test_announced_containers_are_registered() {
        let connector = connector();
        let (link, agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        connector.interaction(&cancel, &"c1".into()).await.unwrap();

        let reply = agent
            .mux
            .global_request(msgs::CONTAINERS_REQ, true, msgs::encode_containers(&["c2"]))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);

        let c2 = connector
            .interaction_within(&cancel, &"c2".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(c2.id().as_str(), "c2");
    }

    #[tokio::test]
    async fn test_fork_closes_link() {
        let connector = connector();
        let (link, agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        connector.interaction(&cancel, &"c1".into()).await.unwrap();

        let reply = agent
            .mux
            .global_request(msgs::FORK_REQ, true, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);

        tokio::time::timeout(Duration::from_secs(5), agent.mux.closed())
            .await
            .unwrap();
        wait_until(|| {
            let connector = connector.clone();
            async move { connector.ids().await.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let connector = connector();
        let cancel = CancellationToken::new();

        let waiter = {
            let connector = connector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.interaction(&cancel, &"c1".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        connector.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.err(), Some(ConnectorError::Stopped));
        assert_eq!(
            connector.interaction(&cancel, &"c1".into()).await.err(),
            Some(ConnectorError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_remove_interaction_closes() {
        let connector = connector();
        let (link, _agent) = spawn_agent(&["c1"], &[]);
        connector.serve_link(link);

        let cancel = CancellationToken::new();
        let c1 = connector.interaction(&cancel, &"c1".into()).await.unwrap();
        connector.remove_interaction(&"c1".into()).await;
        assert!(c1.is_closed());
        assert!(connector.ids().await.is_empty());
    }
}
