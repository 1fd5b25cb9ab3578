//! BLE Connection Module
//!
//! A [`Connection`] drives one peripheral through
//! `Disconnected → Connecting → Discovering → Ready → Disconnecting`, owns
//! the operation queue that serializes GATT transactions on the link and
//! fans notifications out to [`NotificationStream`]s.
//!
//! Every connect attempt runs under an epoch number. Disconnect and link
//! loss bump the epoch, and background tasks belonging to an older epoch
//! stop touching state as soon as they notice.

use crate::domain::capability::RequiredCapabilitySet;
use crate::domain::error::{CapabilityError, ConnectError, GattError, OperationError};
use crate::domain::models::{
    CharacteristicHandle, CharacteristicRef, ConnectionState, DeviceId, DisconnectReason,
    LinkEvent, LinkHandle, NotificationEvent, Property, StreamClosed,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, DEFAULT_ATT_MTU, MAX_ATT_MTU};
use crate::infrastructure::bluetooth::queue::{Dispatch, OperationQueue};
use crate::infrastructure::bluetooth::resolver::{self, ResolvedHandles};
use crate::infrastructure::bluetooth::transaction::{
    self, OperationTimeouts, Outcome, TransactionKind, TransactionOutput, TransactionRequest,
    TransactionResult,
};
use crate::infrastructure::bluetooth::transport::{
    AdapterNotifications, OpenedLink, TransportAdapter,
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Roles the device must provide before it is `Ready`
    pub capabilities: RequiredCapabilitySet,
    /// Per-class GATT operation deadlines and retry budget
    pub timeouts: OperationTimeouts,
    /// Deadline for one link establishment attempt
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    /// How long to wait for the adapter to confirm a local disconnect
    pub disconnect_timeout: Duration,
    /// Extra link establishment attempts after a failed one
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    /// ATT MTU requested once the link is up
    pub preferred_mtu: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            capabilities: RequiredCapabilitySet::new(protocol::control_profile())
                .unwrap_or_default(),
            timeouts: OperationTimeouts::default(),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            connect_retries: 2,
            connect_retry_delay: Duration::from_millis(100),
            preferred_mtu: 247,
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, CapabilityError> {
        Ok(Self {
            capabilities: RequiredCapabilitySet::new(settings.profile.clone())?,
            timeouts: OperationTimeouts {
                read: Duration::from_millis(settings.read_timeout_ms),
                write: Duration::from_millis(settings.write_timeout_ms),
                subscribe: Duration::from_millis(settings.subscribe_timeout_ms),
                retries: settings.operation_retries,
            },
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            discovery_timeout: Duration::from_millis(settings.discovery_timeout_ms),
            disconnect_timeout: Duration::from_millis(settings.disconnect_timeout_ms),
            connect_retries: settings.connect_retries,
            connect_retry_delay: Duration::from_millis(settings.connect_retry_delay_ms),
            preferred_mtu: settings.preferred_mtu,
        })
    }

    pub fn with_capabilities(mut self, capabilities: RequiredCapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Role-level access requested by the application
#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

impl Access {
    fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// The live link of the current epoch
struct Session {
    link: LinkHandle,
    wakeup: Arc<Notify>,
    /// Set by the event pump once the adapter reported `Disconnected`
    closed: watch::Receiver<bool>,
}

struct Subscription {
    id: u64,
    subscribers: Vec<mpsc::UnboundedSender<NotificationEvent>>,
}

struct Shared {
    state: ConnectionState,
    epoch: u64,
    /// Why the previous epoch ended, reported to a connect that was overtaken
    abort_reason: Option<ConnectError>,
    session: Option<Session>,
    mtu: u16,
    resolved: Option<ResolvedHandles>,
    /// The peer reported `ServicesChanged` while discovery was running
    services_dirty: bool,
    queue: OperationQueue,
    subscriptions: HashMap<CharacteristicHandle, Subscription>,
    next_subscription: u64,
    last_failure: Option<ConnectError>,
}

impl Shared {
    /// Fail every queued transaction, close every stream and forget the
    /// resolved handles. Returns how many transactions were failed.
    fn teardown(&mut self, error: OperationError, reason: StreamClosed) -> usize {
        let failed = self.queue.fail_all(error);
        for (_, subscription) in self.subscriptions.drain() {
            for subscriber in subscription.subscribers {
                let _ = subscriber.send(NotificationEvent::Closed(reason));
            }
        }
        self.resolved = None;
        failed
    }

    fn aborted(&self) -> ConnectError {
        self.abort_reason.clone().unwrap_or(ConnectError::Aborted)
    }
}

struct Inner {
    device_id: DeviceId,
    adapter: Arc<dyn TransportAdapter>,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state == state {
            return;
        }
        info!("{}: {} -> {}", self.device_id, shared.state, state);
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    fn check_epoch(&self, epoch: u64) -> Result<(), ConnectError> {
        let shared = self.lock();
        if shared.epoch == epoch {
            Ok(())
        } else {
            Err(shared.aborted())
        }
    }

    /// `adapter.close` bounded by `disconnect_timeout`
    async fn close_link(&self, link: LinkHandle) -> Result<(), ConnectError> {
        let timeout = self.config.disconnect_timeout;
        tokio::time::timeout(timeout, self.adapter.close(link))
            .await
            .unwrap_or(Err(ConnectError::Timeout(timeout)))
    }

    /// One link establishment attempt: open, then wait for `Connected`
    async fn open_once(&self) -> Result<OpenedLink, ConnectError> {
        let timeout = self.config.connect_timeout;
        let deadline = Instant::now() + timeout;
        let mut opened = tokio::time::timeout_at(deadline, self.adapter.open(&self.device_id))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        let connected = tokio::time::timeout_at(deadline, async {
            while let Some(event) = opened.events.recv().await {
                match event {
                    LinkEvent::Connected => return Ok(()),
                    LinkEvent::Disconnected(reason) => {
                        debug!("{}: link dropped before connecting ({})", self.device_id, reason);
                        return Err(ConnectError::LinkLost);
                    }
                    LinkEvent::ServicesChanged => {}
                }
            }
            Err(ConnectError::LinkLost)
        })
        .await
        .unwrap_or(Err(ConnectError::Timeout(timeout)));

        match connected {
            Ok(()) => Ok(opened),
            Err(error) => {
                let _ = self.close_link(opened.handle).await;
                Err(error)
            }
        }
    }

    async fn open_with_retry(&self, epoch: u64) -> Result<OpenedLink, ConnectError> {
        let attempts = self.config.connect_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            self.check_epoch(epoch)?;
            match self.open_once().await {
                Ok(opened) => return Ok(opened),
                Err(error) if attempt < attempts && is_retryable(&error) => {
                    warn!(
                        "{}: connect attempt {}/{} failed: {}. Retrying in {:?}",
                        self.device_id, attempt, attempts, error, self.config.connect_retry_delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn negotiate_mtu(&self, epoch: u64, link: LinkHandle) {
        let requested = self.config.preferred_mtu;
        let negotiated = tokio::time::timeout(
            self.config.timeouts.write,
            self.adapter.request_mtu(link, requested),
        )
        .await;
        match negotiated {
            Ok(Ok(mtu)) => {
                let mtu = mtu.clamp(DEFAULT_ATT_MTU, MAX_ATT_MTU);
                let mut shared = self.lock();
                if shared.epoch == epoch {
                    shared.mtu = mtu;
                }
                debug!("{}: MTU {} (requested {})", self.device_id, mtu, requested);
            }
            Ok(Err(e)) => warn!("{}: MTU negotiation failed, keeping {}: {}", self.device_id, DEFAULT_ATT_MTU, e),
            Err(_) => warn!("{}: MTU negotiation timed out, keeping {}", self.device_id, DEFAULT_ATT_MTU),
        }
    }

    /// Enumerate services and bind every required role
    async fn resolve_services(&self, link: LinkHandle) -> Result<ResolvedHandles, ConnectError> {
        let timeout = self.config.discovery_timeout;
        let services = tokio::time::timeout(timeout, self.adapter.discover_services(link))
            .await
            .map_err(|_| crate::domain::error::DiscoveryError::Timeout(timeout))??;
        debug!(
            "{}: discovered {} services, {} characteristics",
            self.device_id,
            services.services.len(),
            services.characteristic_count()
        );
        let resolved = resolver::resolve(&self.config.capabilities, &services)?;
        debug!(
            "{}: resolved roles [{}]",
            self.device_id,
            resolved.roles().collect::<Vec<_>>().join(", ")
        );
        Ok(resolved)
    }

    /// Discover and resolve until the table is stable, then go `Ready`.
    /// A `ServicesChanged` seen while discovery ran discards its result,
    /// including a failed resolution against the old table.
    async fn discover(&self, epoch: u64, link: LinkHandle) -> Result<(), ConnectError> {
        loop {
            {
                let mut shared = self.lock();
                if shared.epoch != epoch {
                    return Err(shared.aborted());
                }
                shared.services_dirty = false;
            }

            let result = self.resolve_services(link).await;

            {
                let mut shared = self.lock();
                if shared.epoch != epoch || shared.state != ConnectionState::Discovering {
                    return Err(shared.aborted());
                }
                if !shared.services_dirty {
                    shared.resolved = Some(result?);
                    self.set_state(&mut shared, ConnectionState::Ready);
                    return Ok(());
                }
            }
            info!("{}: services changed during discovery, discovering again", self.device_id);
        }
    }

    /// End the epoch with `error` and move to `Failed`. An epoch that was
    /// already overtaken reports why instead.
    async fn fail(&self, epoch: u64, error: ConnectError) -> ConnectError {
        let link = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                return shared.aborted();
            }
            shared.epoch += 1;
            let session = shared.session.take();
            if let Some(session) = &session {
                session.wakeup.notify_one();
            }
            shared.teardown(OperationError::LinkLost, StreamClosed::LinkLost);
            shared.last_failure = Some(error.clone());
            self.set_state(&mut shared, ConnectionState::Failed);
            session.map(|s| s.link)
        };
        error!("Connection to {} failed: {}", self.device_id, error);
        if let Some(link) = link {
            if let Err(e) = self.close_link(link).await {
                debug!("{}: close after failure: {}", self.device_id, e);
            }
        }
        error
    }

    fn on_link_lost(&self, epoch: u64, reason: DisconnectReason) {
        let mut shared = self.lock();
        if shared.epoch != epoch {
            trace!("{}: ignoring disconnect of a finished link", self.device_id);
            return;
        }
        warn!("{}: link lost in state {} ({})", self.device_id, shared.state, reason);
        let connecting = shared.state != ConnectionState::Ready;
        shared.epoch += 1;
        shared.abort_reason = Some(ConnectError::LinkLost);
        if connecting {
            shared.last_failure = Some(ConnectError::LinkLost);
        }
        if let Some(session) = shared.session.take() {
            session.wakeup.notify_one();
        }
        let failed = shared.teardown(OperationError::LinkLost, StreamClosed::LinkLost);
        if failed > 0 {
            debug!("{}: failed {} transactions on link loss", self.device_id, failed);
        }
        self.set_state(&mut shared, ConnectionState::Disconnected);
    }

    fn on_services_changed(self: &Arc<Self>, epoch: u64) {
        let link = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                return;
            }
            match shared.state {
                ConnectionState::Ready => {}
                ConnectionState::Discovering => {
                    debug!("{}: services changed during discovery", self.device_id);
                    shared.services_dirty = true;
                    return;
                }
                state => {
                    debug!("{}: services changed in state {}, ignored", self.device_id, state);
                    return;
                }
            }
            let Some(link) = shared.session.as_ref().map(|s| s.link) else {
                return;
            };
            info!("{}: services changed, resolving again", self.device_id);
            shared.teardown(
                OperationError::NotReady(ConnectionState::Discovering),
                StreamClosed::ServicesChanged,
            );
            self.set_state(&mut shared, ConnectionState::Discovering);
            link
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = inner.discover(epoch, link).await {
                inner.fail(epoch, error).await;
            }
        });
    }

    /// Hand the adapter result to the waiting caller
    fn complete(
        self: &Arc<Self>,
        epoch: u64,
        id: u64,
        request: TransactionRequest,
        result: Result<Outcome, OperationError>,
    ) {
        let mut shared = self.lock();
        // Already failed by teardown
        let Some(completion) = shared.queue.finish(id) else {
            return;
        };
        let handle = request.target.handle;
        let output = match result {
            Ok(Outcome::Value(value)) => Ok(TransactionOutput::Value(value)),
            Ok(Outcome::Written) => Ok(TransactionOutput::Written),
            Ok(Outcome::Subscribed(notifications)) => {
                shared.next_subscription += 1;
                let subscription_id = shared.next_subscription;
                let mut subscribers = shared
                    .subscriptions
                    .remove(&handle)
                    .map(|s| s.subscribers)
                    .unwrap_or_default();
                subscribers.extend(request.subscriber);
                shared.subscriptions.insert(
                    handle,
                    Subscription {
                        id: subscription_id,
                        subscribers,
                    },
                );
                tokio::spawn(forward_notifications(
                    Arc::downgrade(self),
                    epoch,
                    handle,
                    subscription_id,
                    notifications,
                ));
                debug!("{}: subscribed to {}", self.device_id, request.target);
                Ok(TransactionOutput::Subscribed)
            }
            Ok(Outcome::Unsubscribed) => {
                if let Some(subscription) = shared.subscriptions.remove(&handle) {
                    for subscriber in subscription.subscribers {
                        let _ = subscriber.send(NotificationEvent::Closed(StreamClosed::Unsubscribed));
                    }
                }
                Ok(TransactionOutput::Unsubscribed)
            }
            Err(e) => {
                warn!(
                    "{}: {} on {} failed: {}",
                    self.device_id,
                    request.kind.name(),
                    request.target,
                    e
                );
                Err(e)
            }
        };
        completion.complete(output);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(|e| e.into_inner());
        shared.queue.fail_all(OperationError::LinkLost);
        if let Some(session) = shared.session.take() {
            session.wakeup.notify_one();
            let link = session.link;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let adapter = Arc::clone(&self.adapter);
                runtime.spawn(async move {
                    let _ = adapter.close(link).await;
                });
            }
        }
    }
}

fn is_retryable(error: &ConnectError) -> bool {
    matches!(
        error,
        ConnectError::Open(_) | ConnectError::Timeout(_) | ConnectError::LinkLost
    )
}

/// Forward link events of one epoch into the state machine
async fn pump_events(
    inner: Weak<Inner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    closed: watch::Sender<bool>,
) {
    let mut reason = DisconnectReason::Other(0);
    while let Some(event) = events.recv().await {
        let Some(conn) = inner.upgrade() else {
            break;
        };
        match event {
            LinkEvent::Connected => debug!("{}: link up", conn.device_id),
            LinkEvent::ServicesChanged => conn.on_services_changed(epoch),
            LinkEvent::Disconnected(r) => {
                reason = r;
                break;
            }
        }
    }
    closed.send_replace(true);
    if let Some(conn) = inner.upgrade() {
        conn.on_link_lost(epoch, reason);
    }
}

/// Drain the operation queue of one epoch, one transaction at a time
async fn run_dispatcher(inner: Weak<Inner>, epoch: u64, link: LinkHandle, wakeup: Arc<Notify>) {
    loop {
        let (next, adapter) = {
            let Some(conn) = inner.upgrade() else {
                return;
            };
            let mut shared = conn.lock();
            if shared.epoch != epoch {
                return;
            }
            let next = shared.queue.begin_next();
            drop(shared);
            (next, Arc::clone(&conn.adapter))
        };
        let Some(Dispatch {
            id,
            request,
            mut abort,
        }) = next
        else {
            wakeup.notified().await;
            continue;
        };

        trace!("Dispatching {} #{} on {}", request.kind.name(), id, request.target);
        let result = tokio::select! {
            result = transaction::execute(adapter.as_ref(), link, &request) => result,
            _ = &mut abort => continue,
        };

        match inner.upgrade() {
            Some(conn) => conn.complete(epoch, id, request, result),
            None => return,
        }
    }
}

async fn forward_notifications(
    inner: Weak<Inner>,
    epoch: u64,
    handle: CharacteristicHandle,
    subscription_id: u64,
    mut notifications: AdapterNotifications,
) {
    while let Some(payload) = notifications.recv().await {
        let Some(conn) = inner.upgrade() else {
            return;
        };
        let mut shared = conn.lock();
        if shared.epoch != epoch {
            return;
        }
        let Some(subscription) = shared
            .subscriptions
            .get_mut(&handle)
            .filter(|s| s.id == subscription_id)
        else {
            return;
        };
        trace!("Notification on {}: {:02X?}", handle, payload);
        subscription
            .subscribers
            .retain(|tx| tx.send(NotificationEvent::Payload(payload.clone())).is_ok());
    }
}

async fn wait(rx: oneshot::Receiver<TransactionResult>) -> TransactionResult {
    // A dropped completion means the connection itself went away
    rx.await.unwrap_or(Err(OperationError::LinkLost))
}

fn unexpected(output: TransactionOutput) -> OperationError {
    OperationError::Gatt(GattError::Failure(format!(
        "unexpected transaction output {:?}",
        output
    )))
}

/// Connection to one peripheral
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.current_state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        device_id: DeviceId,
        adapter: Arc<dyn TransportAdapter>,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                device_id,
                adapter,
                config,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    abort_reason: None,
                    session: None,
                    mtu: DEFAULT_ATT_MTU,
                    resolved: None,
                    services_dirty: false,
                    queue: OperationQueue::new(),
                    subscriptions: HashMap::new(),
                    next_subscription: 0,
                    last_failure: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.current_state() == ConnectionState::Ready
    }

    /// Observe every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Why the last connect attempt ended in `Failed` (or lost its link)
    pub fn last_failure(&self) -> Option<ConnectError> {
        self.inner.lock().last_failure.clone()
    }

    /// Negotiated ATT MTU of the current link
    pub fn mtu(&self) -> u16 {
        self.inner.lock().mtu
    }

    /// Pending plus in-flight transactions
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn resolved_target(&self, role: &str) -> Option<CharacteristicRef> {
        self.inner
            .lock()
            .resolved
            .as_ref()
            .and_then(|r| r.get(role))
            .map(|r| r.target)
    }

    /// Establish the link, discover services and resolve every required role.
    ///
    /// Resolves once the connection is `Ready`. Any failure leaves it in
    /// `Failed` with the link closed; a concurrent [`Connection::disconnect`]
    /// makes this return [`ConnectError::Aborted`].
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let epoch = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Discovering => {
                    return Err(ConnectError::AlreadyConnecting)
                }
                ConnectionState::Ready | ConnectionState::Disconnecting => {
                    return Err(ConnectError::AlreadyConnected)
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {}
            }
            shared.epoch += 1;
            shared.abort_reason = None;
            shared.last_failure = None;
            shared.mtu = DEFAULT_ATT_MTU;
            self.inner.set_state(&mut shared, ConnectionState::Connecting);
            shared.epoch
        };

        info!("Connecting to {}", self.inner.device_id);
        match self.establish(epoch).await {
            Ok(()) => {
                info!("{} ready (MTU {})", self.inner.device_id, self.mtu());
                Ok(())
            }
            Err(error) => Err(self.inner.fail(epoch, error).await),
        }
    }

    async fn establish(&self, epoch: u64) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let OpenedLink { handle: link, events } = inner.open_with_retry(epoch).await?;

        let wakeup = Arc::new(Notify::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let overtaken = {
            let mut shared = inner.lock();
            if shared.epoch != epoch {
                Some(shared.aborted())
            } else {
                shared.session = Some(Session {
                    link,
                    wakeup: Arc::clone(&wakeup),
                    closed: closed_rx,
                });
                inner.set_state(&mut shared, ConnectionState::Discovering);
                None
            }
        };
        if let Some(reason) = overtaken {
            let _ = inner.close_link(link).await;
            return Err(reason);
        }

        tokio::spawn(pump_events(Arc::downgrade(inner), epoch, events, closed_tx));
        tokio::spawn(run_dispatcher(Arc::downgrade(inner), epoch, link, wakeup));

        inner.negotiate_mtu(epoch, link).await;
        inner.check_epoch(epoch)?;

        inner.discover(epoch, link).await
    }

    /// Validate a role access and queue it. Every rejection happens here,
    /// before anything reaches the adapter.
    fn enqueue(
        &self,
        role: &str,
        access: Access,
        payload: Vec<u8>,
        subscriber: Option<mpsc::UnboundedSender<NotificationEvent>>,
    ) -> Result<oneshot::Receiver<TransactionResult>, OperationError> {
        let mut shared = self.inner.lock();
        if shared.state != ConnectionState::Ready {
            return Err(OperationError::NotReady(shared.state));
        }
        let resolved = shared
            .resolved
            .as_ref()
            .and_then(|r| r.get(role))
            .copied()
            .ok_or_else(|| OperationError::UnknownRole(role.to_string()))?;

        let properties = resolved.properties;
        let kind = match access {
            Access::Read if properties.can_read() => TransactionKind::Read,
            Access::Write if properties.can_write() => {
                let max = protocol::max_write_len(shared.mtu);
                if payload.len() > max {
                    return Err(OperationError::PayloadTooLarge {
                        len: payload.len(),
                        max,
                    });
                }
                TransactionKind::Write {
                    ack_required: properties.has(Property::Write),
                }
            }
            Access::Subscribe if properties.can_notify() => TransactionKind::Subscribe,
            Access::Unsubscribe if properties.can_notify() => TransactionKind::Unsubscribe,
            _ => {
                return Err(OperationError::NotSupported {
                    role: role.to_string(),
                    operation: access.name(),
                })
            }
        };

        let mut request =
            TransactionRequest::new(kind, resolved.target, &self.inner.config.timeouts)
                .with_payload(payload);
        if let Some(subscriber) = subscriber {
            request = request.with_subscriber(subscriber);
        }
        let (id, rx) = shared.queue.push(request);
        if let Some(session) = &shared.session {
            session.wakeup.notify_one();
        }
        trace!(
            "Queued {} #{} for role '{}' ({} in queue)",
            kind.name(),
            id,
            role,
            shared.queue.len()
        );
        Ok(rx)
    }

    pub async fn read_role(&self, role: &str) -> Result<Vec<u8>, OperationError> {
        let rx = self.enqueue(role, Access::Read, Vec::new(), None)?;
        match wait(rx).await? {
            TransactionOutput::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Write `data`; acknowledged when the characteristic supports write
    /// requests, a write command otherwise
    pub async fn write_role(&self, role: &str, data: &[u8]) -> Result<(), OperationError> {
        let rx = self.enqueue(role, Access::Write, data.to_vec(), None)?;
        match wait(rx).await? {
            TransactionOutput::Written => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open a notification stream for `role`. A role that is already
    /// subscribed gets another stream without a new subscription.
    pub async fn subscribe_role(&self, role: &str) -> Result<NotificationStream, OperationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let attached = {
            let mut shared = self.inner.lock();
            let handle = match shared.state {
                ConnectionState::Ready => shared
                    .resolved
                    .as_ref()
                    .and_then(|r| r.get(role))
                    .filter(|r| r.properties.can_notify())
                    .map(|r| r.target.handle),
                _ => None,
            };
            let subscription = match handle {
                Some(handle) => shared.subscriptions.get_mut(&handle),
                None => None,
            };
            match subscription {
                Some(subscription) => {
                    subscription.subscribers.push(tx.clone());
                    true
                }
                None => false,
            }
        };
        if attached {
            debug!("{}: joined subscription of '{}'", self.inner.device_id, role);
            return Ok(NotificationStream::new(role, rx));
        }

        let completion = self.enqueue(role, Access::Subscribe, Vec::new(), Some(tx))?;
        match wait(completion).await? {
            TransactionOutput::Subscribed => Ok(NotificationStream::new(role, rx)),
            other => Err(unexpected(other)),
        }
    }

    /// Disable notifications for `role`; its streams end with
    /// [`StreamClosed::Unsubscribed`]
    pub async fn unsubscribe_role(&self, role: &str) -> Result<(), OperationError> {
        let rx = self.enqueue(role, Access::Unsubscribe, Vec::new(), None)?;
        match wait(rx).await? {
            TransactionOutput::Unsubscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Tear the link down. Queued transactions fail with `LinkLost`, streams
    /// close and the connection ends `Disconnected` even if the adapter
    /// reports an error. Calling it again is a no-op.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        enum Step {
            Done,
            Wait,
            Close(Session),
        }

        let step = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Disconnected => Step::Done,
                ConnectionState::Failed => {
                    self.inner.set_state(&mut shared, ConnectionState::Disconnected);
                    Step::Done
                }
                ConnectionState::Disconnecting => Step::Wait,
                ConnectionState::Connecting
                | ConnectionState::Discovering
                | ConnectionState::Ready => {
                    shared.epoch += 1;
                    shared.abort_reason = Some(ConnectError::Aborted);
                    let failed = shared.teardown(OperationError::LinkLost, StreamClosed::LinkLost);
                    if failed > 0 {
                        debug!(
                            "{}: failed {} queued transactions on disconnect",
                            self.inner.device_id, failed
                        );
                    }
                    match shared.session.take() {
                        Some(session) => {
                            session.wakeup.notify_one();
                            self.inner
                                .set_state(&mut shared, ConnectionState::Disconnecting);
                            Step::Close(session)
                        }
                        None => {
                            self.inner.set_state(&mut shared, ConnectionState::Disconnected);
                            Step::Done
                        }
                    }
                }
            }
        };

        let mut session = match step {
            Step::Done => return Ok(()),
            Step::Wait => {
                let mut states = self.watch_state();
                let _ = states
                    .wait_for(|s| *s != ConnectionState::Disconnecting)
                    .await
                    .map(|_| ());
                return Ok(());
            }
            Step::Close(session) => session,
        };

        info!("Disconnecting from {}", self.inner.device_id);
        let result = self.inner.close_link(session.link).await;
        match &result {
            Ok(()) => {
                let timeout = self.inner.config.disconnect_timeout;
                let confirmed = tokio::time::timeout(timeout, session.closed.wait_for(|c| *c))
                    .await
                    .is_ok();
                if !confirmed {
                    warn!(
                        "{}: no disconnect event within {:?}, forcing Disconnected",
                        self.inner.device_id, timeout
                    );
                }
            }
            Err(e) => warn!("{}: adapter close failed: {}", self.inner.device_id, e),
        }

        {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Disconnecting {
                self.inner.set_state(&mut shared, ConnectionState::Disconnected);
            }
        }
        info!("Disconnected from {}", self.inner.device_id);
        result
    }
}

/// Ordered notification payloads of one subscribed role.
///
/// Yields [`NotificationEvent::Payload`] items, then exactly one
/// [`NotificationEvent::Closed`], then `None`.
pub struct NotificationStream {
    role: String,
    rx: mpsc::UnboundedReceiver<NotificationEvent>,
    finished: bool,
}

impl NotificationStream {
    fn new(role: &str, rx: mpsc::UnboundedReceiver<NotificationEvent>) -> Self {
        Self {
            role: role.to_string(),
            rx,
            finished: false,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub async fn next_event(&mut self) -> Option<NotificationEvent> {
        self.next().await
    }
}

impl Stream for NotificationStream {
    type Item = NotificationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, NotificationEvent::Closed(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
