//! TURN session client.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::allocation::{REFRESH_RATIO, TurnAllocation};
use super::channel::ChannelTable;
use super::permission::{PermissionTable, TurnPermission};
use super::transport::{self, TurnTransport};
use super::{
    MAX_LIFETIME, MIN_LIFETIME, TurnError, TurnEvent, TurnOptions, TurnServer, TurnState,
};
use crate::attribute::{ErrorCode, StunAttribute};
use crate::auth::StunAuthentication;
use crate::channel_data::{
    CHANNEL_HEADER_SIZE, ChannelData, MAX_CHANNEL_PAYLOAD, is_channel_data,
};
use crate::message::{MessageClass, Method, StunMessage, TransactionId};

/// Initial retransmission timeout for requests over UDP (RFC 5389 Section 7.2.1)
const INITIAL_RTO: Duration = Duration::from_millis(500);

/// Bound on the best-effort deallocation sent by `close`
const DEALLOCATE_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Largest payload a Send indication to `peer` can carry
///
/// The attribute section holds XOR-PEER-ADDRESS, the padded DATA attribute
/// and, when enabled, FINGERPRINT within the 16-bit length field.
fn max_indication_payload(peer: SocketAddr, fingerprint: bool) -> usize {
    let peer_attr = if peer.is_ipv4() { 4 + 8 } else { 4 + 20 };
    let fingerprint_attr = if fingerprint { 8 } else { 0 };
    let room = usize::from(u16::MAX) - peer_attr - CHANNEL_HEADER_SIZE - fingerprint_attr;
    room & !3
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}

/// Removes a transaction from the pending map when its waiter goes away
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<TransactionId, oneshot::Sender<StunMessage>>>,
    transaction_id: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.transaction_id);
    }
}

/// Mutable session bookkeeping
#[derive(Default)]
struct Session {
    realm: Option<String>,
    nonce: Option<String>,
    allocation: Option<TurnAllocation>,
    permissions: PermissionTable,
    channels: ChannelTable,
}

struct Inner {
    server: TurnServer,
    options: TurnOptions,
    state: Mutex<TurnState>,
    transport: Mutex<Option<Arc<dyn TurnTransport>>>,
    session: Mutex<Session>,
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<StunMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::Sender<TurnEvent>,
}

/// Client for one allocation on one TURN server
///
/// # Examples
///
/// ```no_run
/// use burrow_stun::turn::{TurnClient, TurnOptions, TurnServer};
///
/// # async fn example() -> Result<(), burrow_stun::turn::TurnError> {
/// let server = TurnServer::new("turn.example.org", "alice", "secret");
/// let client = TurnClient::new(server, TurnOptions::default());
/// let allocation = client.connect().await?;
/// println!("relayed at {}", allocation.relayed_address);
///
/// let peer = "203.0.113.7:40000".parse().unwrap();
/// client.create_permission(peer).await?;
/// client.send(peer, b"hello").await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct TurnClient {
    inner: Arc<Inner>,
    events: Mutex<Option<mpsc::Receiver<TurnEvent>>>,
}

impl TurnClient {
    /// Create a session in the `New` state
    #[must_use]
    pub fn new(server: TurnServer, options: TurnOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let realm = server.realm.clone();

        Self {
            inner: Arc::new(Inner {
                server,
                options,
                state: Mutex::new(TurnState::New),
                transport: Mutex::new(None),
                session: Mutex::new(Session {
                    realm,
                    ..Session::default()
                }),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                events: events_tx,
            }),
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the event queue
    ///
    /// Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TurnEvent>> {
        lock(&self.events).take()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TurnState {
        *lock(&self.inner.state)
    }

    /// Server this session talks to
    #[must_use]
    pub fn server(&self) -> &TurnServer {
        &self.inner.server
    }

    /// Active allocation, if any
    #[must_use]
    pub fn allocation(&self) -> Option<TurnAllocation> {
        lock(&self.inner.session).allocation.clone()
    }

    /// Relayed transport address of the active allocation
    #[must_use]
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.allocation().map(|a| a.relayed_address)
    }

    /// Valid permission for `peer`, if installed
    #[must_use]
    pub fn permission(&self, peer: IpAddr) -> Option<TurnPermission> {
        lock(&self.inner.session)
            .permissions
            .get_valid(peer, Instant::now())
            .cloned()
    }

    /// Channel bound to `peer`, if any
    #[must_use]
    pub fn channel(&self, peer: SocketAddr) -> Option<u16> {
        lock(&self.inner.session).channels.number_for(peer)
    }

    /// Open the server transport and allocate a relay address
    ///
    /// # Errors
    ///
    /// Returns `TurnError::InvalidState` unless the session is `New`, and
    /// the transport or Allocate failure otherwise. The session is `Failed`
    /// after any failure.
    pub async fn connect(&self) -> Result<TurnAllocation, TurnError> {
        self.inner.transition(&[TurnState::New], TurnState::Connecting)?;

        match transport::open(&self.inner.server).await {
            Ok(transport) => self.establish(transport).await,
            Err(e) => {
                warn!(server = %self.inner.server.host, error = %e, "TURN transport failed");
                self.inner.set_state(TurnState::Failed);
                Err(e)
            }
        }
    }

    /// Allocate over a transport supplied by the caller
    ///
    /// # Errors
    ///
    /// See [`TurnClient::connect`].
    pub async fn connect_with(
        &self,
        transport: Arc<dyn TurnTransport>,
    ) -> Result<TurnAllocation, TurnError> {
        self.inner.transition(&[TurnState::New], TurnState::Connecting)?;
        self.establish(transport).await
    }

    async fn establish(
        &self,
        transport: Arc<dyn TurnTransport>,
    ) -> Result<TurnAllocation, TurnError> {
        *lock(&self.inner.transport) = Some(Arc::clone(&transport));
        let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), transport));
        lock(&self.inner.tasks).push(reader);

        self.inner.set_state(TurnState::Allocating);

        match self.inner.allocate().await {
            Ok(allocation) => {
                info!(
                    server = %self.inner.server.host,
                    relayed = %allocation.relayed_address,
                    lifetime = ?allocation.lifetime,
                    "TURN allocation ready"
                );
                self.inner.set_state(TurnState::Ready);

                let refresh = tokio::spawn(refresh_loop(Arc::clone(&self.inner)));
                let sweep = tokio::spawn(sweep_loop(Arc::clone(&self.inner)));
                lock(&self.inner.tasks).extend([refresh, sweep]);
                Ok(allocation)
            }
            Err(e) => {
                warn!(server = %self.inner.server.host, error = %e, "TURN allocation failed");
                self.inner.abort_tasks();
                self.inner.fail_pending();
                *lock(&self.inner.transport) = None;
                self.inner.set_state(TurnState::Failed);
                Err(e)
            }
        }
    }

    /// Refresh the allocation now
    ///
    /// Requests `lifetime` when given, otherwise the current lifetime.
    /// Returns the lifetime granted by the server.
    ///
    /// # Errors
    ///
    /// Returns `TurnError::InvalidState` unless `Ready`, and the Refresh
    /// failure otherwise.
    pub async fn refresh(&self, lifetime: Option<Duration>) -> Result<Duration, TurnError> {
        self.inner.ensure_ready()?;
        self.inner.refresh(lifetime).await
    }

    /// Install a permission for `peer`
    ///
    /// An unexpired permission for the peer IP is returned without contacting
    /// the server.
    ///
    /// # Errors
    ///
    /// Returns `TurnError::Timeout` if the server does not answer within the
    /// permission timeout, or the error response it sent.
    pub async fn create_permission(&self, peer: SocketAddr) -> Result<TurnPermission, TurnError> {
        self.inner.ensure_ready()?;

        if let Some(existing) = self.permission(peer.ip()) {
            trace!(%peer, "Reusing TURN permission");
            return Ok(existing);
        }

        let build = || {
            StunMessage::request(Method::CreatePermission)
                .with_attribute(StunAttribute::XorPeerAddress(peer))
        };
        tokio::time::timeout(
            self.inner.options.permission_timeout,
            self.inner.transact_authenticated(build, "CreatePermission"),
        )
        .await
        .map_err(|_| TurnError::Timeout("CreatePermission"))??;

        let permission = lock(&self.inner.session).permissions.confirm(
            peer.ip(),
            self.inner.options.permission_lifetime,
            None,
            Instant::now(),
        );
        debug!(%peer, "TURN permission installed");
        Ok(permission)
    }

    /// Bind a channel to `peer`
    ///
    /// An existing binding is returned without contacting the server. A
    /// successful bind also installs or refreshes the peer's permission.
    ///
    /// # Errors
    ///
    /// Returns `TurnError::ChannelsExhausted` when every number is in use,
    /// or the ChannelBind failure.
    pub async fn bind_channel(&self, peer: SocketAddr) -> Result<u16, TurnError> {
        self.inner.ensure_ready()?;

        let number = {
            let mut session = lock(&self.inner.session);
            if let Some(existing) = session.channels.number_for(peer) {
                return Ok(existing);
            }
            session
                .channels
                .reserve()
                .ok_or(TurnError::ChannelsExhausted)?
        };

        let build = || {
            StunMessage::request(Method::ChannelBind)
                .with_attribute(StunAttribute::ChannelNumber(number))
                .with_attribute(StunAttribute::XorPeerAddress(peer))
        };

        match self.inner.transact_authenticated(build, "ChannelBind").await {
            Ok(_) => {
                let mut session = lock(&self.inner.session);
                // A concurrent bind for the same peer won
                if let Some(existing) = session.channels.number_for(peer) {
                    session.channels.release(number);
                    return Ok(existing);
                }
                session.channels.bind(number, peer);
                session.permissions.confirm(
                    peer.ip(),
                    self.inner.options.permission_lifetime,
                    Some(number),
                    Instant::now(),
                );
                debug!(%peer, channel = number, "TURN channel bound");
                Ok(number)
            }
            Err(e) => {
                lock(&self.inner.session).channels.release(number);
                Err(e)
            }
        }
    }

    /// Relay `data` to `peer`
    ///
    /// Uses ChannelData when a channel is bound, a Send indication otherwise.
    ///
    /// # Errors
    ///
    /// Returns `TurnError::InvalidState` unless `Ready`,
    /// `TurnError::PayloadTooLarge` if `data` does not fit the framing, or
    /// the transport error.
    pub async fn send(&self, peer: SocketAddr, data: &[u8]) -> Result<(), TurnError> {
        self.inner.ensure_ready()?;
        let transport = self.inner.transport()?;
        let channel = lock(&self.inner.session).channels.number_for(peer);

        let max = match channel {
            Some(_) => MAX_CHANNEL_PAYLOAD,
            None => max_indication_payload(peer, self.inner.options.fingerprint),
        };
        if data.len() > max {
            return Err(TurnError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        let frame = match channel {
            Some(number) => ChannelData::new(number, data).encode(transport.is_stream())?,
            None => {
                let mut indication = StunMessage::indication(Method::Send)
                    .with_attribute(StunAttribute::XorPeerAddress(peer))
                    .with_attribute(StunAttribute::Data(data.to_vec()));
                if self.inner.options.fingerprint {
                    indication.add_fingerprint();
                }
                indication.try_encode()?
            }
        };

        transport.send(&frame).await?;
        Ok(())
    }

    /// Remove expired permissions and their channels now
    ///
    /// Returns the peers whose permissions lapsed. The background sweep
    /// calls this on its own schedule.
    pub fn sweep_permissions(&self) -> Vec<IpAddr> {
        self.inner.sweep_permissions(Instant::now())
    }

    /// Release the allocation and stop background work
    ///
    /// Sends a best-effort Refresh with lifetime 0, removes every permission
    /// (emitting `PermissionExpired` for each) and moves to `Closed`. Calling
    /// it again is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; deallocation failures are logged.
    pub async fn close(&self) -> Result<(), TurnError> {
        let previous = {
            let mut state = lock(&self.inner.state);
            let previous = *state;
            if previous == TurnState::Closed {
                return Ok(());
            }
            *state = TurnState::Closed;
            previous
        };

        self.inner.abort_background();

        if previous == TurnState::Ready {
            let build = || {
                StunMessage::request(Method::Refresh).with_attribute(StunAttribute::Lifetime(0))
            };
            match tokio::time::timeout(
                DEALLOCATE_TIMEOUT,
                self.inner.transact_authenticated(build, "Deallocate"),
            )
            .await
            {
                Ok(Ok(_)) => debug!(server = %self.inner.server.host, "TURN allocation released"),
                Ok(Err(e)) => debug!(error = %e, "TURN deallocation failed"),
                Err(_) => debug!("TURN deallocation timed out"),
            }
        }

        self.inner.teardown();
        self.inner.emit(TurnEvent::StateChanged(TurnState::Closed));
        info!(server = %self.inner.server.host, "TURN session closed");
        Ok(())
    }
}

impl Drop for TurnClient {
    fn drop(&mut self) {
        self.inner.abort_tasks();
    }
}

impl std::fmt::Debug for TurnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnClient")
            .field("server", &self.inner.server)
            .field("state", &self.state())
            .field("relayed_address", &self.relayed_address())
            .finish()
    }
}

impl Inner {
    fn set_state(&self, next: TurnState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.emit(TurnEvent::StateChanged(next));
        }
    }

    fn transition(&self, from: &[TurnState], to: TurnState) -> Result<(), TurnError> {
        {
            let mut state = lock(&self.state);
            if !from.contains(&*state) {
                return Err(TurnError::InvalidState(*state));
            }
            *state = to;
        }
        self.emit(TurnEvent::StateChanged(to));
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), TurnError> {
        match *lock(&self.state) {
            TurnState::Ready => Ok(()),
            other => Err(TurnError::InvalidState(other)),
        }
    }

    fn transport(&self) -> Result<Arc<dyn TurnTransport>, TurnError> {
        lock(&self.transport).clone().ok_or(TurnError::Closed)
    }

    fn emit(&self, event: TurnEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "TURN event queue full, dropping event");
            }
            // Nobody is listening
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn abort_background(&self) {
        // Reader stays alive so in-flight transactions can complete
        let mut tasks = lock(&self.tasks);
        if tasks.len() > 1 {
            for task in tasks.drain(1..) {
                task.abort();
            }
        }
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes waiters with `TurnError::Closed`
        lock(&self.pending).clear();
    }

    /// Stop every task, release the transport and forget the allocation
    ///
    /// Each removed permission is reported as `PermissionExpired`.
    fn teardown(&self) {
        self.abort_tasks();
        self.fail_pending();
        *lock(&self.transport) = None;

        let expired = {
            let mut session = lock(&self.session);
            session.allocation = None;
            session.channels.clear();
            session.permissions.drain()
        };
        for permission in expired {
            self.emit(TurnEvent::PermissionExpired {
                peer: permission.peer,
            });
        }
    }

    async fn allocate(&self) -> Result<TurnAllocation, TurnError> {
        let lifetime = self.options.requested_lifetime();
        let protocol = self.server.transport;

        let build = || {
            StunMessage::request(Method::Allocate)
                .with_attribute(StunAttribute::RequestedTransport(
                    protocol.protocol_number(),
                ))
                .with_attribute(StunAttribute::Lifetime(lifetime_secs(lifetime)))
        };
        let response = self.transact_authenticated(build, "Allocate").await?;

        let relayed_address = response
            .xor_relayed_address()
            .ok_or(TurnError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
        let granted = response
            .lifetime()
            .map_or(lifetime, |secs| Duration::from_secs(u64::from(secs)));

        let allocation = TurnAllocation {
            relayed_address,
            mapped_address: response.xor_mapped_address(),
            lifetime: granted,
            protocol,
            secure: self.server.secure,
            last_verified: Instant::now(),
        };
        lock(&self.session).allocation = Some(allocation.clone());
        Ok(allocation)
    }

    async fn refresh(&self, lifetime: Option<Duration>) -> Result<Duration, TurnError> {
        let requested = match lifetime {
            Some(lifetime) => lifetime.clamp(MIN_LIFETIME, MAX_LIFETIME),
            None => lock(&self.session)
                .allocation
                .as_ref()
                .map(|a| a.lifetime)
                .ok_or(TurnError::Closed)?,
        };

        let build = || {
            StunMessage::request(Method::Refresh)
                .with_attribute(StunAttribute::Lifetime(lifetime_secs(requested)))
        };
        let response = self.transact_authenticated(build, "Refresh").await?;

        let granted = response
            .lifetime()
            .map_or(requested, |secs| Duration::from_secs(u64::from(secs)));
        if let Some(allocation) = lock(&self.session).allocation.as_mut() {
            allocation.lifetime = granted;
            allocation.last_verified = Instant::now();
        }
        Ok(granted)
    }

    fn sweep_permissions(&self, now: Instant) -> Vec<IpAddr> {
        let expired = {
            let mut session = lock(&self.session);
            let expired = session.permissions.sweep(now);
            for permission in &expired {
                session.channels.release_ip(permission.peer);
            }
            expired
        };

        expired
            .into_iter()
            .map(|permission| {
                debug!(peer = %permission.peer, "TURN permission expired");
                self.emit(TurnEvent::PermissionExpired {
                    peer: permission.peer,
                });
                permission.peer
            })
            .collect()
    }

    /// Add credentials, SOFTWARE and FINGERPRINT to an outgoing request
    fn decorate(&self, message: &mut StunMessage) -> Result<(), TurnError> {
        let (realm, nonce) = {
            let session = lock(&self.session);
            (session.realm.clone(), session.nonce.clone())
        };

        if let Some(software) = &self.options.software {
            message.add_attribute(StunAttribute::Software(software.clone()));
        }
        message.add_attribute(StunAttribute::Username(self.server.username.clone()));
        if let Some(realm) = &realm {
            message.add_attribute(StunAttribute::Realm(realm.clone()));
        }

        if let (Some(realm), Some(nonce)) = (realm, nonce) {
            message.add_attribute(StunAttribute::Nonce(nonce));
            let auth = StunAuthentication::new(
                self.server.username.clone(),
                self.server.password.clone(),
                Some(realm),
            );
            message.add_message_integrity(&auth)?;
        }

        if self.options.fingerprint {
            message.add_fingerprint();
        }
        Ok(())
    }

    /// Run a request, answering one 401/438 challenge
    ///
    /// A 401 is retried when we had not sent a nonce yet; a 438 is retried
    /// once with the fresh nonce. A second rejection surfaces as
    /// `TurnError::StaleCredential`.
    async fn transact_authenticated<F>(
        &self,
        build: F,
        what: &'static str,
    ) -> Result<StunMessage, TurnError>
    where
        F: Fn() -> StunMessage,
    {
        for attempt in 0..2 {
            let had_nonce = lock(&self.session).nonce.is_some();
            let mut request = build();
            self.decorate(&mut request)?;

            let response = self.transact(request, what).await?;
            match response.class() {
                MessageClass::SuccessResponse => return Ok(response),
                MessageClass::ErrorResponse => {
                    let error = response
                        .error_code()
                        .cloned()
                        .ok_or(TurnError::MissingAttribute("ERROR-CODE"))?;

                    let challenge = error.code == ErrorCode::STALE_NONCE
                        || (error.code == ErrorCode::UNAUTHORIZED && !had_nonce);

                    if challenge && response.nonce().is_some() {
                        if attempt == 0 {
                            debug!(request = what, code = error.code, "Answering TURN challenge");
                            let mut session = lock(&self.session);
                            session.nonce = response.nonce().map(str::to_owned);
                            if let Some(realm) = response.realm() {
                                session.realm = Some(realm.to_owned());
                            }
                            continue;
                        }
                        return Err(TurnError::StaleCredential);
                    }

                    return Err(TurnError::ErrorResponse {
                        code: error.code,
                        reason: error.reason,
                    });
                }
                _ => return Err(TurnError::Protocol(crate::StunError::InvalidMessageType)),
            }
        }
        Err(TurnError::StaleCredential)
    }

    /// Send a request and wait for the response with its transaction id
    async fn transact(
        &self,
        request: StunMessage,
        what: &'static str,
    ) -> Result<StunMessage, TurnError> {
        let transport = self.transport()?;
        let bytes = request.try_encode()?;
        let (tx, mut rx) = oneshot::channel();
        let transaction_id = request.transaction_id;
        lock(&self.pending).insert(transaction_id, tx);
        // Also covers callers that stop waiting early
        let _pending = PendingGuard {
            pending: &self.pending,
            transaction_id,
        };

        trace!(request = what, len = bytes.len(), "Sending TURN request");
        transport.send(&bytes).await?;

        let deadline = Instant::now() + self.options.request_timeout;
        let mut rto = INITIAL_RTO;
        let mut retransmit_at = Instant::now() + rto;

        let response = loop {
            tokio::select! {
                response = &mut rx => break response.map_err(|_| TurnError::Closed)?,
                () = tokio::time::sleep_until(deadline) => return Err(TurnError::Timeout(what)),
                () = tokio::time::sleep_until(retransmit_at), if !transport.is_stream() => {
                    trace!(request = what, "Retransmitting TURN request");
                    transport.send(&bytes).await?;
                    rto *= 2;
                    retransmit_at = Instant::now() + rto;
                }
            }
        };

        if response.method() != request.method() {
            return Err(TurnError::Protocol(crate::StunError::TransactionMismatch));
        }
        Ok(response)
    }

    fn handle_frame(&self, frame: &[u8]) {
        if is_channel_data(frame) {
            match ChannelData::decode(frame) {
                Ok(data) => self.deliver_channel_data(data),
                Err(e) => trace!(error = %e, "Dropping malformed ChannelData"),
            }
            return;
        }

        let message = match StunMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                trace!(error = %e, "Dropping undecodable frame from TURN server");
                return;
            }
        };

        if message.class().is_response() {
            match lock(&self.pending).remove(&message.transaction_id) {
                Some(waiter) => {
                    // Waiter may have timed out already
                    let _ = waiter.send(message);
                }
                None => trace!("Dropping response to unknown transaction"),
            }
            return;
        }

        if message.class() == MessageClass::Indication && message.method() == Method::Data {
            let (Some(peer), Some(payload)) = (message.xor_peer_address(), message.data()) else {
                trace!("Dropping Data indication without peer or payload");
                return;
            };
            self.deliver(peer, payload.to_vec());
            return;
        }

        trace!(method = ?message.method(), class = ?message.class(), "Ignoring TURN message");
    }

    fn deliver_channel_data(&self, data: ChannelData) {
        let peer = lock(&self.session).channels.peer_for(data.channel);
        match peer {
            Some(peer) => self.deliver(peer, data.payload),
            None => trace!(channel = data.channel, "Dropping data on unbound channel"),
        }
    }

    fn deliver(&self, peer: SocketAddr, payload: Vec<u8>) {
        let permitted = lock(&self.session)
            .permissions
            .is_permitted(peer.ip(), Instant::now());
        if permitted {
            self.emit(TurnEvent::Data { peer, payload });
        } else {
            debug!(%peer, "Dropping relayed data from peer without permission");
        }
    }
}

async fn read_loop(inner: Arc<Inner>, transport: Arc<dyn TurnTransport>) {
    loop {
        match transport.recv().await {
            Ok(frame) => inner.handle_frame(&frame),
            Err(e) => {
                warn!(error = %e, "TURN transport receive failed");
                inner.fail_pending();
                break;
            }
        }
    }
}

async fn refresh_loop(inner: Arc<Inner>) {
    let Some(mut delay) = lock(&inner.session)
        .allocation
        .as_ref()
        .map(TurnAllocation::refresh_delay)
    else {
        return;
    };

    loop {
        tokio::time::sleep(delay).await;

        match inner.refresh(None).await {
            Ok(lifetime) => {
                info!(lifetime = ?lifetime, "TURN allocation refreshed");
                inner.emit(TurnEvent::AllocationRefreshed { lifetime });
                delay = lifetime.mul_f64(REFRESH_RATIO);
            }
            Err(e) => {
                warn!(error = %e, "TURN refresh failed");
                inner.emit(TurnEvent::RefreshFailed {
                    reason: e.to_string(),
                });

                let remaining = lock(&inner.session)
                    .allocation
                    .as_ref()
                    .map_or(Duration::ZERO, |a| a.remaining(Instant::now()));
                if remaining.is_zero() {
                    warn!("TURN allocation lapsed");
                    // Also aborts this task
                    inner.teardown();
                    inner.set_state(TurnState::Failed);
                    return;
                }
                delay = remaining / 2;
            }
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>) {
    let period = inner.options.effective_sweep_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        inner.sweep_permissions(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;

    /// Accepts every frame and never answers
    struct Silent;

    #[async_trait]
    impl TurnTransport for Silent {
        async fn send(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn recv(&self) -> io::Result<Vec<u8>> {
            std::future::pending().await
        }

        fn is_stream(&self) -> bool {
            true
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("10.0.0.2:50000".parse().unwrap())
        }
    }

    fn ready_client(options: TurnOptions) -> TurnClient {
        let client = TurnClient::new(TurnServer::new("turn.burrow.test", "u", "p"), options);
        *lock(&client.inner.transport) = Some(Arc::new(Silent));
        client.inner.set_state(TurnState::Ready);
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_transaction_leaves_no_pending_entry() {
        let client = ready_client(TurnOptions {
            permission_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            ..TurnOptions::default()
        });
        let peer: SocketAddr = "203.0.113.7:40000".parse().unwrap();

        let result = client.create_permission(peer).await;

        assert!(matches!(result, Err(TurnError::Timeout("CreatePermission"))));
        assert!(lock(&client.inner.pending).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_leaves_no_pending_entry() {
        let client = ready_client(TurnOptions::default());

        let result = client.refresh(None).await;

        // No allocation recorded, so the refresh has nothing to renew
        assert!(matches!(result, Err(TurnError::Closed)));

        let result = client.refresh(Some(Duration::from_secs(600))).await;
        assert!(matches!(result, Err(TurnError::Timeout("Refresh"))));
        assert!(lock(&client.inner.pending).is_empty());
    }

    #[test]
    fn test_indication_payload_limit() {
        let v4: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:40000".parse().unwrap();

        assert_eq!(max_indication_payload(v4, true), 65_508);
        assert_eq!(max_indication_payload(v4, false), 65_516);
        assert_eq!(max_indication_payload(v6, true), 65_496);

        // The limit is exact: one more padded word overflows
        let mut fits = StunMessage::indication(Method::Send)
            .with_attribute(StunAttribute::XorPeerAddress(v4))
            .with_attribute(StunAttribute::Data(vec![0; 65_508]));
        fits.add_fingerprint();
        assert!(fits.try_encode().is_ok());

        let over = StunMessage::indication(Method::Send)
            .with_attribute(StunAttribute::XorPeerAddress(v4))
            .with_attribute(StunAttribute::Data(vec![0; 65_509]))
            .with_attribute(StunAttribute::Fingerprint(0));
        assert!(over.try_encode().is_err());
    }

    #[test]
    fn test_lifetime_seconds_saturate() {
        assert_eq!(lifetime_secs(Duration::from_secs(600)), 600);
        assert_eq!(lifetime_secs(Duration::from_secs(u64::MAX)), u32::MAX);
    }
}
