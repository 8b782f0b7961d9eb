use crate::core::config::{ClientConfig, RealtimeConfig};
use crate::core::errors::TransportError;
use crate::core::kernel::headers::HeaderComposer;
use crate::core::kernel::rest::HttpTransport;
use crate::core::kernel::signature::ElapsedSource;
use crate::core::kernel::ws::{HandshakeRequest, TungsteniteWs, WsSession};
use crate::core::types::{realtime_headers, Account, AUID, NDC_AUTH, NDC_DEVICE_ID, NDC_MSG_SIG};
use crate::realtime::clock::ElapsedClock;
use crate::realtime::codec::{Frame, NdcCodec, RealtimeEvent};
use crate::realtime::command::{Arg, CommandContext};
use crate::realtime::frames;
use crate::realtime::topic::EventTopic;
use futures_util::future::BoxFuture;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Connection state of a realtime session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Identity presented on the realtime handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeCredentials {
    pub device_id: String,
    pub user_id: String,
    pub session_id: String,
}

impl RealtimeCredentials {
    pub fn from_account(account: &Account) -> Self {
        Self {
            device_id: account.device_id.clone(),
            user_id: account.user.uid.clone(),
            session_id: account.session_id.clone(),
        }
    }
}

/// Everything a session needs besides its socket and namespace factory
#[derive(Clone)]
pub struct SessionOptions {
    pub config: RealtimeConfig,
    pub credentials: RealtimeCredentials,
    pub user_agent: String,
    pub composer: HeaderComposer,
    pub clock_source: Arc<dyn ElapsedSource>,
}

impl SessionOptions {
    /// Options sharing the transport's signer and signing service
    pub fn from_transport(
        transport: &Arc<HttpTransport>,
        config: &ClientConfig,
        account: &Account,
    ) -> Self {
        Self {
            config: config.realtime.clone(),
            credentials: RealtimeCredentials::from_account(account),
            user_agent: config.user_agent.clone(),
            composer: transport.composer().clone(),
            clock_source: transport.clone(),
        }
    }
}

/// Builds the per-community client handed to handlers
pub trait NamespaceFactory<C>: Send + 'static {
    fn namespace(&self, ndc_id: i64) -> C;
}

impl<C, F> NamespaceFactory<C> for F
where
    F: Fn(i64) -> C + Send + 'static,
{
    fn namespace(&self, ndc_id: i64) -> C {
        self(ndc_id)
    }
}

type Handler<C> =
    Arc<dyn Fn(C, RealtimeEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registry<C> {
    handlers: RwLock<HashMap<EventTopic, Vec<Handler<C>>>>,
    on_open: RwLock<Vec<Hook>>,
    on_close: RwLock<Vec<Hook>>,
}

impl<C> Registry<C> {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            on_open: RwLock::new(Vec::new()),
            on_close: RwLock::new(Vec::new()),
        }
    }

    fn handlers(&self, topic: EventTopic) -> Vec<Handler<C>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }

    fn run_hooks(hooks: &RwLock<Vec<Hook>>) {
        let hooks = hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
        for hook in hooks {
            tokio::spawn(hook());
        }
    }
}

enum SessionCommand {
    Send(Frame),
    Shutdown(oneshot::Sender<()>),
}

type VoiceThreads = Arc<Mutex<HashSet<String>>>;

/// Driver task owning the single realtime connection
///
/// Created together with its `RealtimeHandle`; register handlers on the handle,
/// then `spawn` the session.
pub struct RealtimeSession<W, C, F> {
    ws: W,
    config: RealtimeConfig,
    credentials: RealtimeCredentials,
    user_agent: String,
    composer: HeaderComposer,
    endpoint: String,
    allowed: Vec<String>,
    reconnect_at: Instant,
    /// A socket was opened and not yet closed, even if the link is down
    opened: bool,
    clock: Arc<ElapsedClock>,
    registry: Arc<Registry<C>>,
    namespaces: HashMap<i64, C>,
    factory: F,
    voice: VoiceThreads,
    state: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<W, C, F> RealtimeSession<W, C, F>
where
    W: WsSession<NdcCodec> + 'static,
    C: Clone + Send + Sync + 'static,
    F: NamespaceFactory<C>,
{
    pub fn new(ws: W, options: SessionOptions, factory: F) -> (Self, RealtimeHandle<C>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let clock = Arc::new(ElapsedClock::new(options.clock_source));
        let registry = Arc::new(Registry::new());
        let voice = VoiceThreads::default();

        let handle = RealtimeHandle {
            commands: command_tx,
            registry: registry.clone(),
            clock: clock.clone(),
            voice: voice.clone(),
            state: state_rx,
            keepalive_interval: options.config.voice_keepalive_interval,
        };

        let session = Self {
            ws,
            endpoint: options.config.initial_endpoint.clone(),
            allowed: options.config.endpoint_ids.clone(),
            reconnect_at: Instant::now() + options.config.reconnect_interval,
            opened: false,
            config: options.config,
            credentials: options.credentials,
            user_agent: options.user_agent,
            composer: options.composer,
            clock,
            registry,
            namespaces: HashMap::new(),
            factory,
            voice,
            state: state_tx,
            commands: command_rx,
        };

        (session, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        self.reconnect().await;

        loop {
            let deadline = sleep_until(self.reconnect_at);

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(frame)) => self.send(frame).await,
                        Some(SessionCommand::Shutdown(done)) => {
                            self.shutdown().await;
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            debug!("All handles dropped, stopping realtime session");
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                msg = self.ws.next_message(), if self.ws.is_connected() => {
                    match msg {
                        Some(Ok(event)) => self.dispatch(event),
                        Some(Err(e)) if e.is_network() => {
                            error!(endpoint = %self.endpoint, "Socket error: {}", e);
                            self.on_link_lost();
                            self.recover().await;
                        }
                        Some(Err(e)) => warn!("Dropping frame: {}", e),
                        None => {
                            info!(endpoint = %self.endpoint, "Socket closed by server");
                            self.on_link_lost();
                        }
                    }
                }

                () = deadline => {
                    info!(endpoint = %self.endpoint, "Periodic reconnect");
                    self.reconnect().await;
                }
            }
        }

        info!("Realtime session stopped");
    }

    /// Full re-handshake on the current endpoint, rotating while handshakes fail
    async fn reconnect(&mut self) {
        self.reconnect_at = Instant::now() + self.config.reconnect_interval;

        loop {
            match self.handshake().await {
                Ok(()) => {
                    self.set_state(SessionState::Connected);
                    info!(endpoint = %self.endpoint, "Socket connected");
                    if let Err(e) = self.clock.read().await {
                        warn!("Failed to prime elapsed clock: {}", e);
                    }
                    Registry::<C>::run_hooks(&self.registry.on_open);
                    return;
                }
                Err(e) => {
                    error!(endpoint = %self.endpoint, "Service unavailable: {}", e);
                    if !self.rotate_endpoint() {
                        self.set_state(SessionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }

    /// Rotate away from a failed live connection, if any endpoint is left
    async fn recover(&mut self) {
        if self.rotate_endpoint() {
            self.reconnect().await;
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn handshake(&mut self) -> Result<(), TransportError> {
        self.set_state(if self.opened {
            SessionState::Reconnecting
        } else {
            SessionState::Connecting
        });
        self.close_socket().await;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let device_id = &self.credentials.device_id;
        let payload = format!("{}|{}", device_id, timestamp);

        let mut headers = realtime_headers(&self.user_agent);
        headers.set(AUID, self.credentials.user_id.as_str());
        headers.set(NDC_AUTH, format!("sid={}", self.credentials.session_id));
        headers.set(NDC_DEVICE_ID, device_id.as_str());
        headers.set(NDC_MSG_SIG, self.composer.sign(payload.as_bytes())?);

        let url = format!(
            "{}/?signbody={}%7C{}",
            self.config.endpoint_url(&self.endpoint),
            device_id,
            timestamp
        );

        self.ws.connect(HandshakeRequest { url, headers }).await?;
        self.opened = true;
        Ok(())
    }

    /// Release the previous socket, whether or not its link is still up
    async fn close_socket(&mut self) {
        if !self.opened {
            return;
        }
        if let Err(e) = self.ws.close().await {
            warn!("Failed to close previous socket: {}", e);
        }
        self.opened = false;
    }

    /// Drop the current endpoint and pick a random remaining one
    fn rotate_endpoint(&mut self) -> bool {
        self.allowed.retain(|id| *id != self.endpoint);

        if self.allowed.is_empty() {
            warn!("Realtime endpoints exhausted, waiting for the periodic reconnect");
            return false;
        }

        let index = rand::thread_rng().gen_range(0..self.allowed.len());
        self.endpoint = self.allowed[index].clone();
        info!(endpoint = %self.endpoint, remaining = self.allowed.len(), "Switched realtime endpoint");
        true
    }

    fn on_link_lost(&mut self) {
        self.set_state(SessionState::Disconnected);
        Registry::<C>::run_hooks(&self.registry.on_close);
    }

    fn dispatch(&mut self, event: RealtimeEvent) {
        let topic = event.topic();
        info!(topic = %topic, t = event.t, "Received data");

        let handlers = self.registry.handlers(topic);
        if handlers.is_empty() {
            return;
        }

        let ndc_id = event.ndc_id();
        let client = self
            .namespaces
            .entry(ndc_id)
            .or_insert_with(|| self.factory.namespace(ndc_id))
            .clone();

        for handler in handlers {
            let task = tokio::spawn(handler(client.clone(), event.clone()));
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(topic = %topic, "Handler failed: {:#}", e),
                    Err(e) => error!(topic = %topic, "Handler panicked: {}", e),
                }
            });
        }
    }

    async fn send(&mut self, frame: Frame) {
        info!(t = frame.t, payload = %frame.o, "Sending data");
        if let Err(e) = self.ws.send_frame(&frame).await {
            error!(t = frame.t, "Failed to send frame: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        self.voice
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let was_connected = self.ws.is_connected();
        self.close_socket().await;
        if was_connected {
            Registry::<C>::run_hooks(&self.registry.on_close);
        }
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

impl<C, F> RealtimeSession<TungsteniteWs<NdcCodec>, C, F>
where
    C: Clone + Send + Sync + 'static,
    F: NamespaceFactory<C>,
{
    /// Session over a tokio-tungstenite socket
    pub fn over_tungstenite(options: SessionOptions, factory: F) -> (Self, RealtimeHandle<C>) {
        let ws = TungsteniteWs::new(NdcCodec, options.config.connect_timeout);
        Self::new(ws, options, factory)
    }
}

/// Cloneable caller-side handle of a `RealtimeSession`
pub struct RealtimeHandle<C> {
    commands: mpsc::UnboundedSender<SessionCommand>,
    registry: Arc<Registry<C>>,
    clock: Arc<ElapsedClock>,
    voice: VoiceThreads,
    state: watch::Receiver<SessionState>,
    keepalive_interval: Duration,
}

impl<C> Clone for RealtimeHandle<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            voice: self.voice.clone(),
            state: self.state.clone(),
            keepalive_interval: self.keepalive_interval,
        }
    }
}

impl<C> RealtimeHandle<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Register `callback` for every event classified as `topic`
    pub fn on<F, Fut>(&self, topic: EventTopic, callback: F)
    where
        F: Fn(C, RealtimeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(
            move |client: C, event: RealtimeEvent| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(callback(client, event))
            },
        );
        self.registry
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(handler);
    }

    /// Run `callback` for chat messages whose content starts with `prefix`
    pub fn command<F, Fut>(&self, prefix: &str, callback: F)
    where
        F: Fn(C, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let prefix = prefix.to_string();
        let callback = Arc::new(callback);
        self.on(EventTopic::Message, move |client, event| {
            let matched = CommandContext::matching(&event, &prefix);
            let callback = callback.clone();
            async move {
                match matched {
                    Some(ctx) => callback(client, ctx).await,
                    None => Ok(()),
                }
            }
        });
    }

    /// As `command`, with the whitespace-separated remainder as arguments
    pub fn command_args<F, Fut>(&self, prefix: &str, callback: F)
    where
        F: Fn(C, CommandContext, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let prefix = prefix.to_string();
        let callback = Arc::new(callback);
        self.on(EventTopic::Message, move |client, event| {
            let matched = CommandContext::matching(&event, &prefix).map(|ctx| {
                let args = ctx.args(&prefix);
                (ctx, args)
            });
            let callback = callback.clone();
            async move {
                match matched {
                    Some((ctx, args)) => callback(client, ctx, args).await,
                    None => Ok(()),
                }
            }
        });
    }

    /// Run `callback` after every successful handshake
    pub fn on_open<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) });
        self.registry
            .on_open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Run `callback` whenever a live connection goes down
    pub fn on_close<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) });
        self.registry
            .on_close
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Queue a frame; delivery failures are logged by the session
    pub fn send(&self, frame: Frame) {
        if self.commands.send(SessionCommand::Send(frame)).is_err() {
            warn!("Realtime session stopped, frame dropped");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub async fn elapsed_realtime(&self) -> Result<u64, TransportError> {
        self.clock.read().await
    }

    pub async fn join_voice_thread(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::join_voice_thread(ndc_id, thread_id, id));
        Ok(())
    }

    pub async fn join_video_thread(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::join_video_thread(ndc_id, thread_id, id));
        Ok(())
    }

    pub async fn join_video_thread_as_viewer(
        &self,
        ndc_id: i64,
        thread_id: &str,
    ) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::join_video_thread_as_viewer(ndc_id, thread_id, id));
        Ok(())
    }

    /// Join and open the voice channel, then keep re-joining until `end_voice_chat`
    pub async fn start_voice_chat(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::join_voice_thread(ndc_id, thread_id, id));
        self.send(frames::start_voice_channel(ndc_id, thread_id, id));

        let fresh = self
            .voice
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.to_string());
        if fresh {
            self.spawn_keepalive(ndc_id, thread_id.to_string());
        }
        Ok(())
    }

    pub async fn end_voice_chat(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        self.voice
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id);

        let id = self.clock.read().await?;
        self.send(frames::leave_voice_thread(ndc_id, thread_id, id));
        Ok(())
    }

    pub fn active_voice_threads(&self) -> Vec<String> {
        self.voice
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub async fn send_typing(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::typing(ndc_id, thread_id, id));
        Ok(())
    }

    pub async fn send_recording(&self, ndc_id: i64, thread_id: &str) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::recording(ndc_id, thread_id, id));
        Ok(())
    }

    pub async fn send_end_recording(
        &self,
        ndc_id: i64,
        thread_id: &str,
        duration: u64,
    ) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::end_recording(ndc_id, thread_id, duration, id));
        Ok(())
    }

    pub async fn send_ndc_browsing(&self, ndc_id: i64, topic_ids: &[i64]) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::community_browsing(ndc_id, topic_ids, id));
        Ok(())
    }

    pub fn send_ndc_enter(&self, ndc_id: i64) {
        self.send(frames::community_enter(
            ndc_id,
            chrono::Utc::now().timestamp_millis(),
        ));
    }

    pub async fn send_chatting(
        &self,
        ndc_id: i64,
        thread_id: &str,
        topic_ids: &[i64],
    ) -> Result<(), TransportError> {
        let id = self.clock.read().await?;
        self.send(frames::chatting(ndc_id, thread_id, topic_ids, id));
        Ok(())
    }

    /// Close the connection, forget voice threads and stop the driver task
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn spawn_keepalive(&self, ndc_id: i64, thread_id: String) {
        let handle = self.clone();
        let period = self.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let active = handle
                    .voice
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&thread_id);
                if !active {
                    debug!(thread_id = %thread_id, "Voice keep-alive stopped");
                    return;
                }

                match handle.clock.read().await {
                    Ok(id) => {
                        let frame = frames::join_voice_thread(ndc_id, &thread_id, id);
                        if handle.commands.send(SessionCommand::Send(frame)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(thread_id = %thread_id, "Voice keep-alive skipped: {}", e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::codec::WsCodec;
    use crate::core::kernel::fakes::FakeSignatureService;
    use crate::core::kernel::signer::HmacSigner;
    use crate::core::types::HeaderSet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::tungstenite::Message;

    enum Inbound {
        Text(String),
        Error,
        Close,
    }

    #[derive(Default)]
    struct Wire {
        events: Vec<String>,
        handshakes: Vec<HandshakeRequest>,
        sent: Vec<String>,
        refuse: Vec<String>,
    }

    struct MockWs {
        wire: Arc<Mutex<Wire>>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        connected: bool,
        open: bool,
        codec: NdcCodec,
    }

    #[async_trait]
    impl WsSession<NdcCodec> for MockWs {
        async fn connect(&mut self, request: HandshakeRequest) -> Result<(), TransportError> {
            let mut wire = self.wire.lock().unwrap();
            wire.events.push(format!("connect {}", request.url));
            let refused = wire.refuse.iter().any(|host| request.url.contains(host.as_str()));
            wire.handshakes.push(request);
            if refused {
                return Err(TransportError::Network("503 Service Unavailable".to_string()));
            }
            assert!(!self.open, "handshake while the previous socket is still open");
            self.connected = true;
            self.open = true;
            Ok(())
        }

        async fn send_raw(&mut self, msg: Message) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::Network("WebSocket not connected".to_string()));
            }
            if let Message::Text(text) = msg {
                self.wire.lock().unwrap().sent.push(text);
            }
            Ok(())
        }

        async fn next_raw(&mut self) -> Option<Result<Message, TransportError>> {
            match self.inbound.recv().await {
                Some(Inbound::Text(text)) => Some(Ok(Message::Text(text))),
                Some(Inbound::Error) => {
                    self.connected = false;
                    Some(Err(TransportError::Network("connection reset".to_string())))
                }
                Some(Inbound::Close) => {
                    self.connected = false;
                    Some(Ok(Message::Close(None)))
                }
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            if self.open {
                self.wire.lock().unwrap().events.push("close".to_string());
            }
            self.connected = false;
            self.open = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn codec(&self) -> &NdcCodec {
            &self.codec
        }
    }

    struct Harness {
        wire: Arc<Mutex<Wire>>,
        inbound: mpsc::UnboundedSender<Inbound>,
        composer: HeaderComposer,
        namespaces: Arc<AtomicUsize>,
    }

    impl Harness {
        fn events(&self) -> Vec<String> {
            self.wire.lock().unwrap().events.clone()
        }

        fn sent(&self) -> Vec<serde_json::Value> {
            self.wire
                .lock()
                .unwrap()
                .sent
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        fn push(&self, text: &str) {
            self.inbound.send(Inbound::Text(text.to_string())).unwrap();
        }
    }

    fn session(
        config: RealtimeConfig,
        refuse: &[&str],
    ) -> (
        RealtimeSession<MockWs, i64, impl NamespaceFactory<i64>>,
        RealtimeHandle<i64>,
        Harness,
    ) {
        let wire = Arc::new(Mutex::new(Wire {
            refuse: refuse.iter().map(ToString::to_string).collect(),
            ..Wire::default()
        }));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ws = MockWs {
            wire: wire.clone(),
            inbound: inbound_rx,
            connected: false,
            open: false,
            codec: NdcCodec,
        };

        let provider = Arc::new(FakeSignatureService::signing("sig").with_elapsed(10_000));
        let composer = HeaderComposer::new(
            Arc::new(HmacSigner::new("key".to_string(), 0x19)),
            provider.clone(),
        );
        let options = SessionOptions {
            config,
            credentials: RealtimeCredentials {
                device_id: "dev".to_string(),
                user_id: "u-1".to_string(),
                session_id: "sid-1".to_string(),
            },
            user_agent: "test-agent".to_string(),
            composer: composer.clone(),
            clock_source: provider,
        };

        let namespaces = Arc::new(AtomicUsize::new(0));
        let counter = namespaces.clone();
        let factory = move |ndc_id: i64| {
            counter.fetch_add(1, Ordering::SeqCst);
            ndc_id
        };

        let (session, handle) = RealtimeSession::new(ws, options, factory);
        let harness = Harness {
            wire,
            inbound: inbound_tx,
            composer,
            namespaces,
        };
        (session, handle, harness)
    }

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            endpoint_template: "ws://ws{}.test".to_string(),
            ..RealtimeConfig::default()
        }
        .with_reconnect_interval(Duration::from_secs(3_600))
    }

    async fn until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn until_state(handle: &RealtimeHandle<i64>, state: SessionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn chat(ndc_id: i64, content: &str) -> String {
        serde_json::json!({
            "t": 1000,
            "o": {"ndcId": ndc_id, "chatMessage": {"type": 0, "content": content, "threadId": "th"}}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_handshake_is_signed_over_device_and_timestamp() {
        let (session, handle, harness) = session(config(), &[]);
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        let request = harness.wire.lock().unwrap().handshakes[0].clone();
        let (endpoint, signbody) = request.url.split_once("/?signbody=").unwrap();
        assert_eq!(endpoint, "ws://ws1.test");
        let (device, timestamp) = signbody.split_once("%7C").unwrap();
        assert_eq!(device, "dev");
        assert!(timestamp.parse::<i64>().is_ok());

        let payload = format!("dev|{}", timestamp);
        let expected = harness.composer.sign(payload.as_bytes()).unwrap();
        let headers: &HeaderSet = &request.headers;
        assert_eq!(headers.get(NDC_MSG_SIG), Some(expected.as_str()));
        assert_eq!(headers.get(NDC_AUTH), Some("sid=sid-1"));
        assert_eq!(headers.get(AUID), Some("u-1"));
        assert_eq!(headers.get(NDC_DEVICE_ID), Some("dev"));
        assert_eq!(headers.get("User-Agent"), Some("test-agent"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_handshake_rotates_to_another_endpoint() {
        let (session, handle, harness) = session(config(), &["ws1."]);
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        let events = harness.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("connect ws://ws1.test"));
        assert!(!events[1].contains("ws1."));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_endpoints_leave_session_disconnected() {
        let (session, handle, harness) = session(config(), &["ws"]);
        let task = session.spawn();

        until(|| harness.events().len() == 4).await;
        until_state(&handle, SessionState::Disconnected).await;

        let mut endpoints: Vec<String> = harness
            .events()
            .iter()
            .filter_map(|e| e.split("/?").next().map(str::to_string))
            .collect();
        endpoints.sort();
        endpoints.dedup();
        assert_eq!(endpoints.len(), 4);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_uses_cached_namespace_per_community() {
        let (session, handle, harness) = session(config(), &[]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on(EventTopic::Message, move |client: i64, event: RealtimeEvent| {
            let tx = tx.clone();
            async move {
                tx.send((client, event.chat_message().and_then(|m| m.content)))?;
                anyhow::Ok(())
            }
        });
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        harness.push(&chat(5, "one"));
        harness.push(&chat(5, "two"));
        harness.push(&chat(9, "three"));
        harness.push(r#"{"t":304,"o":{"ndcId":5}}"#);

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        received.sort();
        assert_eq!(
            received,
            [
                (5, Some("one".to_string())),
                (5, Some("two".to_string())),
                (9, Some("three".to_string())),
            ]
        );
        assert_eq!(harness.namespaces.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let (session, handle, harness) = session(config(), &[]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on(EventTopic::Message, |_: i64, _: RealtimeEvent| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        handle.on(EventTopic::Message, |_: i64, event: RealtimeEvent| async move {
            if event.t == 1000 {
                panic!("handler panic");
            }
            anyhow::Ok(())
        });
        handle.on(EventTopic::Message, move |_: i64, _: RealtimeEvent| {
            let tx = tx.clone();
            async move {
                tx.send(())?;
                anyhow::Ok(())
            }
        });
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        harness.push(&chat(1, "a"));
        harness.push(&chat(1, "b"));
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(handle.state(), SessionState::Connected);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_match_prefix_and_split_args() {
        let (session, handle, harness) = session(config(), &[]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ping_tx = tx.clone();
        handle.command("!ping", move |_: i64, ctx| {
            let tx = ping_tx.clone();
            async move {
                tx.send(format!("ping:{}", ctx.content))?;
                anyhow::Ok(())
            }
        });
        handle.command_args("!echo", move |_: i64, _, args| {
            let tx = tx.clone();
            async move {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                tx.send(format!("echo:{}", args.join(",")))?;
                anyhow::Ok(())
            }
        });
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        harness.push(&chat(1, "!echo  a b"));
        harness.push(&chat(1, "hello"));
        harness.push(&chat(1, "!pingback"));

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, ["echo:a,b", "ping:!pingback"]);
        assert!(rx.try_recv().is_err());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_error_rotates_endpoint() {
        let (session, handle, harness) = session(config(), &[]);
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        harness.inbound.send(Inbound::Error).unwrap();
        until(|| harness.events().len() == 3).await;
        until_state(&handle, SessionState::Connected).await;

        let events = harness.events();
        assert!(events[0].contains("ws1."));
        assert_eq!(events[1], "close");
        assert!(events[2].starts_with("connect "));
        assert!(!events[2].contains("ws1."));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (session, handle, harness) = session(config(), &[]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on(EventTopic::Message, move |_: i64, _: RealtimeEvent| {
            let tx = tx.clone();
            async move {
                tx.send(())?;
                anyhow::Ok(())
            }
        });
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        harness.push("{not json");
        harness.push(&chat(1, "after"));
        rx.recv().await.unwrap();
        assert_eq!(harness.events().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reconnect_closes_before_handshake() {
        let config = config().with_reconnect_interval(Duration::from_secs(180));
        let (session, handle, harness) = session(config, &[]);
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(181)).await;
        until(|| harness.events().len() >= 3).await;

        let events = harness.events();
        assert!(events[0].starts_with("connect ws://ws1.test"));
        assert_eq!(events[1], "close");
        assert!(events[2].starts_with("connect ws://ws1.test"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_runs_hooks_and_periodic_reconnect_restores() {
        let config = config().with_reconnect_interval(Duration::from_secs(180));
        let (session, handle, harness) = session(config, &[]);
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (o, c) = (opened.clone(), closed.clone());
        handle.on_open(move || {
            o.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        handle.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        session.spawn();
        until_state(&handle, SessionState::Connected).await;
        until(|| opened.load(Ordering::SeqCst) == 1).await;

        harness.inbound.send(Inbound::Close).unwrap();
        until_state(&handle, SessionState::Disconnected).await;
        until(|| closed.load(Ordering::SeqCst) == 1).await;

        tokio::time::sleep(Duration::from_secs(181)).await;
        until_state(&handle, SessionState::Connected).await;
        until(|| opened.load(Ordering::SeqCst) == 2).await;
        // the old socket is released first, then the same endpoint is reused
        let events = harness.events();
        assert_eq!(events[1], "close");
        assert!(events[2].starts_with("connect ws://ws1.test"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_keepalive_until_ended() {
        let config = config().with_voice_keepalive_interval(Duration::from_secs(60));
        let (session, handle, harness) = session(config, &[]);
        session.spawn();
        until_state(&handle, SessionState::Connected).await;

        handle.start_voice_chat(4, "vc").await.unwrap();
        until(|| harness.sent().len() == 2).await;
        let sent = harness.sent();
        assert_eq!((sent[0]["t"].as_i64(), sent[1]["t"].as_i64()), (Some(112), Some(108)));
        assert_eq!(handle.active_voice_threads(), ["vc"]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        until(|| harness.sent().len() == 3).await;
        let keepalive = &harness.sent()[2];
        assert_eq!(keepalive["t"], 112);
        assert_eq!(keepalive["o"]["joinRole"], 1);
        let first: u64 = sent[0]["o"]["id"].as_str().unwrap().parse().unwrap();
        let later: u64 = keepalive["o"]["id"].as_str().unwrap().parse().unwrap();
        assert!(later >= first + 60_000);

        handle.end_voice_chat(4, "vc").await.unwrap();
        until(|| harness.sent().len() == 4).await;
        assert_eq!(harness.sent()[3]["o"]["joinRole"], 2);

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(harness.sent().len(), 4);
        assert!(handle.active_voice_threads().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_stops() {
        let (session, handle, harness) = session(config(), &[]);
        let task = session.spawn();
        until_state(&handle, SessionState::Connected).await;

        handle.shutdown().await;
        task.await.unwrap();

        assert_eq!(harness.events().last().map(String::as_str), Some("close"));
        assert_eq!(handle.state(), SessionState::Disconnected);
        handle.send(frames::community_enter(1, 0));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn test_codec_is_json_text() {
        let frame = frames::community_enter(1, 0);
        assert!(matches!(NdcCodec.encode_frame(&frame).unwrap(), Message::Text(_)));
    }
}
