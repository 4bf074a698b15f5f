//! The realtime voice session: connection lifecycle, the outbound capture
//! pipeline, inbound message dispatch, and host-facing callbacks.
//!
//! One `VoiceSession` owns at most one live conversation. All per-session
//! work runs on a single task driving one `select!` loop, so inbound
//! messages are handled strictly in transport order and the playback queue,
//! connection flags, and callbacks have exactly one mutator at a time.

use crate::{
    capture::{AudioDevices, CaptureSource},
    codec,
    error::VoiceError,
    playback::{PlaybackItem, PlaybackQueue},
    protocol::{
        AgentOverride, ClientEvent, ConversationConfigOverride, DynamicVariables, ServerEvent,
        UserAudioChunk,
    },
    signaling::SignalingClient,
};
use chrono::Local;
use futures::{future::BoxFuture, stream::FuturesUnordered};
use futures_util::{Sink, SinkExt, StreamExt};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, warn};

/// Deadline for the socket to reach the active state, measured from the
/// start of connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the best-effort contextual date/time update is sent.
pub const CONTEXTUAL_UPDATE_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which speaker a transcript line belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Agent,
}

/// The four callback slots the host provides.
///
/// Replaceable at any time (last write wins). Invoked synchronously from the
/// session task; the host must not call back into the session from inside a
/// callback except for `stop_conversation`, which is re-entrancy safe.
pub struct CallbackSet {
    pub on_connection_change: Box<dyn Fn(bool) + Send + Sync>,
    pub on_transcript: Box<dyn Fn(&str, TranscriptRole) + Send + Sync>,
    pub on_agent_response: Box<dyn Fn(&str) + Send + Sync>,
    pub on_error: Box<dyn Fn(&str) + Send + Sync>,
}

impl Default for CallbackSet {
    fn default() -> Self {
        Self {
            on_connection_change: Box::new(|_| {}),
            on_transcript: Box::new(|_, _| {}),
            on_agent_response: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
        }
    }
}

/// Session lifecycle states. `Errored` is absorbing until the next
/// `start_conversation`, which is always permitted from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Errored,
}

/// Per-session configuration, fixed before connect.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Persona to converse with; immutable for the session lifetime.
    pub agent: crate::signaling::AgentSelector,
    /// Name threaded into the handshake's dynamic variables.
    pub user_name: String,
    /// Optional override for the agent's opening line.
    pub first_message: Option<String>,
    /// Optional BCP-47-ish language override.
    pub language: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent: crate::signaling::AgentSelector::Primary,
            user_name: "Guest".to_string(),
            first_message: None,
            language: None,
        }
    }
}

struct ActiveHandle {
    epoch: u64,
    cancel_start: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

struct Shared {
    state: Mutex<SessionState>,
    connected: AtomicBool,
    capturing: AtomicBool,
    callbacks: Mutex<Arc<CallbackSet>>,
    queue: Mutex<Option<PlaybackQueue>>,
    active: Mutex<Option<ActiveHandle>>,
    next_epoch: AtomicU64,
}

impl Shared {
    fn callbacks(&self) -> Arc<CallbackSet> {
        self.callbacks.lock().unwrap().clone()
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Tears the session down, firing callback edges at most once.
    ///
    /// `only_epoch` scopes the teardown to one session generation so a
    /// finished run task cannot disturb a successor session. Returns whether
    /// this call performed the teardown.
    fn teardown(&self, error: Option<&VoiceError>, only_epoch: Option<u64>) -> bool {
        let owned = {
            let mut active = self.active.lock().unwrap();
            match active.as_ref() {
                Some(handle) if only_epoch.is_none_or(|e| handle.epoch == e) => {
                    let handle = active.take().expect("checked above");
                    handle.cancel_start.store(true, Ordering::SeqCst);
                    let _ = handle.shutdown_tx.send(true);
                    true
                }
                // A newer session owns the state now; nothing to do.
                Some(_) => return false,
                None => false,
            }
        };
        // A plain stop proceeds even with nothing active (idempotency); a
        // fault or a run-task exit only cleans up what it owns.
        if !owned && (error.is_some() || only_epoch.is_some()) {
            return false;
        }

        if let Some(queue) = self.queue.lock().unwrap().take() {
            queue.flush();
        }
        self.capturing.store(false, Ordering::SeqCst);
        let callbacks = self.callbacks();
        if self.connected.swap(false, Ordering::SeqCst) {
            (callbacks.on_connection_change)(false);
        }
        match error {
            Some(err) => {
                self.set_state(SessionState::Errored);
                (callbacks.on_error)(&err.to_string());
            }
            None => self.set_state(SessionState::Idle),
        }
        true
    }
}

enum StartFailure {
    /// A concurrent `stop_conversation` won; the session is already Idle.
    Cancelled,
    Failed(VoiceError),
}

/// A realtime voice conversation client.
///
/// Construct one per conversation surface and hand it to the UI layer;
/// nothing here is a process-wide singleton.
pub struct VoiceSession {
    shared: Arc<Shared>,
    config: SessionConfig,
    signaling: SignalingClient,
    devices: Arc<dyn AudioDevices>,
}

impl VoiceSession {
    pub fn new(
        config: SessionConfig,
        signaling: SignalingClient,
        devices: Arc<dyn AudioDevices>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                connected: AtomicBool::new(false),
                capturing: AtomicBool::new(false),
                callbacks: Mutex::new(Arc::new(CallbackSet::default())),
                queue: Mutex::new(None),
                active: Mutex::new(None),
                next_epoch: AtomicU64::new(0),
            }),
            config,
            signaling,
            devices,
        }
    }

    /// Replaces the host callbacks; last write wins.
    pub fn set_callbacks(&self, callbacks: CallbackSet) {
        *self.shared.callbacks.lock().unwrap() = Arc::new(callbacks);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Starts a conversation: microphone, broker authorization, WebSocket,
    /// handshake, then the session task.
    ///
    /// Fails fast with [`VoiceError::AlreadyActive`] unless the session is
    /// idle (or errored). On any establishment failure the session is torn
    /// down, `on_error` fires once, and the error is also returned. If
    /// `stop_conversation` is called while this is in flight, the stop wins:
    /// the session unwinds to `Idle` and this returns `Ok(())`.
    pub async fn start_conversation(&self) -> Result<(), VoiceError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                SessionState::Idle | SessionState::Errored => *state = SessionState::Connecting,
                _ => return Err(VoiceError::AlreadyActive),
            }
            *self.shared.active.lock().unwrap() = Some(ActiveHandle {
                epoch,
                cancel_start: cancel.clone(),
                shutdown_tx,
            });
        }

        match self.establish(epoch, &cancel, shutdown_rx).await {
            Ok(()) => Ok(()),
            Err(StartFailure::Cancelled) => Ok(()),
            Err(StartFailure::Failed(err)) => {
                if self.shared.teardown(Some(&err), Some(epoch)) {
                    Err(err)
                } else {
                    // A stop raced the failure and already unwound.
                    Ok(())
                }
            }
        }
    }

    async fn establish(
        &self,
        epoch: u64,
        cancel: &Arc<AtomicBool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), StartFailure> {
        use StartFailure::{Cancelled, Failed};
        let cancelled = || cancel.load(Ordering::SeqCst);

        // Microphone first: no point authorizing a session we cannot feed.
        let capture = self.devices.open_capture().await.map_err(Failed)?;
        if cancelled() {
            return Err(Cancelled);
        }

        let sink = self.devices.open_playback().await.map_err(Failed)?;
        if cancelled() {
            return Err(Cancelled);
        }

        let auth = self
            .signaling
            .get_session_authorization(self.config.agent)
            .await
            .map_err(Failed)?;
        if cancelled() {
            return Err(Cancelled);
        }

        // Connect and complete the handshake under one deadline.
        let ws = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let (mut ws, _) = connect_async(auth.endpoint_url.as_str())
                .await
                .map_err(|e| VoiceError::Connection(e.to_string()))?;
            let handshake = serde_json::to_string(&self.handshake_event())
                .map_err(|e| VoiceError::Connection(e.to_string()))?;
            ws.send(Message::Text(handshake))
                .await
                .map_err(|e| VoiceError::Connection(format!("handshake send failed: {}", e)))?;
            Ok::<_, VoiceError>(ws)
        })
        .await
        .map_err(|_| Failed(VoiceError::ConnectionTimeout(CONNECT_TIMEOUT)))?
        .map_err(Failed)?;
        if cancelled() {
            return Err(Cancelled);
        }

        // Activation is atomic with respect to a racing stop: state, flags,
        // and queue are only set while this attempt's handle is still
        // installed, so a teardown that already ran can never be overwritten.
        // Lock order is `state` before `active`, same as the entry guard;
        // `teardown` never holds `active` while taking another lock.
        {
            let mut state = self.shared.state.lock().unwrap();
            let active = self.shared.active.lock().unwrap();
            match active.as_ref() {
                Some(handle)
                    if handle.epoch == epoch
                        && !handle.cancel_start.load(Ordering::SeqCst) =>
                {
                    *self.shared.queue.lock().unwrap() = Some(PlaybackQueue::new(sink));
                    *state = SessionState::Active;
                    self.shared.connected.store(true, Ordering::SeqCst);
                    self.shared.capturing.store(true, Ordering::SeqCst);
                }
                _ => return Err(Cancelled),
            }
        }
        // Fired outside the locks so the callback may call back into the
        // session; skip the edge if a stop slipped in and already reported
        // the disconnect.
        if self.shared.connected.load(Ordering::SeqCst) {
            (self.shared.callbacks().on_connection_change)(true);
        }
        info!(epoch, agent = ?self.config.agent, "voice session active");

        // The task is detached; teardown reaches it through the watch
        // channel. If a stop raced the spawn, the channel is already
        // signalled and the task unwinds on its first loop turn.
        let _ = tokio::spawn(run_session(
            self.shared.clone(),
            epoch,
            ws,
            capture,
            shutdown_rx,
        ));
        Ok(())
    }

    /// Stops the conversation. Valid from any state, idempotent, and safe to
    /// call from inside a callback (it never blocks on the session task).
    pub fn stop_conversation(&self) {
        let state = self.shared.state();
        if state == SessionState::Connecting || state == SessionState::Active {
            self.shared.set_state(SessionState::Closing);
        }
        self.shared.teardown(None, None);
    }

    fn handshake_event(&self) -> ClientEvent {
        let now = Local::now();
        ClientEvent::ConversationInitiationClientData {
            conversation_config_override: ConversationConfigOverride {
                agent: AgentOverride {
                    first_message: self.config.first_message.clone(),
                    language: self.config.language.clone(),
                },
            },
            dynamic_variables: DynamicVariables {
                current_date: now.format("%Y-%m-%d").to_string(),
                current_time: now.format("%H:%M").to_string(),
                current_day: now.format("%A").to_string(),
                user_name: self.config.user_name.clone(),
            },
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shared.teardown(None, None);
    }
}

/// The single per-session event loop.
async fn run_session(
    shared: Arc<Shared>,
    epoch: u64,
    ws: WsStream,
    mut capture: Box<dyn CaptureSource>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let contextual_timer = tokio::time::sleep(CONTEXTUAL_UPDATE_DELAY);
    tokio::pin!(contextual_timer);
    let mut contextual_sent = false;
    let mut capture_open = true;
    let mut pending_pongs: FuturesUnordered<BoxFuture<'static, serde_json::Value>> =
        FuturesUnordered::new();

    let outcome: Option<VoiceError> = loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break None,

            maybe_msg = ws_rx.next() => match maybe_msg {
                Some(Ok(Message::Text(text))) => dispatch(&shared, &text, &mut pending_pongs),
                Some(Ok(Message::Close(frame))) => match frame {
                    Some(frame) if u16::from(frame.code) == 1000 => {
                        info!("server closed the session normally");
                        break None;
                    }
                    Some(frame) => {
                        break Some(VoiceError::abnormal_close(u16::from(frame.code), &frame.reason));
                    }
                    None => break Some(VoiceError::abnormal_close(1005, "")),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(VoiceError::abnormal_close(1006, &e.to_string())),
                None => break Some(VoiceError::abnormal_close(1006, "connection lost")),
            },

            maybe_block = capture.next_block(), if capture_open => match maybe_block {
                Some(block) => {
                    if shared.capturing.load(Ordering::SeqCst) {
                        send_audio_frame(&mut ws_tx, &block).await;
                    }
                }
                None => {
                    debug!("capture source ended");
                    capture_open = false;
                    shared.capturing.store(false, Ordering::SeqCst);
                }
            },

            _ = &mut contextual_timer, if !contextual_sent => {
                contextual_sent = true;
                let event = ClientEvent::ContextualUpdate { text: contextual_update_text() };
                if let Ok(text) = serde_json::to_string(&event) {
                    // Best-effort; a failure here is not session-fatal.
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        debug!(error = %e, "contextual update not delivered");
                    }
                }
            }

            Some(event_id) = pending_pongs.next() => {
                let pong = ClientEvent::Pong { event_id };
                if let Ok(text) = serde_json::to_string(&pong) {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        debug!(error = %e, "pong not delivered");
                    }
                }
            }
        }
    };

    // Best-effort close frame; teardown handles everything else.
    let _ = ws_tx.close().await;
    shared.teardown(outcome.as_ref(), Some(epoch));
}

/// Encodes one capture block and ships it, dropping the frame if the socket
/// is not writable. Realtime audio is not worth buffering and replaying
/// late.
async fn send_audio_frame(
    ws_tx: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    block: &[f32],
) {
    let chunk = UserAudioChunk {
        user_audio_chunk: codec::to_base64(&codec::encode_pcm16(block)),
    };
    match serde_json::to_string(&chunk) {
        Ok(text) => {
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                debug!(error = %e, "dropped outbound audio frame");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode audio frame"),
    }
}

/// Dispatches one inbound text frame. Errors local to a single message are
/// logged and skipped; they never reach the host's error callback.
fn dispatch(
    shared: &Shared,
    text: &str,
    pending_pongs: &mut FuturesUnordered<BoxFuture<'static, serde_json::Value>>,
) {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            let tag = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
                .unwrap_or_else(|| "<unparseable>".to_string());
            warn!(%tag, "ignoring unknown server event");
            return;
        }
    };

    match event {
        ServerEvent::ConversationInitiationMetadata { .. } => {
            info!("conversation initiation metadata received");
        }
        ServerEvent::UserTranscript {
            user_transcription_event,
        } => {
            (shared.callbacks().on_transcript)(
                &user_transcription_event.user_transcript,
                TranscriptRole::User,
            );
        }
        ServerEvent::AgentResponse {
            agent_response_event,
        } => {
            (shared.callbacks().on_agent_response)(&agent_response_event.agent_response);
        }
        ServerEvent::Audio { audio_event } => {
            let Some(encoded) = audio_event.audio_base_64.filter(|s| !s.is_empty()) else {
                debug!("discarding audio event with empty payload");
                return;
            };
            let samples = match codec::from_base64(&encoded).and_then(|b| codec::decode_pcm16(&b))
            {
                Ok(samples) if !samples.is_empty() => samples,
                Ok(_) => {
                    debug!("discarding audio event with no samples");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed audio event");
                    return;
                }
            };
            if let Some(queue) = shared.queue.lock().unwrap().as_ref() {
                queue.enqueue(PlaybackItem {
                    samples,
                    event_id: audio_event.event_id,
                });
            }
        }
        ServerEvent::Ping { ping_event } => {
            let delay = Duration::from_millis(ping_event.ping_ms.unwrap_or(0));
            let event_id = ping_event.event_id;
            pending_pongs.push(Box::pin(async move {
                tokio::time::sleep(delay).await;
                event_id
            }));
        }
        ServerEvent::Interruption { .. } => {
            debug!("barge-in: flushing queued agent speech");
            if let Some(queue) = shared.queue.lock().unwrap().as_ref() {
                queue.flush();
            }
        }
        ServerEvent::VadScore { vad_score_event } => {
            debug!(score = vad_score_event.vad_score, "vad score");
        }
    }
}

fn contextual_update_text() -> String {
    let now = Local::now();
    format!(
        "The current date is {} ({}), local time {}.",
        now.format("%Y-%m-%d"),
        now.format("%A"),
        now.format("%H:%M"),
    )
}
