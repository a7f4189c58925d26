//! TCP JSON-lines implementation of [`View`].
//!
//! A single client at a time receives `status` messages at the publish
//! interval and may send `hello`, `setpoints`, `select_experiment` and
//! `command` lines. Setpoints and the selection are held for the
//! controller's view task; commands are forwarded over a channel.

use crate::metrics::DynoMetrics;
use crate::protocol::{HelloMsg, IncomingMessage, ProtocolVersion, StatusMsg};
use dyno_core::{OperatorCommand, RigSnapshot, Setpoints, StopToken, View};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub require_handshake: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(100),
            require_handshake: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bridge socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct RemoteState {
    setpoints: Setpoints,
    selected: Option<String>,
    latest: Option<RigSnapshot>,
}

/// The remote client's side of the [`View`] contract.
pub struct RemoteView {
    state: Mutex<RemoteState>,
    commands: Mutex<Sender<OperatorCommand>>,
}

impl RemoteView {
    pub fn new() -> (Arc<Self>, Receiver<OperatorCommand>) {
        let (tx, rx) = mpsc::channel();
        let view = Arc::new(Self {
            state: Mutex::new(RemoteState::default()),
            commands: Mutex::new(tx),
        });
        (view, rx)
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest(&self) -> Option<RigSnapshot> {
        self.state().latest.clone()
    }

    fn submit_setpoints(&self, setpoints: Setpoints) {
        self.state().setpoints = setpoints;
    }

    fn select(&self, name: Option<String>) {
        self.state().selected = name;
    }

    fn submit_command(&self, command: OperatorCommand) -> bool {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(command)
            .is_ok()
    }
}

impl View for RemoteView {
    fn setpoints(&self) -> Setpoints {
        self.state().setpoints
    }

    fn selected_experiment(&self) -> Option<String> {
        self.state().selected.clone()
    }

    fn render(&self, snapshot: &RigSnapshot) {
        self.state().latest = Some(snapshot.clone());
    }
}

#[derive(Debug, Default)]
struct InboundState {
    last_sequence: Option<u64>,
    handshake_seen: bool,
    client_id: Option<String>,
}

impl InboundState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn accept_sequence(&mut self, sequence: u64) -> bool {
        if sequence == 0 {
            warn!("Setpoints sequence missing or zero");
            return false;
        }
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                warn!(sequence, last_sequence = last, "Out-of-order setpoints sequence");
                return false;
            }
        }
        self.last_sequence = Some(sequence);
        true
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id = hello.client_id.clone();
    }
}

pub struct Bridge {
    listener: TcpListener,
    config: BridgeConfig,
    metrics: Option<Arc<DynoMetrics>>,
}

impl Bridge {
    pub fn bind(config: BridgeConfig) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(&config.bind_addr).map_err(|source| BridgeError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<DynoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    fn set_connected(&self, connected: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.set_bridge_connected(connected);
        }
    }

    fn rejected(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.bridge_message_rejected();
        }
    }

    /// Serves clients until `stop` is requested.
    pub fn run(self, view: Arc<RemoteView>, stop: &StopToken) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            require_handshake = self.config.require_handshake,
            "Bridge listening"
        );

        let started = Instant::now();
        let mut client: Option<TcpStream> = None;
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;
        let mut last_publish = Instant::now();
        let mut status_sequence: u64 = 0;
        let mut inbound = InboundState::default();

        while !stop.is_stop_requested() {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            client = Some(stream);
                            self.set_connected(true);
                        }
                        Err(e) => warn!(error = %e, "Failed to configure bridge client"),
                    },
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => warn!(error = %err, "Bridge accept error"),
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        recv_buf.extend_from_slice(&temp[..n]);
                        while let Some(pos) = recv_buf.iter().position(|b| *b == b'\n') {
                            let line = recv_buf.drain(..=pos).collect::<Vec<u8>>();
                            let Ok(text) = std::str::from_utf8(&line) else {
                                self.rejected();
                                continue;
                            };
                            let trimmed = text.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            match IncomingMessage::parse(trimmed) {
                                Some(msg) => {
                                    if !self.handle_incoming(msg, &view, &mut inbound) {
                                        self.rejected();
                                    }
                                }
                                None => {
                                    debug!(line = trimmed, "Unrecognised bridge message");
                                    self.rejected();
                                }
                            }
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                if send_buf.is_empty() && last_publish.elapsed() >= self.config.publish_interval {
                    if let Some(snapshot) = view.latest() {
                        status_sequence = status_sequence.wrapping_add(1);
                        let selected = view.selected_experiment();
                        let msg = StatusMsg {
                            msg_type: "status",
                            protocol_version: ProtocolVersion::v1(),
                            sequence: status_sequence,
                            elapsed_s: started.elapsed().as_secs_f64(),
                            unix_us: chrono::Utc::now().timestamp_micros(),
                            selected_experiment: selected.as_deref(),
                            snapshot: &snapshot,
                        };
                        match serde_json::to_string(&msg) {
                            Ok(line) => {
                                send_buf = line.into_bytes();
                                send_buf.push(b'\n');
                                send_offset = 0;
                            }
                            Err(e) => warn!(error = %e, "Failed to encode status message"),
                        }
                    }
                    last_publish = Instant::now();
                }

                if !send_buf.is_empty() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                recv_buf.clear();
                send_buf.clear();
                send_offset = 0;
                inbound.reset();
                self.set_connected(false);
            }

            stop.sleep(Duration::from_millis(5));
        }
        info!("Bridge stopped");
    }

    /// Applies one client message. Returns false when it was dropped.
    fn handle_incoming(
        &self,
        msg: IncomingMessage,
        view: &RemoteView,
        inbound: &mut InboundState,
    ) -> bool {
        let version = msg.protocol_version();
        if !version.is_supported() {
            warn!(
                major = version.major,
                minor = version.minor,
                "Unsupported protocol version"
            );
            return false;
        }

        if let IncomingMessage::Hello(hello) = &msg {
            inbound.note_handshake(hello);
            info!(
                client_id = ?hello.client_id,
                capabilities = ?hello.capabilities,
                "Bridge handshake received"
            );
            return true;
        }

        if self.config.require_handshake && !inbound.handshake_seen {
            warn!("Message received before handshake");
            return false;
        }

        match msg {
            IncomingMessage::Hello(_) => true,
            IncomingMessage::Setpoints(sp) => {
                if !inbound.accept_sequence(sp.sequence) {
                    return false;
                }
                if !sp.mut_current_a.is_finite() || !sp.load_rpm.is_finite() {
                    warn!("Ignoring non-finite setpoints");
                    return false;
                }
                debug!(
                    client_id = ?inbound.client_id,
                    mut_current_a = sp.mut_current_a,
                    load_rpm = sp.load_rpm,
                    "Setpoints received"
                );
                view.submit_setpoints(Setpoints {
                    mut_current_a: sp.mut_current_a,
                    load_rpm: sp.load_rpm,
                });
                true
            }
            IncomingMessage::SelectExperiment(sel) => {
                info!(experiment = ?sel.name, "Experiment selected");
                view.select(sel.name);
                true
            }
            IncomingMessage::Command(cmd) => {
                info!(command = cmd.command.as_str(), "Operator command received");
                if !view.submit_command(cmd.command) {
                    warn!("Command receiver has gone away");
                    return false;
                }
                true
            }
        }
    }
}
