//! Session room relay server.
//!
//! A single-owner actor holds every live connection, the room membership
//! sets, and the implicit per-user channels. All mutation is serialized
//! through one command loop, so membership reads never race with joins,
//! leaves, or disconnect cleanup. WebSocket handlers talk to it through a
//! cloneable [`RelayServerHandle`].

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use codepair_auth::Identity;
use codepair_relay::models::{
    OutboundPayload, SessionJoinedPayload, SessionLeftPayload,
};
use codepair_relay::{RelayAction, RelayContext, Scope};
use log::{debug, error, info};
use rand::Rng as _;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backplane::Backplane;
use crate::ws::{ConnId, Msg, RoomId};

/// A command received by the [`RelayServer`].
#[derive(Debug)]
enum Command {
    Connect {
        identity: Identity,
        conn_tx: mpsc::UnboundedSender<Msg>,
        res_tx: oneshot::Sender<ConnId>,
    },

    Disconnect {
        conn: ConnId,
    },

    Message {
        msg: Msg,
        conn: ConnId,
        res_tx: oneshot::Sender<()>,
    },

    Remote {
        session_id: RoomId,
        msg: Msg,
    },
}

/// Errors that can occur when processing a connection's message.
#[derive(Debug, Error)]
pub enum RelayMessageError {
    #[error("Connection {0} not registered")]
    NoConnection(ConnId),
    #[error(transparent)]
    Parse(#[from] codepair_relay::ParseError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A registered connection.
#[derive(Debug)]
struct Connection {
    identity: Identity,
    /// Channel for messages to this connection.
    sender: mpsc::UnboundedSender<Msg>,
    /// The session room this connection is currently in, if any.
    current_session: Option<RoomId>,
}

/// A session room relay server.
///
/// Contains the logic of how connections relay events to each other plus
/// room management.
///
/// Call and spawn [`run`](Self::run) to start processing commands.
#[derive(Debug)]
pub struct RelayServer {
    /// Map of connection IDs to their registered state.
    connections: BTreeMap<ConnId, Connection>,

    /// Map of session room ID to member connection IDs. Rooms exist iff they
    /// have at least one member.
    rooms: BTreeMap<RoomId, BTreeSet<ConnId>>,

    /// Implicit personal channels (`user:<userId>`), populated on register
    /// for future direct-to-user delivery.
    user_channels: BTreeMap<String, BTreeSet<ConnId>>,

    /// Tracks total number of live connections.
    visitor_count: Arc<AtomicUsize>,

    /// Command receiver.
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    backplane: Arc<dyn Backplane>,

    token: CancellationToken,
}

impl RelayServer {
    #[must_use]
    pub fn new(backplane: Arc<dyn Backplane>) -> (Self, RelayServerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = RelayServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                connections: BTreeMap::new(),
                rooms: BTreeMap::new(),
                user_channels: BTreeMap::new(),
                visitor_count: Arc::new(AtomicUsize::new(0)),
                cmd_rx,
                backplane,
                token,
            },
            handle,
        )
    }

    /// Send message directly to the user.
    fn send_message_to(&self, id: ConnId, msg: impl Into<String>) {
        if let Some(Connection { sender, .. }) = self.connections.get(&id) {
            // errors if client disconnected abruptly and hasn't been cleaned up yet
            let _ = sender.send(msg.into());
        }
    }

    /// Send message to members of a room.
    ///
    /// `skip` is used to prevent events triggered by a connection also being
    /// received by it.
    fn send_room_message(&self, room: &str, skip: Option<ConnId>, msg: &str) {
        if let Some(members) = self.rooms.get(room) {
            for conn_id in members {
                if skip != Some(*conn_id)
                    && let Some(Connection { sender, .. }) = self.connections.get(conn_id)
                {
                    let _ = sender.send(msg.to_string());
                }
            }
        }
    }

    /// Register new connection and assign unique ID to it.
    fn connect(&mut self, identity: Identity, tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        // register connection with random connection ID
        let id = rand::rng().random::<ConnId>();

        info!("Connection {id} registered for user {}", identity.user_id);

        // implicit personal channel for future direct-to-user delivery
        self.user_channels
            .entry(format!("user:{}", identity.user_id))
            .or_default()
            .insert(id);

        self.connections.insert(
            id,
            Connection {
                identity,
                sender: tx,
                current_session: None,
            },
        );

        let count = self.visitor_count.fetch_add(1, Ordering::SeqCst);
        debug!("Visitor count: {}", count + 1);

        // send id back
        id
    }

    /// Unregister connection from the registry and every room it belongs to.
    ///
    /// Idempotent: a second call for the same connection ID is a no-op.
    fn disconnect(&mut self, conn_id: ConnId) {
        let Some(connection) = self.connections.remove(&conn_id) else {
            debug!("Connection {conn_id} already unregistered");
            return;
        };

        info!("Connection {conn_id} disconnected");
        let count = self.visitor_count.fetch_sub(1, Ordering::SeqCst);
        debug!("Visitor count: {}", count - 1);

        // remove connection from every room; empty rooms cease to exist
        self.rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });

        let channel = format!("user:{}", connection.identity.user_id);
        if let Some(members) = self.user_channels.get_mut(&channel) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.user_channels.remove(&channel);
            }
        }
    }

    /// Join a session room, creating it implicitly on first join.
    ///
    /// A connection is in at most one room: joining a new room leaves the
    /// previous one first. Confirmation is sent to the joiner only.
    fn join(&mut self, conn_id: ConnId, session_id: RoomId) -> Result<(), RelayMessageError> {
        let previous = self
            .connections
            .get(&conn_id)
            .ok_or(RelayMessageError::NoConnection(conn_id))?
            .current_session
            .clone();

        if let Some(previous) = previous
            && previous != session_id
        {
            self.leave(conn_id, &previous)?;
        }

        debug!("Connection {conn_id} joining session {session_id}");

        self.rooms
            .entry(session_id.clone())
            .or_default()
            .insert(conn_id);

        let confirmation = serde_json::to_string(&OutboundPayload::SessionJoined(
            SessionJoinedPayload {
                session_id: session_id.clone(),
            },
        ))?;

        if let Some(connection) = self.connections.get_mut(&conn_id) {
            connection.current_session = Some(session_id);
        }

        self.send_message_to(conn_id, confirmation);

        Ok(())
    }

    /// Leave a session room, dropping the room once its last member is gone.
    /// Confirmation is sent to the leaver.
    fn leave(&mut self, conn_id: ConnId, session_id: &str) -> Result<(), RelayMessageError> {
        debug!("Connection {conn_id} leaving session {session_id}");

        if let Some(members) = self.rooms.get_mut(session_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(session_id);
            }
        }

        if let Some(connection) = self.connections.get_mut(&conn_id)
            && connection.current_session.as_deref() == Some(session_id)
        {
            connection.current_session = None;
        }

        let confirmation =
            serde_json::to_string(&OutboundPayload::SessionLeft(SessionLeftPayload {
                session_id: session_id.to_string(),
            }))?;
        self.send_message_to(conn_id, confirmation);

        Ok(())
    }

    /// Deliver a broadcast to local room members and mirror it onto the
    /// backplane for members connected to other gateway processes.
    async fn broadcast(
        &self,
        sender_id: ConnId,
        session_id: &str,
        scope: Scope,
        payload: &OutboundPayload,
    ) -> Result<(), RelayMessageError> {
        let msg = serde_json::to_string(payload)?;

        let skip = match scope {
            Scope::ExcludeSender => Some(sender_id),
            Scope::IncludeSender => None,
        };

        self.send_room_message(session_id, skip, &msg);

        // a backplane failure degrades to local-only delivery
        if let Err(error) = self.backplane.publish(session_id, &msg).await {
            error!("Failed to publish to backplane for session {session_id}: {error:?}");
        }

        Ok(())
    }

    /// Process one inbound event from a connection. Unroutable or invalid
    /// events are dropped without a reply.
    async fn on_message(&mut self, conn_id: ConnId, msg: Msg) -> Result<(), RelayMessageError> {
        let payload = codepair_relay::parse_inbound(&msg)?;

        debug!("Received {payload} from connection {conn_id}");

        let connection = self
            .connections
            .get(&conn_id)
            .ok_or(RelayMessageError::NoConnection(conn_id))?;

        let ctx = RelayContext {
            user_id: connection.identity.user_id.clone(),
            current_session: connection.current_session.clone(),
        };

        let at = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();

        let Some(action) = codepair_relay::route(payload, &ctx, at) else {
            debug!("Dropping unroutable event from connection {conn_id}");
            return Ok(());
        };

        match action {
            RelayAction::Join { session_id } => self.join(conn_id, session_id),
            RelayAction::Leave { session_id } => self.leave(conn_id, &session_id),
            RelayAction::Broadcast {
                session_id,
                scope,
                payload,
            } => self.broadcast(conn_id, &session_id, scope, &payload).await,
        }
    }

    /// Deliver a backplane event to all local members of the room. Sender
    /// exclusion was already applied on the originating gateway.
    fn on_remote(&self, session_id: &str, msg: &str) {
        self.send_room_message(session_id, None, msg);
    }

    pub async fn run(mut self) -> io::Result<()> {
        let token = self.token.clone();

        loop {
            let cmd = tokio::select! {
                () = token.cancelled() => {
                    debug!("RelayServer was cancelled");
                    break;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match cmd {
                Command::Connect {
                    identity,
                    conn_tx,
                    res_tx,
                } => {
                    if let Err(error) = res_tx.send(self.connect(identity, conn_tx)) {
                        error!("Failed to respond to connect: {error:?}");
                    }
                }

                Command::Disconnect { conn } => self.disconnect(conn),

                Command::Message { conn, msg, res_tx } => {
                    if let Err(error) = self.on_message(conn, msg).await {
                        debug!("Failed to process message from {conn}: {error:?}");
                    }
                    let _ = res_tx.send(());
                }

                Command::Remote { session_id, msg } => self.on_remote(&session_id, &msg),
            }
        }

        debug!("Stopped RelayServer");

        Ok(())
    }
}

/// Handle and command sender for the relay server.
///
/// Reduces boilerplate of setting up response channels in WebSocket handlers.
#[derive(Debug, Clone)]
pub struct RelayServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl RelayServerHandle {
    /// Register client message sender and obtain connection ID.
    pub async fn connect(
        &self,
        identity: Identity,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> ConnId {
        let (res_tx, res_rx) = oneshot::channel();

        // unwrap: relay server should not have been dropped
        self.cmd_tx
            .send(Command::Connect {
                identity,
                conn_tx,
                res_tx,
            })
            .unwrap();

        // unwrap: relay server does not drop our response channel
        res_rx.await.unwrap()
    }

    /// Hand an inbound event to the relay server and wait for it to be
    /// processed.
    pub async fn send_message(&self, conn: ConnId, msg: impl Into<String>) {
        let (res_tx, res_rx) = oneshot::channel();

        // unwrap: relay server should not have been dropped
        self.cmd_tx
            .send(Command::Message {
                msg: msg.into(),
                conn,
                res_tx,
            })
            .unwrap();

        // unwrap: relay server does not drop our response channel
        res_rx.await.unwrap();
    }

    /// Mirror a backplane event onto the local rooms.
    pub fn remote(&self, session_id: RoomId, msg: Msg) {
        // the server may already be gone during shutdown
        if let Err(error) = self.cmd_tx.send(Command::Remote { session_id, msg }) {
            debug!("Failed to forward remote event: {error:?}");
        }
    }

    /// Unregister a connection and remove it from any room it belonged to.
    pub fn disconnect(&self, conn: ConnId) {
        if let Err(error) = self.cmd_tx.send(Command::Disconnect { conn }) {
            debug!("Failed to send disconnect: {error:?}");
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
