use std::time::{Duration, Instant};

use actix_ws::Message;
use codepair_auth::Identity;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use log::debug;
use tokio::{pin, sync::mpsc, time::interval};

use crate::ws::server::RelayServerHandle;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay events received from the client, respond to ping messages, and
/// monitor connection health to detect network issues and free up resources.
///
/// Registry and room cleanup runs unconditionally after the connection loop,
/// whatever caused it to exit.
pub async fn relay_ws(
    relay_server: RelayServerHandle,
    identity: Identity,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    log::info!("Connected user {}", identity.user_id);

    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = relay_server.connect(identity, conn_tx).await;

    log::debug!("Connection id: {conn_id}");

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // commands & messages received from client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    last_heartbeat = Instant::now();
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();
                    let text: &str = text.as_ref();
                    relay_server.send_message(conn_id, text).await;
                }

                Message::Binary(_) => {
                    last_heartbeat = Instant::now();
                    debug!("Ignoring binary message from connection {conn_id}");
                }

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("{err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => break None,

            // relayed events for this connection
            Either::Left((Either::Right((Some(relay_msg), _)), _)) => {
                if session.text(relay_msg).await.is_err() {
                    break None;
                }
            }

            // all connection's message senders were dropped
            Either::Left((Either::Right((None, _)), _)) => break None,

            // heartbeat internal tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "client has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        };
    };

    relay_server.disconnect(conn_id);

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;
}
