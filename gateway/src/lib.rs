#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

//! CodePair realtime collaboration gateway.
//!
//! Authenticates persistent WebSocket connections, groups them into
//! per-interview session rooms, and relays code edits, chat messages, and
//! typing indicators between room members, across gateway processes via a
//! Redis pub/sub backplane.

pub mod api;
pub mod backplane;
pub mod config;
pub mod ws;

use std::sync::{Arc, LazyLock, RwLock};

use actix_cors::Cors;
use actix_web::{App, http, middleware};
use codepair_auth::TokenVerifier;
use tokio::try_join;

use crate::backplane::{Backplane, RedisBackplane};
use crate::config::Config;
use crate::ws::server::{RelayServer, RelayServerHandle};

static RELAY_SERVER_HANDLE: LazyLock<RwLock<Option<RelayServerHandle>>> =
    LazyLock::new(|| RwLock::new(None));

static TOKEN_VERIFIER: LazyLock<RwLock<Option<TokenVerifier>>> =
    LazyLock::new(|| RwLock::new(None));

/// Run the gateway until the HTTP server stops.
///
/// The backplane connection is established first; if it cannot be, the
/// gateway refuses to start.
///
/// # Errors
///
/// * If the backplane is unreachable at startup
/// * If the HTTP server fails to bind or run
pub async fn run(config: Config) -> std::io::Result<()> {
    let backplane = RedisBackplane::connect(&config.redis_url)
        .await
        .map_err(|error| {
            log::error!("Failed to connect to backplane at {}: {error:?}", config.redis_url);
            std::io::Error::other(error)
        })?;

    let backplane: Arc<dyn Backplane> = Arc::new(backplane);

    let mut remote_rx = backplane
        .subscribe()
        .await
        .map_err(std::io::Error::other)?;

    let (relay_server, handle) = RelayServer::new(backplane);
    let relay_server = tokio::task::spawn(relay_server.run());

    // mirror backplane events onto local rooms
    tokio::task::spawn({
        let handle = handle.clone();
        async move {
            while let Some(event) = remote_rx.recv().await {
                handle.remote(event.session_id, event.msg);
            }
        }
    });

    RELAY_SERVER_HANDLE.write().unwrap().replace(handle);
    TOKEN_VERIFIER
        .write()
        .unwrap()
        .replace(TokenVerifier::new(&config.jwt_secret));

    let cors_origins = config.cors_origins.clone();

    let app = move || {
        let cors = if cors_origins.is_empty() {
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![http::header::AUTHORIZATION, http::header::ACCEPT])
                .allowed_header(http::header::CONTENT_TYPE)
                .max_age(3600)
        } else {
            let mut cors = Cors::default();
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
            cors.allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![http::header::AUTHORIZATION, http::header::ACCEPT])
                .allowed_header(http::header::CONTENT_TYPE)
                .supports_credentials()
                .max_age(3600)
        };

        App::new()
            .wrap(cors)
            .wrap(middleware::Compress::default())
            .service(api::health_endpoint)
            .service(api::websocket)
    };

    let http_server = actix_web::HttpServer::new(app)
        .bind(("0.0.0.0", config.port))?
        .run();

    log::info!("CodePair gateway listening on :{}", config.port);

    try_join!(
        async move {
            let resp = http_server.await;
            if let Some(handle) = RELAY_SERVER_HANDLE.write().unwrap().take() {
                handle.shutdown();
            }
            resp
        },
        async move {
            relay_server
                .await
                .map_err(std::io::Error::other)?
        }
    )?;

    Ok(())
}
