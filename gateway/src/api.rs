use actix_web::error::{ErrorInternalServerError, ErrorUnauthorized};
use actix_web::web::Json;
use actix_web::{HttpRequest, HttpResponse, Result, get, http, route, web};
use codepair_auth::extract_token;
use qstring::QString;
use serde_json::{Value, json};
use tokio::task::spawn_local;

use crate::ws::handler;
use crate::{RELAY_SERVER_HANDLE, TOKEN_VERIFIER};

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    Ok(Json(json!({"healthy": true})))
}

#[get("/ws")]
pub async fn websocket(
    req: HttpRequest,
    stream: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let query = QString::from(req.query_string());
    let authorization_header = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let verifier = TOKEN_VERIFIER
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| ErrorInternalServerError("Gateway not initialized"))?;

    // verification runs once per connection attempt, before any room
    // operation is permitted
    let identity = extract_token(query.get("auth"), authorization_header, query.get("token"))
        .and_then(|token| verifier.verify(token))
        .map_err(|error| {
            log::warn!("Unauthorized websocket connection attempt: {error}");
            ErrorUnauthorized("Unauthorized")
        })?;

    let relay_server = RELAY_SERVER_HANDLE
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| ErrorInternalServerError("Gateway not initialized"))?;

    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    spawn_local(handler::relay_ws(relay_server, identity, session, msg_stream));

    Ok(res)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{App, http::StatusCode, http::header, test};
    use codepair_auth::TokenVerifier;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backplane::{Backplane, InMemoryBackplane};
    use crate::ws::server::RelayServer;

    fn init_handles() {
        let backplane: Arc<dyn Backplane> = Arc::new(InMemoryBackplane::new());
        let (server, handle) = RelayServer::new(backplane);
        tokio::spawn(server.run());

        crate::RELAY_SERVER_HANDLE.write().unwrap().replace(handle);
        crate::TOKEN_VERIFIER
            .write()
            .unwrap()
            .replace(TokenVerifier::new("secret"));
    }

    fn token(secret: &str) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &json!({
                "sub": "u1",
                "email": "u1@example.com",
                "exp": chrono::Utc::now().timestamp() + 600,
            }),
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[actix_web::test]
    async fn websocket_route_authenticates_before_upgrading() {
        init_handles();
        let app = test::init_service(App::new().service(websocket)).await;

        // missing token
        let res =
            test::call_service(&app, test::TestRequest::get().uri("/ws").to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // garbage token
        let res = test::call_service(
            &app,
            test::TestRequest::get().uri("/ws?token=garbage").to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // tampered signature, presented via the Authorization header
        let bad = token("other-secret");
        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/ws")
                .insert_header((header::AUTHORIZATION, format!("Bearer {bad}")))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // valid token passes auth; the request still isn't an upgrade, so
        // the websocket handshake itself is what gets rejected
        let good = token("secret");
        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/ws?token={good}"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
