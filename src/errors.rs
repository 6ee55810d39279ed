use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

use crate::types::{Response, ResponseType};

// HTTP-stage error codes.
pub const HTTP_MISSING_URL_QUERY: u16 = 101;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 102;
pub const HTTP_INVALID_TOKEN: u16 = 103;
pub const HTTP_INVALID_TOKEN_CLAIM: u16 = 104;
pub const HTTP_UNAUTHORIZED: u16 = 105;

// Duplex-channel error codes.
pub const WS_INVALID_REQUEST: u16 = 201;
pub const WS_LOBBY_NOT_FOUND: u16 = 202;
pub const WS_TOO_MANY_PLAYERS: u16 = 203;
pub const WS_PLAYER_ALREADY_REGISTERED: u16 = 204;
pub const WS_USERNAME_ALREADY_EXISTS: u16 = 205;
pub const WS_CLIENT_RESTITUTE: u16 = 206;
pub const WS_INVALID_INPUT: u16 = 207;
pub const WS_INTERNAL_SERVER_ERROR: u16 = 208;
pub const WS_UNAUTHORIZED: u16 = 209;
pub const WS_PLAYER_NOT_FOUND: u16 = 210;
pub const WS_QUIZ_NOT_FOUND: u16 = 211;

/// Error payload surfaced on the duplex channel as
/// `{"type":"error","data":{code,message,extra?}}`.
#[derive(Debug, Clone, Serialize)]
pub struct WsError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl WsError {
    pub fn into_response(self) -> Response<WsError> {
        Response::new(ResponseType::Error, self)
    }
}

pub fn invalid_request(cause: &str) -> WsError {
    WsError {
        code: WS_INVALID_REQUEST,
        message: "invalid request".into(),
        extra: Some(json!({ "cause": cause })),
    }
}

pub fn unauthorized_request(cause: &str) -> WsError {
    WsError {
        code: WS_UNAUTHORIZED,
        message: "unauthorized request".into(),
        extra: Some(json!({ "cause": cause })),
    }
}

pub fn user_already_registered(username: &str) -> WsError {
    WsError {
        code: WS_PLAYER_ALREADY_REGISTERED,
        message: "user already registered".into(),
        extra: Some(json!({ "username": username })),
    }
}

pub fn username_already_exists(username: &str) -> WsError {
    WsError {
        code: WS_USERNAME_ALREADY_EXISTS,
        message: "username already exists".into(),
        extra: Some(json!({ "username": username })),
    }
}

pub fn player_not_found(username: &str) -> WsError {
    WsError {
        code: WS_PLAYER_NOT_FOUND,
        message: "player not found".into(),
        extra: Some(json!({ "username": username })),
    }
}

pub fn quiz_not_found(quiz: &str) -> WsError {
    WsError {
        code: WS_QUIZ_NOT_FOUND,
        message: "quiz not found".into(),
        extra: Some(json!({ "quiz": quiz })),
    }
}

pub fn invalid_input(fields: Value) -> WsError {
    WsError {
        code: WS_INVALID_INPUT,
        message: "invalid input".into(),
        extra: Some(fields),
    }
}

pub fn client_restitute(cause: &str) -> WsError {
    WsError {
        code: WS_CLIENT_RESTITUTE,
        message: "could not restitute client".into(),
        extra: Some(json!({ "cause": cause })),
    }
}

pub fn ws_internal_server_error() -> WsError {
    WsError {
        code: WS_INTERNAL_SERVER_ERROR,
        message: "internal server error".into(),
        extra: None,
    }
}

/// Error payload returned by the HTTP entry points before any upgrade.
#[derive(Debug, Clone, Serialize)]
pub struct HttpError {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self.code {
            HTTP_MISSING_URL_QUERY => StatusCode::BAD_REQUEST,
            HTTP_INVALID_TOKEN | HTTP_INVALID_TOKEN_CLAIM => StatusCode::FORBIDDEN,
            HTTP_UNAUTHORIZED => StatusCode::UNAUTHORIZED,
            WS_LOBBY_NOT_FOUND => StatusCode::NOT_FOUND,
            WS_TOO_MANY_PLAYERS => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn missing_url_query(query: &str) -> HttpError {
    HttpError {
        code: HTTP_MISSING_URL_QUERY,
        message: "missing url query".into(),
        extra: Some(json!({ "query": query })),
    }
}

pub fn http_internal_server_error() -> HttpError {
    HttpError {
        code: HTTP_INTERNAL_SERVER_ERROR,
        message: "internal server error".into(),
        extra: None,
    }
}

pub fn invalid_token() -> HttpError {
    HttpError {
        code: HTTP_INVALID_TOKEN,
        message: "invalid token".into(),
        extra: None,
    }
}

pub fn invalid_token_claim(claim: &str) -> HttpError {
    HttpError {
        code: HTTP_INVALID_TOKEN_CLAIM,
        message: "invalid token claim".into(),
        extra: Some(json!({ "claim": claim })),
    }
}

pub fn unauthorized(cause: &str) -> HttpError {
    HttpError {
        code: HTTP_UNAUTHORIZED,
        message: "unauthorized".into(),
        extra: Some(json!({ "cause": cause })),
    }
}

pub fn lobby_not_found(id: &str) -> HttpError {
    HttpError {
        code: WS_LOBBY_NOT_FOUND,
        message: "lobby not found".into(),
        extra: Some(json!({ "lobbyId": id })),
    }
}

pub fn too_many_players(max_players: i32) -> HttpError {
    HttpError {
        code: WS_TOO_MANY_PLAYERS,
        message: "too many players".into(),
        extra: Some(json!({ "maxPlayers": max_players })),
    }
}

/// Warp rejection wrapper so HTTP-stage errors surface with their taxonomy
/// code and status instead of warp's defaults.
#[derive(Debug)]
pub struct ApiReject(pub HttpError);

impl Reject for ApiReject {}

pub fn reject(err: HttpError) -> warp::Rejection {
    warp::reject::custom(ApiReject(err))
}

/// Maps rejections back to JSON error bodies.
pub async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let body;
    let status;

    if let Some(ApiReject(api_err)) = err.find::<ApiReject>() {
        status = api_err.status();
        body = api_err.clone();
    } else if err.is_not_found() {
        body = lobby_not_found("");
        status = StatusCode::NOT_FOUND;
    } else {
        log::error!("unhandled rejection: {:?}", err);
        body = http_internal_server_error();
        status = StatusCode::INTERNAL_SERVER_ERROR;
    }

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Token mint/verify failures, split so the HTTP stage can distinguish a bad
/// signature (103) from a bad claim set (104).
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("invalid token claims: {0}")]
    InvalidClaims(#[source] jsonwebtoken::errors::Error),
    #[error("token does not match lobby id")]
    LobbyMismatch,
}

/// Lobby registration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no lobby id slot available")]
    NoSlot,
}

/// A single connection write failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("connection write timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// Aggregate of per-recipient broadcast write failures. A failed write to one
/// connection never stops the others.
#[derive(Debug, Error)]
#[error("broadcast failed for {failed} of {total} connections")]
pub struct BroadcastError {
    pub failed: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_error_serializes_with_code() {
        let res = username_already_exists("alice").into_response();
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], 205);
        assert_eq!(json["data"]["extra"]["username"], "alice");
    }

    #[test]
    fn ws_error_without_extra_omits_field() {
        let json = serde_json::to_value(ws_internal_server_error()).unwrap();
        assert_eq!(json["code"], 208);
        assert!(json.get("extra").is_none());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(missing_url_query("id").status(), StatusCode::BAD_REQUEST);
        assert_eq!(unauthorized("bad password").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(invalid_token().status(), StatusCode::FORBIDDEN);
        assert_eq!(invalid_token_claim("username").status(), StatusCode::FORBIDDEN);
        assert_eq!(lobby_not_found("ABCDE").status(), StatusCode::NOT_FOUND);
        assert_eq!(too_many_players(1).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            http_internal_server_error().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
