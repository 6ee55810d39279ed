use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use warp::ws::WebSocket;

use crate::auth::LobbyClaims;
use crate::errors::{self, HttpError, TokenError, WsError};
use crate::lobby::{ConnHandle, Lobby, LobbyState};
use crate::limiter::Limiter;
use crate::player::Player;
use crate::registry::Lobbies;
use crate::scheduler;
use crate::types::{Request, RequestType, Response, ResponseType};
use crate::types::{
    AnswerRequestData, ConfigureRequestData, KickRequestData, RegisterRequestData,
    ReviewRequestData,
};

// Outbound channel depth per connection, bounding memory for slow clients.
const OUTBOUND_BUFFER: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(5);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Extracts a bearer token from the Authorization header, falling back to
/// tokens smuggled inside Sec-WebSocket-Protocol entries. Browser WebSocket
/// clients cannot set handshake headers, hence the subprotocol detour.
pub fn bearer_token(authorization: Option<&str>, subprotocols: Option<&str>) -> Option<String> {
    if let Some(auth) = authorization {
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    for protocol in subprotocols.unwrap_or_default().split(',') {
        if let Some(token) = protocol.trim().strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    None
}

/// Pre-upgrade admission: resolves the lobby and enforces the HTTP-stage
/// rules. In Quiz and Review states the bearer token names a player to
/// restitute after the upgrade.
pub async fn prepare_connection(
    lobbies: &Lobbies,
    id: &str,
    password: Option<&str>,
    token: Option<&str>,
) -> Result<(Arc<Lobby>, Option<LobbyClaims>), HttpError> {
    let Some(lobby) = lobbies.get(id).await else {
        return Err(errors::lobby_not_found(id));
    };

    match lobby.state().await {
        LobbyState::Created => {
            // First connection moves the lobby into registration.
            if lobby.num_conns().await == 0 {
                lobby.set_state(LobbyState::Register).await;
            }
        }
        LobbyState::Register => {
            if lobby.is_full().await {
                return Err(errors::too_many_players(lobby.max_players()));
            }
        }
        LobbyState::Quiz | LobbyState::Review => {
            let Some(token) = token else {
                return Err(errors::unauthorized("token required to rejoin a started quiz"));
            };
            let claims = lobby.check_token(token).map_err(|e| match e {
                TokenError::InvalidClaims(_) => errors::invalid_token_claim("username"),
                _ => errors::invalid_token(),
            })?;
            return Ok((lobby, Some(claims)));
        }
        LobbyState::Ended => return Err(errors::lobby_not_found(id)),
    }

    if !lobby.check_password(password.unwrap_or_default()).await {
        return Err(errors::unauthorized("invalid lobby password"));
    }

    Ok((lobby, None))
}

/// Runs one upgraded connection to completion: banner or restitution, the
/// heartbeat, the request loop, and finally the disconnect routine.
pub async fn client_connection(
    ws: WebSocket,
    lobby: Arc<Lobby>,
    lobbies: Arc<Lobbies>,
    rate_limit: usize,
    restitute: Option<LobbyClaims>,
) {
    let (ws_sink, mut ws_stream) = ws.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);

    // Single forwarder task per connection keeps frame writes atomic.
    tokio::task::spawn(async move {
        let _ = ReceiverStream::new(rx).forward(ws_sink).await;
    });

    let conn = ConnHandle::new(tx);
    info!("connection {} entering lobby {}", conn.id(), lobby.id());

    if let Some(claims) = restitute {
        if !restitute_player(&lobby, &conn, &claims).await {
            return;
        }
    } else {
        lobby.add_conn(conn.clone()).await;
        if lobby.state().await == LobbyState::Register {
            send_lobby_snapshot(&lobby, &conn, true).await;
        }
    }

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let heartbeat = tokio::spawn(heartbeat(
        conn.clone(),
        last_pong.clone(),
        lobby.clone(),
    ));

    let limiter = Limiter::new(RATE_LIMIT_WINDOW, rate_limit);

    while let Some(result) = ws_stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                error!("connection {}: read: {}", conn.id(), e);
                send_error(&conn, errors::invalid_request("could not read websocket frame"))
                    .await;
                break;
            }
        };

        if msg.is_close() {
            break;
        }
        if msg.is_pong() {
            *last_pong.lock().await = Instant::now();
            continue;
        }
        if msg.is_ping() {
            // The transport layer replies on its own.
            continue;
        }

        let Ok(text) = msg.to_str() else {
            send_error(&conn, errors::invalid_request("expected a text frame")).await;
            break;
        };

        // Admission control; control frames above never consume slots.
        if !limiter.allow().await {
            limiter.wait().await;
        }

        let req: Request = match serde_json::from_str(text) {
            Ok(req) => req,
            Err(e) => {
                warn!("connection {}: request parse: {}", conn.id(), e);
                send_error(&conn, errors::invalid_request("could not decode request")).await;
                break;
            }
        };

        let handled = tokio::time::timeout(
            REQUEST_TIMEOUT,
            handle_request(&lobby, &lobbies, &conn, req),
        )
        .await;
        if handled.is_err() {
            error!("connection {}: request timed out", conn.id());
            send_error(&conn, errors::ws_internal_server_error()).await;
        }
    }

    heartbeat.abort();
    handle_disconnect(&lobbies, &lobby, &conn).await;
    info!("connection {} left lobby {}", conn.id(), lobby.id());
}

/// Reassociates an incoming connection with the player named by the token
/// claims. Returns false when nothing could be restituted.
async fn restitute_player(lobby: &Arc<Lobby>, conn: &ConnHandle, claims: &LobbyClaims) -> bool {
    if !lobby.replace_player_conn(&claims.username, conn.clone()).await {
        send_error(conn, errors::client_restitute("no player to restitute")).await;
        conn.close(1008, "restitution failed");
        return false;
    }

    info!("player {} reconnected to lobby {}", claims.username, lobby.id());

    let update = lobby
        .broadcast_player_update(WRITE_TIMEOUT, &claims.username, "reconnect")
        .await;
    if let Err(e) = update {
        error!("lobby {}: broadcast player update: reconnect: {}", lobby.id(), e);
    }

    if let Some(question) = lobby.current_question().await {
        let res = Response::new(ResponseType::Question, question);
        let _ = conn.send_json(&res, WRITE_TIMEOUT).await;
    }

    true
}

/// Pings every interval and closes the connection when the peer stops
/// answering.
async fn heartbeat(conn: ConnHandle, last_pong: Arc<Mutex<Instant>>, lobby: Arc<Lobby>) {
    let mut done = lobby.done_rx();
    let mut tick = tokio::time::interval(PING_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if last_pong.lock().await.elapsed() > PONG_TIMEOUT {
                    warn!("connection {}: ping timed out, closing", conn.id());
                    conn.close(1001, "ping timeout");
                    return;
                }
                if conn.ping().is_err() {
                    return;
                }
            }
            _ = done.changed() => return,
        }
    }
}

/// State-dependent disconnect semantics.
async fn handle_disconnect(lobbies: &Arc<Lobbies>, lobby: &Arc<Lobby>, conn: &ConnHandle) {
    match lobby.state().await {
        // While registering, the slot is freed outright. An owner leaving
        // hands the lobby to the first player of the sorted list, or tears
        // the lobby down when nobody is left.
        LobbyState::Created | LobbyState::Register => {
            let slot = lobby.get_player_by_conn(conn.id()).await;
            lobby.delete_player_by_conn(conn.id()).await;

            let Some(Some(player)) = slot else {
                // Conn never registered, nothing to announce.
                return;
            };
            let username = player.username().to_string();

            let update = lobby
                .broadcast_player_update(WRITE_TIMEOUT, &username, "disconnect")
                .await;
            if let Err(e) = update {
                error!("lobby {}: broadcast player update: disconnect: {}", lobby.id(), e);
            }

            if lobby.owner().await.as_deref() != Some(username.as_str()) {
                return;
            }

            let players = lobby.player_list().await;
            if players.is_empty() {
                lobbies.delete(lobby.id()).await;
                return;
            }

            let new_owner = players[0].clone();
            lobby.set_owner(Some(new_owner.clone())).await;

            let update = lobby
                .broadcast_player_update(WRITE_TIMEOUT, &new_owner, "new owner")
                .await;
            if let Err(e) = update {
                error!("lobby {}: broadcast player update: new owner: {}", lobby.id(), e);
            }
        }
        // During playback the player stays for a token reconnect; the lobby
        // collapses once nobody is left alive.
        LobbyState::Quiz => {
            match lobby.get_player_by_conn(conn.id()).await {
                Some(Some(player)) => {
                    player.disconnect().await;
                    lobby.detach_conn(conn.id()).await;
                }
                _ => lobby.delete_player_by_conn(conn.id()).await,
            }

            if lobby.player_list().await.is_empty() {
                lobby.set_state(LobbyState::Ended).await;
                lobbies.delete(lobby.id()).await;
            }
        }
        LobbyState::Review | LobbyState::Ended => {
            lobby.delete_player_by_conn(conn.id()).await;
            if lobby.num_conns().await == 0 {
                lobbies.delete(lobby.id()).await;
            }
        }
    }
}

async fn handle_request(
    lobby: &Arc<Lobby>,
    lobbies: &Arc<Lobbies>,
    conn: &ConnHandle,
    req: Request,
) {
    let state = lobby.state().await;
    debug!(
        "connection {}: {} request in lobby {} ({})",
        conn.id(),
        req.kind.as_str(),
        lobby.id(),
        state
    );

    match (state, req.kind) {
        (LobbyState::Register, RequestType::Lobby) => {
            send_lobby_snapshot(lobby, conn, false).await;
        }
        (LobbyState::Register, RequestType::Register) => {
            handle_register_request(lobby, conn, req.data).await;
        }
        (LobbyState::Register, RequestType::Kick) => {
            handle_kick_request(lobby, conn, req.data).await;
        }
        (LobbyState::Register, RequestType::Configure) => {
            handle_configure_request(lobby, conn, req.data).await;
        }
        (LobbyState::Register, RequestType::Start) => {
            handle_start_request(lobby, conn).await;
        }
        (LobbyState::Quiz, RequestType::Answer) => {
            handle_answer_request(lobby, conn, req.data).await;
        }
        (LobbyState::Review, RequestType::Review) => {
            handle_review_request(lobby, conn, req.data).await;
        }
        (_, kind) => {
            let cause = format!("unknown request: {}", kind.as_str());
            send_error(conn, errors::invalid_request(&cause)).await;
        }
    }
}

async fn send_lobby_snapshot(lobby: &Lobby, conn: &ConnHandle, banner: bool) {
    let res = Response::new(ResponseType::Lobby, lobby.snapshot().await);
    if let Err(e) = conn.send_json(&res, WRITE_TIMEOUT).await {
        error!("connection {}: lobby response write: {}", conn.id(), e);
        return;
    }
    if banner {
        debug!("connection {}: banner sent", conn.id());
    }
}

async fn handle_register_request(lobby: &Arc<Lobby>, conn: &ConnHandle, data: Value) {
    let req: RegisterRequestData = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(_) => {
            send_error(conn, errors::invalid_request("invalid register request")).await;
            return;
        }
    };

    // Refuse a second registration on the same connection.
    if let Some(Some(player)) = lobby.get_player_by_conn(conn.id()).await {
        send_error(conn, errors::user_already_registered(player.username())).await;
        return;
    }

    if let Err(cause) = validate_username(&req.username) {
        send_error(conn, errors::invalid_input(json!({ "username": cause }))).await;
        return;
    }

    if lobby.get_player(&req.username).await.is_some() {
        send_error(conn, errors::username_already_exists(&req.username)).await;
        return;
    }

    lobby.add_player_with_conn(conn, &req.username).await;

    let ack = Response::<()>::ack(ResponseType::Register);
    if let Err(e) = conn.send_json(&ack, WRITE_TIMEOUT).await {
        error!("connection {}: register response write: {}", conn.id(), e);
    }

    let update = lobby
        .broadcast_player_update(WRITE_TIMEOUT, &req.username, "join")
        .await;
    if let Err(e) = update {
        error!("lobby {}: broadcast player update: join: {}", lobby.id(), e);
    }

    // First registered player takes ownership.
    if lobby.owner().await.is_none() {
        lobby.set_owner(Some(req.username.clone())).await;
        let update = lobby
            .broadcast_player_update(WRITE_TIMEOUT, &req.username, "new owner")
            .await;
        if let Err(e) = update {
            error!("lobby {}: broadcast player update: new owner: {}", lobby.id(), e);
        }
    }

    info!("player {} registered in lobby {}", req.username, lobby.id());
}

async fn handle_kick_request(lobby: &Arc<Lobby>, conn: &ConnHandle, data: Value) {
    let req: KickRequestData = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(_) => {
            send_error(conn, errors::invalid_request("invalid kick request")).await;
            return;
        }
    };

    if require_owner(lobby, conn).await.is_none() {
        send_error(conn, errors::unauthorized_request("user is not lobby owner")).await;
        return;
    }

    if !lobby.delete_player(&req.username).await {
        send_error(conn, errors::player_not_found(&req.username)).await;
        return;
    }

    let ack = Response::<()>::ack(ResponseType::Kick);
    if let Err(e) = conn.send_json(&ack, WRITE_TIMEOUT).await {
        error!("connection {}: kick response write: {}", conn.id(), e);
    }

    let update = lobby
        .broadcast_player_update(WRITE_TIMEOUT, &req.username, "kick")
        .await;
    if let Err(e) = update {
        error!("lobby {}: broadcast player update: kick: {}", lobby.id(), e);
    }

    info!("player {} kicked from lobby {}", req.username, lobby.id());
}

async fn handle_configure_request(lobby: &Arc<Lobby>, conn: &ConnHandle, data: Value) {
    let req: ConfigureRequestData = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(_) => {
            send_error(conn, errors::invalid_request("invalid configure request")).await;
            return;
        }
    };

    if require_owner(lobby, conn).await.is_none() {
        send_error(conn, errors::unauthorized_request("user is not lobby owner")).await;
        return;
    }

    if !req.quiz.is_empty() {
        if lobby.load_quiz(&req.quiz).is_none() {
            send_error(conn, errors::quiz_not_found(&req.quiz)).await;
            return;
        }
        lobby.set_selected_quiz(&req.quiz).await;
    }
    if !req.password.is_empty() {
        lobby.set_password(req.password.clone()).await;
    }

    let ack = Response::<()>::ack(ResponseType::Configure);
    if let Err(e) = conn.send_json(&ack, WRITE_TIMEOUT).await {
        error!("connection {}: configure response write: {}", conn.id(), e);
    }

    if !req.quiz.is_empty() {
        if let Err(e) = lobby.broadcast_configure(WRITE_TIMEOUT, &req.quiz).await {
            error!("lobby {}: broadcast configure: {}", lobby.id(), e);
        }
    }
}

async fn handle_start_request(lobby: &Arc<Lobby>, conn: &ConnHandle) {
    if require_owner(lobby, conn).await.is_none() {
        send_error(conn, errors::unauthorized_request("user is not lobby owner")).await;
        return;
    }

    // Question ids become their playback index.
    let mut questions = lobby.quiz().await.unwrap_or_default().questions;
    for (i, question) in questions.iter_mut().enumerate() {
        question.id = i as i64;
    }

    lobby.set_state(LobbyState::Quiz).await;
    lobby.close_unregistered_conns().await;

    if let Err(e) = lobby.broadcast_start(WRITE_TIMEOUT).await {
        error!("lobby {}: broadcast start: {}", lobby.id(), e);
    }

    info!("quiz started in lobby {}", lobby.id());
    tokio::spawn(scheduler::run_quiz(lobby.clone(), questions));
}

async fn handle_answer_request(lobby: &Arc<Lobby>, conn: &ConnHandle, data: Value) {
    let req: AnswerRequestData = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(_) => {
            send_error(conn, errors::invalid_request("invalid answer request")).await;
            return;
        }
    };

    // Answers only count while a question is up. No acknowledgement either
    // way, late answers are dropped silently.
    let Some(question) = lobby.current_question().await else {
        return;
    };

    if !req.answer.matches_type(&question.kind) {
        let fields = json!({ "answer": "answer shape does not match question type" });
        send_error(conn, errors::invalid_input(fields)).await;
        return;
    }

    if let Some(Some(player)) = lobby.get_player_by_conn(conn.id()).await {
        player.register_answer(question.id, req.answer).await;
    }
}

async fn handle_review_request(lobby: &Arc<Lobby>, conn: &ConnHandle, data: Value) {
    let req: ReviewRequestData = match serde_json::from_value(data) {
        Ok(req) => req,
        Err(_) => {
            send_error(conn, errors::invalid_request("invalid review request")).await;
            return;
        }
    };

    if require_owner(lobby, conn).await.is_none() {
        send_error(conn, errors::unauthorized_request("user is not lobby owner")).await;
        return;
    }

    if !lobby.send_review(req.validate).await {
        debug!("lobby {}: review decision with no pending review", lobby.id());
    }
}

/// The sender's player when it is the lobby owner.
async fn require_owner(lobby: &Lobby, conn: &ConnHandle) -> Option<Arc<Player>> {
    let player = lobby.get_player_by_conn(conn.id()).await.flatten()?;
    let owner = lobby.owner().await?;
    (player.username() == owner).then_some(player)
}

async fn send_error(conn: &ConnHandle, err: WsError) {
    let res = err.into_response();
    if let Err(e) = conn.send_json(&res, WRITE_TIMEOUT).await {
        error!("connection {}: error response write: {}", conn.id(), e);
    }
}

fn validate_username(username: &str) -> Result<(), &'static str> {
    let count = username.chars().count();
    if count < 3 {
        return Err("username too short");
    }
    if count > 25 {
        return Err("username too long");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokio::sync::mpsc::Receiver;
    use warp::ws::Message;

    use crate::quiz::{Answer, Question, Quiz, QUESTION_TYPE_TEXT};
    use crate::registry::LobbyOptions;

    type Rx = Receiver<Result<Message, warp::Error>>;

    fn test_conn() -> (ConnHandle, Rx) {
        let (tx, rx) = mpsc::channel(64);
        (ConnHandle::new(tx), rx)
    }

    fn test_quizzes() -> HashMap<String, Quiz> {
        let mut quizzes = HashMap::new();
        for name in ["cars", "custom", "default"] {
            quizzes.insert(
                name.to_string(),
                Quiz {
                    name: name.to_string(),
                    questions: vec![Question {
                        title: format!("{} question", name),
                        kind: QUESTION_TYPE_TEXT.into(),
                        answer: Some(Answer {
                            text: Some("42".into()),
                            ..Answer::default()
                        }),
                        ..Question::default()
                    }],
                },
            );
        }
        quizzes
    }

    async fn test_lobby(max_players: i32) -> (Arc<Lobbies>, Arc<Lobby>) {
        let lobbies = Arc::new(Lobbies::new());
        let lobby = lobbies
            .clone()
            .register(LobbyOptions {
                max_players,
                quizzes: test_quizzes(),
                jwt_salt: b"testsecret".to_vec(),
                register_timeout: Duration::from_secs(60),
                ..LobbyOptions::default()
            })
            .await
            .unwrap();
        lobby.set_state(LobbyState::Register).await;
        (lobbies, lobby)
    }

    async fn recv_json(rx: &mut Rx) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expected a frame")
            .unwrap()
            .unwrap();
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    async fn register(lobby: &Arc<Lobby>, username: &str) -> (ConnHandle, Rx) {
        let (conn, mut rx) = test_conn();
        lobby.add_conn(conn.clone()).await;
        handle_register_request(lobby, &conn, json!({ "username": username })).await;
        // Drain the ack and our own join broadcast.
        let ack = recv_json(&mut rx).await;
        assert_eq!(ack["type"], "register");
        let join = recv_json(&mut rx).await;
        assert_eq!(join["data"]["action"], "join");
        // First player also receives the ownership broadcast.
        if lobby.owner().await.as_deref() == Some(username) {
            let owner = recv_json(&mut rx).await;
            assert_eq!(owner["data"]["action"], "new owner");
        }
        (conn, rx)
    }

    #[test]
    fn bearer_token_lifting() {
        assert_eq!(
            bearer_token(Some("Bearer abc"), None),
            Some("abc".to_string())
        );
        assert_eq!(bearer_token(Some("abc"), None), Some("abc".to_string()));
        assert_eq!(
            bearer_token(None, Some("quizparty, Bearer xyz")),
            Some("xyz".to_string())
        );
        assert_eq!(bearer_token(None, Some("quizparty")), None);
        assert_eq!(bearer_token(None, None), None);
    }

    #[test]
    fn username_boundaries() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"a".repeat(25)).is_ok());
        assert!(validate_username(&"a".repeat(26)).is_err());
        assert!(validate_username("").is_err());
        // Code points, not bytes.
        assert!(validate_username("héllo").is_ok());
    }

    #[tokio::test]
    async fn register_flow_broadcasts_join_then_ownership() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (conn, mut rx) = test_conn();
        lobby.add_conn(conn.clone()).await;

        handle_register_request(&lobby, &conn, json!({ "username": "alice" })).await;

        let ack = recv_json(&mut rx).await;
        assert_eq!(ack["type"], "register");

        let join = recv_json(&mut rx).await;
        assert_eq!(join["type"], "playerUpdate");
        assert_eq!(join["data"]["username"], "alice");
        assert_eq!(join["data"]["action"], "join");

        let owner = recv_json(&mut rx).await;
        assert_eq!(owner["data"]["username"], "alice");
        assert_eq!(owner["data"]["action"], "new owner");

        assert_eq!(lobby.owner().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_username() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (_alice, _rx) = register(&lobby, "alice").await;

        let (conn, mut rx) = test_conn();
        lobby.add_conn(conn.clone()).await;
        handle_register_request(&lobby, &conn, json!({ "username": "alice" })).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["data"]["code"], 205);
    }

    #[tokio::test]
    async fn register_rejects_second_registration_on_conn() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (conn, mut rx) = register(&lobby, "alice").await;

        handle_register_request(&lobby, &conn, json!({ "username": "bob" })).await;

        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 204);
        assert_eq!(err["data"]["extra"]["username"], "alice");
    }

    #[tokio::test]
    async fn register_validates_username_length() {
        let (_lobbies, lobby) = test_lobby(20).await;

        for bad in [String::from("ab"), "x".repeat(26)] {
            let (conn, mut rx) = test_conn();
            lobby.add_conn(conn.clone()).await;
            handle_register_request(&lobby, &conn, json!({ "username": bad })).await;
            let err = recv_json(&mut rx).await;
            assert_eq!(err["data"]["code"], 207);
        }
    }

    #[tokio::test]
    async fn kick_is_owner_only() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (_alice, mut alice_rx) = register(&lobby, "alice").await;
        let (bob, mut bob_rx) = register(&lobby, "bob").await;
        // alice observed bob's join.
        recv_json(&mut alice_rx).await;

        handle_kick_request(&lobby, &bob, json!({ "username": "alice" })).await;
        let err = recv_json(&mut bob_rx).await;
        assert_eq!(err["data"]["code"], 209);
        assert!(lobby.get_player("alice").await.is_some());
    }

    #[tokio::test]
    async fn owner_kicks_player() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, mut alice_rx) = register(&lobby, "alice").await;
        let (_bob, _bob_rx) = register(&lobby, "bob").await;
        recv_json(&mut alice_rx).await; // bob's join

        handle_kick_request(&lobby, &alice, json!({ "username": "bob" })).await;

        let ack = recv_json(&mut alice_rx).await;
        assert_eq!(ack["type"], "kick");
        let update = recv_json(&mut alice_rx).await;
        assert_eq!(update["data"]["username"], "bob");
        assert_eq!(update["data"]["action"], "kick");
        assert!(lobby.get_player("bob").await.is_none());

        // Kicking an unknown player reports 210.
        handle_kick_request(&lobby, &alice, json!({ "username": "bob" })).await;
        let err = recv_json(&mut alice_rx).await;
        assert_eq!(err["data"]["code"], 210);
    }

    #[tokio::test]
    async fn configure_selects_quiz_and_password() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, mut rx) = register(&lobby, "alice").await;

        handle_configure_request(&lobby, &alice, json!({ "quiz": "unknown" })).await;
        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 211);

        handle_configure_request(
            &lobby,
            &alice,
            json!({ "quiz": "custom", "password": "1234" }),
        )
        .await;
        let ack = recv_json(&mut rx).await;
        assert_eq!(ack["type"], "configure");
        let broadcast = recv_json(&mut rx).await;
        assert_eq!(broadcast["type"], "configure");
        assert_eq!(broadcast["data"]["quiz"], "custom");

        assert_eq!(lobby.selected_quiz().await, "custom");
        assert!(lobby.check_password("1234").await);
        assert!(!lobby.check_password("nope").await);
    }

    #[tokio::test]
    async fn start_assigns_ids_and_broadcasts_tokens() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, mut alice_rx) = register(&lobby, "alice").await;

        // An unregistered connection is torn down on start.
        let (bare, mut bare_rx) = test_conn();
        lobby.add_conn(bare).await;

        handle_start_request(&lobby, &alice).await;

        assert_eq!(lobby.state().await, LobbyState::Quiz);
        assert_eq!(lobby.num_conns().await, 1);
        assert!(bare_rx.recv().await.unwrap().unwrap().is_close());

        let start = recv_json(&mut alice_rx).await;
        assert_eq!(start["type"], "start");
        let claims = lobby
            .check_token(start["data"]["token"].as_str().unwrap())
            .unwrap();
        assert_eq!(claims.username, "alice");

        // The scheduler broadcasts the first question with its id assigned
        // and the canonical answer stripped.
        let question = recv_json(&mut alice_rx).await;
        assert_eq!(question["type"], "question");
        assert_eq!(question["data"]["id"], 0);
        assert!(question["data"].get("answer").is_none());
    }

    #[tokio::test]
    async fn start_is_owner_only() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (_alice, _alice_rx) = register(&lobby, "alice").await;
        let (bob, mut bob_rx) = register(&lobby, "bob").await;

        handle_start_request(&lobby, &bob).await;
        let err = recv_json(&mut bob_rx).await;
        assert_eq!(err["data"]["code"], 209);
        assert_eq!(lobby.state().await, LobbyState::Register);
    }

    #[tokio::test]
    async fn answer_records_against_current_question() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, _rx) = register(&lobby, "alice").await;
        let player = lobby.get_player("alice").await.unwrap().1;
        lobby.set_state(LobbyState::Quiz).await;

        // No current question: silently dropped.
        handle_answer_request(&lobby, &alice, json!({ "answer": { "text": "early" } })).await;
        assert!(player.answers().await.is_empty());

        lobby
            .set_current_question(Some(Question {
                id: 2,
                title: "q".into(),
                kind: QUESTION_TYPE_TEXT.into(),
                ..Question::default()
            }))
            .await;

        handle_answer_request(&lobby, &alice, json!({ "answer": { "text": "42" } })).await;
        let answer = player.answer(2).await.unwrap();
        assert_eq!(answer.text.as_deref(), Some("42"));

        // Overwrites on a second submission.
        handle_answer_request(&lobby, &alice, json!({ "answer": { "text": "43" } })).await;
        assert_eq!(player.answer(2).await.unwrap().text.as_deref(), Some("43"));
    }

    #[tokio::test]
    async fn answer_shape_must_match_question_type() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, mut rx) = register(&lobby, "alice").await;
        lobby.set_state(LobbyState::Quiz).await;
        lobby
            .set_current_question(Some(Question {
                id: 0,
                title: "q".into(),
                kind: QUESTION_TYPE_TEXT.into(),
                ..Question::default()
            }))
            .await;

        handle_answer_request(&lobby, &alice, json!({ "answer": { "choices": ["a"] } })).await;
        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 207);
    }

    #[tokio::test]
    async fn review_is_owner_only_and_reaches_scheduler() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (alice, _alice_rx) = register(&lobby, "alice").await;
        let (bob, mut bob_rx) = register(&lobby, "bob").await;
        lobby.set_state(LobbyState::Review).await;

        let (tx, mut decision_rx) = mpsc::channel(1);
        lobby.set_review_tx(Some(tx)).await;

        handle_review_request(&lobby, &bob, json!({ "validate": true })).await;
        let err = recv_json(&mut bob_rx).await;
        assert_eq!(err["data"]["code"], 209);

        handle_review_request(&lobby, &alice, json!({ "validate": true })).await;
        assert_eq!(decision_rx.recv().await, Some(true));
    }

    #[tokio::test]
    async fn dispatch_rejects_out_of_state_requests() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (alice, mut rx) = register(&lobby, "alice").await;

        // `answer` is not accepted while registering.
        let req: Request = serde_json::from_value(json!({ "type": "answer" })).unwrap();
        handle_request(&lobby, &lobbies, &alice, req).await;
        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 201);

        // Unknown request types fall through the same way.
        let req: Request = serde_json::from_value(json!({ "type": "login" })).unwrap();
        handle_request(&lobby, &lobbies, &alice, req).await;
        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 201);
    }

    #[tokio::test]
    async fn owner_disconnect_elects_sorted_first() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (alice, _alice_rx) = register(&lobby, "alice").await;
        let (_carol, _carol_rx) = register(&lobby, "carol").await;
        let (_bob, mut bob_rx) = register(&lobby, "bob").await;

        handle_disconnect(&lobbies, &lobby, &alice).await;

        let disconnect = recv_json(&mut bob_rx).await;
        assert_eq!(disconnect["data"]["username"], "alice");
        assert_eq!(disconnect["data"]["action"], "disconnect");

        let new_owner = recv_json(&mut bob_rx).await;
        assert_eq!(new_owner["data"]["username"], "bob");
        assert_eq!(new_owner["data"]["action"], "new owner");

        assert_eq!(lobby.owner().await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn last_player_disconnect_deletes_lobby() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (alice, _rx) = register(&lobby, "alice").await;
        let id = lobby.id().to_string();

        handle_disconnect(&lobbies, &lobby, &alice).await;

        assert!(lobbies.get(&id).await.is_none());
        assert!(lobby.is_done());
    }

    #[tokio::test]
    async fn quiz_disconnect_keeps_player_for_reconnect() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (alice, _alice_rx) = register(&lobby, "alice").await;
        let (_bob, _bob_rx) = register(&lobby, "bob").await;
        lobby.set_state(LobbyState::Quiz).await;

        handle_disconnect(&lobbies, &lobby, &alice).await;

        let (conn, player) = lobby.get_player("alice").await.unwrap();
        assert!(conn.is_none());
        assert!(!player.alive().await);
        assert!(lobbies.get(lobby.id()).await.is_some());
    }

    #[tokio::test]
    async fn quiz_collapse_when_no_live_players_remain() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (alice, _rx) = register(&lobby, "alice").await;
        lobby.set_state(LobbyState::Quiz).await;
        let id = lobby.id().to_string();

        handle_disconnect(&lobbies, &lobby, &alice).await;

        assert!(lobbies.get(&id).await.is_none());
        assert!(lobby.is_done());
    }

    #[tokio::test]
    async fn prepare_connection_checks() {
        let (lobbies, lobby) = test_lobby(1).await;
        let id = lobby.id().to_string();

        // Unknown lobby.
        let err = prepare_connection(&lobbies, "?????", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 202);

        // Open slot.
        let (lobby_ok, claims) = prepare_connection(&lobbies, &id, None, None).await.unwrap();
        assert_eq!(lobby_ok.id(), id);
        assert!(claims.is_none());

        // Full lobby.
        let (conn, _rx) = test_conn();
        lobby.add_conn(conn).await;
        let err = prepare_connection(&lobbies, &id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 203);
    }

    #[tokio::test]
    async fn prepare_connection_password() {
        let (lobbies, lobby) = test_lobby(20).await;
        lobby.set_password("1234".into()).await;
        let id = lobby.id().to_string();

        let err = prepare_connection(&lobbies, &id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 105);

        let err = prepare_connection(&lobbies, &id, Some("wrong"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 105);

        assert!(prepare_connection(&lobbies, &id, Some("1234"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn prepare_connection_first_conn_moves_created_to_register() {
        let lobbies = Arc::new(Lobbies::new());
        let lobby = lobbies
            .clone()
            .register(LobbyOptions {
                max_players: 20,
                jwt_salt: b"testsecret".to_vec(),
                register_timeout: Duration::from_secs(60),
                ..LobbyOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(lobby.state().await, LobbyState::Created);

        prepare_connection(&lobbies, lobby.id(), None, None)
            .await
            .unwrap();
        assert_eq!(lobby.state().await, LobbyState::Register);
    }

    #[tokio::test]
    async fn prepare_connection_restitution_token_paths() {
        let (lobbies, lobby) = test_lobby(20).await;
        let (_alice, _rx) = register(&lobby, "alice").await;
        lobby.set_state(LobbyState::Quiz).await;
        let id = lobby.id().to_string();

        // No token.
        let err = prepare_connection(&lobbies, &id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 105);

        // Garbage token.
        let err = prepare_connection(&lobbies, &id, None, Some("garbage"))
            .await
            .unwrap_err();
        assert_eq!(err.code, 103);

        // Valid token yields restitution claims.
        let token = lobby.new_token("alice").unwrap();
        let (_lobby, claims) = prepare_connection(&lobbies, &id, None, Some(&token))
            .await
            .unwrap();
        assert_eq!(claims.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn restitution_replaces_conn_and_broadcasts_reconnect() {
        let (_lobbies, lobby) = test_lobby(20).await;
        let (old, old_rx) = register(&lobby, "alice").await;
        let (_bob, mut bob_rx) = register(&lobby, "bob").await;
        lobby.set_state(LobbyState::Quiz).await;

        // alice drops during playback.
        let player = lobby.get_player("alice").await.unwrap().1;
        player.disconnect().await;
        lobby.detach_conn(old.id()).await;

        let (fresh, mut fresh_rx) = test_conn();
        let claims = LobbyClaims {
            lobby_id: lobby.id().to_string(),
            username: "alice".into(),
        };
        assert!(restitute_player(&lobby, &fresh, &claims).await);
        assert!(player.alive().await);

        // alice's old rx got only her pre-disconnect traffic; bob sees the
        // reconnect broadcast after his join/new-owner drains.
        drop(old_rx);
        loop {
            let json = recv_json(&mut bob_rx).await;
            if json["data"]["action"] == "reconnect" {
                assert_eq!(json["data"]["username"], "alice");
                break;
            }
        }
        let fresh_json = recv_json(&mut fresh_rx).await;
        assert_eq!(fresh_json["data"]["action"], "reconnect");
    }

    #[tokio::test]
    async fn restitution_of_unknown_player_errors() {
        let (_lobbies, lobby) = test_lobby(20).await;
        lobby.set_state(LobbyState::Quiz).await;

        let (conn, mut rx) = test_conn();
        let claims = LobbyClaims {
            lobby_id: lobby.id().to_string(),
            username: "ghost".into(),
        };
        assert!(!restitute_player(&lobby, &conn, &claims).await);

        let err = recv_json(&mut rx).await;
        assert_eq!(err["data"]["code"], 206);
        assert!(rx.recv().await.unwrap().unwrap().is_close());
    }
}
