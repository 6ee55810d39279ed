use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::error;
use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;
use warp::ws::Message;

use crate::auth::{self, LobbyClaims};
use crate::errors::{BroadcastError, TokenError, WriteError};
use crate::player::Player;
use crate::quiz::{Answer, Question, Quiz};
use crate::types::{
    ConfigureData, LobbySnapshot, PlayerUpdateData, Response, ResponseType, ResultsData,
    ReviewPromptData, StartData,
};

/// Write half of a connection. Frames go through a bounded channel drained by
/// a single forwarder task, which keeps frame delivery atomic.
#[derive(Clone)]
#[derive(Debug)]
pub struct ConnHandle {
    id: Uuid,
    tx: mpsc::Sender<Result<Message, warp::Error>>,
}

impl ConnHandle {
    pub fn new(tx: mpsc::Sender<Result<Message, warp::Error>>) -> Self {
        ConnHandle {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, msg: Message, timeout: Duration) -> Result<(), WriteError> {
        self.tx
            .send_timeout(Ok(msg), timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => WriteError::Timeout,
                SendTimeoutError::Closed(_) => WriteError::Closed,
            })
    }

    pub async fn send_json<T: Serialize>(
        &self,
        v: &T,
        timeout: Duration,
    ) -> Result<(), WriteError> {
        let json = match serde_json::to_string(v) {
            Ok(json) => json,
            Err(e) => {
                error!("response serialize: {}", e);
                return Ok(());
            }
        };
        self.send(Message::text(json), timeout).await
    }

    /// Queues a close frame. The forwarder drains it and the peer's close
    /// reply ends the read loop.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.try_send(Ok(Message::close_with(code, reason)));
    }

    pub fn ping(&self) -> Result<(), WriteError> {
        self.tx
            .try_send(Ok(Message::ping(Vec::new())))
            .map_err(|_| WriteError::Closed)
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    Created,
    Register,
    Quiz,
    Review,
    Ended,
}

impl fmt::Display for LobbyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LobbyState::Created => "created",
            LobbyState::Register => "register",
            LobbyState::Quiz => "quiz",
            LobbyState::Review => "review",
            LobbyState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// One lobby slot. A slot without a connection is a detached player awaiting
/// reconnect; a slot without a player is an upgraded connection that has not
/// registered yet.
#[derive(Debug)]
pub struct Slot {
    pub conn: Option<ConnHandle>,
    pub player: Option<Arc<Player>>,
}

#[derive(Debug)]
struct LobbyInner {
    owner: Option<String>,
    state: LobbyState,
    selected_quiz: String,
    current_question: Option<Question>,
    password: Option<String>,
    slots: Vec<Slot>,
    review_tx: Option<mpsc::Sender<bool>>,
}

/// A single game room with its own lifecycle.
///
/// Multiple tasks may invoke methods on a Lobby concurrently.
#[derive(Debug)]
pub struct Lobby {
    id: String,
    created: DateTime<Utc>,
    max_players: i32,
    quizzes: HashMap<String, Quiz>,
    jwt_key: Vec<u8>,
    done: watch::Sender<bool>,
    inner: RwLock<LobbyInner>,
}

impl Lobby {
    pub fn new(
        id: String,
        owner: Option<String>,
        max_players: i32,
        password: Option<String>,
        quizzes: HashMap<String, Quiz>,
        jwt_salt: &[u8],
    ) -> Self {
        let created = Utc::now();
        let jwt_key = auth::derive_key(jwt_salt, &id, created.timestamp());

        let mut names: Vec<&String> = quizzes.keys().collect();
        names.sort();
        let selected_quiz = names.first().map(|n| n.to_string()).unwrap_or_default();

        let mut slots = Vec::new();
        if let Some(owner) = &owner {
            // Pre-joined owner: a detached slot until the owner connects.
            slots.push(Slot {
                conn: None,
                player: Some(Arc::new(Player::detached(owner))),
            });
        }

        Lobby {
            id,
            created,
            max_players,
            quizzes,
            jwt_key,
            done: watch::channel(false).0,
            inner: RwLock::new(LobbyInner {
                owner,
                state: LobbyState::Created,
                selected_quiz,
                current_question: None,
                password,
                slots,
                review_tx: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn max_players(&self) -> i32 {
        self.max_players
    }

    pub async fn owner(&self) -> Option<String> {
        self.inner.read().await.owner.clone()
    }

    pub async fn set_owner(&self, username: Option<String>) {
        self.inner.write().await.owner = username;
    }

    pub async fn state(&self) -> LobbyState {
        self.inner.read().await.state
    }

    pub async fn set_state(&self, state: LobbyState) {
        self.inner.write().await.state = state;
    }

    pub async fn current_question(&self) -> Option<Question> {
        self.inner.read().await.current_question.clone()
    }

    pub async fn set_current_question(&self, question: Option<Question>) {
        self.inner.write().await.current_question = question;
    }

    pub async fn check_password(&self, given: &str) -> bool {
        match &self.inner.read().await.password {
            None => true,
            Some(p) if p.is_empty() => true,
            Some(p) => p == given,
        }
    }

    pub async fn set_password(&self, password: String) {
        self.inner.write().await.password = Some(password);
    }

    /// Name of the currently selected quiz.
    pub async fn selected_quiz(&self) -> String {
        self.inner.read().await.selected_quiz.clone()
    }

    pub async fn set_selected_quiz(&self, name: &str) {
        self.inner.write().await.selected_quiz = name.to_string();
    }

    pub fn load_quiz(&self, name: &str) -> Option<&Quiz> {
        self.quizzes.get(name)
    }

    pub fn list_quizzes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.quizzes.keys().cloned().collect();
        names.sort();
        names
    }

    /// The selected quiz, if any quizzes were configured.
    pub async fn quiz(&self) -> Option<Quiz> {
        let name = self.selected_quiz().await;
        self.quizzes.get(&name).cloned()
    }

    /// Number of live connections, registered or not.
    pub async fn num_conns(&self) -> usize {
        let inner = self.inner.read().await;
        inner.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    pub async fn is_full(&self) -> bool {
        if self.max_players < 0 {
            return false;
        }
        self.num_conns().await >= self.max_players as usize
    }

    /// Registers a connection not yet associated to a player.
    pub async fn add_conn(&self, conn: ConnHandle) {
        self.inner.write().await.slots.push(Slot {
            conn: Some(conn),
            player: None,
        });
    }

    /// Binds a player to a connection's slot, creating the slot if the
    /// connection is unknown. The player starts alive.
    pub async fn add_player_with_conn(&self, conn: &ConnHandle, username: &str) -> Arc<Player> {
        let player = Arc::new(Player::new(username));
        let mut inner = self.inner.write().await;
        match inner
            .slots
            .iter_mut()
            .find(|s| s.conn.as_ref().is_some_and(|c| c.id() == conn.id()))
        {
            Some(slot) => slot.player = Some(player.clone()),
            None => inner.slots.push(Slot {
                conn: Some(conn.clone()),
                player: Some(player.clone()),
            }),
        }
        player
    }

    /// Finds a player by username along with their connection, if any.
    pub async fn get_player(&self, username: &str) -> Option<(Option<ConnHandle>, Arc<Player>)> {
        let inner = self.inner.read().await;
        inner.slots.iter().find_map(|s| {
            let player = s.player.as_ref()?;
            (player.username() == username).then(|| (s.conn.clone(), player.clone()))
        })
    }

    /// Looks up a connection's slot. `Some(None)` means the connection exists
    /// but has not registered.
    pub async fn get_player_by_conn(&self, conn_id: Uuid) -> Option<Option<Arc<Player>>> {
        let inner = self.inner.read().await;
        inner
            .slots
            .iter()
            .find(|s| s.conn.as_ref().is_some_and(|c| c.id() == conn_id))
            .map(|s| s.player.clone())
    }

    /// Sorted usernames of live players. Detached and unregistered slots are
    /// filtered out.
    pub async fn player_list(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut list = Vec::new();
        for slot in &inner.slots {
            if let Some(player) = &slot.player {
                if player.alive().await {
                    list.push(player.username().to_string());
                }
            }
        }
        list.sort();
        list
    }

    pub async fn live_players(&self) -> Vec<Arc<Player>> {
        let inner = self.inner.read().await;
        let mut players = Vec::new();
        for slot in &inner.slots {
            if let Some(player) = &slot.player {
                if player.alive().await {
                    players.push(player.clone());
                }
            }
        }
        players
    }

    /// Reassigns a player to a new connection, closing the previous one and
    /// flipping the player alive.
    pub async fn replace_player_conn(&self, username: &str, conn: ConnHandle) -> bool {
        let player = {
            let mut inner = self.inner.write().await;
            let Some(slot) = inner.slots.iter_mut().find(|s| {
                s.player
                    .as_ref()
                    .is_some_and(|p| p.username() == username)
            }) else {
                return false;
            };
            if let Some(old) = slot.conn.replace(conn) {
                old.close(1000, "connection replaced");
            }
            slot.player.clone()
        };
        if let Some(player) = player {
            player.connect().await;
        }
        true
    }

    /// Drops a connection from its slot while keeping the player for a later
    /// reconnect.
    pub async fn detach_conn(&self, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|s| s.conn.as_ref().is_some_and(|c| c.id() == conn_id))
        {
            slot.conn = None;
        }
    }

    /// Removes a player by username, closing their connection. Returns false
    /// if no such player exists.
    pub async fn delete_player(&self, username: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(idx) = inner.slots.iter().position(|s| {
            s.player
                .as_ref()
                .is_some_and(|p| p.username() == username)
        }) else {
            return false;
        };
        let slot = inner.slots.remove(idx);
        if let Some(conn) = slot.conn {
            conn.close(1000, "removed from lobby");
        }
        true
    }

    /// Removes a connection's slot, closing the connection.
    pub async fn delete_player_by_conn(&self, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.conn.as_ref().is_some_and(|c| c.id() == conn_id))
        {
            let slot = inner.slots.remove(idx);
            if let Some(conn) = slot.conn {
                conn.close(1000, "removed from lobby");
            }
        }
    }

    /// Closes and removes every slot whose connection never registered.
    pub async fn close_unregistered_conns(&self) {
        let mut inner = self.inner.write().await;
        inner.slots.retain(|slot| {
            if slot.player.is_some() {
                return true;
            }
            if let Some(conn) = &slot.conn {
                conn.close(1000, "registration closed");
            }
            false
        });
    }

    /// Fan-out write with per-recipient message computation. `make` returns
    /// the serialized frame for a slot, or None to skip it. Writes run
    /// concurrently; failures are aggregated and never stop other recipients.
    pub async fn broadcast_with<F>(
        &self,
        timeout: Duration,
        make: F,
    ) -> Result<(), BroadcastError>
    where
        F: Fn(&Slot) -> Option<String>,
    {
        let targets: Vec<(ConnHandle, String)> = {
            let inner = self.inner.read().await;
            inner
                .slots
                .iter()
                .filter_map(|slot| {
                    let conn = slot.conn.clone()?;
                    let json = make(slot)?;
                    Some((conn, json))
                })
                .collect()
        };

        let total = targets.len();
        let results = join_all(
            targets
                .into_iter()
                .map(|(conn, json)| async move { conn.send(Message::text(json), timeout).await }),
        )
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(BroadcastError { failed, total });
        }
        Ok(())
    }

    /// Broadcasts one message to every connection in the lobby.
    pub async fn broadcast<T: Serialize>(
        &self,
        timeout: Duration,
        res: &Response<T>,
    ) -> Result<(), BroadcastError> {
        let json = match serde_json::to_string(res) {
            Ok(json) => json,
            Err(e) => {
                error!("broadcast serialize: {}", e);
                return Ok(());
            }
        };
        self.broadcast_with(timeout, |_| Some(json.clone())).await
    }

    pub async fn broadcast_player_update(
        &self,
        timeout: Duration,
        username: &str,
        action: &str,
    ) -> Result<(), BroadcastError> {
        let res = Response::new(
            ResponseType::PlayerUpdate,
            PlayerUpdateData {
                username: username.to_string(),
                action: action.to_string(),
            },
        );
        self.broadcast(timeout, &res).await
    }

    pub async fn broadcast_configure(
        &self,
        timeout: Duration,
        quiz: &str,
    ) -> Result<(), BroadcastError> {
        let res = Response::new(
            ResponseType::Configure,
            ConfigureData {
                quiz: quiz.to_string(),
            },
        );
        self.broadcast(timeout, &res).await
    }

    /// Broadcasts the start event; each registered recipient gets a token
    /// minted for their own username.
    pub async fn broadcast_start(&self, timeout: Duration) -> Result<(), BroadcastError> {
        self.broadcast_with(timeout, |slot| {
            let player = slot.player.as_ref()?;
            let token = match self.new_token(player.username()) {
                Ok(token) => token,
                Err(e) => {
                    error!("start token for {}: {}", player.username(), e);
                    return None;
                }
            };
            serde_json::to_string(&Response::new(ResponseType::Start, StartData { token })).ok()
        })
        .await
    }

    pub async fn broadcast_question(
        &self,
        timeout: Duration,
        question: &Question,
    ) -> Result<(), BroadcastError> {
        let res = Response::new(ResponseType::Question, question);
        self.broadcast(timeout, &res).await
    }

    pub async fn broadcast_review(
        &self,
        timeout: Duration,
        question: &Question,
        player: &str,
        answer: &Answer,
    ) -> Result<(), BroadcastError> {
        let res = Response::new(
            ResponseType::Review,
            ReviewPromptData {
                question: question.clone(),
                player: player.to_string(),
                answer: answer.clone(),
            },
        );
        self.broadcast(timeout, &res).await
    }

    pub async fn broadcast_results(
        &self,
        timeout: Duration,
        scores: ResultsData,
    ) -> Result<(), BroadcastError> {
        let res = Response::new(ResponseType::Results, scores);
        self.broadcast(timeout, &res).await
    }

    /// Mints a bearer token bound to this lobby and username.
    pub fn new_token(&self, username: &str) -> Result<String, TokenError> {
        auth::sign(
            &self.jwt_key,
            &LobbyClaims {
                lobby_id: self.id.clone(),
                username: username.to_string(),
            },
        )
    }

    /// Validates a bearer token against this lobby's key and id.
    pub fn check_token(&self, token: &str) -> Result<LobbyClaims, TokenError> {
        auth::verify(&self.jwt_key, token, &self.id)
    }

    /// Installs or removes the channel carrying owner review decisions.
    pub async fn set_review_tx(&self, tx: Option<mpsc::Sender<bool>>) {
        self.inner.write().await.review_tx = tx;
    }

    /// Forwards an owner review decision to the scheduler. Returns false when
    /// no review is pending.
    pub async fn send_review(&self, validate: bool) -> bool {
        let inner = self.inner.read().await;
        match &inner.review_tx {
            Some(tx) => tx.try_send(validate).is_ok(),
            None => false,
        }
    }

    /// Signals when the lobby has been closed.
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Closes every connection with a normal-closure reason and signals done.
    /// Idempotent.
    pub async fn close(&self) {
        let inner = self.inner.read().await;
        for slot in &inner.slots {
            if let Some(conn) = &slot.conn {
                conn.close(1000, "lobby closed");
            }
        }
        drop(inner);
        let _ = self.done.send_replace(true);
    }

    /// The snapshot sent as the banner and on `lobby` requests. The current
    /// question, if any, is stripped of its canonical answer.
    pub async fn snapshot(&self) -> LobbySnapshot {
        let player_list = self.player_list().await;
        let inner = self.inner.read().await;
        LobbySnapshot {
            id: self.id.clone(),
            owner: inner.owner.clone(),
            max_players: self.max_players,
            player_list,
            quizzes: self.list_quizzes(),
            current_quiz: inner.selected_quiz.clone(),
            current_question: inner.current_question.as_ref().map(Question::stripped),
            created: self.created().to_rfc3339(),
        }
    }
}
