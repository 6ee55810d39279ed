use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::RegistryError;
use crate::lobby::{Lobby, LobbyState};
use crate::quiz::Quiz;

/// How many id draws to attempt before giving up on registration.
const ID_MINT_ATTEMPTS: usize = 50;

const ID_LEN: usize = 5;
const ID_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Default)]
pub struct LobbyOptions {
    pub owner: Option<String>,
    pub max_players: i32,
    pub password: Option<String>,
    pub quizzes: HashMap<String, Quiz>,
    pub jwt_salt: Vec<u8>,
    pub register_timeout: Duration,
}

/// In-memory keyed container owning every lobby.
#[derive(Default)]
pub struct Lobbies {
    inner: RwLock<HashMap<String, Arc<Lobby>>>,
}

impl Lobbies {
    pub fn new() -> Self {
        Lobbies::default()
    }

    /// Creates a lobby under a freshly minted id and spawns its registration
    /// timeout supervisor.
    pub async fn register(
        self: Arc<Self>,
        opts: LobbyOptions,
    ) -> Result<Arc<Lobby>, RegistryError> {
        self.register_with_mint(opts, short_id).await
    }

    async fn register_with_mint(
        self: Arc<Self>,
        opts: LobbyOptions,
        mut mint: impl FnMut() -> String,
    ) -> Result<Arc<Lobby>, RegistryError> {
        let lobby = {
            let mut map = self.inner.write().await;

            let mut id = None;
            for _ in 0..ID_MINT_ATTEMPTS {
                let candidate = mint();
                if !map.contains_key(&candidate) {
                    id = Some(candidate);
                    break;
                }
            }
            let id = id.ok_or(RegistryError::NoSlot)?;

            let lobby = Arc::new(Lobby::new(
                id.clone(),
                opts.owner,
                opts.max_players,
                opts.password,
                opts.quizzes,
                &opts.jwt_salt,
            ));
            map.insert(id, lobby.clone());
            lobby
        };

        info!("lobby {} registered", lobby.id());

        tokio::spawn(supervise(
            self.clone(),
            lobby.clone(),
            opts.register_timeout,
        ));

        Ok(lobby)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Lobby>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Removes a lobby and closes it while still holding the registry lock,
    /// so a re-registration of the same id cannot race the teardown.
    pub async fn delete(&self, id: &str) {
        let mut map = self.inner.write().await;
        if let Some(lobby) = map.remove(id) {
            lobby.close().await;
            info!("lobby {} deleted", id);
        }
    }
}

/// Waits for the lobby to finish or its registration window to elapse. A
/// lobby still waiting for players at the deadline is deleted.
async fn supervise(lobbies: Arc<Lobbies>, lobby: Arc<Lobby>, timeout: Duration) {
    let mut done = lobby.done_rx();

    tokio::select! {
        _ = done.changed() => {}
        _ = tokio::time::sleep(timeout) => {
            let state = lobby.state().await;
            if matches!(state, LobbyState::Created | LobbyState::Register) {
                info!("lobby {} registration timed out", lobby.id());
                lobbies.delete(lobby.id()).await;
            }
        }
    }
}

/// Mints a 5-character id from a v4 UUID mapped onto a base-62 alphabet.
fn short_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(ID_LEN);
    for _ in 0..ID_LEN {
        id.push(ID_ALPHABET[(n % 62) as usize] as char);
        n /= 62;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> LobbyOptions {
        LobbyOptions {
            max_players: 25,
            jwt_salt: b"testsecret".to_vec(),
            register_timeout: Duration::from_secs(60),
            ..LobbyOptions::default()
        }
    }

    #[test]
    fn short_id_shape() {
        for _ in 0..100 {
            let id = short_id();
            assert_eq!(id.len(), 5);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let lobbies = Arc::new(Lobbies::new());
        let lobby = lobbies.clone().register(opts()).await.unwrap();

        assert_eq!(lobby.id().len(), 5);
        assert_eq!(lobby.state().await, LobbyState::Created);

        let found = lobbies.get(lobby.id()).await.unwrap();
        assert_eq!(found.id(), lobby.id());
        assert!(lobbies.get("?????").await.is_none());
    }

    #[tokio::test]
    async fn exhausted_id_draws_return_no_slot() {
        let lobbies = Arc::new(Lobbies::new());

        let first = lobbies
            .clone()
            .register_with_mint(opts(), || "AAAAA".to_string())
            .await
            .unwrap();
        assert_eq!(first.id(), "AAAAA");

        // Every subsequent draw collides.
        let err = lobbies
            .clone()
            .register_with_mint(opts(), || "AAAAA".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NoSlot);
    }

    #[tokio::test]
    async fn delete_closes_lobby() {
        let lobbies = Arc::new(Lobbies::new());
        let lobby = lobbies.clone().register(opts()).await.unwrap();
        let id = lobby.id().to_string();

        lobbies.delete(&id).await;

        assert!(lobbies.get(&id).await.is_none());
        assert!(lobby.is_done());
    }

    #[tokio::test]
    async fn zero_register_timeout_deletes_immediately() {
        let lobbies = Arc::new(Lobbies::new());
        let mut timeout_opts = opts();
        timeout_opts.register_timeout = Duration::ZERO;

        let lobby = lobbies.clone().register(timeout_opts).await.unwrap();
        let id = lobby.id().to_string();

        // Let the supervisor run its deletion.
        let mut done = lobby.done_rx();
        tokio::time::timeout(Duration::from_secs(1), done.changed())
            .await
            .expect("supervisor should close the lobby")
            .unwrap();

        assert!(lobbies.get(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_ignores_started_lobbies() {
        let lobbies = Arc::new(Lobbies::new());
        let mut short_opts = opts();
        short_opts.register_timeout = Duration::from_secs(5);

        let lobby = lobbies.clone().register(short_opts).await.unwrap();
        lobby.set_state(LobbyState::Quiz).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        // Give the supervisor task a chance to observe the deadline.
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(lobbies.get(lobby.id()).await.is_some());
        assert!(!lobby.is_done());
    }

    #[tokio::test]
    async fn default_quiz_is_lexicographically_first() {
        let lobbies = Arc::new(Lobbies::new());
        let mut quiz_opts = opts();
        for name in ["zebra", "alpha", "middle"] {
            quiz_opts.quizzes.insert(
                name.to_string(),
                Quiz {
                    name: name.to_string(),
                    questions: Vec::new(),
                },
            );
        }

        let lobby = lobbies.clone().register(quiz_opts).await.unwrap();
        assert_eq!(lobby.selected_quiz().await, "alpha");
        assert_eq!(lobby.list_quizzes(), vec!["alpha", "middle", "zebra"]);
    }
}
