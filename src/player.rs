use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::quiz::Answer;

/// A registered quiz participant. Safe for concurrent use.
#[derive(Debug)]
pub struct Player {
    username: String,
    inner: RwLock<PlayerInner>,
}

#[derive(Debug, Default)]
struct PlayerInner {
    alive: bool,
    score: i64,
    answers: HashMap<i64, Answer>,
}

impl Player {
    pub fn new(username: &str) -> Self {
        Player {
            username: username.to_string(),
            inner: RwLock::new(PlayerInner {
                alive: true,
                ..PlayerInner::default()
            }),
        }
    }

    /// A player slot reserved ahead of its first connection.
    pub fn detached(username: &str) -> Self {
        Player {
            username: username.to_string(),
            inner: RwLock::new(PlayerInner::default()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn alive(&self) -> bool {
        self.inner.read().await.alive
    }

    pub async fn disconnect(&self) {
        self.inner.write().await.alive = false;
    }

    pub async fn connect(&self) {
        self.inner.write().await.alive = true;
    }

    pub async fn score(&self) -> i64 {
        self.inner.read().await.score
    }

    pub async fn add_score(&self, points: i64) {
        self.inner.write().await.score += points;
    }

    /// Records an answer for a question, overwriting any prior one.
    pub async fn register_answer(&self, question_id: i64, answer: Answer) {
        self.inner.write().await.answers.insert(question_id, answer);
    }

    pub async fn answer(&self, question_id: i64) -> Option<Answer> {
        self.inner.read().await.answers.get(&question_id).cloned()
    }

    /// Snapshot of all recorded answers, ordered by question id. Writes that
    /// race the snapshot land on the next one.
    pub async fn answers(&self) -> Vec<(i64, Answer)> {
        let inner = self.inner.read().await;
        let mut answers: Vec<(i64, Answer)> =
            inner.answers.iter().map(|(id, a)| (*id, a.clone())).collect();
        answers.sort_by_key(|(id, _)| *id);
        answers
    }
}
