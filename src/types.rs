use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::quiz::{Answer, Question};

/// Incoming request kinds, dispatched per lobby state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    Lobby,
    Register,
    Kick,
    Configure,
    Start,
    Answer,
    Review,
    #[serde(other)]
    Unknown,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Lobby => "lobby",
            RequestType::Register => "register",
            RequestType::Kick => "kick",
            RequestType::Configure => "configure",
            RequestType::Start => "start",
            RequestType::Answer => "answer",
            RequestType::Review => "review",
            RequestType::Unknown => "unknown",
        }
    }
}

/// Outgoing response kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    Lobby,
    Register,
    Kick,
    Configure,
    PlayerUpdate,
    Start,
    Question,
    Answer,
    Review,
    Results,
    Error,
}

/// Request envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub data: Value,
}

/// Response envelope: `{"type": ..., "message"?: ..., "data"?: ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Response<T> {
    pub fn new(kind: ResponseType, data: T) -> Self {
        Response {
            kind,
            message: None,
            data: Some(data),
        }
    }

    /// A response carrying only its type, used to acknowledge requests.
    pub fn ack(kind: ResponseType) -> Self {
        Response {
            kind,
            message: None,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequestData {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickRequestData {
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigureRequestData {
    #[serde(default)]
    pub quiz: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequestData {
    pub answer: Answer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequestData {
    pub validate: bool,
}

/// Lobby snapshot sent as the banner and on `lobby` requests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySnapshot {
    pub id: String,
    pub owner: Option<String>,
    pub max_players: i32,
    pub player_list: Vec<String>,
    pub quizzes: Vec<String>,
    pub current_quiz: String,
    pub current_question: Option<Question>,
    pub created: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerUpdateData {
    pub username: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureData {
    pub quiz: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartData {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewPromptData {
    pub question: Question,
    pub player: String,
    pub answer: Answer,
}

pub type ResultsData = BTreeMap<String, i64>;

#[derive(Debug, Clone, Serialize)]
pub struct CreateLobbyResponse {
    pub id: String,
}
