use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default playback time for questions that do not configure one.
pub const DEFAULT_QUESTION_TIME: Duration = Duration::from_secs(30);

pub const QUESTION_TYPE_CHOICES: &str = "choices";
pub const QUESTION_TYPE_TEXT: &str = "text";
pub const QUESTION_TYPE_ORDER: &str = "order";
pub const QUESTION_TYPE_COORDINATES: &str = "coordinates";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub name: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Wire format is integer nanoseconds; zero means unset.
    #[serde(default, with = "duration_nanos")]
    pub time: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub medias: Vec<Media>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "orderItems")]
    pub order_items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
}

impl Question {
    /// Copy for broadcast: canonical answer removed, playback time defaulted.
    pub fn stripped(&self) -> Question {
        let mut q = self.clone();
        q.answer = None;
        if q.time.is_zero() {
            q.time = DEFAULT_QUESTION_TIME;
        }
        q
    }

    /// Score credited when the owner validates an answer to this question.
    pub fn points(&self) -> i64 {
        self.options
            .as_ref()
            .and_then(|o| o.get("points"))
            .and_then(Value::as_i64)
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

impl Answer {
    /// Checks the payload shape against a question type. Unknown question
    /// types accept any answer.
    pub fn matches_type(&self, kind: &str) -> bool {
        match kind {
            QUESTION_TYPE_CHOICES => self.choices.is_some(),
            QUESTION_TYPE_TEXT => self.text.is_some(),
            QUESTION_TYPE_ORDER => self.order.is_some(),
            QUESTION_TYPE_COORDINATES => self.x.is_some() && self.y.is_some(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

/// Loads every `<name>.json` file under `dir` as a quiz named after the file
/// stem. Each file holds an array of questions.
pub fn load_quizzes(dir: &Path) -> io::Result<HashMap<String, Quiz>> {
    let mut quizzes = HashMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let raw = fs::read_to_string(&path)?;
        let questions: Vec<Question> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        quizzes.insert(
            name.to_string(),
            Quiz {
                name: name.to_string(),
                questions,
            },
        );
    }

    Ok(quizzes)
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(d)?;
        if nanos <= 0 {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}
