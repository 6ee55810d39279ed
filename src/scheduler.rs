use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::lobby::{Lobby, LobbyState};
use crate::quiz::Question;
use crate::types::ResultsData;

const BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives a started quiz to completion: question playback, owner review and
/// the final results. Runs as the lobby's dedicated task and is the only
/// writer of the current question after start.
pub async fn run_quiz(lobby: Arc<Lobby>, questions: Vec<Question>) {
    let mut done = lobby.done_rx();

    for question in &questions {
        if lobby.is_done() || lobby.state().await == LobbyState::Ended {
            info!("quiz in lobby {} ended early", lobby.id());
            return;
        }

        // Canonical answer stripped, playback time defaulted.
        let outgoing = question.stripped();
        lobby.set_current_question(Some(outgoing.clone())).await;
        let deadline = Instant::now() + outgoing.time;

        if let Err(e) = lobby.broadcast_question(BROADCAST_TIMEOUT, &outgoing).await {
            warn!("lobby {}: broadcast question {}: {}", lobby.id(), outgoing.id, e);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = done.changed() => return,
        }
    }

    lobby.set_current_question(None).await;
    if lobby.is_done() || lobby.state().await == LobbyState::Ended {
        return;
    }
    lobby.set_state(LobbyState::Review).await;

    let (tx, mut rx) = mpsc::channel(1);
    lobby.set_review_tx(Some(tx)).await;

    for question in &questions {
        for player in lobby.live_players().await {
            let Some(answer) = player.answer(question.id).await else {
                continue;
            };

            let err = lobby
                .broadcast_review(BROADCAST_TIMEOUT, question, player.username(), &answer)
                .await;
            if let Err(e) = err {
                warn!("lobby {}: broadcast review: {}", lobby.id(), e);
            }

            // Block until the owner adjudicates this answer.
            let validate = tokio::select! {
                decision = rx.recv() => match decision {
                    Some(v) => v,
                    None => return,
                },
                _ = done.changed() => return,
            };

            if validate {
                player.add_score(question.points()).await;
            }
        }
    }

    lobby.set_review_tx(None).await;

    let mut scores = ResultsData::new();
    for player in lobby.live_players().await {
        scores.insert(player.username().to_string(), player.score().await);
    }
    if let Err(e) = lobby.broadcast_results(BROADCAST_TIMEOUT, scores).await {
        warn!("lobby {}: broadcast results: {}", lobby.id(), e);
    }

    lobby.set_state(LobbyState::Ended).await;
    info!("quiz in lobby {} ended", lobby.id());
}
