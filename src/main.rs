mod auth;
mod config;
mod errors;
mod limiter;
mod lobby;
mod player;
mod quiz;
mod registry;
mod scheduler;
mod types;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use warp::Filter;

use crate::config::Config;
use crate::quiz::Quiz;
use crate::registry::{Lobbies, LobbyOptions};
use crate::types::CreateLobbyResponse;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::from_env();

    let quizzes = match quiz::load_quizzes(&cfg.quiz_dir) {
        Ok(quizzes) => quizzes,
        Err(e) => {
            warn!("loading quizzes from {}: {}", cfg.quiz_dir.display(), e);
            HashMap::new()
        }
    };
    info!("{} quizzes loaded", quizzes.len());

    let lobbies: Arc<Lobbies> = Arc::new(Lobbies::new());

    let cfg_filter = {
        let cfg = cfg.clone();
        warp::any().map(move || cfg.clone())
    };
    let lobbies_filter = {
        let lobbies = lobbies.clone();
        warp::any().map(move || lobbies.clone())
    };
    let quizzes_filter = warp::any().map(move || quizzes.clone());

    let create_lobby = warp::path!("lobby")
        .and(warp::post())
        .and(cfg_filter.clone())
        .and(lobbies_filter.clone())
        .and(quizzes_filter)
        .and_then(create_lobby_handler);

    // GET /lobby without an id never reaches the join route.
    let lobby_missing_id = warp::path!("lobby").and(warp::get()).and_then(|| async {
        Err::<warp::reply::Json, warp::Rejection>(errors::reject(errors::missing_url_query("id")))
    });

    let join_lobby = warp::path!("lobby" / String)
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>("sec-websocket-protocol"))
        .and(warp::ws())
        .and(cfg_filter)
        .and(lobbies_filter)
        .and_then(join_lobby_handler);

    let cors = if cfg.allowed_origins.iter().any(|o| o == "*") {
        warn!("CORS: all origins allowed");
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["content-type", "authorization"])
    } else {
        warp::cors()
            .allow_origins(cfg.allowed_origins.iter().map(|s| s.as_str()))
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["content-type", "authorization"])
    };

    let routes = create_lobby
        .or(join_lobby)
        .or(lobby_missing_id)
        .recover(errors::handle_rejection)
        .with(cors)
        .with(warp::log("quizparty"));

    // Graceful shutdown on SIGINT/SIGTERM.
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C, shutting down...");
        }
        let _ = tx.send(());
    });

    info!("quizparty server listening on {}", cfg.addr);
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(cfg.addr, async {
        rx.await.ok();
    });

    server.await;
    info!("server shutdown complete");
}

async fn create_lobby_handler(
    cfg: Config,
    lobbies: Arc<Lobbies>,
    quizzes: HashMap<String, Quiz>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let lobby = lobbies
        .register(LobbyOptions {
            owner: None,
            max_players: cfg.max_players,
            password: None,
            quizzes,
            jwt_salt: cfg.jwt_secret.clone(),
            register_timeout: cfg.register_timeout,
        })
        .await
        .map_err(|e| {
            error!("lobby registration: {}", e);
            errors::reject(errors::http_internal_server_error())
        })?;

    Ok(warp::reply::json(&CreateLobbyResponse {
        id: lobby.id().to_string(),
    }))
}

async fn join_lobby_handler(
    id: String,
    query: HashMap<String, String>,
    authorization: Option<String>,
    subprotocols: Option<String>,
    ws: warp::ws::Ws,
    cfg: Config,
    lobbies: Arc<Lobbies>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let token = ws::bearer_token(authorization.as_deref(), subprotocols.as_deref());
    let password = query.get("p").map(String::as_str);

    let (lobby, restitute) = ws::prepare_connection(&lobbies, &id, password, token.as_deref())
        .await
        .map_err(errors::reject)?;

    Ok(ws
        .max_message_size(cfg.websocket_read_limit)
        .on_upgrade(move |socket| {
            ws::client_connection(socket, lobby, lobbies, cfg.rate_limit, restitute)
        }))
}
