use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod admin_socket;
mod assembler;
mod cache;
mod clock;
mod config;
mod database;
mod error;
mod paginator;
mod profile;
mod providers;
mod scoring;
mod service;
mod stores;
mod types;
mod updater;

use crate::{
    admin_socket::AdminSocket,
    clock::SystemClock,
    config::RankingArgs,
    database::Database,
    error::FeedError,
    service::FeedService,
    stores::Stores,
    types::*,
};

#[derive(Parser)]
#[command(name = "feed-ranker")]
#[command(about = "Personalized feed ranking and caching service")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./feed.db")]
    database_url: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    #[arg(long, env = "ADMIN_SOCKET", default_value = "/var/run/feed-ranker.sock")]
    admin_socket: String,

    #[command(flatten)]
    ranking: RankingArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
    /// Run the ranking server (default)
    Serve,
}

#[derive(Clone)]
struct AppState {
    db: Arc<Database>,
    service: Arc<FeedService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (feed_config, scoring_config) = args.ranking.into_configs()?;

    let db = Arc::new(Database::new(&args.database_url).await?);
    db.migrate().await?;

    if matches!(args.command, Some(Command::Migrate)) {
        info!("Migrations applied to {}", args.database_url);
        return Ok(());
    }

    let service = FeedService::new(
        Stores::from_database(Arc::clone(&db)),
        feed_config,
        scoring_config,
        Arc::new(SystemClock),
    );

    let admin_socket = AdminSocket::new(
        Arc::clone(&db),
        Arc::clone(&service),
        args.admin_socket.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = admin_socket.start().await {
            warn!("Admin socket error: {}", e);
        }
    });

    let app = app(AppState { db, service });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Feed ranker listening on port {}", args.port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/feeds/{owner_id}/{feed_type}", get(get_feed))
        .route("/feeds/{owner_id}/{feed_type}/refresh", post(refresh_feed))
        .route(
            "/feeds/{owner_id}/{feed_type}/preferences",
            get(get_preferences).put(update_preferences),
        )
        .route("/events/new-post", post(new_post))
        .route("/events/follow", post(follow_event))
        .route("/events/karma", post(karma_event))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler error: domain errors caused by the request map to 400, the rest to 500.
struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self.0.downcast_ref::<FeedError>() {
            Some(e) if e.is_client_error() => (StatusCode::BAD_REQUEST, e.code()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError"),
        };
        if status.is_server_error() {
            warn!("Request failed: {:#}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message: format!("{:#}", self.0),
            }),
        )
            .into_response()
    }
}

fn feed_type(kind: &str, filter: Option<&str>) -> Result<FeedType, FeedError> {
    FeedType::from_parts(kind.parse::<FeedKind>()?, filter)
}

async fn root() -> &'static str {
    "Feed Ranker"
}

async fn health() -> &'static str {
    "OK"
}

async fn get_feed(
    Path((owner_id, kind)): Path<(String, String)>,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Result<Json<FeedResponse>, AppError> {
    let feed_type = feed_type(&kind, params.filter.as_deref())?;
    let response = state
        .service
        .get_feed(
            &owner_id,
            feed_type,
            params.page.unwrap_or(0),
            paginator::page_size(params.page_size),
            params.force_refresh,
        )
        .await?;
    Ok(Json(response))
}

async fn refresh_feed(
    Path((owner_id, kind)): Path<(String, String)>,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Result<Json<FeedResponse>, AppError> {
    let feed_type = feed_type(&kind, params.filter.as_deref())?;
    info!(owner_id = %owner_id, feed_type = %kind, "Forced refresh requested");
    Ok(Json(state.service.refresh_feed(&owner_id, feed_type).await?))
}

async fn get_preferences(
    Path((owner_id, kind)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<FeedPreferences>, AppError> {
    let kind = kind.parse::<FeedKind>()?;
    Ok(Json(state.service.get_preferences(&owner_id, kind).await?))
}

async fn update_preferences(
    Path((owner_id, kind)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(preferences): Json<FeedPreferences>,
) -> Result<Json<FeedPreferences>, AppError> {
    let kind = kind.parse::<FeedKind>()?;
    Ok(Json(
        state
            .service
            .update_preferences(&owner_id, kind, preferences)
            .await?,
    ))
}

/// Records the post, then fans it out in the background.
async fn new_post(
    State(state): State<AppState>,
    Json(post): Json<PostSnapshot>,
) -> Result<StatusCode, AppError> {
    state.db.upsert_post(&post).await?;
    state.service.notify_new_post(post);
    Ok(StatusCode::ACCEPTED)
}

async fn follow_event(
    State(state): State<AppState>,
    Json(edge): Json<FollowEdge>,
) -> Result<StatusCode, AppError> {
    state.db.upsert_follow(&edge).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn karma_event(
    State(state): State<AppState>,
    Json(event): Json<KarmaEvent>,
) -> Result<StatusCode, AppError> {
    state
        .db
        .set_total_karma(&event.user_id, event.total_karma)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
