//! Demo ledger server wired through the transaction middleware.
//!
//! `POST` routes run inside a transaction; `GET` routes bypass it.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tower_http::trace::TraceLayer;
use tracing::info;
use with_db_transactions::{
    EventBus, MemoryBackend, MiddlewareRegistry, TracingListener, TransactionConfig,
    TransactionSession, TxError,
};

#[derive(Parser, Debug)]
#[command(name = "with_db_transactions", about = "Transactional ledger demo server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    addr: SocketAddr,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    store: MemoryBackend,
    flaky_calls: Arc<AtomicU32>,
}

#[derive(Debug, Deserialize)]
struct NewAccount {
    id: String,
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    from: String,
    to: String,
    amount: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,with_db_transactions=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TransactionConfig::from_file(path)?,
        None => TransactionConfig::new()
            .maximum_attempts(3)
            .middleware_groups(["api"]),
    };

    let store = MemoryBackend::new();
    let events = EventBus::new().subscribe(Arc::new(TracingListener));
    let registry = MiddlewareRegistry::boot(config, Arc::new(store.clone()), events)?;

    let state = AppState {
        store,
        flaky_calls: Arc::new(AtomicU32::new(0)),
    };

    let api = Router::new()
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/accounts/:id", get(show_account))
        .route("/transfers", post(transfer))
        .route("/flaky", post(flaky));
    let app = registry
        .apply_group(api, "api")?
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!("listening on {}", args.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn account_key(id: &str) -> String {
    format!("accounts:{id}")
}

async fn list_accounts(State(state): State<AppState>) -> Json<Value> {
    let accounts: Vec<Value> = state
        .store
        .scan_committed("accounts:")
        .await
        .into_iter()
        .map(|(_, account)| account)
        .collect();
    Json(Value::Array(accounts))
}

async fn show_account(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_committed(&account_key(&id)).await {
        Some(account) => (StatusCode::OK, Json(account)),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "account not found" }))),
    }
}

async fn create_account(
    State(state): State<AppState>,
    Extension(session): Extension<TransactionSession>,
    Json(input): Json<NewAccount>,
) -> Result<impl IntoResponse, TxError> {
    let tx = session.open_transaction().ok_or(TxError::NoOpenTransaction)?;
    let key = account_key(&input.id);
    if state.store.get(tx, &key).await?.is_some() {
        return Ok((StatusCode::CONFLICT, Json(json!({ "error": "account exists" }))));
    }

    let account = json!({ "id": input.id, "balance": input.balance });
    state.store.put(tx, key, account.clone()).await?;
    let id = input.id.clone();
    session.after_commit(move || info!(account = %id, "account opened"))?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn transfer(
    State(state): State<AppState>,
    Extension(session): Extension<TransactionSession>,
    Json(input): Json<Transfer>,
) -> Result<impl IntoResponse, TxError> {
    let tx = session.open_transaction().ok_or(TxError::NoOpenTransaction)?;
    let from_key = account_key(&input.from);
    let to_key = account_key(&input.to);

    let (Some(mut from), Some(mut to)) = (
        state.store.get(tx, &from_key).await?,
        state.store.get(tx, &to_key).await?,
    ) else {
        return Ok((StatusCode::NOT_FOUND, Json(json!({ "error": "account not found" }))));
    };

    let from_balance = from["balance"].as_i64().unwrap_or_default() - input.amount;
    let to_balance = to["balance"].as_i64().unwrap_or_default() + input.amount;
    from["balance"] = json!(from_balance);
    to["balance"] = json!(to_balance);

    // Staged before the check so the rollback path is exercised.
    state.store.put(tx, from_key, from).await?;
    state.store.put(tx, to_key, to).await?;
    if from_balance < 0 {
        session.after_rollback(|| info!("transfer rejected, balances restored"))?;
        return Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "insufficient funds" })),
        ));
    }

    Ok((StatusCode::OK, Json(json!({ "from": from_balance, "to": to_balance }))))
}

/// Fails every other call to show the retry loop.
async fn flaky(
    State(state): State<AppState>,
    Extension(session): Extension<TransactionSession>,
) -> Result<impl IntoResponse, TxError> {
    let call = state.flaky_calls.fetch_add(1, Ordering::SeqCst);
    if call % 2 == 0 {
        session.after_every_rollback(|| info!("flaky attempt rolled back, retrying"))?;
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "attempt": session.current_attempt() }))));
    }
    Ok((StatusCode::CREATED, Json(json!({ "attempt": session.current_attempt() }))))
}
