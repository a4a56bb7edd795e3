use super::AppState;
use crate::broker::kite::{self, KiteClient};
use crate::broker::{BrokerApi, SessionFactory};
use crate::store::{Account, StrategySnapshot};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Json, Redirect},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", get(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/link", post(link_account))
        .route("/api/accounts/:account_id", put(update_account))
        .route("/api/accounts/:account_id/funds", get(account_funds))
        .route("/api/orders/:child_id", get(child_orders))
        .route("/api/strategy", get(strategy_state))
        .route("/api/strategy/reset", post(reset_strategy))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal_error(err: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    account_id: String,
}

/// Redirect the operator to the broker login page for an account. The
/// account id rides along in `state` so the callback can route the token.
async fn auth_login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect, ApiError> {
    let account = state
        .db
        .accounts()
        .get(&query.account_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Account {} not found", query.account_id),
            )
        })?;

    let url = format!("{}&state={}", kite::login_url(&account.api_key), account.account_id);
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    request_token: String,
    account_id: Option<String>,
    state: Option<String>,
}

/// Broker redirect target: exchange the request token for an access token,
/// refresh the account's capital from live margins, and mark it connected.
async fn auth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ApiError> {
    let accounts = state.db.accounts();

    let (account, session_data) = match query.account_id.or(query.state) {
        Some(id) => {
            let account = accounts
                .get(&id)
                .map_err(internal_error)?
                .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Account {id} not found")))?;
            let data = state
                .sessions
                .generate_session(&account.api_key, &account.api_secret, &query.request_token)
                .await
                .map_err(|e| {
                    (
                        StatusCode::UNAUTHORIZED,
                        format!("Token exchange failed: {e}"),
                    )
                })?;
            (account, data)
        }
        None => {
            // The broker redirect lost its state parameter; try the token
            // against every registered account.
            warn!("login callback without account id; scanning registered accounts");
            let mut matched = None;
            for account in accounts.all().map_err(internal_error)? {
                match state
                    .sessions
                    .generate_session(&account.api_key, &account.api_secret, &query.request_token)
                    .await
                {
                    Ok(data) => {
                        info!(account = %account.account_id, "matched request token");
                        matched = Some((account, data));
                        break;
                    }
                    Err(_) => continue,
                }
            }
            matched.ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    "Could not authenticate with any registered account".to_string(),
                )
            })?
        }
    };

    // Refresh stored capital with a live figure when the fetch succeeds.
    let capital = match KiteClient::new(
        &state.config.kite_base_url,
        &account.api_key,
        &session_data.access_token,
    ) {
        Ok(client) => match client.margins().await {
            Ok(margins) => {
                let equity = margins.total_equity();
                info!(account = %account.account_id, equity, "fetched live capital");
                (equity > 0.0).then_some(equity)
            }
            Err(e) => {
                warn!(account = %account.account_id, "capital refresh failed: {e}");
                None
            }
        },
        Err(_) => None,
    };

    accounts
        .set_session(&account.account_id, &session_data.access_token, capital)
        .map_err(internal_error)?;
    info!(account = %account.account_id, "broker login completed");

    Ok(Json(json!({
        "status": "success",
        "account_id": account.account_id,
    })))
}

#[derive(Debug, Serialize)]
struct AccountSummary {
    account_id: String,
    api_key: String,
    role: &'static str,
    status: &'static str,
    connected: bool,
    capital: f64,
    max_capital_usage: f64,
    last_updated: Option<String>,
}

impl AccountSummary {
    fn from_account(account: Account) -> Self {
        Self {
            api_key: mask(&account.api_key),
            role: account.role.as_str(),
            status: account.status.as_str(),
            connected: account.is_connected(),
            account_id: account.account_id,
            capital: account.capital,
            max_capital_usage: account.max_capital_usage,
            last_updated: account.last_updated,
        }
    }
}

fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(5).collect();
    format!("{prefix}***")
}

async fn list_accounts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let accounts = state.db.accounts().all().map_err(internal_error)?;
    let summaries: Vec<AccountSummary> = accounts
        .into_iter()
        .map(AccountSummary::from_account)
        .collect();
    Ok(Json(json!({
        "count": summaries.len(),
        "accounts": summaries,
    })))
}

#[derive(Debug, Deserialize)]
struct LinkAccountRequest {
    account_id: String,
    api_key: String,
    api_secret: String,
}

/// Register a child account so the operator can complete its broker login.
async fn link_account(
    State(state): State<AppState>,
    Json(body): Json<LinkAccountRequest>,
) -> Result<Json<Value>, ApiError> {
    let inserted = state
        .db
        .accounts()
        .link(&body.account_id, &body.api_key, &body.api_secret)
        .map_err(internal_error)?;
    if !inserted {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Account {} already linked", body.account_id),
        ));
    }

    info!(account = %body.account_id, "account linked");
    Ok(Json(json!({
        "status": "ok",
        "account_id": body.account_id,
        "login_url": kite::login_url(&body.api_key),
    })))
}

#[derive(Debug, Deserialize)]
struct UpdateAccountRequest {
    max_capital_usage: Option<f64>,
}

async fn update_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<UpdateAccountRequest>,
) -> Result<Json<Value>, ApiError> {
    let accounts = state.db.accounts();
    if accounts.get(&account_id).map_err(internal_error)?.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Account {account_id} not found"),
        ));
    }

    if let Some(cap) = body.max_capital_usage {
        accounts
            .set_max_capital_usage(&account_id, cap)
            .map_err(internal_error)?;
        info!(account = %account_id, cap, "cap-limit updated");
    }

    Ok(Json(json!({"status": "ok", "account_id": account_id})))
}

async fn account_funds(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let account = state
        .db
        .accounts()
        .get(&account_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Account {account_id} not found"),
            )
        })?;
    if !account.is_connected() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Account {account_id} not connected; re-authenticate"),
        ));
    }

    let session = state
        .sessions
        .session(&account)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let margins = session
        .margins()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(json!({
        "account_id": account_id,
        "equity": margins.equity,
    })))
}

async fn child_orders(
    State(state): State<AppState>,
    Path(child_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let orders = state
        .db
        .orders()
        .for_child(&child_id, 100)
        .map_err(internal_error)?;
    Ok(Json(json!({
        "account_id": child_id,
        "count": orders.len(),
        "orders": orders,
    })))
}

async fn strategy_state(State(state): State<AppState>) -> Result<Json<StrategySnapshot>, ApiError> {
    let snapshot = state.db.strategy().snapshot().map_err(internal_error)?;
    Ok(Json(snapshot))
}

/// Force-reset: clear the durable strategy state and ask the poller to drop
/// the orchestrator's in-memory snapshot at the next tick boundary.
async fn reset_strategy(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.db.strategy().clear().map_err(internal_error)?;
    state.reset_requested.store(true, Ordering::SeqCst);
    warn!("strategy force-reset requested via admin API");
    Ok(Json(json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_keeps_short_prefix() {
        assert_eq!(mask("abcdefgh"), "abcde***");
        assert_eq!(mask("ab"), "ab***");
    }
}
