use std::time::Instant;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use simplebank_core::{
    Account, CreateAccountParams, CreateUserParams, Currency, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, StorageBackend, StorageError, Transfer, TransferTxParams, TransferTxResult, TxContext,
    User,
};
use time::OffsetDateTime;

use super::{blocking, page_bounds, ApiError, AppState, CancelOnDrop};
use crate::{auth::CallerIdentity, password::hash_password};

// ---- users ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    username: String,
    password: String,
    full_name: String,
    email: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    username: String,
    full_name: String,
    email: String,
    #[serde(with = "time::serde::rfc3339")]
    password_changed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            username: user.username,
            full_name: user.full_name,
            email: user.email,
            password_changed_at: user.password_changed_at,
            created_at: user.created_at,
        }
    }
}

impl CreateUserRequest {
    fn validate(&self) -> Result<(), ApiError> {
        let bad = |msg: &str| Err(ApiError::BadRequest(msg.to_string()));
        if !(3..=100).contains(&self.username.len())
            || !self.username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return bad("username must be 3-100 letters, digits or underscores");
        }
        if !(6..=100).contains(&self.password.len()) {
            return bad("password must be 6-100 characters");
        }
        if self.full_name.trim().is_empty() || !self.full_name.chars().all(|c| c.is_alphabetic() || c == ' ') {
            return bad("full_name must contain only letters and spaces");
        }
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => bad("email is not a valid address"),
        }
    }
}

pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let Json(req) = payload?;
    req.validate()?;

    let store = state.ledger.store().clone();
    let user = blocking(move || {
        let hashed_password =
            hash_password(&req.password).map_err(|e| ApiError::Internal(format!("failed to hash password: {e}")))?;
        Ok(store.create_user(&CreateUserParams {
            username: req.username,
            hashed_password,
            full_name: req.full_name,
            email: req.email,
        })?)
    })
    .await?;

    tracing::info!(username = %user.username, "User created");
    Ok((StatusCode::CREATED, Json(user.into())))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    username: Result<Path<String>, PathRejection>,
) -> Result<Json<UserResponse>, ApiError> {
    let Path(username) = username?;
    if !caller.may_act_for(&username) {
        return Err(ApiError::Unauthorized("cannot view another user".to_string()));
    }
    let store = state.ledger.store().clone();
    let user = blocking(move || Ok(store.get_user(&username)?)).await?;
    Ok(Json(user.into()))
}

// ---- accounts -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    currency: Currency,
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListAccountsQuery {
    owner: Option<String>,
    page_id: i64,
    page_size: i64,
}

fn owned_account(store: &dyn StorageBackend, caller: &CallerIdentity, id: i64) -> Result<Account, ApiError> {
    let account = store.get_account(id)?;
    if !caller.may_act_for(&account.owner) {
        return Err(ApiError::Unauthorized(format!(
            "account {id} doesn't belong to the authenticated user"
        )));
    }
    Ok(account)
}

pub async fn create_account(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let Json(req) = payload?;
    let owner = req.owner.unwrap_or_else(|| caller.name.clone());
    if !caller.may_act_for(&owner) {
        return Err(ApiError::Unauthorized("cannot open an account for another user".to_string()));
    }

    let store = state.ledger.store().clone();
    let account = blocking(move || {
        Ok(store.create_account(&CreateAccountParams {
            owner,
            balance: 0,
            currency: req.currency,
        })?)
    })
    .await?;

    tracing::info!(account_id = account.id, owner = %account.owner, currency = %account.currency, "Account created");
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Account>, ApiError> {
    let Path(id) = id?;
    let store = state.ledger.store().clone();
    blocking(move || owned_account(store.as_ref(), &caller, id)).await.map(Json)
}

pub async fn list_accounts(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<ListAccountsQuery>, QueryRejection>,
) -> Result<Json<Vec<Account>>, ApiError> {
    let Query(query) = query?;
    let (limit, offset) = page_bounds(query.page_id, query.page_size)?;
    let owner = query.owner.unwrap_or_else(|| caller.name.clone());
    if !caller.may_act_for(&owner) {
        return Err(ApiError::Unauthorized("cannot list another user's accounts".to_string()));
    }

    let store = state.ledger.store().clone();
    blocking(move || Ok(store.list_accounts(&ListAccountsParams { owner, limit, offset })?))
        .await
        .map(Json)
}

// ---- transfers ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    currency: Currency,
}

#[derive(Debug, Deserialize)]
pub struct AccountPageQuery {
    account_id: i64,
    page_id: i64,
    page_size: i64,
}

/// Loads an account and checks it is held in `currency`.
fn account_in_currency(store: &dyn StorageBackend, id: i64, currency: Currency) -> Result<Account, ApiError> {
    let account = store.get_account(id)?;
    if account.currency != currency {
        return Err(ApiError::BadRequest(format!(
            "account [{id}] currency mismatch: {} vs {currency}",
            account.currency
        )));
    }
    Ok(account)
}

pub async fn create_transfer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<CreateTransferRequest>, JsonRejection>,
) -> Result<Json<TransferTxResult>, ApiError> {
    let Json(req) = payload?;
    let params = TransferTxParams {
        from_account_id: req.from_account_id,
        to_account_id: req.to_account_id,
        amount: req.amount,
    };
    params.validate()?;

    let store = state.ledger.store().clone();
    blocking(move || {
        let from = account_in_currency(store.as_ref(), params.from_account_id, req.currency)?;
        if !caller.may_act_for(&from.owner) {
            return Err(ApiError::Unauthorized(
                "from account doesn't belong to the authenticated user".to_string(),
            ));
        }
        account_in_currency(store.as_ref(), params.to_account_id, req.currency)?;
        Ok(())
    })
    .await?;

    let ctx = TxContext::with_timeout(state.transfer_timeout);
    let _cancel = CancelOnDrop(ctx.clone());
    let ledger = state.ledger.clone();
    let started = Instant::now();
    let result = blocking(move || Ok(ledger.transfer(&ctx, &params)?)).await;

    let outcome = match &result {
        Ok(_) => "committed",
        Err(ApiError::Storage(
            StorageError::Cancelled | StorageError::DeadlineExceeded | StorageError::LockTimeout,
        )) => "timeout",
        Err(_) => "failed",
    };
    metrics::increment_counter!("simplebank_transfers_total", "outcome" => outcome);
    metrics::histogram!("simplebank_transfer_duration_seconds", started.elapsed().as_secs_f64());

    result.map(Json)
}

pub async fn get_transfer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Transfer>, ApiError> {
    let Path(id) = id?;
    let store = state.ledger.store().clone();
    blocking(move || {
        let transfer = store.get_transfer(id)?;
        let from = store.get_account(transfer.from_account_id)?;
        let to = store.get_account(transfer.to_account_id)?;
        if !caller.may_act_for(&from.owner) && !caller.may_act_for(&to.owner) {
            return Err(ApiError::Unauthorized(format!(
                "transfer {id} doesn't involve the authenticated user"
            )));
        }
        Ok(transfer)
    })
    .await
    .map(Json)
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<AccountPageQuery>, QueryRejection>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    let Query(query) = query?;
    let (limit, offset) = page_bounds(query.page_id, query.page_size)?;
    let store = state.ledger.store().clone();
    blocking(move || {
        owned_account(store.as_ref(), &caller, query.account_id)?;
        Ok(store.list_transfers(&ListTransfersParams {
            from_account_id: query.account_id,
            to_account_id: query.account_id,
            limit,
            offset,
        })?)
    })
    .await
    .map(Json)
}

// ---- entries --------------------------------------------------------------

pub async fn get_entry(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Entry>, ApiError> {
    let Path(id) = id?;
    let store = state.ledger.store().clone();
    blocking(move || {
        let entry = store.get_entry(id)?;
        owned_account(store.as_ref(), &caller, entry.account_id)?;
        Ok(entry)
    })
    .await
    .map(Json)
}

pub async fn list_entries(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<AccountPageQuery>, QueryRejection>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let Query(query) = query?;
    let (limit, offset) = page_bounds(query.page_id, query.page_size)?;
    let store = state.ledger.store().clone();
    blocking(move || {
        owned_account(store.as_ref(), &caller, query.account_id)?;
        Ok(store.list_entries(&ListEntriesParams {
            account_id: query.account_id,
            limit,
            offset,
        })?)
    })
    .await
    .map(Json)
}
