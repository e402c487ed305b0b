use axum::{
    Extension, Json,
    extract::{Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use conselho_db::ledger::PAGE_SIZE;
use conselho_gateway::auth::Identity;
use conselho_types::api::{
    AmountRequest, BalanceResponse, LedgerReceipt, TransactionsResponse, TransferReceipt,
    TransferRequest,
};
use conselho_types::events::NotificationEvent;

use crate::AppState;
use crate::error::{ApiError, join_error};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let db = state.db.clone();
    let balance = tokio::task::spawn_blocking(move || db.balance(identity.user_id))
        .await
        .map_err(join_error)??;
    Ok(Json(BalanceResponse { balance }))
}

pub async fn transactions(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let db = state.db.clone();
    let transactions = tokio::task::spawn_blocking(move || db.transactions(identity.user_id, page))
        .await
        .map_err(join_error)??;
    Ok(Json(TransactionsResponse {
        transactions,
        page,
        page_size: PAGE_SIZE,
    }))
}

/// Credit the caller's account. This is the single entry point the payment
/// processor integration uses.
pub async fn add(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<LedgerReceipt>, ApiError> {
    let reference_id = reference_or_generated(req.reference_id, "add");
    let db = state.db.clone();
    let user_id = identity.user_id;
    let reference = reference_id.clone();
    let row = tokio::task::spawn_blocking(move || db.add_credits(user_id, req.amount, &reference))
        .await
        .map_err(join_error)??;

    state
        .gateway
        .notifications()
        .notify(
            user_id,
            NotificationEvent::CreditsAdded {
                amount: row.amount,
                balance: row.balance_after,
                reference_id,
            },
        )
        .await;

    Ok(Json(LedgerReceipt {
        transaction_id: row.id,
        amount: row.amount,
        new_balance: row.balance_after,
    }))
}

pub async fn debit(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<LedgerReceipt>, ApiError> {
    let reference_id = reference_or_generated(req.reference_id, "debit");
    let db = state.db.clone();
    let user_id = identity.user_id;
    let reference = reference_id.clone();
    let row =
        tokio::task::spawn_blocking(move || db.debit_credits(user_id, req.amount, &reference))
            .await
            .map_err(join_error)??;

    state
        .gateway
        .notifications()
        .notify(
            user_id,
            NotificationEvent::CreditsDebited {
                amount: row.amount,
                balance: row.balance_after,
                reference_id,
            },
        )
        .await;

    Ok(Json(LedgerReceipt {
        transaction_id: row.id,
        amount: row.amount,
        new_balance: row.balance_after,
    }))
}

pub async fn transfer(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<TransferReceipt>, ApiError> {
    let db = state.db.clone();
    let sender = identity.user_id;
    let recipient = req.recipient_id;
    let receipt =
        tokio::task::spawn_blocking(move || db.transfer_credits(sender, recipient, req.amount))
            .await
            .map_err(join_error)??;

    state
        .gateway
        .notifications()
        .notify(
            recipient,
            NotificationEvent::TransferReceived {
                from_user_id: sender,
                amount: receipt.credit.amount,
                balance: receipt.credit.balance_after,
            },
        )
        .await;

    Ok(Json(TransferReceipt {
        transfer_id: receipt.transfer_id,
        amount: receipt.debit.amount,
        sender_new_balance: receipt.debit.balance_after,
    }))
}

fn reference_or_generated(reference_id: Option<String>, kind: &str) -> String {
    match reference_id {
        Some(r) if !r.trim().is_empty() => r,
        _ => format!("{}:{}", kind, Uuid::new_v4()),
    }
}
