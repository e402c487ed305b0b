//! Credit ledger: per-user balances plus an append-only transaction log.
//!
//! Every mutating operation is one `BEGIN IMMEDIATE` transaction: the SQLite
//! write lock is taken before the balance is read, so the read-validate-write
//! sequence cannot interleave with another writer, in this process or any
//! other. Any error drops the transaction, which rolls it back; no partial
//! debit or credit is ever visible.

use chrono::Utc;
use conselho_types::models::{Consultation, LedgerTransaction, TransactionKind};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, error};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    CONSULTATION_COLUMNS, TRANSACTION_COLUMNS, cents, consultation_from_row, get_decimal,
    timestamp_text, transaction_from_row,
};

pub const PAGE_SIZE: u32 = 20;

/// Largest single movement the ledger accepts.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 2);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, at most 1000000.00, with at most two decimal places")]
    InvalidAmount,

    #[error("balance limit exceeded")]
    Overflow,

    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    #[error("cannot transfer credits to yourself")]
    SelfTransfer,

    #[error("unknown account {0}")]
    UnknownAccount(Uuid),

    #[error("consultation {0} is not active")]
    ConsultationNotActive(Uuid),

    #[error("ledger transaction failed: {0}")]
    Transaction(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Transaction(e.into())
    }
}

/// Result of a transfer: the sender's debit row and the recipient's add row.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub transfer_id: Uuid,
    pub debit: LedgerTransaction,
    pub credit: LedgerTransaction,
}

/// Result of one billing charge against a consultation.
#[derive(Debug, Clone)]
pub struct Charge {
    pub transaction: LedgerTransaction,
    pub total_charged: Decimal,
}

/// Reject zero, negative, oversized and sub-cent amounts; normalize the rest
/// to cents.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, LedgerError> {
    if amount <= Decimal::ZERO || amount > MAX_AMOUNT || amount.normalize().scale() > 2 {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(cents(amount))
}

impl Database {
    /// Run `f` inside an immediate (write-locked) transaction. Commits on
    /// `Ok`, rolls back on `Err`.
    fn ledger_tx<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Transaction) -> Result<T, LedgerError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(Ok(value))
                }
                // Dropping `tx` rolls back.
                Err(e) => {
                    if let LedgerError::Transaction(inner) = &e {
                        error!("Ledger transaction rolled back: {:#}", inner);
                    }
                    Ok(Err(e))
                }
            }
        })
        .map_err(|e| {
            error!("Ledger store failure: {:#}", e);
            LedgerError::Transaction(e)
        })?
    }

    pub fn add_credits(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<LedgerTransaction, LedgerError> {
        let amount = validate_amount(amount)?;
        self.ledger_tx(|tx| apply(tx, user_id, TransactionKind::Add, amount, reference_id))
    }

    pub fn debit_credits(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<LedgerTransaction, LedgerError> {
        let amount = validate_amount(amount)?;
        self.ledger_tx(|tx| apply(tx, user_id, TransactionKind::Debit, amount, reference_id))
    }

    /// Move credits between two accounts. Both legs commit together or not
    /// at all.
    pub fn transfer_credits(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        amount: Decimal,
    ) -> Result<TransferReceipt, LedgerError> {
        if sender_id == recipient_id {
            return Err(LedgerError::SelfTransfer);
        }
        let amount = validate_amount(amount)?;
        let transfer_id = Uuid::new_v4();

        self.ledger_tx(|tx| {
            let debit = apply(
                tx,
                sender_id,
                TransactionKind::Debit,
                amount,
                &format!("transfer:{}:to:{}", transfer_id, recipient_id),
            )?;
            let credit = apply(
                tx,
                recipient_id,
                TransactionKind::Add,
                amount,
                &format!("transfer:{}:from:{}", transfer_id, sender_id),
            )?;
            Ok(TransferReceipt {
                transfer_id,
                debit,
                credit,
            })
        })
    }

    /// Debit the consultation's client and bump `total_charged` in the same
    /// transaction, so the two can never disagree.
    pub fn charge_consultation(
        &self,
        consultation_id: Uuid,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<Charge, LedgerError> {
        let amount = validate_amount(amount)?;
        self.ledger_tx(|tx| {
            let consultation: Consultation = tx
                .query_row(
                    &format!("SELECT {} FROM consultations WHERE id = ?1", CONSULTATION_COLUMNS),
                    [consultation_id.to_string()],
                    consultation_from_row,
                )
                .optional()?
                .ok_or(LedgerError::ConsultationNotActive(consultation_id))?;

            if !consultation.is_active() {
                return Err(LedgerError::ConsultationNotActive(consultation_id));
            }

            let transaction = apply(
                tx,
                consultation.client_id,
                TransactionKind::Debit,
                amount,
                reference_id,
            )?;

            let total_charged = consultation
                .total_charged
                .checked_add(amount)
                .map(cents)
                .ok_or(LedgerError::Overflow)?;
            tx.execute(
                "UPDATE consultations SET total_charged = ?1 WHERE id = ?2",
                (total_charged.to_string(), consultation_id.to_string()),
            )?;

            Ok(Charge {
                transaction,
                total_charged,
            })
        })
    }

    /// Current balance; users who never transacted have a zero balance.
    pub fn balance(&self, user_id: Uuid) -> Result<Decimal, LedgerError> {
        let balance = self.with_conn(|conn| {
            let balance = conn
                .query_row(
                    "SELECT balance FROM ledger_accounts WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| get_decimal(row, 0),
                )
                .optional()?;
            Ok(balance)
        })?;
        Ok(balance.unwrap_or_else(|| cents(Decimal::ZERO)))
    }

    /// One page of a user's history, newest first. Pages start at 1.
    pub fn transactions(
        &self,
        user_id: Uuid,
        page: u32,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let offset = u64::from(page.max(1) - 1) * u64::from(PAGE_SIZE);
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM credits_transactions
                 WHERE user_id = ?1
                 ORDER BY seq DESC
                 LIMIT ?2 OFFSET ?3",
                TRANSACTION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![user_id.to_string(), PAGE_SIZE, offset],
                    transaction_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    /// Full history in commit order. Used to audit the replay invariant.
    pub fn all_transactions(&self, user_id: Uuid) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM credits_transactions WHERE user_id = ?1 ORDER BY seq ASC",
                TRANSACTION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([user_id.to_string()], transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }
}

/// Read the locked balance, validate, write the new balance and append the
/// transaction row. Must run inside a `ledger_tx`.
fn apply(
    tx: &Transaction,
    user_id: Uuid,
    kind: TransactionKind,
    amount: Decimal,
    reference_id: &str,
) -> Result<LedgerTransaction, LedgerError> {
    let uid = user_id.to_string();

    let known: bool = tx
        .query_row("SELECT 1 FROM users WHERE id = ?1", [&uid], |_| Ok(true))
        .optional()?
        .unwrap_or(false);
    if !known {
        return Err(LedgerError::UnknownAccount(user_id));
    }

    tx.execute(
        "INSERT OR IGNORE INTO ledger_accounts (user_id, balance) VALUES (?1, '0.00')",
        [&uid],
    )?;
    let balance = tx.query_row(
        "SELECT balance FROM ledger_accounts WHERE user_id = ?1",
        [&uid],
        |row| get_decimal(row, 0),
    )?;

    let new_balance = match kind {
        TransactionKind::Add => balance.checked_add(amount).ok_or(LedgerError::Overflow)?,
        TransactionKind::Debit => {
            if balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    balance,
                    required: amount,
                });
            }
            balance.checked_sub(amount).ok_or(LedgerError::Overflow)?
        }
    };
    let new_balance = cents(new_balance);

    tx.execute(
        "UPDATE ledger_accounts SET balance = ?1 WHERE user_id = ?2",
        (new_balance.to_string(), &uid),
    )?;

    let row = LedgerTransaction {
        id: Uuid::new_v4(),
        user_id,
        kind,
        amount,
        balance_after: new_balance,
        reference_id: reference_id.to_string(),
        created_at: Utc::now(),
    };
    tx.execute(
        "INSERT INTO credits_transactions
            (id, user_id, type, amount, balance_after, reference_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            row.id.to_string(),
            uid,
            kind.as_str(),
            amount.to_string(),
            new_balance.to_string(),
            row.reference_id,
            timestamp_text(row.created_at),
        ],
    )?;

    debug!(
        "ledger {} {} for {} -> balance {} ({})",
        kind.as_str(),
        amount,
        user_id,
        new_balance,
        reference_id
    );
    Ok(row)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::open_temp;
    use conselho_types::models::Role;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(id, name, "hash", Role::Client).unwrap();
        id
    }

    fn assert_replay_matches(db: &Database, user_id: Uuid) {
        let rows = db.all_transactions(user_id).unwrap();
        let sum: Decimal = rows.iter().map(|t| t.signed_amount()).sum();
        let balance = db.balance(user_id).unwrap();
        assert_eq!(sum, balance);
        assert!(balance >= Decimal::ZERO);
        if let Some(last) = rows.last() {
            assert_eq!(last.balance_after, balance);
        }
    }

    #[test]
    fn add_then_debit_updates_balance_and_log() {
        let (_dir, db) = open_temp();
        let alice = user(&db, "alice");

        let added = db.add_credits(alice, dec("20"), "pix_1").unwrap();
        assert_eq!(added.kind, TransactionKind::Add);
        assert_eq!(added.balance_after, dec("20.00"));

        let debited = db.debit_credits(alice, dec("3.50"), "minute_1").unwrap();
        assert_eq!(debited.balance_after, dec("16.50"));

        assert_eq!(db.balance(alice).unwrap(), dec("16.50"));
        assert_eq!(db.transactions(alice, 1).unwrap().len(), 2);
        assert_replay_matches(&db, alice);
    }

    #[test]
    fn debit_beyond_balance_changes_nothing() {
        let (_dir, db) = open_temp();
        let bob = user(&db, "bob");
        db.add_credits(bob, dec("5"), "seed").unwrap();

        let err = db.debit_credits(bob, dec("5.01"), "too_much").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { balance, required }
                if balance == dec("5.00") && required == dec("5.01")
        ));
        assert_eq!(db.balance(bob).unwrap(), dec("5.00"));
        assert_eq!(db.all_transactions(bob).unwrap().len(), 1);
    }

    #[test]
    fn rejects_invalid_amounts() {
        let (_dir, db) = open_temp();
        let carol = user(&db, "carol");
        for bad in ["0", "-1", "0.001", "1000000.01", "40000000000000000000000000000"] {
            assert!(matches!(
                db.add_credits(carol, dec(bad), "x"),
                Err(LedgerError::InvalidAmount)
            ));
        }
        // Trailing zeros are not extra precision.
        assert!(db.add_credits(carol, dec("1.500"), "x").is_ok());
    }

    #[test]
    fn oversized_balance_is_refused_and_store_stays_usable() {
        let (_dir, db) = open_temp();
        let whale = user(&db, "whale");
        db.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO ledger_accounts (user_id, balance) VALUES (?1, ?2)",
                (whale.to_string(), Decimal::MAX.to_string()),
            )?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            db.add_credits(whale, MAX_AMOUNT, "top_up"),
            Err(LedgerError::Overflow)
        ));
        assert_eq!(db.balance(whale).unwrap(), Decimal::MAX);

        // The writer is still healthy afterwards.
        let other = user(&db, "other");
        assert_eq!(
            db.add_credits(other, dec("1"), "after").unwrap().balance_after,
            dec("1.00")
        );
    }

    #[test]
    fn unknown_account_is_rejected() {
        let (_dir, db) = open_temp();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            db.add_credits(ghost, dec("1"), "x"),
            Err(LedgerError::UnknownAccount(id)) if id == ghost
        ));
    }

    #[test]
    fn failed_transfer_leaves_both_accounts_untouched() {
        let (_dir, db) = open_temp();
        let a = user(&db, "a");
        let b = user(&db, "b");
        db.add_credits(a, dec("30"), "seed").unwrap();

        let err = db.transfer_credits(a, b, dec("50")).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(db.balance(a).unwrap(), dec("30.00"));
        assert_eq!(db.balance(b).unwrap(), dec("0.00"));
        assert_eq!(db.all_transactions(a).unwrap().len(), 1);
        assert!(db.all_transactions(b).unwrap().is_empty());
    }

    #[test]
    fn transfer_rolls_back_sender_leg_when_recipient_leg_fails() {
        let (_dir, db) = open_temp();
        let a = user(&db, "a");
        db.add_credits(a, dec("30"), "seed").unwrap();

        let err = db.transfer_credits(a, Uuid::new_v4(), dec("10")).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAccount(_)));
        assert_eq!(db.balance(a).unwrap(), dec("30.00"));
        assert_eq!(db.all_transactions(a).unwrap().len(), 1);
    }

    #[test]
    fn transfer_moves_credits_atomically() {
        let (_dir, db) = open_temp();
        let a = user(&db, "a");
        let b = user(&db, "b");
        db.add_credits(a, dec("30"), "seed").unwrap();

        let receipt = db.transfer_credits(a, b, dec("12.25")).unwrap();
        assert_eq!(receipt.debit.balance_after, dec("17.75"));
        assert_eq!(receipt.credit.balance_after, dec("12.25"));
        assert_replay_matches(&db, a);
        assert_replay_matches(&db, b);

        assert!(matches!(
            db.transfer_credits(a, a, dec("1")),
            Err(LedgerError::SelfTransfer)
        ));
    }

    #[test]
    fn concurrent_debits_never_overdraw() {
        let (_dir, db) = open_temp();
        let db = Arc::new(db);
        let payer = user(&db, "payer");
        db.add_credits(payer, dec("10"), "seed").unwrap();

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || db.debit_credits(payer, dec("7"), &format!("race_{}", i)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let short = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();
        assert_eq!((ok, short), (1, 1));
        assert_eq!(db.balance(payer).unwrap(), dec("3.00"));
        assert_replay_matches(&db, payer);
    }

    #[test]
    fn separate_connections_serialize_on_the_database_lock() {
        // Two independent `Database` handles on one file behave like two
        // processes: only SQLite's lock stands between them.
        let (dir, first) = open_temp();
        let second = Database::open(&dir.path().join("test.db")).unwrap();
        let payer = user(&first, "payer");
        first.add_credits(payer, dec("10"), "seed").unwrap();

        let first = Arc::new(first);
        let second = Arc::new(second);
        let t1 = {
            let db = first.clone();
            std::thread::spawn(move || db.debit_credits(payer, dec("6"), "p1"))
        };
        let t2 = {
            let db = second.clone();
            std::thread::spawn(move || db.debit_credits(payer, dec("6"), "p2"))
        };
        let results = [t1.join().unwrap(), t2.join().unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(first.balance(payer).unwrap(), dec("4.00"));
        assert_replay_matches(&first, payer);
    }

    #[test]
    fn ledger_rows_are_append_only() {
        let (_dir, db) = open_temp();
        let a = user(&db, "a");
        db.add_credits(a, dec("1"), "seed").unwrap();

        let result = db.with_conn_mut(|conn| {
            conn.execute("UPDATE credits_transactions SET amount = '999'", [])?;
            Ok(())
        });
        assert!(result.is_err());
        let result = db.with_conn_mut(|conn| {
            conn.execute("DELETE FROM credits_transactions", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn transactions_paginate_newest_first() {
        let (_dir, db) = open_temp();
        let a = user(&db, "a");
        for i in 0..25 {
            db.add_credits(a, dec("1"), &format!("ref_{}", i)).unwrap();
        }
        let first = db.transactions(a, 1).unwrap();
        let second = db.transactions(a, 2).unwrap();
        assert_eq!(first.len(), PAGE_SIZE as usize);
        assert_eq!(second.len(), 5);
        assert_eq!(first[0].reference_id, "ref_24");
        assert_eq!(second[4].reference_id, "ref_0");
        // Page 0 is treated as the first page.
        assert_eq!(db.transactions(a, 0).unwrap()[0].reference_id, "ref_24");
        assert!(db.transactions(a, u32::MAX).unwrap().is_empty());
    }
}
