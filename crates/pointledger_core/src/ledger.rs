//! Balance singleton and its atomic mutations.
//!
//! # Responsibility
//! - Own the `"current"` balance record; no other component writes it.
//! - Expose atomic increment/decrement and the conditional debit used by
//!   redemption transactions.
//!
//! # Invariants
//! - No in-process balance state; every read and write goes to the store.
//! - An absent balance record reads as zero, not as not-found.
//! - The balance never goes below zero.

use crate::context::OpContext;
use crate::error::{PointsError, PointsResult};
use crate::model::balance::{CurrentPoints, CURRENT_POINTS_ID};
use crate::model::item::ValidationError;
use crate::store::{Condition, Record, Store, StoreError, Table, WriteOp};
use log::debug;

/// Balance debit staged for a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDebit {
    /// Balance record after the debit.
    pub balance: CurrentPoints,
    /// Conditional write; only applies if the stored balance is unchanged.
    pub op: WriteOp,
}

/// Ledger facade over the balance singleton.
#[derive(Debug, Clone)]
pub struct Ledger<S: Store> {
    store: S,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the current balance, defaulting to zero when never written.
    pub fn get_balance(&self, ctx: &OpContext) -> PointsResult<CurrentPoints> {
        match self
            .store
            .get(ctx, Table::CurrentPoints, CURRENT_POINTS_ID)
        {
            Ok(Record::CurrentPoints(balance)) => Ok(balance),
            Ok(other) => Err(PointsError::database(
                "get_balance",
                Table::CurrentPoints,
                StoreError::InvalidData(format!(
                    "expected balance record, got {} record",
                    other.table()
                )),
            )),
            Err(StoreError::NotFound { .. }) => Ok(CurrentPoints::zero()),
            Err(err) => Err(PointsError::database("get_balance", Table::CurrentPoints, err)),
        }
    }

    /// Adds `delta` points in one atomic store operation.
    pub fn increment(&self, ctx: &OpContext, delta: i64) -> PointsResult<CurrentPoints> {
        ensure_positive(delta)?;
        let balance = self
            .store
            .increment_counter(ctx, delta)
            .map_err(|err| PointsError::database("increment", Table::CurrentPoints, err))?;
        debug!(
            "event=ledger_increment module=ledger status=ok delta={} balance={}",
            delta, balance.point
        );
        Ok(balance)
    }

    /// Subtracts `delta` points if and only if the balance covers it.
    ///
    /// The sufficiency check and the write are one conditional statement, so
    /// two racing decrements cannot both pass against the same balance.
    pub fn decrement(&self, ctx: &OpContext, delta: i64) -> PointsResult<CurrentPoints> {
        ensure_positive(delta)?;
        let applied = self
            .store
            .decrement_counter_if_sufficient(ctx, delta)
            .map_err(|err| PointsError::database("decrement", Table::CurrentPoints, err))?;

        match applied {
            Some(balance) => {
                debug!(
                    "event=ledger_decrement module=ledger status=ok delta={} balance={}",
                    delta, balance.point
                );
                Ok(balance)
            }
            None => {
                let available = self.get_balance(ctx)?.point;
                debug!(
                    "event=ledger_decrement module=ledger status=insufficient delta={} available={}",
                    delta, available
                );
                Err(PointsError::insufficient_points("decrement", delta, available))
            }
        }
    }

    /// Builds the balance half of a redemption transaction.
    ///
    /// `read` must be the balance the caller based its decision on; the write
    /// is conditioned on the stored value still equal to `read.point`.
    pub fn stage_debit(
        &self,
        read: &CurrentPoints,
        cost: i64,
        updated_at: i64,
    ) -> PointsResult<StagedDebit> {
        ensure_positive(cost)?;
        if read.point < cost {
            return Err(PointsError::insufficient_points("redeem", cost, read.point));
        }
        let balance = CurrentPoints::with_point(read.point - cost, updated_at);
        let op = WriteOp::put_if(
            Record::CurrentPoints(balance.clone()),
            Condition::PointEquals(read.point),
        );
        Ok(StagedDebit { balance, op })
    }
}

fn ensure_positive(delta: i64) -> Result<(), ValidationError> {
    if delta <= 0 {
        return Err(ValidationError::new(
            "delta",
            format!("delta must be greater than 0, got {delta}"),
        ));
    }
    Ok(())
}
