use anyhow::Context;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::WalletHold;

const BALANCES: TableDefinition<&str, i64> = TableDefinition::new("wallet_balances");
const HOLDS: TableDefinition<&str, &[u8]> = TableDefinition::new("wallet_holds");

/// Transactional points ledger with a freeze/confirm/release saga per task.
///
/// Every operation runs inside one redb write transaction, so concurrent
/// freeze/confirm/release calls for the same user serialize instead of
/// interleaving into an inconsistent balance. Invariant: for every user,
/// `balance + sum(active holds) == sum(grants)`.
#[derive(Clone)]
pub struct WalletLedger {
    db: Arc<Database>,
}

impl WalletLedger {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(BALANCES)?;
        write_txn.open_table(HOLDS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Credit points to a user, creating the balance row if needed.
    pub fn grant(&self, user_id: &str, points: i64) -> Result<i64> {
        let write_txn = self.db.begin_write().context("begin wallet write")?;
        let balance = {
            let mut balances = write_txn.open_table(BALANCES).context("open balances")?;
            let current = balances.get(user_id)?.map(|v| v.value()).unwrap_or(0);
            let updated = current + points;
            balances.insert(user_id, updated)?;
            updated
        };
        write_txn.commit().context("commit wallet grant")?;
        Ok(balance)
    }

    /// Seed a balance row for a user that has never been seen. Returns false
    /// without mutating when the row already exists, even at zero balance.
    pub fn ensure_seeded(&self, user_id: &str, points: i64) -> Result<bool> {
        let write_txn = self.db.begin_write().context("begin wallet write")?;
        let seeded = {
            let mut balances = write_txn.open_table(BALANCES).context("open balances")?;
            if balances.get(user_id)?.is_some() {
                false
            } else {
                balances.insert(user_id, points)?;
                true
            }
        };
        write_txn.commit().context("commit wallet seed")?;
        Ok(seeded)
    }

    pub fn balance(&self, user_id: &str) -> Result<i64> {
        let read_txn = self.db.begin_read().context("begin wallet read")?;
        let balances = read_txn.open_table(BALANCES).context("open balances")?;
        Ok(balances.get(user_id)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Provisionally debit `points` for a task. Fails without mutation when
    /// the balance does not cover the debit.
    pub fn freeze(&self, user_id: &str, task_id: &str, points: i64) -> Result<(String, i64)> {
        let hold_id = WalletHold::derive_id(task_id, user_id);
        let write_txn = self.db.begin_write().context("begin wallet write")?;
        let remaining = {
            let mut balances = write_txn.open_table(BALANCES).context("open balances")?;
            let balance = balances.get(user_id)?.map(|v| v.value()).unwrap_or(0);
            if points > balance {
                return Err(Error::WalletInsufficient {
                    need: points,
                    balance,
                });
            }
            let remaining = balance - points;
            balances.insert(user_id, remaining)?;

            let hold = WalletHold {
                id: hold_id.clone(),
                user_id: user_id.to_string(),
                points,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            let mut holds = write_txn.open_table(HOLDS).context("open holds")?;
            let serialized = serde_json::to_vec(&hold)?;
            holds.insert(hold_id.as_str(), serialized.as_slice())?;
            remaining
        };
        write_txn.commit().context("commit wallet freeze")?;
        Ok((hold_id, remaining))
    }

    /// Make the debit permanent: the hold is removed, the points stay gone.
    pub fn confirm(&self, hold_id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("begin wallet write")?;
        {
            let mut holds = write_txn.open_table(HOLDS).context("open holds")?;
            if holds.remove(hold_id)?.is_none() {
                return Err(Error::WalletHoldNotFound(hold_id.to_string()));
            }
        }
        write_txn.commit().context("commit wallet confirm")?;
        Ok(())
    }

    /// Undo the debit: the hold is removed and the points credited back.
    pub fn release(&self, hold_id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("begin wallet write")?;
        {
            let mut holds = write_txn.open_table(HOLDS).context("open holds")?;
            let hold: WalletHold = match holds.remove(hold_id)? {
                Some(data) => serde_json::from_slice(data.value())?,
                None => return Err(Error::WalletHoldNotFound(hold_id.to_string())),
            };
            let mut balances = write_txn.open_table(BALANCES).context("open balances")?;
            let balance = balances.get(hold.user_id.as_str())?.map(|v| v.value()).unwrap_or(0);
            balances.insert(hold.user_id.as_str(), balance + hold.points)?;
        }
        write_txn.commit().context("commit wallet release")?;
        Ok(())
    }

    /// Resume-path variant: a missing hold means a prior process already
    /// resolved it, which is a no-op here, not an error.
    pub fn confirm_if_held(&self, hold_id: &str) -> Result<bool> {
        match self.confirm(hold_id) {
            Ok(()) => Ok(true),
            Err(Error::WalletHoldNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resume-path variant of [`release`](Self::release); see
    /// [`confirm_if_held`](Self::confirm_if_held).
    pub fn release_if_held(&self, hold_id: &str) -> Result<bool> {
        match self.release(hold_id) {
            Ok(()) => Ok(true),
            Err(Error::WalletHoldNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sum of points held for a user across active holds.
    pub fn held_points(&self, user_id: &str) -> Result<i64> {
        let read_txn = self.db.begin_read().context("begin wallet read")?;
        let holds = read_txn.open_table(HOLDS).context("open holds")?;
        let mut total = 0;
        for entry in holds.iter()? {
            let (_, data) = entry?;
            let hold: WalletHold = serde_json::from_slice(data.value())?;
            if hold.user_id == user_id {
                total += hold.points;
            }
        }
        Ok(total)
    }
}
