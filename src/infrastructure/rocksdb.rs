use crate::domain::money::{Amount, Balance};
use crate::domain::order::{Order, OrderNumber, OrderStatus};
use crate::domain::ports::{BalanceLedger, OrderLedger, Outbox};
use crate::domain::task::OutboxEntry;
use crate::domain::user::{BalanceSummary, User, UserId};
use crate::domain::withdrawal::Withdrawal;
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Order number → `Order`.
pub const CF_ORDERS: &str = "orders";
/// User id ++ sequence → order number, for oldest-first listing.
pub const CF_USER_ORDERS: &str = "user_orders";
/// User id → `User`.
pub const CF_USERS: &str = "users";
/// Login → user id.
pub const CF_LOGINS: &str = "logins";
/// User id ++ sequence → `Withdrawal`.
pub const CF_WITHDRAWALS: &str = "withdrawals";
/// Withdrawal order number → user id.
pub const CF_WITHDRAWAL_NUMBERS: &str = "withdrawal_numbers";
/// Sequence → `OutboxEntry`.
pub const CF_OUTBOX: &str = "outbox";
/// Order number → outbox sequence.
pub const CF_OUTBOX_INDEX: &str = "outbox_index";
/// Store-wide counters.
pub const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_ORDERS,
    CF_USER_ORDERS,
    CF_USERS,
    CF_LOGINS,
    CF_WITHDRAWALS,
    CF_WITHDRAWAL_NUMBERS,
    CF_OUTBOX,
    CF_OUTBOX_INDEX,
    CF_META,
];

const SEQUENCE_KEY: &[u8] = b"sequence";

/// A persistent ledger backed by RocksDB.
///
/// Each write operation builds a single `WriteBatch`, so it lands atomically or
/// not at all. Writers are serialized by a process-local lock that also owns
/// the monotonic sequence used to order per-user listings and the outbox.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbLedger {
    db: Arc<DB>,
    sequence: Arc<Mutex<u64>>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn sequenced_key(prefix: &[u8], sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

impl RocksDbLedger {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every required column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| LoyaltyError::Storage(format!("Column family {CF_META} not found")))?;
        let stored = match db.get_cf(meta, SEQUENCE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    LoyaltyError::Storage("Corrupt sequence counter".to_string())
                })?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };

        Ok(Self {
            db: Arc::new(db),
            sequence: Arc::new(Mutex::new(stored)),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LoyaltyError::Storage(format!("Column family {name} not found")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        self.db
            .get_cf(self.cf(cf)?, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_pinned_cf(self.cf(cf)?, key)?.is_some())
    }

    /// Values under `prefix` in key order.
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value);
        }
        Ok(values)
    }

    fn user(&self, user_id: UserId) -> Result<User> {
        self.get(CF_USERS, user_id.as_bytes())?
            .ok_or_else(|| LoyaltyError::not_found("user", user_id))
    }

    fn put_sequence(&self, batch: &mut WriteBatch, sequence: u64) -> Result<()> {
        batch.put_cf(self.cf(CF_META)?, SEQUENCE_KEY, sequence.to_be_bytes());
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for RocksDbLedger {
    async fn insert(&self, number: OrderNumber, user_id: UserId) -> Result<Order> {
        let mut sequence = self.sequence.lock().await;
        self.user(user_id)?;
        if self.exists(CF_ORDERS, number.as_str().as_bytes())? {
            return Err(LoyaltyError::duplicate("order", &number));
        }

        let order = Order::new(number.clone(), user_id);
        let entry = OutboxEntry::new(number.clone());
        let next = *sequence + 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ORDERS)?, number.as_str(), encode(&order)?);
        batch.put_cf(
            self.cf(CF_USER_ORDERS)?,
            sequenced_key(user_id.as_bytes(), next),
            number.as_str(),
        );
        batch.put_cf(self.cf(CF_OUTBOX)?, next.to_be_bytes(), encode(&entry)?);
        batch.put_cf(self.cf(CF_OUTBOX_INDEX)?, number.as_str(), next.to_be_bytes());
        self.put_sequence(&mut batch, next)?;
        self.db.write(batch)?;

        *sequence = next;
        Ok(order)
    }

    async fn find_by_number(&self, number: &OrderNumber) -> Result<Order> {
        self.get(CF_ORDERS, number.as_str().as_bytes())?
            .ok_or_else(|| LoyaltyError::not_found("order", number))
    }

    async fn find_all_by_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        for raw_number in self.scan_prefix(CF_USER_ORDERS, user_id.as_bytes())? {
            let order = self.get(CF_ORDERS, &raw_number)?.ok_or_else(|| {
                LoyaltyError::Storage(format!(
                    "Order index points at missing order {}",
                    String::from_utf8_lossy(&raw_number)
                ))
            })?;
            orders.push(order);
        }
        Ok(orders)
    }

    async fn apply_accrual(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Balance,
    ) -> Result<Order> {
        let _sequence = self.sequence.lock().await;
        let mut order = self.find_by_number(number).await?;
        let mut user = self.user(order.user_id)?;
        let credit = order.settle(status, accrual)?;
        user.balance = user.balance.checked_add(credit)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ORDERS)?, number.as_str(), encode(&order)?);
        batch.put_cf(self.cf(CF_USERS)?, user.id.as_bytes(), encode(&user)?);
        self.db.write(batch)?;
        Ok(order)
    }
}

#[async_trait]
impl BalanceLedger for RocksDbLedger {
    async fn register_user(&self, login: &str, credential_hash: &str) -> Result<User> {
        let _sequence = self.sequence.lock().await;
        if self.exists(CF_LOGINS, login.as_bytes())? {
            return Err(LoyaltyError::duplicate("user", login));
        }

        let user = User::new(login, credential_hash);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_USERS)?, user.id.as_bytes(), encode(&user)?);
        batch.put_cf(self.cf(CF_LOGINS)?, login, user.id.as_bytes());
        self.db.write(batch)?;
        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> Result<User> {
        self.user(user_id)
    }

    async fn find_user_by_login(&self, login: &str) -> Result<User> {
        let raw_id = self
            .db
            .get_cf(self.cf(CF_LOGINS)?, login)?
            .ok_or_else(|| LoyaltyError::not_found("user", login))?;
        let user_id = UserId::from_slice(&raw_id)
            .map_err(|e| LoyaltyError::Storage(format!("Corrupt user id for {login}: {e}")))?;
        self.user(user_id)
    }

    async fn withdraw(
        &self,
        order_number: OrderNumber,
        amount: Amount,
        user_id: UserId,
    ) -> Result<Withdrawal> {
        let mut sequence = self.sequence.lock().await;
        let mut user = self.user(user_id)?;
        user.balance = user.balance.debit(amount)?;
        if self.exists(CF_WITHDRAWAL_NUMBERS, order_number.as_str().as_bytes())? {
            return Err(LoyaltyError::duplicate("withdrawal", &order_number));
        }

        let withdrawal = Withdrawal::new(order_number.clone(), amount, user_id);
        let next = *sequence + 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_USERS)?, user.id.as_bytes(), encode(&user)?);
        batch.put_cf(
            self.cf(CF_WITHDRAWALS)?,
            sequenced_key(user_id.as_bytes(), next),
            encode(&withdrawal)?,
        );
        batch.put_cf(
            self.cf(CF_WITHDRAWAL_NUMBERS)?,
            order_number.as_str(),
            user_id.as_bytes(),
        );
        self.put_sequence(&mut batch, next)?;
        self.db.write(batch)?;

        *sequence = next;
        Ok(withdrawal)
    }

    async fn withdrawals_by_user(&self, user_id: UserId) -> Result<Vec<Withdrawal>> {
        self.scan_prefix(CF_WITHDRAWALS, user_id.as_bytes())?
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }

    async fn balance_summary(&self, user_id: UserId) -> Result<BalanceSummary> {
        let _sequence = self.sequence.lock().await;
        let current = self.user(user_id)?.balance;
        let withdrawn = Balance::checked_sum(
            self.withdrawals_by_user(user_id)
                .await?
                .into_iter()
                .map(|w| Balance::from(w.amount)),
        )?;
        Ok(BalanceSummary { current, withdrawn })
    }
}

#[async_trait]
impl Outbox for RocksDbLedger {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let iter = self.db.iterator_cf(self.cf(CF_OUTBOX)?, IteratorMode::Start);
        let mut entries = Vec::new();
        for item in iter.take(limit) {
            let (_key, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    async fn remove(&self, order_number: &OrderNumber) -> Result<()> {
        let _sequence = self.sequence.lock().await;
        let index = self.cf(CF_OUTBOX_INDEX)?;
        let Some(sequence) = self.db.get_cf(index, order_number.as_str())? else {
            return Ok(());
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_OUTBOX)?, sequence);
        batch.delete_cf(index, order_number.as_str());
        self.db.write(batch)?;
        Ok(())
    }
}
