//! SQLite snapshot persistence for [`GuardState`].
//!
//! The whole state is rewritten inside one transaction at the end of a run, so
//! a reader only ever sees the previous snapshot or the new one. Concurrent
//! runs are not coordinated: the last committed write wins.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::state::GuardState;
use crate::types::{Direction, TradeRecord, TraderHistory};

pub struct SnapshotStore {
    conn: RefCell<Connection>,
}

impl SnapshotStore {
    /// Creates or opens a SQLite snapshot database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open snapshot database {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS guard_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                watermark INTEGER NOT NULL,
                last_update TEXT,
                addresses_tracked INTEGER NOT NULL,
                bots_detected INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS traders (
                address TEXT PRIMARY KEY,
                first_seen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                address TEXT NOT NULL REFERENCES traders(address),
                seq INTEGER NOT NULL,
                direction TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                amount TEXT NOT NULL,
                counterparty TEXT NOT NULL,
                PRIMARY KEY (address, seq)
            );

            CREATE TABLE IF NOT EXISTS detected_bots (
                address TEXT PRIMARY KEY,
                reasons TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS actioned_bots (
                address TEXT PRIMARY KEY
            );
            ",
        )?;
        Ok(())
    }

    /// Writes `state` as the new snapshot, replacing the previous one atomically.
    ///
    /// # Errors
    /// Returns error if any insert fails; the previous snapshot is left intact.
    #[tracing::instrument(skip_all, fields(watermark = state.watermark()))]
    pub fn save(&self, state: &GuardState) -> Result<()> {
        let summary = state.summary();
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "
            DELETE FROM trades;
            DELETE FROM traders;
            DELETE FROM detected_bots;
            DELETE FROM actioned_bots;
            DELETE FROM guard_meta;
            ",
        )?;
        {
            tx.execute(
                "
                INSERT INTO guard_meta
                    (id, watermark, last_update, addresses_tracked, bots_detected)
                VALUES (1, ?, ?, ?, ?)
                ",
                params![
                    state.watermark(),
                    state.last_update().map(|at| at.to_rfc3339()),
                    summary.addresses_tracked as u64,
                    summary.bots_detected as u64,
                ],
            )?;

            let mut trader_stmt =
                tx.prepare("INSERT INTO traders (address, first_seen) VALUES (?, ?)")?;
            let mut trade_stmt = tx.prepare(
                "
                INSERT INTO trades (address, seq, direction, block_number, amount, counterparty)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for (address, history) in state.traders() {
                let address_text = address.to_checksum(None);
                trader_stmt.execute(params![address_text, history.first_seen()])?;
                for (seq, trade) in history.trades().iter().enumerate() {
                    trade_stmt.execute(params![
                        address_text,
                        seq as u64,
                        trade.direction.as_str(),
                        trade.block_number,
                        trade.amount.to_string(),
                        trade.counterparty.to_checksum(None),
                    ])?;
                }
            }

            let mut detected_stmt =
                tx.prepare("INSERT INTO detected_bots (address, reasons) VALUES (?, ?)")?;
            for address in state.detected() {
                let reasons = serde_json::to_string(state.detection_reasons(address))
                    .wrap_err("failed to encode detection reasons")?;
                detected_stmt.execute(params![address.to_checksum(None), reasons])?;
            }

            let mut actioned_stmt = tx.prepare("INSERT INTO actioned_bots (address) VALUES (?)")?;
            for address in state.actioned() {
                actioned_stmt.execute(params![address.to_checksum(None)])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            addresses_tracked = summary.addresses_tracked,
            bots_detected = summary.bots_detected,
            "snapshot saved"
        );
        Ok(())
    }

    /// Reads the last snapshot. Returns `Ok(None)` when nothing was saved yet.
    ///
    /// # Errors
    /// Returns error if the database cannot be read or holds malformed rows.
    #[tracing::instrument(skip_all)]
    pub fn load(&self) -> Result<Option<GuardState>> {
        let conn = self.conn.borrow();

        let meta: Option<(u64, Option<String>)> = conn
            .query_row(
                "SELECT watermark, last_update FROM guard_meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((watermark, last_update)) = meta else {
            return Ok(None);
        };
        let last_update = last_update
            .map(|text| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|at| at.with_timezone(&Utc))
                    .wrap_err_with(|| format!("invalid last_update timestamp {text}"))
            })
            .transpose()?;

        let mut traders: BTreeMap<Address, TraderHistory> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT address, first_seen FROM traders")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (address, first_seen) in rows {
                traders.insert(parse_address(&address)?, TraderHistory::new(first_seen));
            }
        }

        {
            let mut stmt = conn.prepare(
                "
                SELECT address, direction, block_number, amount, counterparty
                FROM trades ORDER BY address, seq
                ",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (address, direction, block_number, amount, counterparty) in rows {
                let address = parse_address(&address)?;
                let history = traders
                    .get_mut(&address)
                    .ok_or_else(|| eyre!("trade row for unknown trader {address}"))?;
                history.push(TradeRecord {
                    direction: Direction::parse(&direction)
                        .ok_or_else(|| eyre!("invalid trade direction {direction}"))?,
                    block_number,
                    amount: amount
                        .parse::<U256>()
                        .map_err(|error| eyre!("invalid trade amount {amount}: {error}"))?,
                    counterparty: parse_address(&counterparty)?,
                });
            }
        }

        let mut detected: BTreeMap<Address, Vec<String>> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT address, reasons FROM detected_bots")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (address, reasons) in rows {
                let reasons = serde_json::from_str(&reasons)
                    .wrap_err_with(|| format!("invalid detection reasons for {address}"))?;
                detected.insert(parse_address(&address)?, reasons);
            }
        }
        let actioned = load_address_set(&conn, "SELECT address FROM actioned_bots")?;

        tracing::debug!(
            watermark,
            traders = traders.len(),
            detected = detected.len(),
            "snapshot loaded"
        );

        Ok(Some(GuardState::from_parts(
            watermark,
            traders,
            detected,
            actioned,
            last_update,
        )))
    }
}

fn load_address_set(conn: &Connection, sql: &str) -> Result<BTreeSet<Address>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter().map(|text| parse_address(text)).collect()
}

fn parse_address(text: &str) -> Result<Address> {
    text.parse::<Address>()
        .map_err(|error| eyre!("invalid address {text} in snapshot: {error}"))
}
