//! Replication client: slot lifecycle, change polling, confirm.
//!
//! Uses regular SQL connections and the wal2json output plugin. Changes are
//! peeked (not consumed) so a crash before registration re-delivers them;
//! `confirm` advances the slot only after the batch pipeline has written and
//! registered everything up to the given position. This gives at-least-once
//! delivery with idempotent registration downstream.

pub mod decode;

use tokio_postgres::Client as PgClient;
use tracing::{debug, info};

use crate::error::{MirrorError, MirrorResult};
use crate::lsn::Lsn;
use crate::model::Message;
use decode::Decoder;

/// wal2json options for the peek query.
///
/// 'format-version', '2'      - one JSON document per change
/// 'include-transaction'      - emit B/C records for commit boundaries
/// 'include-timestamp'        - commit timestamps on B/C records
/// 'include-pk'               - primary key metadata on row records
const WAL2JSON_OPTIONS: &str = "'format-version', '2', 'include-transaction', 'true', \
     'include-timestamp', 'true', 'include-pk', 'true'";

/// Check whether the named replication slot exists.
pub async fn slot_exists(pg: &PgClient, slot_name: &str) -> MirrorResult<bool> {
    let rows = pg
        .query(
            "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;
    Ok(!rows.is_empty())
}

/// Client owning the replication slot and its confirmed position.
pub struct ReplicationClient {
    pg: PgClient,
    slot_name: String,
    /// Full wal2json option list, including table exclusions.
    options: String,
    decoder: Decoder,
    /// Position confirmed to the source; WAL before this is released.
    confirmed: Lsn,
    /// Highest commit LSN already handed to the pipeline; peeked
    /// transactions at or below it are re-deliveries and are dropped.
    delivered_upto: Lsn,
}

impl ReplicationClient {
    /// Open the slot. In fresh-init mode a missing slot is created with the
    /// wal2json plugin; otherwise a missing slot is `SlotMissing`. A slot
    /// held by another process is `SlotInUse`.
    ///
    /// `exclude_tables` are wal2json `filter-tables` patterns (for example
    /// `data_mirror.*`); the registry schema goes here so its own writes
    /// never echo back through the slot.
    pub async fn open(
        pg: PgClient,
        slot_name: &str,
        create_if_missing: bool,
        exclude_tables: &[String],
    ) -> MirrorResult<Self> {
        let rows = pg
            .query(
                "SELECT active, confirmed_flush_lsn::text FROM pg_replication_slots \
                 WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;

        let confirmed = match rows.first() {
            Some(row) => {
                if row.get::<_, bool>(0) {
                    return Err(MirrorError::SlotInUse(slot_name.to_string()));
                }
                let lsn: Option<String> = row.get(1);
                info!("Replication slot already exists: {slot_name}");
                match lsn {
                    Some(text) => text.parse()?,
                    None => Lsn::ZERO,
                }
            }
            None => {
                if !create_if_missing {
                    return Err(MirrorError::SlotMissing(slot_name.to_string()));
                }
                info!("Creating logical replication slot: {slot_name}");
                let row = pg
                    .query_one(
                        "SELECT lsn::text FROM \
                         pg_create_logical_replication_slot($1, 'wal2json')",
                        &[&slot_name],
                    )
                    .await?;
                let created_at: String = row.get(0);
                info!("Created slot {slot_name} at {created_at}");
                created_at.parse()?
            }
        };

        let mut options = WAL2JSON_OPTIONS.to_string();
        if !exclude_tables.is_empty() {
            options.push_str(&format!(
                ", 'filter-tables', '{}'",
                exclude_tables.join(",")
            ));
        }

        Ok(Self {
            pg,
            slot_name: slot_name.to_string(),
            options,
            decoder: Decoder::new(),
            confirmed,
            delivered_upto: confirmed,
        })
    }

    /// The position last confirmed to the source.
    pub fn confirmed(&self) -> Lsn {
        self.confirmed
    }

    /// Highest commit position already handed to the pipeline.
    pub fn delivered_upto(&self) -> Lsn {
        self.delivered_upto
    }

    /// Raise the delivery watermark. Used after a reconnect so transactions
    /// that are already buffered (but not yet confirmed) are not delivered
    /// a second time.
    pub fn fast_forward(&mut self, upto: Lsn) {
        self.delivered_upto = self.delivered_upto.max(upto);
    }

    /// Peek all available changes and decode the complete transactions not
    /// yet handed to the pipeline. Does not consume WAL; a trailing partial
    /// transaction is dropped and re-peeked next time.
    pub async fn poll(&mut self) -> MirrorResult<Vec<Message>> {
        let query = format!(
            "SELECT lsn::text, data FROM pg_logical_slot_peek_changes('{}', NULL, NULL, {})",
            self.slot_name, self.options
        );
        let rows = self.pg.query(&query, &[]).await?;

        let mut out = Vec::new();
        for row in rows {
            let lsn: Lsn = row.get::<_, String>(0).parse()?;
            let data: String = row.get(1);
            let released = self.decoder.push_line(lsn, &data)?;
            if released.is_empty() {
                continue;
            }
            // A non-empty release always ends with the Commit record.
            let Some(Message::Commit { end_lsn, .. }) = released.last() else {
                return Err(MirrorError::Decode(
                    "decoder released a transaction without a commit".to_string(),
                ));
            };
            let end_lsn = *end_lsn;
            if end_lsn <= self.delivered_upto {
                debug!("Skipping re-delivered transaction at {end_lsn}");
                continue;
            }
            self.delivered_upto = end_lsn;
            out.extend(released);
        }
        self.decoder.reset_txn();

        if !out.is_empty() {
            debug!(
                "Polled {} messages up to {}",
                out.len(),
                self.delivered_upto
            );
        }
        Ok(out)
    }

    /// Advance the slot's confirmed position. Never moves backwards; acts
    /// as the heartbeat because the batch loop calls it every cycle.
    pub async fn confirm(&mut self, flushed: Lsn) -> MirrorResult<()> {
        if flushed <= self.confirmed || flushed.is_zero() {
            return Ok(());
        }
        self.pg
            .query(
                "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                &[&self.slot_name, &flushed.to_string()],
            )
            .await?;
        debug!("Advanced slot {} to {flushed}", self.slot_name);
        self.confirmed = flushed;
        Ok(())
    }

    /// The source's current write position; used as the fresh-init baseline
    /// and for empty-cycle checkpoints.
    pub async fn current_wal_lsn(&self) -> MirrorResult<Lsn> {
        let row = self
            .pg
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        Ok(row.get::<_, String>(0).parse()?)
    }
}
