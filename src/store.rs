//! SQLite-backed statistics store.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::readings::CumulativeStatisticPoint;
use crate::statistics::{PersistenceError, StatisticMetadata, StatisticsStore};

pub struct SqliteStatisticsStore {
    conn: Connection,
}

impl SqliteStatisticsStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn metadata(
        &self,
        statistic_id: &str,
    ) -> Result<Option<StatisticMetadata>, PersistenceError> {
        let meta = self
            .conn
            .query_row(
                "
                SELECT statistic_id, source, name, unit_of_measurement, has_mean, has_sum
                FROM statistics_meta
                WHERE statistic_id = ?1
                ",
                params![statistic_id],
                |row| {
                    Ok(StatisticMetadata {
                        statistic_id: row.get(0)?,
                        source: row.get(1)?,
                        name: row.get(2)?,
                        unit_of_measurement: row.get(3)?,
                        has_mean: row.get::<_, i64>(4)? != 0,
                        has_sum: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub fn count_points(&self, statistic_id: &str) -> Result<u64, PersistenceError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM statistics WHERE statistic_id = ?1",
            params![statistic_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl StatisticsStore for SqliteStatisticsStore {
    fn statistics_during_period(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
        statistic_id: &str,
    ) -> Result<Vec<CumulativeStatisticPoint>, PersistenceError> {
        let mut stmt = self.conn.prepare_cached(
            "
            SELECT start_ts_ms_utc, state, sum
            FROM statistics
            WHERE statistic_id = ?1
              AND start_ts_ms_utc >= ?2
              AND start_ts_ms_utc < ?3
            ORDER BY start_ts_ms_utc ASC
            ",
        )?;

        let mut rows = stmt.query(params![statistic_id, start_ts_ms_utc, end_ts_ms_utc_exclusive])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CumulativeStatisticPoint {
                start_ts_ms_utc: row.get(0)?,
                state: row.get(1)?,
                sum: row.get(2)?,
            });
        }
        Ok(out)
    }

    fn import_statistics(
        &mut self,
        metadata: &StatisticMetadata,
        points: &[CumulativeStatisticPoint],
    ) -> Result<usize, PersistenceError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO statistics_meta (
                statistic_id,
                source,
                name,
                unit_of_measurement,
                has_mean,
                has_sum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(statistic_id) DO UPDATE SET
                source = excluded.source,
                name = excluded.name,
                unit_of_measurement = excluded.unit_of_measurement,
                has_mean = excluded.has_mean,
                has_sum = excluded.has_sum
            ",
            params![
                metadata.statistic_id,
                metadata.source,
                metadata.name,
                metadata.unit_of_measurement,
                metadata.has_mean as i64,
                metadata.has_sum as i64,
            ],
        )?;

        let mut written = 0usize;
        {
            // A stored sum is only ever replaced by one that is not lower.
            let mut stmt = tx.prepare(
                "
                INSERT INTO statistics (statistic_id, start_ts_ms_utc, state, sum)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(statistic_id, start_ts_ms_utc) DO UPDATE SET
                    state = excluded.state,
                    sum = excluded.sum
                WHERE excluded.sum >= statistics.sum
                ",
            )?;

            for point in points {
                written += stmt.execute(params![
                    metadata.statistic_id,
                    point.start_ts_ms_utc,
                    point.state,
                    point.sum,
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS statistics_meta (
            statistic_id TEXT NOT NULL PRIMARY KEY,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            unit_of_measurement TEXT NOT NULL,
            has_mean INTEGER NOT NULL,
            has_sum INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS statistics (
            statistic_id TEXT NOT NULL,
            start_ts_ms_utc INTEGER NOT NULL,
            state REAL NOT NULL,
            sum REAL NOT NULL,
            PRIMARY KEY(statistic_id, start_ts_ms_utc)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}
