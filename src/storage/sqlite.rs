use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{FlowRecord, IncidentEvent, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::geo::{BoundingBox, IncidentType, Severity};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        // WAL lets readers proceed while a refresh appends.
        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create a private in-memory database (single connection), for tests.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        // The database lives exactly as long as its only connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_flows(&self, flows: &[FlowRecord]) -> StorageResult<()> {
        if flows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for flow in flows {
            sqlx::query(
                r#"
                INSERT INTO flow_records (id, latitude, longitude, road_name, current_speed, free_flow_speed,
                                          current_travel_time, free_flow_travel_time, confidence, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&flow.id)
            .bind(flow.latitude)
            .bind(flow.longitude)
            .bind(&flow.road_name)
            .bind(flow.current_speed)
            .bind(flow.free_flow_speed)
            .bind(flow.current_travel_time)
            .bind(flow.free_flow_travel_time)
            .bind(flow.confidence)
            .bind(encode_timestamp(&flow.recorded_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = flows.len(), "Inserted flow records");
        Ok(())
    }

    async fn insert_incidents(&self, incidents: &[IncidentEvent]) -> StorageResult<()> {
        if incidents.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for incident in incidents {
            sqlx::query(
                r#"
                INSERT INTO incident_events (id, external_event_id, event_type, description, severity,
                                             latitude, longitude, road_name, start_time, end_time, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&incident.id)
            .bind(&incident.external_event_id)
            .bind(incident.event_type.as_str())
            .bind(&incident.description)
            .bind(incident.severity.as_str())
            .bind(incident.latitude)
            .bind(incident.longitude)
            .bind(&incident.road_name)
            .bind(encode_timestamp(&incident.start_time))
            .bind(incident.end_time.as_ref().map(encode_timestamp))
            .bind(encode_timestamp(&incident.recorded_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = incidents.len(), "Inserted incident events");
        Ok(())
    }

    async fn flows_in_box(&self, bbox: &BoundingBox, limit: u32) -> StorageResult<Vec<FlowRecord>> {
        let rows: Vec<FlowRow> = sqlx::query_as(
            r#"
            SELECT id, latitude, longitude, road_name, current_speed, free_flow_speed,
                   current_travel_time, free_flow_travel_time, confidence, recorded_at
            FROM flow_records
            WHERE latitude >= ? AND latitude <= ?
              AND longitude >= ? AND longitude <= ?
            ORDER BY recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(bbox.min_lat())
        .bind(bbox.max_lat())
        .bind(bbox.min_lon())
        .bind(bbox.max_lon())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FlowRecord::try_from).collect()
    }

    async fn incidents_in_box(
        &self,
        bbox: &BoundingBox,
        limit: u32,
    ) -> StorageResult<Vec<IncidentEvent>> {
        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT id, external_event_id, event_type, description, severity, latitude, longitude,
                   road_name, start_time, end_time, recorded_at
            FROM incident_events
            WHERE latitude >= ? AND latitude <= ?
              AND longitude >= ? AND longitude <= ?
            ORDER BY start_time DESC
            LIMIT ?
            "#,
        )
        .bind(bbox.min_lat())
        .bind(bbox.max_lat())
        .bind(bbox.min_lon())
        .bind(bbox.max_lon())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncidentEvent::try_from).collect()
    }

    async fn incidents_recorded_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<IncidentEvent>> {
        let rows: Vec<IncidentRow> = sqlx::query_as(
            r#"
            SELECT id, external_event_id, event_type, description, severity, latitude, longitude,
                   road_name, start_time, end_time, recorded_at
            FROM incident_events
            WHERE recorded_at >= ?
            ORDER BY start_time DESC
            LIMIT ?
            "#,
        )
        .bind(encode_timestamp(&since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncidentEvent::try_from).collect()
    }

    async fn count_flows(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flow_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_incidents(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incident_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(table: &str, column: &str, raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow {
            table: table.to_string(),
            message: format!("{} '{}': {}", column, raw, e),
        })
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct FlowRow {
    id: String,
    latitude: f64,
    longitude: f64,
    road_name: String,
    current_speed: f64,
    free_flow_speed: f64,
    current_travel_time: f64,
    free_flow_travel_time: f64,
    confidence: f64,
    recorded_at: String,
}

impl TryFrom<FlowRow> for FlowRecord {
    type Error = StorageError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        Ok(Self {
            recorded_at: decode_timestamp("flow_records", "recorded_at", &row.recorded_at)?,
            id: row.id,
            latitude: row.latitude,
            longitude: row.longitude,
            road_name: row.road_name,
            current_speed: row.current_speed,
            free_flow_speed: row.free_flow_speed,
            current_travel_time: row.current_travel_time,
            free_flow_travel_time: row.free_flow_travel_time,
            confidence: row.confidence,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    id: String,
    external_event_id: String,
    event_type: String,
    description: String,
    severity: String,
    latitude: f64,
    longitude: f64,
    road_name: String,
    start_time: String,
    end_time: Option<String>,
    recorded_at: String,
}

impl TryFrom<IncidentRow> for IncidentEvent {
    type Error = StorageError;

    fn try_from(row: IncidentRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "incident_events";

        let event_type = IncidentType::from_str(&row.event_type).map_err(|message| {
            StorageError::InvalidRow {
                table: TABLE.to_string(),
                message,
            }
        })?;
        let severity =
            Severity::from_str(&row.severity).map_err(|message| StorageError::InvalidRow {
                table: TABLE.to_string(),
                message,
            })?;
        let end_time = row
            .end_time
            .as_deref()
            .map(|raw| decode_timestamp(TABLE, "end_time", raw))
            .transpose()?;

        Ok(Self {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type,
            description: row.description,
            severity,
            latitude: row.latitude,
            longitude: row.longitude,
            road_name: row.road_name,
            start_time: decode_timestamp(TABLE, "start_time", &row.start_time)?,
            end_time,
            recorded_at: decode_timestamp(TABLE, "recorded_at", &row.recorded_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_encoding_sorts_lexically() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        let later = earlier + chrono::Duration::microseconds(1);

        let (a, b) = (encode_timestamp(&earlier), encode_timestamp(&later));
        assert!(a < b);
        assert_eq!(a, "2026-03-01T09:59:59.000000Z");
    }

    #[test]
    fn test_decode_timestamp_round_trip_and_error() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let decoded = decode_timestamp("t", "c", &encode_timestamp(&ts)).unwrap();
        assert_eq!(decoded, ts);

        let err = decode_timestamp("flow_records", "recorded_at", "yesterday").unwrap_err();
        assert!(matches!(err, StorageError::InvalidRow { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_storage_starts_empty() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        assert_eq!(storage.count_flows().await.unwrap(), 0);
        assert_eq!(storage.count_incidents().await.unwrap(), 0);
    }
}
