//! SQL Server source: catalog queries and full-table reads.

mod quote;

pub use quote::{qualify_mssql, quote_mssql, validate_identifier};

use crate::config::SourceConfig;
use crate::core::{
    split_table_name, CatalogReader, ForeignKeyDescriptor, PrimaryKeyRow, SourceRow, SourceStore,
    SqlValue,
};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        match self.config.encrypt.to_lowercase().as_str() {
            "false" | "no" | "0" | "disable" => {
                config.encryption(EncryptionLevel::NotSupported);
            }
            _ => {
                if self.config.trust_server_cert {
                    config.trust_cert();
                }
                config.encryption(EncryptionLevel::Required);
            }
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server source with connection pooling.
///
/// Implements both [`CatalogReader`] and [`SourceStore`] over one pool.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlPool {
    /// Create a new pool with the given max connections and verify connectivity.
    pub async fn with_max_connections(config: SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "creating MSSQL pool"))?;

        let source = Self { pool };
        source.ping().await?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(source)
    }

    /// Get a pooled connection.
    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting MSSQL connection"))
    }

    /// Run a parameterised catalog query bound to a table's schema and name.
    async fn query_for_table(&self, sql: &str, table: &str) -> Result<Vec<Row>> {
        let (schema, name) = split_table_name(table);
        let mut client = self.get_client().await?;

        let mut query = Query::new(sql);
        query.bind(schema);
        query.bind(name);

        let stream = query.query(&mut client).await?;
        Ok(stream.into_first_result().await?)
    }
}

#[async_trait]
impl CatalogReader for MssqlPool {
    async fn list_tables(&self, skip: &HashSet<String>) -> Result<Vec<String>> {
        let mut client = self.get_client().await?;

        let query = r#"
            SELECT DISTINCT t.TABLE_SCHEMA + '.' + t.TABLE_NAME AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES t
            WHERE t.TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let stream = client.simple_query(query).await?;
        let rows = stream.into_first_result().await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.get::<&str, _>(0).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            if skip.contains(name) {
                debug!("Skipping {} (skip-list)", name);
                continue;
            }
            tables.push(name.to_string());
        }

        info!("Found {} tables ({} in skip-list)", tables.len(), skip.len());
        Ok(tables)
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Option<Vec<String>>> {
        let query = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let rows = self.query_for_table(query, table).await?;
        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get::<&str, _>(0))
            .map(String::from)
            .collect();

        debug!("Primary key for {}: {:?}", table, columns);
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let query = r#"
            SELECT
                fk.name AS fk_name,
                pc.name AS parent_column,
                rs.name + '.' + rt.name AS ref_table,
                (SELECT COUNT(*) FROM sys.foreign_key_columns x
                 WHERE x.constraint_object_id = fk.object_id) AS column_count,
                CASE WHEN EXISTS (
                    SELECT 1
                    FROM sys.indexes i
                    JOIN sys.index_columns ic
                        ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                    WHERE i.object_id = fk.referenced_object_id
                      AND i.is_primary_key = 1
                      AND ic.column_id = fkc.referenced_column_id
                ) THEN 1 ELSE 0 END AS references_pk,
                (SELECT COUNT(*)
                 FROM sys.indexes i
                 JOIN sys.index_columns ic
                    ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                 WHERE i.object_id = fk.referenced_object_id
                   AND i.is_primary_key = 1) AS ref_pk_columns
            FROM sys.foreign_keys fk
            JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
            JOIN sys.columns pc
                ON fkc.parent_object_id = pc.object_id AND fkc.parent_column_id = pc.column_id
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name, fkc.constraint_column_id
        "#;

        let rows = self.query_for_table(query, table).await?;

        let mut foreign_keys = Vec::new();
        for row in rows {
            let fk_name = row.get::<&str, _>(0).unwrap_or_default();
            let column = row.get::<&str, _>(1).unwrap_or_default();
            let ref_table = row.get::<&str, _>(2).unwrap_or_default();
            let column_count = row.get::<i32, _>(3).unwrap_or(1);
            let references_pk = row.get::<i32, _>(4).unwrap_or(0) == 1;
            let ref_pk_columns = row.get::<i32, _>(5).unwrap_or(0);

            match classify_foreign_key(column_count, references_pk, ref_pk_columns) {
                ForeignKeyShape::Remappable => {
                    foreign_keys.push(ForeignKeyDescriptor::new(column, ref_table));
                }
                ForeignKeyShape::Composite => warn!(
                    "{}: foreign key {} spans {} columns; composite foreign keys are not remapped",
                    table, fk_name, column_count
                ),
                ForeignKeyShape::NotPrimaryKey => warn!(
                    "{}: foreign key {} references a non-primary key of {}; not remapped",
                    table, fk_name, ref_table
                ),
                ForeignKeyShape::PartOfCompositeKey => warn!(
                    "{}: foreign key {} references one column of the {}-column primary key of {}; not remapped",
                    table, fk_name, ref_pk_columns, ref_table
                ),
            }
        }

        debug!("Loaded {} foreign keys for {}", foreign_keys.len(), table);
        Ok(foreign_keys)
    }

    async fn primary_key_rows(&self) -> Result<Vec<PrimaryKeyRow>> {
        let mut client = self.get_client().await?;

        let query = r#"
            SELECT
                tc.TABLE_SCHEMA + '.' + tc.TABLE_NAME AS TABLE_NAME,
                tc.CONSTRAINT_NAME,
                c.COLUMN_NAME,
                c.ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
            ORDER BY tc.TABLE_SCHEMA, tc.TABLE_NAME, c.ORDINAL_POSITION
        "#;

        let stream = client.simple_query(query).await?;
        let rows = stream.into_first_result().await?;

        Ok(rows
            .iter()
            .map(|row| PrimaryKeyRow {
                table_name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                constraint_name: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                column_name: row.get::<&str, _>(2).unwrap_or_default().to_string(),
                ordinal_position: row.get::<i32, _>(3).unwrap_or(0),
            })
            .collect())
    }
}

#[async_trait]
impl SourceStore for MssqlPool {
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>> {
        let query = format!("SELECT * FROM {}", qualify_mssql(table)?);
        debug!("Executing query: {}", query);

        let mut client = self.get_client().await?;
        let stream = client.simple_query(&query).await?;
        let rows = stream.into_first_result().await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .into_iter()
                .map(convert_column)
                .collect::<Result<Vec<_>>>()?;
            result.push(SourceRow::new(columns.clone(), values));
        }

        debug!("Read {} rows from {}", result.len(), table);
        Ok(result)
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT_BIG(*) FROM {}", qualify_mssql(table)?);

        let mut client = self.get_client().await?;
        let stream = client.simple_query(&query).await?;
        let row = stream.into_row().await?;

        Ok(row.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

/// How a foreign key relates to the primary key of the table it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForeignKeyShape {
    /// One column referencing a single-column primary key.
    Remappable,
    /// The foreign key spans several columns.
    Composite,
    /// References a unique key other than the primary key.
    NotPrimaryKey,
    /// References one column of a multi-column primary key. Remap entries of
    /// that table are keyed by the whole key, so a single value never matches.
    PartOfCompositeKey,
}

fn classify_foreign_key(column_count: i32, references_pk: bool, ref_pk_columns: i32) -> ForeignKeyShape {
    if column_count > 1 {
        ForeignKeyShape::Composite
    } else if !references_pk {
        ForeignKeyShape::NotPrimaryKey
    } else if ref_pk_columns > 1 {
        ForeignKeyShape::PartOfCompositeKey
    } else {
        ForeignKeyShape::Remappable
    }
}

/// Convert one column of a result row into an owned [`SqlValue`].
fn convert_column(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::I16(i16::from(v))),
        ColumnData::I16(v) => v.map(SqlValue::I16),
        ColumnData::I32(v) => v.map(SqlValue::I32),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(SqlValue::F32),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|s| SqlValue::String(s.into_owned())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| {
            // decimal(38, s) can exceed rust_decimal's scale limit of 28
            Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(SqlValue::Decimal)
                .unwrap_or_else(|_| SqlValue::String(n.to_string()))
        }),
        ColumnData::Xml(v) => v.map(|x| SqlValue::String(x.into_owned().into_string())),
        ref d @ (ColumnData::DateTime(_) | ColumnData::SmallDateTime(_)) => {
            NaiveDateTime::from_sql(d)?.map(|v| SqlValue::DateTime(whole_millis(v)))
        }
        ref d @ ColumnData::DateTime2(_) => NaiveDateTime::from_sql(d)?.map(SqlValue::DateTime),
        ref d @ ColumnData::Date(_) => NaiveDate::from_sql(d)?.map(SqlValue::Date),
        ref d @ ColumnData::Time(_) => NaiveTime::from_sql(d)?.map(SqlValue::Time),
        ref d @ ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(d)?.map(SqlValue::DateTimeOffset)
        }
    };

    Ok(value.unwrap_or(SqlValue::Null))
}

/// Drop the sub-millisecond part of a `datetime` or `smalldatetime`.
///
/// Their 1/300 s ticks decode to fractional milliseconds that carry no
/// information, and two distinct ticks never share a millisecond.
fn whole_millis(v: NaiveDateTime) -> NaiveDateTime {
    let nanos = v.nanosecond() / 1_000_000 * 1_000_000;
    v.with_nanosecond(nanos).unwrap_or(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_convert_nulls() {
        assert_eq!(convert_column(ColumnData::I32(None)).unwrap(), SqlValue::Null);
        assert_eq!(convert_column(ColumnData::String(None)).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_convert_scalars() {
        assert_eq!(convert_column(ColumnData::U8(Some(7))).unwrap(), SqlValue::I16(7));
        assert_eq!(convert_column(ColumnData::I64(Some(-3))).unwrap(), SqlValue::I64(-3));
        assert_eq!(convert_column(ColumnData::Bit(Some(true))).unwrap(), SqlValue::Bool(true));
        assert_eq!(
            convert_column(ColumnData::String(Some(Cow::Owned("Ann".to_string())))).unwrap(),
            SqlValue::String("Ann".to_string())
        );
    }

    #[test]
    fn test_classify_foreign_keys() {
        assert_eq!(classify_foreign_key(1, true, 1), ForeignKeyShape::Remappable);
        assert_eq!(classify_foreign_key(2, true, 2), ForeignKeyShape::Composite);
        assert_eq!(classify_foreign_key(1, false, 1), ForeignKeyShape::NotPrimaryKey);
        assert_eq!(classify_foreign_key(1, true, 2), ForeignKeyShape::PartOfCompositeKey);
    }

    #[test]
    fn test_legacy_datetime_ticks_truncate_to_millis() {
        let date = chrono::NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        // 1/300 s and 2/300 s
        let one = date.and_hms_nano_opt(8, 0, 0, 3_333_333).unwrap();
        let two = date.and_hms_nano_opt(8, 0, 0, 6_666_667).unwrap();

        assert_eq!(whole_millis(one).nanosecond(), 3_000_000);
        assert_eq!(whole_millis(two).nanosecond(), 6_000_000);
        assert!(matches!(
            SqlValue::DateTime(whole_millis(one)).to_bson(),
            mongodb::bson::Bson::DateTime(_)
        ));
    }

    #[test]
    fn test_convert_numeric() {
        let n = tiberius::numeric::Numeric::new_with_scale(12345, 2);
        assert_eq!(
            convert_column(ColumnData::Numeric(Some(n))).unwrap(),
            SqlValue::Decimal(Decimal::new(12345, 2))
        );
    }
}
