// ABOUTME: MySQL binary log source built on mysql_async's binlog stream
// ABOUTME: Emits insert/update row events with the last committed position for resume

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, OptsBuilder, Row, Value};
use rust_decimal::Decimal;

use super::ChangeSource;
use crate::checkpoint::ResumePosition;
use crate::error::RelayError;
use crate::event::{ChangeEvent, EventKind, FieldValue, RowImage, SourceItem, SourceRecord};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Connection settings for the binlog replica connection.
#[derive(Clone)]
pub struct MysqlSourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Replica server id; must not collide with any other replica of the source.
    pub server_id: u32,
}

impl MysqlSourceConfig {
    fn opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(self.password.clone())
    }
}

impl fmt::Debug for MysqlSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlSourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// Follows transaction boundaries to know where a resume is safe.
#[derive(Debug, Clone)]
struct CommitTracker {
    log_file: String,
    committed: ResumePosition,
}

impl CommitTracker {
    fn new(start: ResumePosition) -> Self {
        Self {
            log_file: start.log_file.clone(),
            committed: start,
        }
    }

    fn committed(&self) -> &ResumePosition {
        &self.committed
    }

    /// Switch to `log_file`. Returns the new position unless it is the one
    /// already held, as for the rotate event that opens every stream.
    fn rotate(&mut self, log_file: String, log_pos: u64) -> Option<ResumePosition> {
        let position = ResumePosition::at(log_file.clone(), log_pos);
        self.log_file = log_file;
        if position == self.committed {
            return None;
        }
        self.committed = position.clone();
        Some(position)
    }

    /// A transaction ended at `end_pos` in the current file.
    fn commit(&mut self, end_pos: u64) -> ResumePosition {
        self.committed = ResumePosition::at(self.log_file.clone(), end_pos);
        self.committed.clone()
    }
}

/// Non-transactional engines end their transactions with a COMMIT query
/// instead of an XID event.
fn is_commit_query(query: &str) -> bool {
    query.trim().eq_ignore_ascii_case("COMMIT")
}

/// Binlog reader registered as a replica of the source server.
///
/// Every row carries the position of the last transaction boundary seen
/// before it, so resuming from a checkpoint replays a partially relayed
/// transaction instead of skipping its remaining rows. Each commit is also
/// reported on its own so the position keeps up while the source is idle.
pub struct MysqlBinlogSource {
    stream: BinlogStream,
    tracker: CommitTracker,
    pending: VecDeque<SourceItem>,
}

impl MysqlBinlogSource {
    /// Connect and start streaming from `resume`, or from the server's
    /// current binlog coordinates when `resume` is fresh.
    pub async fn open(
        config: &MysqlSourceConfig,
        resume: &ResumePosition,
    ) -> Result<Self, RelayError> {
        let mut conn = Conn::new(config.opts()).await.map_err(source_error)?;

        let start = if resume.resume_stream {
            tracing::info!("Replication progress found, resuming from {}", resume);
            resume.clone()
        } else {
            let current = current_position(&mut conn).await?;
            tracing::info!(
                "Replication progress not found, starting from current position {}",
                current
            );
            current
        };

        let request = BinlogStreamRequest::new(config.server_id)
            .with_filename(start.log_file.as_bytes())
            .with_pos(start.log_pos);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(source_error)?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            server_id = config.server_id,
            "Binlog stream opened"
        );

        Ok(Self {
            stream,
            tracker: CommitTracker::new(start),
            pending: VecDeque::new(),
        })
    }

    /// Last committed position seen on the stream; the start position right after `open`.
    pub fn position(&self) -> &ResumePosition {
        self.tracker.committed()
    }

    fn apply(&mut self, event: &Event) -> Result<(), RelayError> {
        let end_pos = u64::from(event.header().log_pos());
        let data = event.read_data().map_err(|err| {
            RelayError::SourceProtocol(format!("failed to decode binlog event: {}", err))
        })?;

        match data {
            Some(EventData::RotateEvent(rotate)) => {
                let rotated = self
                    .tracker
                    .rotate(rotate.name().into_owned(), rotate.position());
                if let Some(position) = rotated {
                    tracing::debug!(position = %position, "binlog rotated");
                    self.pending.push_back(SourceItem::Position(position));
                }
            }
            Some(EventData::XidEvent(_)) => {
                let position = self.tracker.commit(end_pos);
                self.pending.push_back(SourceItem::Position(position));
            }
            Some(EventData::QueryEvent(query)) if is_commit_query(&query.query()) => {
                let position = self.tracker.commit(end_pos);
                self.pending.push_back(SourceItem::Position(position));
            }
            Some(EventData::RowsEvent(rows_event)) => {
                let Some(kind) = event_kind(&rows_event) else {
                    return Ok(());
                };
                let table_id = rows_event.table_id();
                let tme = self.stream.get_tme(table_id).ok_or_else(|| {
                    RelayError::SourceProtocol(format!(
                        "rows event references unknown table id {}",
                        table_id
                    ))
                })?;
                let schema = tme.database_name().into_owned();
                let table = tme.table_name().into_owned();

                for row in rows_event.rows(tme) {
                    let (before, after) = row.map_err(|err| {
                        RelayError::SourceProtocol(format!(
                            "failed to decode row of {}.{}: {}",
                            schema, table, err
                        ))
                    })?;
                    let fields = match kind {
                        EventKind::Insert => after.map(row_image).unwrap_or_default(),
                        EventKind::Update => RowImage::new()
                            .with("before_values", before.map(row_image).unwrap_or_default())
                            .with("after_values", after.map(row_image).unwrap_or_default()),
                    };
                    self.pending.push_back(SourceItem::Change(SourceRecord {
                        event: ChangeEvent::new(schema.clone(), table.clone(), kind, fields),
                        position: self.tracker.committed().clone(),
                    }));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ChangeSource for MysqlBinlogSource {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, RelayError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            let event = match self.stream.next().await {
                Some(event) => event.map_err(source_error)?,
                None => return Ok(None),
            };
            self.apply(&event)?;
        }
    }
}

async fn current_position(conn: &mut Conn) -> Result<ResumePosition, RelayError> {
    // MySQL 8.4 renamed the statement.
    let row = match conn.query_first::<Row, _>("SHOW MASTER STATUS").await {
        Ok(row) => row,
        Err(mysql_async::Error::Server(_)) => conn
            .query_first::<Row, _>("SHOW BINARY LOG STATUS")
            .await
            .map_err(source_error)?,
        Err(err) => return Err(source_error(err)),
    };
    let row = row.ok_or_else(|| {
        RelayError::SourceProtocol("binary logging is not enabled on the source".to_string())
    })?;

    let log_file: String = row.get(0).ok_or_else(|| {
        RelayError::SourceProtocol("binary log status is missing the file name".to_string())
    })?;
    let log_pos: u64 = row.get(1).ok_or_else(|| {
        RelayError::SourceProtocol("binary log status is missing the position".to_string())
    })?;
    Ok(ResumePosition::at(log_file, log_pos))
}

fn source_error(err: mysql_async::Error) -> RelayError {
    match err {
        mysql_async::Error::Io(err) => RelayError::SourceConnectionLost(err.to_string()),
        other => RelayError::SourceProtocol(other.to_string()),
    }
}

fn event_kind(rows_event: &RowsEventData<'_>) -> Option<EventKind> {
    match rows_event {
        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
            Some(EventKind::Insert)
        }
        RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::PartialUpdateRowsEvent(_) => Some(EventKind::Update),
        _ => None,
    }
}

fn row_image(mut row: BinlogRow) -> RowImage {
    let columns = row.columns();
    let mut image = RowImage::with_capacity(row.len());
    for idx in 0..row.len() {
        let (name, column_type) = match columns.get(idx) {
            Some(column) => (column.name_str().into_owned(), Some(column.column_type())),
            None => (String::new(), None),
        };
        // Without binlog_row_metadata=FULL the server sends no column names.
        let name = if name.is_empty() {
            format!("UNKNOWN_COL{}", idx)
        } else {
            name
        };
        let value = match row.take(idx) {
            Some(BinlogValue::Value(value)) => value_to_field(value, column_type),
            // TODO: decode binary JSON columns into FieldValue::Json instead of their debug form
            Some(other) => FieldValue::String(format!("{:?}", other)),
            None => FieldValue::Null,
        };
        image.insert(name, value);
    }
    image
}

/// Map a decoded binlog cell to a field value using its column type.
pub fn value_to_field(value: Value, column_type: Option<ColumnType>) -> FieldValue {
    match value {
        Value::NULL => FieldValue::Null,
        Value::Int(i) => match column_type {
            Some(ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2) => {
                timestamp_to_field(i, 0)
            }
            _ => FieldValue::Int(i),
        },
        Value::UInt(u) => FieldValue::UInt(u),
        Value::Float(f) => FieldValue::Float(f64::from(f)),
        Value::Double(d) => FieldValue::Float(d),
        Value::Bytes(bytes) => bytes_to_field(bytes, column_type),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let Some(date) =
                NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
            else {
                // Zero dates such as 0000-00-00 have no calendar value.
                return FieldValue::Null;
            };
            match column_type {
                Some(ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE) => {
                    FieldValue::from(date)
                }
                _ => date
                    .and_hms_micro_opt(
                        u32::from(hour),
                        u32::from(minute),
                        u32::from(second),
                        micros,
                    )
                    .map(FieldValue::from)
                    .unwrap_or(FieldValue::Null),
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total = ((i64::from(days) * 24 + i64::from(hours)) * 60 + i64::from(minutes))
                * 60
                * MICROS_PER_SECOND
                + i64::from(seconds) * MICROS_PER_SECOND
                + i64::from(micros);
            let total = if negative { -total } else { total };
            FieldValue::from(chrono::Duration::microseconds(total))
        }
    }
}

fn bytes_to_field(bytes: Vec<u8>, column_type: Option<ColumnType>) -> FieldValue {
    match column_type {
        Some(ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL) => {
            let parsed = std::str::from_utf8(&bytes).ok().map(str::trim).map(|text| {
                Decimal::from_str(text)
                    .map(FieldValue::Decimal)
                    .or_else(|_| text.parse::<f64>().map(FieldValue::Float))
            });
            match parsed {
                Some(Ok(value)) => value,
                _ => text_or_bytes(bytes),
            }
        }
        Some(ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2) => {
            match std::str::from_utf8(&bytes).ok().and_then(parse_unix_timestamp) {
                Some((secs, micros)) => timestamp_to_field(secs, micros),
                None => text_or_bytes(bytes),
            }
        }
        _ => text_or_bytes(bytes),
    }
}

fn text_or_bytes(bytes: Vec<u8>) -> FieldValue {
    match String::from_utf8(bytes) {
        Ok(text) => FieldValue::String(text),
        Err(err) => FieldValue::Bytes(err.into_bytes()),
    }
}

/// Parse `secs[.fraction]` as written for TIMESTAMP columns.
fn parse_unix_timestamp(text: &str) -> Option<(i64, u32)> {
    let (secs, fraction) = match text.split_once('.') {
        Some((secs, fraction)) => (secs, fraction),
        None => (text, ""),
    };
    let secs = secs.parse::<i64>().ok()?;
    let micros = if fraction.is_empty() {
        0
    } else {
        let digits: String = fraction.chars().chain("000000".chars()).take(6).collect();
        digits.parse::<u32>().ok()?
    };
    Some((secs, micros))
}

/// TIMESTAMP values are rendered in UTC.
fn timestamp_to_field(secs: i64, micros: u32) -> FieldValue {
    chrono::DateTime::from_timestamp(secs, micros * 1_000)
        .map(|datetime| FieldValue::from(datetime.naive_utc()))
        .unwrap_or(FieldValue::Null)
}
