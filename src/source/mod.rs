// ABOUTME: Change source seam: an ordered, blocking sequence of row events
// ABOUTME: The MySQL binlog adapter lives in `mysql`

pub mod mysql;

use std::future::Future;

use crate::error::RelayError;
use crate::event::SourceItem;

pub use mysql::{MysqlBinlogSource, MysqlSourceConfig};

/// Transaction-log reader.
///
/// Items come back strictly in log order: row changes, and position-only
/// items for commits that carry no further rows. `next_item` waits while no
/// new event is available; `Ok(None)` means the source is exhausted.
/// Connection loss and protocol errors are returned as-is, never retried here.
pub trait ChangeSource: Send {
    fn next_item(&mut self) -> impl Future<Output = Result<Option<SourceItem>, RelayError>> + Send;
}
