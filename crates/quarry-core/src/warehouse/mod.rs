//! Warehouse access.
//!
//! The session protocol is abstracted behind [`WarehouseDriver`] (opens
//! sessions) and [`WarehouseSession`] (runs statements).  Drivers classify
//! their failures into [`WarehouseError`] kinds so that the layers above
//! never inspect message text.
//!
//! | Module       | Role                                                    |
//! |--------------|---------------------------------------------------------|
//! | [`manager`]  | single current connection, staleness and liveness       |
//! | [`executor`] | statement timeout and connection-fault retry            |
//! | [`sql_api`]  | statement REST API driver                               |

pub mod executor;
pub mod manager;
pub mod sql_api;

use async_trait::async_trait;

pub use crate::error::WarehouseError;
pub use executor::QueryExecutor;
pub use manager::{ConnectionLease, ConnectionManager};
pub use sql_api::SqlApiDriver;

/// One result row: column name → value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A live session able to run statements.
#[async_trait]
pub trait WarehouseSession: Send + Sync {
    /// Run `sql` to completion and return every row.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError>;

    /// Explicit health query.  `None` means the session has none.
    async fn ping(&self) -> Option<Result<(), WarehouseError>> {
        None
    }

    /// Cheap ready-state flag.  `None` means the session does not track one.
    fn is_up(&self) -> Option<bool> {
        None
    }

    /// Release server-side resources held by the session.
    async fn close(&self) -> Result<(), WarehouseError>;
}

/// Opens warehouse sessions.
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError>;
}
