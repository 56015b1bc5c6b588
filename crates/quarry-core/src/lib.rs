//! quarry-core – the natural-language-to-data pipeline.
//!
//! A question flows through four stages:
//!
//! 1. [`analyst::AnalystClient`] turns it into a [`analyst::QueryPlan`]
//!    (generated SQL plus explanation) using a key-pair token from
//!    [`signer::CredentialSigner`].
//! 2. [`warehouse::QueryExecutor`] runs the SQL over the single connection
//!    owned by [`warehouse::ConnectionManager`].
//! 3. [`narrator::ResponseNarrator`] asks a language model to explain the
//!    result, either in one block or as a token stream.
//! 4. [`relay::relay`] writes the stream to the caller as `data:` frames.
//!
//! [`orchestrator::QueryOrchestrator`] ties the stages together and
//! [`gateway::GatewayState`] builds the whole graph from a
//! [`config::GatewayConfig`].

pub mod analyst;
pub mod config;
pub mod error;
pub mod gateway;
pub mod narrator;
pub mod orchestrator;
pub mod relay;
pub mod signer;
pub mod warehouse;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{GatewayError, WarehouseError};
pub use gateway::GatewayState;
pub use narrator::{NarrationEvent, NarrationStream};
pub use orchestrator::{ChatResponse, NarratedAnswer, QueryResult};
pub use warehouse::Row;
