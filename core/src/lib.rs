//! `unisearch-core`: the capability-driven orchestrator that turns one natural-language
//! utterance into a ranked answer over a user's email, chat, calendar, tasks, browser
//! history, and the open web.
//!
//! The pipeline lives in [`orchestrator::Orchestrator::search`] and runs, per query:
//! capability-aware source routing ([`router`]), deterministic intent extraction
//! ([`intent`]) with an optional LM fallback, parallel dispatch through either the MCP
//! [`dispatcher`] or an in-process [`backends::DirectBackend`], entity carry-over across
//! multi-hop plans ([`entity`]), quality-gated refinement, and weighted fusion
//! ([`fusion`]) into one ordered [`model::Response`].

pub mod backends;
pub mod capabilities;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod fusion;
pub mod intent;
pub mod model;
pub mod orchestrator;
pub mod router;
pub mod timezone;

pub use capabilities::CapabilityRegistry;
pub use dispatcher::McpDispatcher;
pub use error::{SearchCoreError, SearchCoreResult};
pub use orchestrator::{Orchestrator, SearchRequest};
