//! Load-balancing reverse proxy and live-backend orchestrator for
//! GPU-resident LLM workers.
//!
//! See [`proxy`] for the HTTP ingress, [`backend`] for the per-model backend
//! pools, [`tracker`] for request/session bookkeeping, [`health`] for the
//! health/load refresh loops, and [`reconcile`] for the external-enumerator
//! reconciliation loop.

pub mod backend;
pub mod config;
pub mod error;
pub mod external;
pub mod health;
pub mod proxy;
pub mod reconcile;
pub mod strategy;
pub mod tracker;

pub use backend::{Backend, BackendPool, BackendStats, PoolRegistry};
pub use config::{Config, HeadersConfig, Strategy};
pub use error::ProxyError;
pub use proxy::AppState;
pub use reconcile::Reconciler;
pub use tracker::RequestTracker;
