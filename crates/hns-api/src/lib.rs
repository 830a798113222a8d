//! Aggregated list/watch API for hierarchical namespace subtrees.
//!
//! The server exposes every namespaced upstream resource under the
//! synthetic group `resources.hns.demo/v1alpha1`. A list or watch against a
//! parent namespace fans out to every namespace in the parent's HNC
//! subtree and merges the results into one ordinary-looking Kubernetes
//! response, so clients get a whole-subtree view from a single call.
//!
//! # Architecture
//!
//! ```text
//! client ──► mTLS listener ──► CN allow-list ──► handlers
//!                                                  │
//!                   ┌──────────────┬───────────────┤
//!                   ▼              ▼               ▼
//!              catalog        subtree         fan-out engines
//!            (CRD/APIService  resolver       (bounded list /
//!             discovery)    (namespace cache)  merged watch)
//!                                                  │
//!                                                  ▼
//!                                          upstream API server
//! ```
//!
//! # Endpoints
//!
//! - `GET /apis/resources.hns.demo/v1alpha1` - discovery document
//! - `GET /apis/resources.hns.demo/v1alpha1/{resource}` - cluster-scoped
//! - `GET /apis/resources.hns.demo/v1alpha1/namespaces/{ns}/{resource}` -
//!   subtree fan-out; `?watch=true` streams events

pub mod auth;
pub mod catalog;
pub mod consts;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod hierarchy;
pub mod response;
pub mod server;
pub mod stores;
pub mod upstream;

pub use error::{Error, Result};
