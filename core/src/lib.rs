//! Client state core for the TaskFlow task manager.
//!
//! # Overview
//! Mirrors a signed-in user's tasks and identity from a hosted auth + data
//! service into local state containers, and keeps a persisted dark/light
//! theme preference.
//!
//! # Design
//! - `ServiceClient` builds `HttpRequest` values and parses `HttpResponse`
//!   values without touching the network; `Transport` does the I/O.
//! - `HostedService` puts the two together behind the `RemoteService` trait
//!   and owns the remote session.
//! - `AuthStore`, `TodoStore` and `ThemeStore` are explicitly constructed
//!   containers; `AppContext` wires them. The todo container reads the
//!   identity through an `AuthHandle` passed at construction.
//! - Local state only changes after the service confirms a call.

pub mod auth;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod remote;
pub mod session;
pub mod storage;
pub mod theme;
pub mod todos;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use auth::{AuthHandle, AuthStore};
pub use client::ServiceClient;
pub use config::ClientConfig;
pub use context::AppContext;
pub use error::ApiError;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use remote::{HostedService, RemoteService, SESSION_STORAGE_KEY};
pub use session::{ListenerId, SessionEvent, SessionListener};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use theme::{SharedPreference, SystemPreference, ThemeMode, ThemeState, ThemeStore, THEME_STORAGE_KEY};
pub use todos::TodoStore;
pub use transport::{Transport, UreqTransport};
pub use types::{AuthOutcome, Credentials, Identity, InsertTodo, NewTodo, Session, Todo, UpdateTodo};
