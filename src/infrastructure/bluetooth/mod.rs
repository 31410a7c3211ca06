//! Bluetooth Module
//!
//! BLE central-role session management over an abstract platform stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionManager                        │
//! │  (facade - capability queries, single GATT listener)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌────────────┐ ┌─────────────┐ ┌────────────┐
//! │ Discovery  │ │ Connection  │ │   Events   │
//! │ Controller │ │  Session    │ │            │
//! │ - scan     │ │ - GATT link │ │ - dispatch │
//! │ - phases   │ │ - callbacks │ │   actor    │
//! └────────────┘ └─────────────┘ └────────────┘
//!                       │
//!                       ▼
//!                ┌────────────┐
//!                │  Platform  │  (traits; `simulated` is in-memory)
//!                └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - Traits for the radio, event source, GATT driver and enable prompt
//! - [`events`] - Observables, subscriptions and the dispatch actor
//! - [`scanner`] - Adapter-level discovery
//! - [`connection`] - The single GATT connection and callback translation
//! - [`service`] - Session manager facade
//! - [`simulated`] - In-memory platform for tests and the demo

pub mod connection;
pub mod events;
pub mod platform;
pub mod scanner;
pub mod service;
pub mod simulated;

pub use service::SessionManager;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Session state stays usable even if a listener panicked mid-update
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
