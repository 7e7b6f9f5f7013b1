//! # dunebugger-core: Device State for the Dunebugger Monitor
//!
//! This crate holds everything the monitor knows about the remote device,
//! as plain data with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Dunebugger Monitor Architecture                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    View Adapter (external)                      │   │
//! │  │        reads snapshots, subscribes to store changes             │   │
//! │  └─────────────────────────────▲───────────────────────────────────┘   │
//! │                                │ listeners (sync, in order)             │
//! │  ┌─────────────────────────────┴───────────────────────────────────┐   │
//! │  │             ★ dunebugger-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────────────────────┐  │   │
//! │  │   │   gpio    │  │   logs    │  │          store            │  │   │
//! │  │   │ GpioValue │  │ LogBuffer │  │ StateStore + listeners    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO ASYNC • NO NETWORK                                │   │
//! │  └─────────────────────────────▲───────────────────────────────────┘   │
//! │                                │ apply_* calls                          │
//! │  ┌─────────────────────────────┴───────────────────────────────────┐   │
//! │  │              dunebugger-sync (Session Manager)                  │   │
//! │  │         WebSocket transport, envelope dispatch, retry           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gpio`] - GPIO values and the GPIO map type
//! - [`logs`] - Capped log ring buffer
//! - [`store`] - `StateStore` with subscription API
//! - [`error`] - Store error types
//!
//! ## Example Usage
//!
//! ```rust
//! use dunebugger_core::{GpioValue, StateStore};
//!
//! let mut store = StateStore::new(100);
//! store.subscribe(|change, _store| println!("changed: {change:?}"));
//!
//! store.apply_gpio_update("GPIO17", GpioValue::from("HIGH")).unwrap();
//! store.append_log("relay on");
//!
//! assert_eq!(store.gpio_value("GPIO17"), Some(&GpioValue::from("HIGH")));
//! assert_eq!(store.logs().len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod gpio;
pub mod logs;
pub mod store;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use gpio::{GpioMap, GpioValue};
pub use logs::LogBuffer;
pub use store::{ListenerId, StateStore, StoreChange, StoreSnapshot};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default number of log lines retained by the store.
///
/// The device can stream logs for days; the buffer keeps the most recent
/// lines and evicts the oldest. `0` disables the cap.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;
