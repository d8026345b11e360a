//! Shared utilities.
//!
//! - [`debounce`]: keyed debouncing used to collapse bursts of file changes

pub mod debounce;

pub use debounce::{Debounced, Debouncer, DebouncerError, DEFAULT_DEBOUNCE_MS};
