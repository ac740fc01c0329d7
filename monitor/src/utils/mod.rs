//! Utility modules for the Filetrail monitor.
//!
//! - [`debounce`]: keyed quiet-period debouncing of write notifications

pub mod debounce;

pub use debounce::Debouncer;
