//! # Endocrine Test Suite
//!
//! End-to-end tests running glands and receptors of real systems against the
//! in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs    # Systems, clocks and event helpers
//!     ├── scenarios.rs  # Acceptance scenarios
//!     └── flows.rs      # Cross-crate flows: sharing, replacement, reconnects
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p es-tests
//! cargo test -p es-tests integration::scenarios::
//! ```

#![allow(dead_code)]

pub mod integration;
