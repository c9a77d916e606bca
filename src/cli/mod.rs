// Copyright 2024-2026 rootlink Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI module for rootlink commands.
//!
//! ## Usage
//!
//! ```bash
//! rootlink connect   # Establish a session, exits 0 when Ready
//! rootlink status    # Probe the companion without starting it
//! rootlink start     # Start (and deploy) the companion
//! rootlink stop      # Stop the companion
//! rootlink config    # Show, list defaults, or validate configuration
//! ```

pub mod config_cmd;
pub mod session_cmd;

pub use session_cmd::{run_connect, run_start, run_status, run_stop, StatusReport};

/// Process exit codes shared by all commands.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const CONNECTION_ERROR: i32 = 3;
}

/// Exit code for a failed operation.
pub fn exit_code_for(error: &crate::LinkError) -> i32 {
    match error {
        crate::LinkError::Connection(_) => exit_codes::CONNECTION_ERROR,
        crate::LinkError::Config(_) => exit_codes::CONFIG_ERROR,
        _ => exit_codes::FAILURE,
    }
}
