// Copyright 2024-2026 rootlink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session and lifecycle CLI subcommands: connect, status, start, stop.

use serde::Serialize;

use super::{exit_code_for, exit_codes};
use crate::ipc::{ConnectOutcome, LinkStatus};
use crate::lifecycle::ProcessLifecycleState;
use crate::LinkRuntime;

/// Companion reachability as reported by `rootlink status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub discoverable: bool,
    pub connected: bool,
    pub protocol_version: Option<u32>,
    pub expected_version: u32,
    pub capabilities: Option<u32>,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// Establish a full session and report the resulting state.
pub async fn run_connect(runtime: &LinkRuntime) -> i32 {
    match runtime.session.connect().await {
        Ok(()) => {
            println!("Session: {}", runtime.session.state());
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("Connect failed: {e}");
            print_lifecycle_diagnostic(runtime);
            exit_code_for(&e)
        }
    }
}

/// Probe the companion without starting or authenticating.
pub async fn run_status(runtime: &LinkRuntime, json: bool) -> i32 {
    let report = probe(runtime).await;
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to serialize status: {e}");
                return exit_codes::FAILURE;
            }
        }
    } else {
        print_report(&report);
    }

    if report.connected {
        exit_codes::SUCCESS
    } else {
        exit_codes::CONNECTION_ERROR
    }
}

async fn probe(runtime: &LinkRuntime) -> StatusReport {
    let mut report = StatusReport {
        discoverable: runtime.transport.is_discoverable().await,
        connected: false,
        protocol_version: None,
        expected_version: runtime.config.lifecycle.expected_version,
        capabilities: None,
        pid: None,
        error: None,
    };
    if !report.discoverable {
        return report;
    }

    match runtime.transport.connect().await {
        ConnectOutcome::Connected { version, capabilities } => {
            report.connected = true;
            report.protocol_version = Some(version);
            report.capabilities = Some(capabilities.bits());
            if let LinkStatus::Connected { pid, .. } = runtime.transport.status() {
                report.pid = pid;
            }
        }
        ConnectOutcome::NotRunning => report.error = Some("companion not running".into()),
        ConnectOutcome::Failed(e) => report.error = Some(e.to_string()),
    }
    runtime.transport.disconnect().await;
    report
}

fn print_report(report: &StatusReport) {
    println!("Discoverable: {}", if report.discoverable { "yes" } else { "no" });
    println!("Connected:    {}", if report.connected { "yes" } else { "no" });
    if let Some(version) = report.protocol_version {
        let note = if version == report.expected_version { "" } else { " (MISMATCH)" };
        println!("Protocol:     {version} (expected {}){note}", report.expected_version);
    }
    if let Some(bits) = report.capabilities {
        println!("Capabilities: {bits:#06x}");
    }
    if let Some(pid) = report.pid {
        println!("PID:          {pid}");
    }
    if let Some(error) = &report.error {
        println!("Error:        {error}");
    }
}

/// Start the companion, deploying it first when needed.
pub async fn run_start(runtime: &LinkRuntime) -> i32 {
    match runtime.lifecycle.start_daemon().await {
        Ok(()) => {
            match runtime.lifecycle.state() {
                ProcessLifecycleState::Running { pid: Some(pid) } => {
                    println!("Companion running (pid {pid})")
                }
                _ => println!("Companion running"),
            }
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("Start failed: {e}");
            print_lifecycle_diagnostic(runtime);
            exit_code_for(&e)
        }
    }
}

/// Stop the companion.
pub async fn run_stop(runtime: &LinkRuntime) -> i32 {
    match runtime.lifecycle.stop_daemon().await {
        Ok(()) => {
            println!("Companion stopped");
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("Stop failed: {e}");
            exit_code_for(&e)
        }
    }
}

fn print_lifecycle_diagnostic(runtime: &LinkRuntime) {
    if let ProcessLifecycleState::Failed { diagnostic, .. } = runtime.lifecycle.state() {
        eprintln!();
        eprintln!("{diagnostic}");
    }
}
