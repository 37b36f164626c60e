//! Subcommand implementations. Output goes to the given writer so the
//! commands can be driven from tests.

use anyhow::Result;
use serde_json::json;
use std::io::{BufRead, Write};
use warden_core::{AuditLog, CapabilityRegistry, GovernanceProtocol, Turn};

/// Handle one turn and print its artifact.
///
/// Returns `false` when the turn was denied. Infrastructure faults print
/// their artifact and are returned as errors.
pub async fn run_turn<W: Write>(
    protocol: &GovernanceProtocol,
    session_id: &str,
    line: &str,
    as_json: bool,
    out: &mut W,
) -> Result<bool> {
    match protocol.handle(session_id, line).await {
        Ok(turn) => {
            print_turn(&turn, as_json, out)?;
            Ok(!turn.artifact.is_denial())
        }
        Err(failure) => {
            if as_json {
                writeln!(out, "{}", json!({ "artifact": failure.artifact }))?;
            } else {
                write!(out, "{}", failure.artifact.render_markdown())?;
            }
            Err(failure.into())
        }
    }
}

fn print_turn<W: Write>(turn: &Turn, as_json: bool, out: &mut W) -> Result<()> {
    let token = turn.issued_token.as_ref().map(|t| t.value());
    if as_json {
        let line = json!({
            "artifact": turn.artifact,
            "state": turn.state,
            "token": token,
        });
        writeln!(out, "{line}")?;
        return Ok(());
    }

    write!(out, "{}", turn.artifact.render_markdown())?;
    if let Some(token) = token {
        writeln!(out, "\nToken (shown once): {token}")?;
        writeln!(
            out,
            "Run: `execute {} {token}`",
            turn.artifact.proposal_id()
        )?;
    }
    Ok(())
}

/// Read turn commands line by line until end of input or `quit`.
pub async fn repl<R: BufRead, W: Write>(
    protocol: &GovernanceProtocol,
    session_id: &str,
    input: R,
    as_json: bool,
    out: &mut W,
) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        // A failed turn has already printed its artifact; keep reading.
        if let Err(e) = run_turn(protocol, session_id, line, as_json, out).await {
            tracing::error!(error = %e, "Turn failed");
        }
        out.flush()?;
    }
    Ok(())
}

/// List registered capabilities.
pub fn list_registry<W: Write>(
    registry: &CapabilityRegistry,
    as_json: bool,
    out: &mut W,
) -> Result<()> {
    for cap in registry.iter() {
        let roots: Vec<String> = cap
            .allowed_roots
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if as_json {
            let protected: Vec<String> = cap
                .protected_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            let line = json!({
                "name": cap.name,
                "tier": cap.tier,
                "kind": cap.kind,
                "allow_patterns": cap.allow_patterns.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                "deny_patterns": cap.deny_patterns.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                "allowed_roots": roots,
                "protected_paths": protected,
            });
            writeln!(out, "{line}")?;
        } else {
            writeln!(
                out,
                "{:<24} {:<18} {:<8} {}",
                cap.name,
                cap.tier.as_str(),
                cap.kind.as_str(),
                roots.join(", ")
            )?;
        }
    }
    Ok(())
}

/// Print the last `n` audit events, optionally for one proposal.
pub fn audit_tail<W: Write>(
    audit: &AuditLog,
    n: usize,
    proposal_id: Option<&str>,
    as_json: bool,
    out: &mut W,
) -> Result<()> {
    let events = match proposal_id {
        Some(id) => {
            let events = audit.events_for_proposal(id)?;
            let skip = events.len().saturating_sub(n);
            events.into_iter().skip(skip).collect()
        }
        None => audit.tail(n)?,
    };
    for event in events {
        if as_json {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
        } else {
            writeln!(
                out,
                "{} {:<8} {} {}{}",
                event.timestamp.to_rfc3339(),
                event.event_type.as_str(),
                event.proposal_id,
                event.summary,
                if event.redacted { " [redacted]" } else { "" }
            )?;
        }
    }
    Ok(())
}
