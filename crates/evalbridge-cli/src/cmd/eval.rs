//! `eval` and `describe`: talk to a protocol peer directly.

use crate::ui::{self, Report, Tone};
use anyhow::Context;
use evalbridge_types::config::BridgeConfig;
use evalbridge_wire::{EvalResult, MessageIdGenerator, ProtocolSession, SessionOptions};
use std::sync::Arc;
use std::time::Duration;

fn peer_address(config: &BridgeConfig, host: Option<String>, port: Option<u16>) -> String {
    format!(
        "{}:{}",
        host.unwrap_or_else(|| config.peer.host.clone()),
        port.unwrap_or(config.peer.port)
    )
}

pub async fn cmd_eval(
    config: &BridgeConfig,
    code: &str,
    host: Option<String>,
    port: Option<u16>,
    timeout_ms: Option<u64>,
    ns: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let addr = peer_address(config, host, port);
    let mut opts = SessionOptions::from(&config.session);
    if let Some(ms) = timeout_ms {
        opts = opts.with_timeout(Duration::from_millis(ms));
    }

    let ids = Arc::new(MessageIdGenerator::new());
    let mut session = ProtocolSession::connect(&addr, ids, opts)
        .await
        .with_context(|| format!("cannot connect to protocol peer at {addr}"))?;
    let outcome = session.eval_in(code, ns.as_deref(), None).await?;

    if json {
        let (status, result) = match &outcome.result {
            EvalResult::Value(v) => ("value", Some(v.as_str())),
            EvalResult::Error(e) => ("error", Some(e.as_str())),
            EvalResult::NoValue => ("no-value", None),
        };
        let body = serde_json::json!({
            "status": status,
            "result": result,
            "stdout": outcome.stdout,
            "ns": outcome.ns,
            "frames": outcome.frames.len(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if !outcome.stdout.is_empty() {
        print!("{}", outcome.stdout);
    }
    match outcome.result {
        EvalResult::Value(value) => {
            println!("{value}");
            Ok(())
        }
        EvalResult::Error(err) => anyhow::bail!("{err}"),
        EvalResult::NoValue => {
            ui::note("the peer finished without reporting a value");
            Ok(())
        }
    }
}

pub async fn cmd_describe(
    config: &BridgeConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let addr = peer_address(config, host, port);
    let ids = Arc::new(MessageIdGenerator::new());
    let mut session = ProtocolSession::connect(&addr, ids, SessionOptions::from(&config.session))
        .await
        .with_context(|| format!("cannot connect to protocol peer at {addr}"))?;
    let reply = session.describe().await?;

    let mut report = Report::new(format!("Protocol peer {}", session.peer_addr()));
    match reply.get("ops").and_then(|ops| ops.as_dict()) {
        Some(ops) => {
            for name in ops.keys() {
                report.field("op", String::from_utf8_lossy(name));
            }
        }
        None => {
            report.field_toned("ops", "not reported", Tone::Caution);
        }
    }
    report.print();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_overrides() {
        let config = BridgeConfig::default();
        assert_eq!(peer_address(&config, None, None), "127.0.0.1:7888");
        assert_eq!(
            peer_address(&config, Some("10.0.0.2".into()), Some(1667)),
            "10.0.0.2:1667"
        );
    }
}
