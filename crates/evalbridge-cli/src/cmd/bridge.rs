//! `serve` and `call`: run a bridge node or send it one request.

use crate::ui::{self, Report, Tone};
use anyhow::Context;
use evalbridge_runtime::Bridge;
use evalbridge_types::config::BridgeConfig;
use evalbridge_types::envelope::{Direction, OperationKind, Payload};

pub async fn cmd_serve(
    config: &BridgeConfig,
    listen: Option<String>,
    connect: Option<String>,
) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.bridge.listen_addr.clone());
    let connect = connect.or_else(|| config.bridge.connect_addr.clone());

    let bridge = Bridge::from_config(config);
    let (addr, accept) = bridge
        .listen(&listen)
        .await
        .with_context(|| format!("cannot listen on {listen}"))?;
    let mut report = Report::new(format!("Bridge listening on {addr}"));
    report
        .field("evaluator", config.peer.address())
        .field("max frame", format!("{} bytes", bridge.max_frame_bytes()));
    if let Some(peer) = connect {
        let peer_addr = bridge
            .connect(&peer)
            .await
            .with_context(|| format!("cannot link with bridge at {peer}"))?;
        report.field_toned("linked", peer_addr, Tone::Good);
    }
    report.print();
    ui::note("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    accept.abort();
    let cancelled = bridge.shutdown();
    println!();
    ui::done(&format!("Bridge stopped ({cancelled} pending calls cancelled)"));
    Ok(())
}

/// A single argument travels as text, several as an argument list.
fn payload_from_args(args: Vec<String>) -> Payload {
    match <[String; 1]>::try_from(args) {
        Ok([single]) => Payload::Text(single),
        Err(args) => Payload::Args(args),
    }
}

pub async fn cmd_call(
    config: &BridgeConfig,
    op: &str,
    args: Vec<String>,
    bridge_addr: Option<String>,
    local: bool,
    json: bool,
) -> anyhow::Result<()> {
    let kind: OperationKind = op.parse()?;
    let payload = payload_from_args(args);

    let node = Bridge::from_config(config);
    let direction = if local {
        Direction::ToLocal
    } else {
        let addr = bridge_addr.unwrap_or_else(|| config.bridge.listen_addr.clone());
        node.connect(&addr)
            .await
            .with_context(|| format!("cannot reach bridge at {addr}"))?;
        Direction::ToPeer
    };

    match node.call(kind, payload, direction).await {
        Ok(resp) if json => println!("{}", serde_json::to_string_pretty(&resp)?),
        Ok(resp) => {
            let value = resp.value.unwrap_or_default();
            if value.ends_with('\n') {
                print!("{value}");
            } else {
                println!("{value}");
            }
        }
        Err(e) if json => {
            let body = serde_json::json!({ "status": "error", "error": e.to_string() });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
