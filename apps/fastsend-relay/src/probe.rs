use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::cli::ProbeRole;
use crate::codes::is_valid_code;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIVE_WAIT: Duration = Duration::from_secs(10);

/// Plays one side of a pairing against a live relay and prints every reply.
pub async fn run_probe(url: String, role: ProbeRole) -> Result<()> {
    if let ProbeRole::Receive { code, .. } = &role {
        if !is_valid_code(code) {
            bail!("pairing codes are four digits, got {code:?}");
        }
    }

    debug!("connecting to {url}");
    let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {url}"))?,
        Err(_) => bail!("connection to {url} timed out - is the relay running?"),
    };
    let (mut write, mut read) = stream.split();

    let (hello, wait, follow_up) = match role {
        ProbeRole::Send { wait_secs } => (
            json!({ "type": "send" }),
            Duration::from_secs(wait_secs),
            None,
        ),
        ProbeRole::Receive { code, message } => {
            (json!({ "type": "receive", "code": code }), RECEIVE_WAIT, message)
        }
    };
    write
        .send(Message::Text(hello.to_string().into()))
        .await
        .context("failed to send pairing request")?;
    info!(request = %hello, "pairing request sent");

    let deadline = Instant::now() + wait;
    let mut follow_up = follow_up;
    loop {
        let next = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!("probe wait elapsed");
                break;
            }
        };
        let frame = match next {
            Some(frame) => frame.context("relay connection failed")?,
            None => break,
        };
        match frame {
            Message::Text(text) => {
                let reply: Value = serde_json::from_str(text.as_str())
                    .map_err(|err| anyhow!("relay sent invalid JSON {:?}: {err}", text.as_str()))?;
                println!("{reply}");
                if is_paired_status(&reply) {
                    if let Some(message) = follow_up.take() {
                        write
                            .send(Message::Text(message.into()))
                            .await
                            .context("failed to relay message")?;
                        info!("message relayed to sender");
                    }
                }
            }
            Message::Binary(data) => println!("<{} binary bytes>", data.len()),
            Message::Close(frame) => {
                info!(reason = ?frame.map(|f| f.reason.to_string()), "relay closed the socket");
                break;
            }
            _ => continue,
        }
    }

    let _ = write.close().await;
    Ok(())
}

fn is_paired_status(reply: &Value) -> bool {
    reply.get("type").and_then(Value::as_str) == Some("status")
        && reply.get("code").and_then(Value::as_i64) == Some(0)
}
