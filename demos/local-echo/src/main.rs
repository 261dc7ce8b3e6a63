//! Exposes a small echo agent in-process and calls it through the default
//! registry, the same way a remote agent would be called.

use agent_uri::telemetry::{TelemetryConfig, init_tracing};
use agent_uri::transport::local::{CallError, Callable, Module, ParamKind, Signature};
use agent_uri::{InvokeOptions, Params, StreamOptions, default_registry, local_catalog};
use anyhow::Result;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::info;

fn echo_agent() -> Module {
    Module::new()
        .with_callable(
            "echo",
            Callable::plain(
                Signature::new()
                    .required("message", ParamKind::String)
                    .optional("times", ParamKind::Integer, 1),
                |args| {
                    let message: String = args.get("message")?;
                    let times: usize = args.get("times")?;
                    Ok(json!(vec![message; times].join(" ")))
                },
            ),
        )
        .with_callable(
            "spell",
            Callable::generator(Signature::new().required("word", ParamKind::String), |args| {
                let word: String = args.get("word")?;
                Ok(word
                    .chars()
                    .map(|c| Ok(Value::String(c.to_string())))
                    .collect::<Vec<_>>())
            }),
        )
        .with_callable(
            "fail",
            Callable::plain(Signature::new(), |_| Err(CallError::new("this agent always fails here"))),
        )
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(&TelemetryConfig::new().with_default_directive("info,agent_transport=debug"))?;

    local_catalog().register_module("echo", echo_agent());
    let endpoint = "agent+local://echo";
    let transport = default_registry().get("agent+local")?;

    let reply = transport
        .invoke(
            endpoint,
            "echo",
            params(json!({"message": "hello", "times": "3"})),
            InvokeOptions::new(),
        )
        .await?;
    info!(%reply, "invoke");

    let mut letters = transport
        .stream(endpoint, "spell", params(json!({"word": "agent"})), StreamOptions::new())
        .await?;
    while let Some(letter) = letters.next().await {
        let letter = letter?;
        info!(%letter, "chunk");
    }

    match transport
        .invoke(endpoint, "fail", Params::new(), InvokeOptions::new())
        .await
    {
        Ok(value) => info!(%value, "unexpected success"),
        Err(err) => info!(kind = ?err.kind(), %err, "expected failure"),
    }

    default_registry().close_all().await;
    Ok(())
}
