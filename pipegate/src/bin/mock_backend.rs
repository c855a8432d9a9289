//! Scripted stdio JSON-RPC backend for integration tests.
//!
//! Reads NDJSON requests on stdin and answers on stdout. The method name
//! selects the behaviour:
//!
//! | Method | Reply |
//! |--------|-------|
//! | `initialize` | server info |
//! | `add` | `params.a + params.b` |
//! | `echo` | `params` |
//! | `sleep` | `params.ms` later, then `"slept"` |
//! | `crash` | exits with status 1, no reply |
//! | `garbage` | a non-JSON line, then `"ok"` |
//! | `double` | the same reply twice |
//! | `notify` | a `notifications/message` notification, then `"ok"` |
//! | `split` | the reply written in two chunks |
//! | `bare` | `params.a + params.b` with no `jsonrpc` member |
//! | anything else | `-32601` method not found |
//!
//! Notifications are read and ignored.
//!
//! ```bash
//! echo '{"jsonrpc":"2.0","id":1,"method":"add","params":{"a":2,"b":3}}' | cargo run --bin mock_backend
//! ```

use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// One line for stdout. `Split` is written as two flushed halves.
enum Output {
    Chunk(String),
    Split { head: String, tail: String },
}

fn reply(id: &Value, result: Value) -> Output {
    line(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn line(value: Value) -> Output {
    Output::Chunk(format!("{value}\n"))
}

async fn handle(request: Value, out: mpsc::Sender<Output>) {
    let Some(id) = request.get("id").cloned() else {
        return;
    };
    let method = request["method"].as_str().unwrap_or_default();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let outputs = match method {
        "initialize" => vec![reply(
            &id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "mock_backend", "version": "0.1.0"}
            }),
        )],
        "add" => {
            let sum = params["a"].as_i64().unwrap_or(0) + params["b"].as_i64().unwrap_or(0);
            vec![reply(&id, json!(sum))]
        }
        "echo" => vec![reply(&id, params)],
        "bare" => {
            let sum = params["a"].as_i64().unwrap_or(0) + params["b"].as_i64().unwrap_or(0);
            vec![line(json!({"id": id, "result": sum}))]
        }
        "sleep" => {
            sleep(Duration::from_millis(params["ms"].as_u64().unwrap_or(100))).await;
            vec![reply(&id, json!("slept"))]
        }
        "crash" => std::process::exit(1),
        "garbage" => vec![
            Output::Chunk("this is not json {{{\n".to_string()),
            reply(&id, json!("ok")),
        ],
        "double" => vec![reply(&id, json!("once")), reply(&id, json!("once"))],
        "notify" => vec![
            line(json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": "hello"}
            })),
            reply(&id, json!("ok")),
        ],
        "split" => {
            let text = json!({"jsonrpc": "2.0", "id": id, "result": {"split": true}}).to_string();
            let (head, tail) = text.split_at(text.len() / 2);
            vec![Output::Split {
                head: head.to_string(),
                tail: format!("{tail}\n"),
            }]
        }
        other => vec![line(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {other}")}
        }))],
    };

    for output in outputs {
        if out.send(output).await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Output>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = rx.recv().await {
            match output {
                Output::Chunk(text) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Output::Split { head, tail } => {
                    stdout.write_all(head.as_bytes()).await?;
                    stdout.flush().await?;
                    sleep(Duration::from_millis(50)).await;
                    stdout.write_all(tail.as_bytes()).await?;
                    stdout.flush().await?;
                }
            }
        }
        Ok::<(), std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(text) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            eprintln!("mock_backend: ignoring malformed line");
            continue;
        };
        tokio::spawn(handle(request, tx.clone()));
    }

    drop(tx);
    writer.await.map_err(std::io::Error::other)?
}
