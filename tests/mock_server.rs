//! Minimal MCP server over stdio for the integration tests.
//!
//! Speaks newline-delimited JSON-RPC. Prints a non-JSON banner first so
//! clients have to skip it. Tools: `echo`, `add`, `fail`, `sleep`, `exit`.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde_json::{Value, json};

const PROTOCOL_VERSION: &str = "2025-06-18";

fn main() {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "mock-mcp-server starting");
    let _ = stdout.flush();
    eprintln!("mock-mcp-server: ready");

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            reply(&mut stdout, &error(Value::Null, -32700, "Parse error"));
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        // Notifications need no answer
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let response = match method {
            "initialize" => result(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": false}, "resources": {}, "prompts": {}},
                    "serverInfo": {"name": "mock-mcp-server", "version": "0.1.0"},
                    "instructions": "Test server"
                }),
            ),
            "ping" => result(id, json!({})),
            "tools/list" => tools_list(id, &params),
            "tools/call" => tools_call(id, &params),
            "resources/list" => result(
                id,
                json!({"resources": [
                    {"uri": "mock://readme", "name": "readme", "mimeType": "text/plain"}
                ]}),
            ),
            "resources/read" => match params.get("uri").and_then(Value::as_str) {
                Some(uri @ "mock://readme") => result(
                    id,
                    json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": "hello from mock"}]}),
                ),
                Some(uri) => error(id, -32602, &format!("unknown resource {uri}")),
                None => error(id, -32602, "missing uri"),
            },
            "prompts/list" => result(
                id,
                json!({"prompts": [
                    {"name": "greet", "description": "Say hello", "arguments": [{"name": "who", "required": true}]}
                ]}),
            ),
            "prompts/get" => {
                let who = params
                    .pointer("/arguments/who")
                    .and_then(Value::as_str)
                    .unwrap_or("world");
                result(
                    id,
                    json!({
                        "description": "Say hello",
                        "messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello, {who}!")}}]
                    }),
                )
            }
            other => error(id, -32601, &format!("Method not found: {other}")),
        };

        reply(&mut stdout, &response);
    }
}

fn tools_list(id: Value, params: &Value) -> Value {
    // Two pages to exercise cursor handling
    match params.get("cursor").and_then(Value::as_str) {
        None => result(
            id,
            json!({
                "tools": [
                    {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}},
                    {"name": "add", "description": "Add numbers", "inputSchema": {"type": "object"}},
                    {"name": "fail", "inputSchema": {"type": "object"}}
                ],
                "nextCursor": "page-2"
            }),
        ),
        Some("page-2") => result(
            id,
            json!({"tools": [
                {"name": "sleep", "inputSchema": {"type": "object"}},
                {"name": "exit", "inputSchema": {"type": "object"}}
            ]}),
        ),
        Some(other) => error(id, -32602, &format!("bad cursor {other}")),
    }
}

fn tools_call(id: Value, params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    match name {
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or("");
            result(id, json!({"content": [{"type": "text", "text": text}]}))
        }
        "add" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            result(id, json!({"content": [{"type": "text", "text": (a + b).to_string()}]}))
        }
        "fail" => result(
            id,
            json!({"content": [{"type": "text", "text": "tool failed"}], "isError": true}),
        ),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
            result(id, json!({"content": [{"type": "text", "text": "awake"}]}))
        }
        "exit" => {
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(3);
            std::process::exit(i32::try_from(code).unwrap_or(3));
        }
        other => error(id, -32602, &format!("Unknown tool: {other}")),
    }
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn reply(out: &mut impl Write, response: &Value) {
    let _ = writeln!(out, "{response}");
    let _ = out.flush();
}
