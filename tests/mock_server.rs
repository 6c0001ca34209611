//! Scriptable MCP server speaking newline-delimited JSON-RPC on stdio.
//!
//! Usage:
//!   mock-mcp-server [--label NAME] [--tools a,b,..] [--crash-on TOOL]
//!                   [--fail-init] [--exit-code N] [--banner]
//!
//! Options:
//!   --label NAME     Reported as serverInfo.name and by the `whoami` tool
//!   --tools LIST     Only advertise these tools (default: all)
//!   --crash-on TOOL  Exit with code 1 when TOOL is called
//!   --fail-init      Answer `initialize` with an error
//!   --exit-code N    Write to stderr and exit with N before reading anything
//!   --banner         Print a non-JSON line before serving
//!
//! Each request is answered on its own thread, so slow calls do not hold up
//! fast ones and responses can arrive out of order.

use std::env;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

const ALL_TOOLS: &[&str] = &["echo", "add", "sleep", "fail", "whoami"];

#[derive(Clone, Default)]
struct Options {
    label: String,
    tools: Option<Vec<String>>,
    crash_on: Option<String>,
    fail_init: bool,
    exit_code: Option<i32>,
    banner: bool,
}

impl Options {
    fn from_args() -> Self {
        let mut options = Self {
            label: "mock-mcp-server".to_string(),
            ..Self::default()
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--label" => options.label = args.next().unwrap_or_default(),
                "--tools" => {
                    options.tools = args
                        .next()
                        .map(|list| list.split(',').map(str::to_string).collect())
                }
                "--crash-on" => options.crash_on = args.next(),
                "--fail-init" => options.fail_init = true,
                "--exit-code" => options.exit_code = args.next().and_then(|n| n.parse().ok()),
                "--banner" => options.banner = true,
                _ => {}
            }
        }
        options
    }

    fn advertises(&self, tool: &str) -> bool {
        match &self.tools {
            Some(tools) => tools.iter().any(|t| t == tool),
            None => ALL_TOOLS.contains(&tool),
        }
    }
}

fn main() {
    let options = Options::from_args();

    if let Some(code) = options.exit_code {
        eprintln!("mock-mcp-server: refusing to start (exit {code})");
        std::process::exit(code);
    }

    let stdout = Arc::new(Mutex::new(std::io::stdout()));
    if options.banner {
        write_line(&stdout, "mock-mcp-server starting up");
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-mcp-server: ignoring unparsable line");
            continue;
        };
        // Notifications and responses carry nothing to answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let options = options.clone();
        let stdout = stdout.clone();
        thread::spawn(move || {
            let reply = handle(&options, &method, &params);
            let response = match reply {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err((code, message)) => {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                }
            };
            write_line(&stdout, &response.to_string());
        });
    }
}

fn write_line(stdout: &Mutex<std::io::Stdout>, line: &str) {
    let Ok(mut out) = stdout.lock() else { return };
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn handle(options: &Options, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" if options.fail_init => Err((-32603, "initialization refused".into())),
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": options.label, "version": "1.0.0"}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools: Vec<Value> = ALL_TOOLS
                .iter()
                .filter(|name| options.advertises(name))
                .map(|name| describe(name))
                .collect();
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => call(options, params),
        _ => Err((-32601, "Method not found".into())),
    }
}

fn describe(name: &str) -> Value {
    let (description, properties) = match name {
        "echo" => ("Echo back the message", json!({"message": {"type": "string"}})),
        "add" => (
            "Add two integers",
            json!({"a": {"type": "integer"}, "b": {"type": "integer"}}),
        ),
        "sleep" => ("Sleep for ms milliseconds", json!({"ms": {"type": "integer"}})),
        "fail" => ("Always reports an error", json!({})),
        _ => ("Report which server answered", json!({})),
    };
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": properties}
    })
}

fn text(value: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": value.into()}]})
}

fn call(options: &Options, params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);

    if options.crash_on.as_deref() == Some(name) {
        eprintln!("mock-mcp-server: crashing on {name}");
        std::process::exit(1);
    }
    if !options.advertises(name) {
        return Err((-32601, "Method not found".into()));
    }

    match name {
        "echo" => Ok(text(args["message"].as_str().unwrap_or_default())),
        "add" => {
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            Ok(text(sum.to_string()))
        }
        "sleep" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(text(format!("slept {ms}")))
        }
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "this tool always fails"}],
            "isError": true
        })),
        _ => Ok(text(options.label.clone())),
    }
}
