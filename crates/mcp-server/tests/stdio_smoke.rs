use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

fn write_mcp_message(stdin: &mut impl Write, payload: &Value) {
    let body = serde_json::to_vec(payload).unwrap();
    write!(stdin, "Content-Length: {}\r\n\r\n", body.len()).unwrap();
    stdin.write_all(&body).unwrap();
    stdin.flush().unwrap();
}

fn read_mcp_message(stdout: &mut impl BufRead) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected EOF");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().unwrap());
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0_u8; len];
    stdout.read_exact(&mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}

fn call(id: u64, name: &str, arguments: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

#[test]
fn stdio_server_create_invalidate_and_query() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("graph.redb");
    let config = dir.path().join("chronoedge.toml");
    std::fs::write(&config, "max_revision_history = 5\n").unwrap();

    let bin = env!("CARGO_BIN_EXE_chronoedge-mcp");
    let mut child = Command::new(bin)
        .env("CHRONOEDGE_DB_PATH", &db)
        .env("CHRONOEDGE_CONFIG", &config)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {}
        }),
    );
    let init = read_mcp_message(&mut stdout);
    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["serverInfo"]["name"], "chronoedge-mcp");

    write_mcp_message(
        &mut stdin,
        &call(
            2,
            "create_edge",
            serde_json::json!({
                "source": "api",
                "target": "cache",
                "relation": "depends_on",
                "valid_from": "2024-01-01T00:00:00Z"
            }),
        ),
    );
    let created = read_mcp_message(&mut stdout);
    assert_eq!(created["id"], 2);
    let edge_id = created["result"]["structuredContent"]["edge"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    write_mcp_message(
        &mut stdin,
        &call(
            3,
            "invalidate_edge",
            serde_json::json!({ "edge_id": edge_id, "at": "2024-06-01T00:00:00Z" }),
        ),
    );
    let invalidated = read_mcp_message(&mut stdout);
    assert_eq!(invalidated["id"], 3);
    assert_eq!(
        invalidated["result"]["structuredContent"]["edge"]["valid_time"]["end"],
        "2024-06-01T00:00:00Z"
    );

    write_mcp_message(
        &mut stdin,
        &call(4, "query", serde_json::json!({ "valid_at": "2024-03-01T00:00:00Z" })),
    );
    let during = read_mcp_message(&mut stdout);
    assert_eq!(
        during["result"]["structuredContent"]["result"]["edges"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    write_mcp_message(
        &mut stdin,
        &call(5, "query", serde_json::json!({ "valid_at": "2024-07-01T00:00:00Z" })),
    );
    let after = read_mcp_message(&mut stdout);
    assert!(after["result"]["structuredContent"]["result"]["edges"]
        .as_array()
        .unwrap()
        .is_empty());

    write_mcp_message(&mut stdin, &call(6, "stats", serde_json::json!({})));
    let stats = read_mcp_message(&mut stdout);
    assert_eq!(stats["result"]["structuredContent"]["stats"]["total_edges"], 1);
    assert_eq!(stats["result"]["structuredContent"]["stats"]["graph_edges"], 1);

    // Stop child cleanly.
    drop(stdin);
    let _ = child.wait();
}
