use std::fs::File;
use std::io::Write;
use std::time::Duration;
use tempfile::tempdir;

use crate::{Config, Error, TransportKind};

#[tokio::test]
async fn test_load_config() {
    let tmp_dir = tempdir().unwrap();
    let config_path = tmp_dir.path().join("config.json");
    let mut file = File::create(&config_path).unwrap();
    let json = r#"
    {
        "mcpServers": {
            "server1": {
                "command": "echo",
                "args": ["Hello"],
                "env": {}
            }
        }
    }
    "#;
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::load_config(config_path.to_str().unwrap()).unwrap();
    assert!(config.mcp_servers.contains_key("server1"));
    let server = &config.mcp_servers["server1"];
    assert_eq!(server.command, "echo");
    assert_eq!(server.name, "server1");
    assert_eq!(server.kind, TransportKind::Stdio);
}

#[test]
fn http_servers_and_timeouts() {
    let config = Config::from_json(
        r#"{
            "mcpServers": {
                "remote": {
                    "type": "http",
                    "url": "https://tools.example.com/mcp",
                    "headers": {"Authorization": "Bearer t"},
                    "timeout": 2500
                },
                "local": {"command": "mcp-files", "cwd": "/srv", "name": "files"}
            }
        }"#,
    )
    .unwrap();

    let servers = config.servers();
    // Ordered by key: "local" before "remote".
    assert_eq!(servers[0].name, "files");
    assert_eq!(servers[0].cwd.as_deref(), Some("/srv"));
    assert_eq!(servers[1].kind, TransportKind::Http);
    assert_eq!(servers[1].headers["Authorization"], "Bearer t");
    assert_eq!(servers[1].request_timeout(), Some(Duration::from_millis(2500)));
    assert_eq!(servers[0].request_timeout(), None);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempdir().unwrap();
    let err = Config::load_config(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn unknown_transport_type_is_rejected() {
    let err = Config::from_json(r#"{"mcpServers": {"x": {"type": "carrier-pigeon"}}}"#);
    assert!(matches!(err, Err(Error::Serialization(_))));
}

#[test]
fn empty_file_has_no_servers() {
    let config = Config::from_json("{}").unwrap();
    assert!(config.servers().is_empty());
}
