use mf_domain::config::{McpConfigDocument, ServerConfig, TransportKind};
use mf_domain::policy::{ApprovalProcess, RiskLevel};

#[test]
fn document_entries_become_configs_with_policy_defaults() {
    let raw = r#"{
        "mcpServers": {
            "demo": { "command": "echo-server" },
            "remote": { "url": "http://localhost:8080/sse", "description": "Remote tools" }
        }
    }"#;
    let doc: McpConfigDocument = serde_json::from_str(raw).unwrap();
    let configs: Vec<ServerConfig> = doc
        .all_servers()
        .iter()
        .map(|(id, def)| ServerConfig::from_definition(id.clone(), def, None))
        .collect();

    assert_eq!(configs.len(), 2);
    let demo = configs.iter().find(|c| c.server_id == "demo").unwrap();
    assert_eq!(demo.transport_kind().unwrap(), TransportKind::Stdio);
    assert!(demo.auto_restart);
    assert!(!demo.auto_start);
    assert_eq!(demo.approval_process, ApprovalProcess::User);

    let remote = configs.iter().find(|c| c.server_id == "remote").unwrap();
    assert_eq!(remote.name, "Remote tools");
    assert_eq!(remote.transport_kind().unwrap(), TransportKind::Streaming);
    assert_eq!(remote.max_risk_level, RiskLevel::Medium);
}

#[test]
fn server_config_roundtrips_through_json() {
    let mut cfg = ServerConfig::new("fs").with_command("npx", ["-y", "server-filesystem"]);
    cfg.auto_start = true;
    cfg.max_risk_level = RiskLevel::High;
    cfg.approval_process = ApprovalProcess::AllowAll;

    let json = serde_json::to_string(&cfg).unwrap();
    assert!(json.contains("\"serverId\":\"fs\""));
    assert!(json.contains("\"maxRiskLevel\":\"high\""));
    let back: ServerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn disabled_flag_defaults_to_false() {
    let doc: McpConfigDocument =
        serde_json::from_str(r#"{ "servers": { "a": { "command": "x" } } }"#).unwrap();
    assert!(!doc.all_servers()["a"].disabled);
}
