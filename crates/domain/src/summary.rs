//! Read-only snapshots of pipeline configuration for startup logging.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSummary {
    pub section: &'static str,
    pub server: String,
    pub username: String,
    pub password: &'static str,
    pub client_id: String,
    pub qos: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub prefix_topic: String,
}

impl BrokerSummary {
    pub const REDACTED: &'static str = "***";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub enabled: bool,
    pub timeout: Option<String>,
    pub reexec: Option<u64>,
}

/// Everything an operator needs to see about a pipeline at startup, with
/// credentials masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<BrokerSummary>,
    pub publish: BrokerSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracer: Option<TraceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_path: Option<String>,
}

impl ConfigSummary {
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(section: &'static str) -> BrokerSummary {
        BrokerSummary {
            section,
            server: "tcp://broker:1883".to_string(),
            username: "notify".to_string(),
            password: BrokerSummary::REDACTED,
            client_id: "NotifyMonitorPublish1".to_string(),
            qos: 1,
            topic: None,
            prefix_topic: "n/".to_string(),
        }
    }

    #[test]
    fn absent_sections_are_omitted() {
        let summary = ConfigSummary {
            mode: "monitor",
            subscribe: None,
            publish: broker("Publish"),
            rpc_url: Some("http://node:8545".to_string()),
            delay: Some(0),
            tracer: None,
            cursor_path: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&summary.to_pretty_json().unwrap()).unwrap();
        assert!(json.get("subscribe").is_none());
        assert!(json["publish"].get("topic").is_none());
        assert_eq!(json["publish"]["password"], "***");
        assert_eq!(json["rpcUrl"], "http://node:8545");
    }
}
