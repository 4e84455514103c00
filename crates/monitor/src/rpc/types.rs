use chain_notify_domain::TraceConfig;
use ethers::types::{Address, BlockNumber, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Height selector for ledger lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockHeight {
    Latest,
    Number(u64),
}

impl From<BlockHeight> for BlockNumber {
    fn from(value: BlockHeight) -> Self {
        match value {
            BlockHeight::Latest => BlockNumber::Latest,
            BlockHeight::Number(number) => BlockNumber::Number(number.into()),
        }
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

/// The two header fields the ticker cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
}

/// Value movement discovered by tracing a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTransfer {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
}

/// Parameters for `debug_traceTransaction` using the built-in call tracer.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRequest {
    pub tracer: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reexec: Option<u64>,
}

impl From<&TraceConfig> for TraceRequest {
    fn from(config: &TraceConfig) -> Self {
        Self {
            tracer: "callTracer",
            timeout: config.timeout(),
            reexec: config.reexec(),
        }
    }
}

/// One frame of `callTracer` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

impl CallFrame {
    fn is_create(&self) -> bool {
        matches!(self.kind.as_str(), "CREATE" | "CREATE2")
    }

    fn moves_value(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "CALL" | "CREATE" | "CREATE2" | "SELFDESTRUCT"
        )
    }

    fn to_transfer(&self) -> InternalTransfer {
        InternalTransfer {
            from: self.from,
            to: if self.is_create() { None } else { self.to },
            value: self.value.unwrap_or_default(),
            input: self.input.clone(),
        }
    }

    /// Flattens the call tree into transfers, depth first.
    ///
    /// The root frame always yields one record. Nested frames yield one only
    /// when they moved non-zero value and did not revert; reverted subtrees
    /// are skipped entirely.
    pub fn internal_transfers(&self) -> Vec<InternalTransfer> {
        let mut out = vec![self.to_transfer()];
        if self.error.is_none() {
            for call in &self.calls {
                call.collect_nested(&mut out);
            }
        }
        out
    }

    fn collect_nested(&self, out: &mut Vec<InternalTransfer>) {
        if self.error.is_some() {
            return;
        }
        let value = self.value.unwrap_or_default();
        if self.moves_value() && !value.is_zero() {
            out.push(self.to_transfer());
        }
        for call in &self.calls {
            call.collect_nested(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(raw: serde_json::Value) -> CallFrame {
        serde_json::from_value(raw).expect("frame decodes")
    }

    #[test]
    fn plain_transfer_yields_root_only() {
        let root = frame(serde_json::json!({
            "type": "CALL",
            "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "value": "0x64",
            "gas": "0x5208",
            "input": "0x"
        }));
        let transfers = root.internal_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].value, U256::from(100u64));
    }

    #[test]
    fn nested_value_calls_are_collected_and_reverts_skipped() {
        let root = frame(serde_json::json!({
            "type": "CALL",
            "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to": "0xcccccccccccccccccccccccccccccccccccccccc",
            "value": "0x0",
            "input": "0x12345678",
            "calls": [
                {
                    "type": "CALL",
                    "from": "0xcccccccccccccccccccccccccccccccccccccccc",
                    "to": "0xdddddddddddddddddddddddddddddddddddddddd",
                    "value": "0x10",
                    "input": "0x"
                },
                {
                    "type": "STATICCALL",
                    "from": "0xcccccccccccccccccccccccccccccccccccccccc",
                    "to": "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee",
                    "input": "0x"
                },
                {
                    "type": "CALL",
                    "from": "0xcccccccccccccccccccccccccccccccccccccccc",
                    "to": "0xffffffffffffffffffffffffffffffffffffffff",
                    "value": "0x20",
                    "error": "execution reverted",
                    "input": "0x"
                },
                {
                    "type": "CREATE2",
                    "from": "0xcccccccccccccccccccccccccccccccccccccccc",
                    "to": "0x1111111111111111111111111111111111111111",
                    "value": "0x5",
                    "input": "0x6080"
                }
            ]
        }));
        let transfers = root.internal_transfers();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[0].input, Bytes::from(vec![0x12, 0x34, 0x56, 0x78]));
        assert_eq!(transfers[1].to, Some(Address::repeat_byte(0xdd)));
        assert_eq!(transfers[2].to, None);
        assert_eq!(transfers[2].value, U256::from(5u64));
    }

    #[test]
    fn trace_request_omits_unset_limits() {
        let request = TraceRequest::from(&TraceConfig::new(true, None, Some(128)));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tracer"], "callTracer");
        assert!(json.get("timeout").is_none());
        assert_eq!(json["reexec"], 128);
    }
}
