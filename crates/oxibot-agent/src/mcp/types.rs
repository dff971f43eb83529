//! MCP wire-level content types.
//!
//! Server configuration (`McpServerConfig`, `McpTransportKind`) lives in
//! `oxibot_core::config` alongside the rest of the config schema; this
//! module only adds the types specific to the protocol's tool-call results.

use serde::Deserialize;

pub use oxibot_core::config::{McpServerConfig, McpTransportKind};

/// One block of a `tools/call` or `resources/read` result.
///
/// Mirrors the content-block shapes MCP servers actually emit
/// (`{"type": "text", ...}`, `{"type": "resource", ...}`,
/// `{"type": "image", ...}`) — the concrete instance of this crate's
/// "tagged variants over dynamic dicts" convention.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContentBlock {
    Text {
        text: String,
    },
    Resource {
        uri: String,
    },
    Image {
        #[serde(rename = "mimeType", default = "default_mime")]
        mime_type: String,
        #[serde(default)]
        data: String,
    },
    /// Anything not matching a known shape — preserved so callers can at
    /// least see that content arrived, rather than failing to deserialize.
    #[serde(other)]
    Unknown,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_block() {
        let v: McpContentBlock = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(v, McpContentBlock::Text { text: "hi".into() });
    }

    #[test]
    fn test_parse_resource_block() {
        let v: McpContentBlock =
            serde_json::from_str(r#"{"type":"resource","uri":"file:///x"}"#).unwrap();
        assert_eq!(
            v,
            McpContentBlock::Resource {
                uri: "file:///x".into()
            }
        );
    }

    #[test]
    fn test_parse_image_block() {
        let v: McpContentBlock =
            serde_json::from_str(r#"{"type":"image","mimeType":"image/png","data":"abcd"}"#)
                .unwrap();
        assert_eq!(
            v,
            McpContentBlock::Image {
                mime_type: "image/png".into(),
                data: "abcd".into()
            }
        );
    }

    #[test]
    fn test_parse_unknown_block() {
        let v: McpContentBlock = serde_json::from_str(r#"{"type":"audio"}"#).unwrap();
        assert_eq!(v, McpContentBlock::Unknown);
    }
}
