//! Payload templater: JSON command bodies keyed by (dialect, command kind) (spec §4.3).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{CMD_CONTROL, CMD_CONTROL_NEW, CMD_DP_QUERY, CMD_DP_QUERY_NEW, CMD_STATUS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Default,
    Device22,
}

impl Dialect {
    pub fn parse(name: &str) -> (Dialect, bool) {
        match name {
            "device22" => (Dialect::Device22, true),
            "default" => (Dialect::Default, true),
            _ => (Dialect::Default, false),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Default => write!(f, "default"),
            Dialect::Device22 => write!(f, "device22"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    DpQuery,
    Control,
    Status,
}

impl CommandKind {
    fn name(self) -> &'static str {
        match self {
            CommandKind::DpQuery => "DP_QUERY",
            CommandKind::Control => "CONTROL",
            CommandKind::Status => "STATUS",
        }
    }
}

struct Template {
    fields: &'static [&'static str],
    default_cmd: u32,
    command_override: Option<u32>,
}

/// Static `(dialect, command_kind) -> template` table. New dialects are
/// added by extending this match only (spec §9 Design Notes).
fn lookup(dialect: Dialect, kind: CommandKind) -> Option<Template> {
    match (dialect, kind) {
        (Dialect::Default, CommandKind::DpQuery) => Some(Template {
            fields: &["gwId", "devId", "uid", "t"],
            default_cmd: CMD_DP_QUERY,
            command_override: None,
        }),
        (Dialect::Default, CommandKind::Control) => Some(Template {
            fields: &["devId", "uid", "t"],
            default_cmd: CMD_CONTROL,
            command_override: None,
        }),
        (Dialect::Default, CommandKind::Status) => Some(Template {
            fields: &["gwId", "devId"],
            default_cmd: CMD_STATUS,
            command_override: None,
        }),
        // device22 rewrites DP_QUERY into a CONTROL_NEW-coded frame with
        // a body omitting gwId (spec §3, scenario 5).
        (Dialect::Device22, CommandKind::DpQuery) => Some(Template {
            fields: &["devId", "uid", "t"],
            default_cmd: CMD_DP_QUERY_NEW,
            command_override: Some(CMD_CONTROL_NEW),
        }),
        (Dialect::Device22, CommandKind::Control) => Some(Template {
            fields: &["devId", "uid", "t"],
            default_cmd: CMD_CONTROL,
            command_override: None,
        }),
        (Dialect::Device22, CommandKind::Status) => None,
    }
}

/// Build a command body for `(dialect, kind)`. Returns the serialized
/// JSON bytes and the effective on-wire command code (which may differ
/// from the logical `kind` per `command_override`).
///
/// Returns `None` if the dialect has no template for this command kind
/// (`UnsupportedOp`, spec §7).
pub fn build(
    dialect: Dialect,
    device_id: &str,
    kind: CommandKind,
    dps_writes: Option<&serde_json::Value>,
    cid: Option<&str>,
) -> Option<(Vec<u8>, u32)> {
    let template = lookup(dialect, kind)?;

    let mut body = serde_json::Map::new();
    for field in template.fields {
        let value = match *field {
            "gwId" | "devId" | "uid" => device_id,
            "t" => {
                // placeholder, replaced below
                continue;
            }
            _ => continue,
        };
        body.insert(field.to_string(), serde_json::Value::String(value.to_owned()));
    }
    if template.fields.contains(&"t") {
        body.insert("t".to_string(), serde_json::Value::String(timestamp_str()));
    }
    if let Some(dps) = dps_writes {
        body.insert("dps".to_string(), dps.clone());
    }
    if let Some(cid) = cid {
        body.insert("cid".to_string(), serde_json::Value::String(cid.to_owned()));
    }

    let effective_cmd = template.command_override.unwrap_or(template.default_cmd);
    let bytes = serde_json::to_vec(&serde_json::Value::Object(body)).expect("known-good JSON");
    Some((bytes, effective_cmd))
}

fn timestamp_str() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dp_query_has_gwid() {
        let (bytes, cmd) = build(Dialect::Default, "dev1", CommandKind::DpQuery, None, None).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["gwId"], "dev1");
        assert_eq!(v["devId"], "dev1");
        assert_eq!(cmd, CMD_DP_QUERY);
    }

    #[test]
    fn device22_dp_query_omits_gwid_and_overrides_cmd() {
        let (bytes, cmd) = build(Dialect::Device22, "dev1", CommandKind::DpQuery, None, None).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(v.get("gwId").is_none());
        assert_eq!(v["devId"], "dev1");
        assert_eq!(cmd, CMD_CONTROL_NEW);
    }

    #[test]
    fn control_attaches_dps() {
        let dps = serde_json::json!({"1": true});
        let (bytes, cmd) = build(Dialect::Default, "dev1", CommandKind::Control, Some(&dps), None).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["dps"], dps);
        assert_eq!(cmd, CMD_CONTROL);
    }

    #[test]
    fn cid_is_attached_for_child_devices() {
        let (bytes, _) = build(Dialect::Default, "dev1", CommandKind::DpQuery, None, Some("child1")).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["cid"], "child1");
    }

    #[test]
    fn unknown_dialect_falls_back_to_default() {
        let (dialect, known) = Dialect::parse("some_unknown_dialect");
        assert_eq!(dialect, Dialect::Default);
        assert!(!known);
    }

    #[test]
    fn unsupported_op_returns_none() {
        assert!(lookup(Dialect::Device22, CommandKind::Status).is_none());
        assert!(build(Dialect::Device22, "dev1", CommandKind::Status, None, None).is_none());
    }
}
