//! iSCSI host probe
//!
//! Only the initiator name is read here; session management is left to a
//! registered connector plugin.

use crate::domain::properties::PropertyMap;
use crate::error::Result;
use crate::executor::ExecRequest;
use crate::initiator::properties::ProbeContext;
use serde_json::Value;
use tracing::warn;

/// Initiator IQN from the contents of `initiatorname.iscsi`
pub fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// `initiator` when the host has one configured
pub fn get_connector_properties(ctx: &ProbeContext) -> Result<PropertyMap> {
    let mut props = PropertyMap::new();

    let request = ExecRequest::new("cat")
        .arg(ctx.iscsi_initiator_file.to_string_lossy())
        .as_root(&ctx.root_helper);
    match ctx.executor.execute(&request) {
        Ok(output) => {
            if let Some(initiator) = parse_initiator_name(&output.stdout) {
                props.insert("initiator".to_string(), Value::String(initiator));
            }
        }
        Err(e) => warn!("Could not find the iSCSI Initiator File: {}", e),
    }
    Ok(props)
}
