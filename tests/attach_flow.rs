//! End-to-end flows through the public API with a recording executor

use assert_matches::assert_matches;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use volume_attach::initiator::collect_properties;
use volume_attach::{
    get_encryption_metadata, get_volume_encryptor, CommandOutput, ConnectionInfo,
    ConnectionProperties, ConnectorFactory, ConnectorOptions, EncryptionMetadata,
    EncryptorSelection, Error, HostPlatform, KeyManager, ProbeContext, RecordingExecutor,
    RequestContext, Result, VolumeApi,
};

struct FixedKey;

impl KeyManager for FixedKey {
    fn get_key(&self, _context: &RequestContext, _key_id: &str) -> Result<Vec<u8>> {
        Ok(vec![0xde, 0xad, 0x0b, 0xef])
    }
}

struct MetadataService(IndexMap<String, Value>);

impl VolumeApi for MetadataService {
    fn get_volume_encryption_metadata(
        &self,
        _context: &RequestContext,
        _volume_id: &str,
    ) -> Result<IndexMap<String, Value>> {
        Ok(self.0.clone())
    }
}

fn factory(executor: Arc<RecordingExecutor>) -> ConnectorFactory {
    ConnectorFactory::builder()
        .executor(executor)
        .platform(HostPlatform::new("x86_64", "linux"))
        .build()
}

#[test]
fn test_local_volume_round_trip() {
    let executor = Arc::new(RecordingExecutor::new());
    let connector = factory(executor.clone())
        .build("local", ConnectorOptions::new("sudo"))
        .unwrap();
    let props = ConnectionProperties::new().with("device_path", "/dev/vg0/volume-1");

    let device = connector.connect_volume(&props).unwrap();
    assert_eq!(device.path, "/dev/vg0/volume-1");
    assert_eq!(device.device_type, "local");
    assert_eq!(connector.get_volume_paths(&props).unwrap(), vec!["/dev/vg0/volume-1"]);

    connector.disconnect_volume(&props, Some(&device)).unwrap();
    assert!(executor.requests().is_empty());
}

#[test]
fn test_protocol_errors() {
    let factory = factory(Arc::new(RecordingExecutor::new()));

    assert_matches!(
        factory.build("CARRIER_PIGEON", ConnectorOptions::new("sudo")),
        Err(Error::InvalidConnectorProtocol { protocol }) if protocol == "CARRIER_PIGEON"
    );
    assert_matches!(
        factory.build("ISCSI", ConnectorOptions::new("sudo")),
        Err(Error::ConnectorUnavailable { .. })
    );
}

#[test]
fn test_built_objects_format_for_diagnostics() {
    let connector = factory(Arc::new(RecordingExecutor::new()))
        .build("local", ConnectorOptions::new("sudo"))
        .unwrap();
    assert_eq!(format!("{:?}", connector), r#"Connector { name: "LocalConnector" }"#);

    let info = ConnectionInfo::new(
        "rbd",
        ConnectionProperties::new().with("device_path", "/dev/rbd0"),
    );
    let encryptor = get_volume_encryptor(
        "sudo",
        &info,
        Arc::new(FixedKey),
        None,
        &EncryptionMetadata::default(),
    )
    .unwrap();
    assert_eq!(
        format!("{:?}", encryptor),
        "VolumeEncryptor { selection: NoOp }"
    );
}

#[test]
fn test_host_properties_for_fc_host() {
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(sysfs.path().join("class/fc_host")).unwrap();
    let systool = "Class = \"fc_host\"\n\n  Class Device = \"host5\"\n  \
                   Class Device path = \"/sys/devices/pci0000:00/0000:00:02.0/host5/fc_host/host5\"\n    \
                   node_name = \"0x20000025B5AA0001\"\n    \
                   port_name = \"0x20000025B5AB0001\"\n";

    let executor = Arc::new(RecordingExecutor::with_responder(move |request| {
        match request.program.as_str() {
            "systool" => Ok(CommandOutput::stdout(systool)),
            "cat" => Ok(CommandOutput::stdout("InitiatorName=iqn.2004-10.com.ubuntu:01:c0ffee\n")),
            _ => Ok(CommandOutput::default()),
        }
    }));
    let ctx = ProbeContext::new("sudo", "192.168.1.20", executor)
        .host("compute-7")
        .platform(HostPlatform::new("x86_64", "linux"))
        .sysfs_root(sysfs.path());

    let props = collect_properties(&ctx).unwrap();

    assert_eq!(props["host"], json!("compute-7"));
    assert_eq!(props["initiator"], json!("iqn.2004-10.com.ubuntu:01:c0ffee"));
    assert_eq!(props["wwpns"], json!(["20000025b5ab0001"]));
    assert_eq!(props["wwnns"], json!(["20000025b5aa0001"]));
}

#[test]
fn test_encrypted_volume_selects_luks() {
    let info = ConnectionInfo::new(
        "fibre_channel",
        ConnectionProperties::new()
            .with("device_path", "/dev/disk/by-id/wwn-0x600a0b80005e7f81")
            .with("encrypted", true),
    );
    let mut raw = IndexMap::new();
    raw.insert("provider".to_string(), json!("luks"));
    raw.insert("control_location".to_string(), json!("front-end"));
    raw.insert("encryption_key_id".to_string(), json!("key-42"));
    let context = RequestContext::new("req-9");

    let metadata =
        get_encryption_metadata(&context, &MetadataService(raw), "vol-1", &info).unwrap();
    assert!(metadata.is_front_end());

    let executor = Arc::new(RecordingExecutor::new());
    let encryptor =
        get_volume_encryptor("sudo", &info, Arc::new(FixedKey), Some(executor.clone()), &metadata)
            .unwrap();
    assert_eq!(encryptor.selection(), EncryptorSelection::Luks);

    encryptor.attach_volume(&context, &metadata).unwrap();
    let lines = executor.command_lines();
    assert_eq!(
        lines[0],
        "cryptsetup isLuks --verbose /dev/disk/by-id/wwn-0x600a0b80005e7f81"
    );
    assert_eq!(executor.requests()[0].argv()[0], "sudo");
    assert!(lines.iter().any(|line| line.contains("luksOpen")));
    assert!(!lines.iter().any(|line| line.contains("luksFormat")));
}

#[test]
fn test_unencrypted_volume_is_noop() {
    let info = ConnectionInfo::new(
        "rbd",
        ConnectionProperties::new().with("device_path", "/dev/rbd0"),
    );
    let context = RequestContext::new("req-10");

    let metadata =
        get_encryption_metadata(&context, &MetadataService(IndexMap::new()), "vol-2", &info)
            .unwrap();
    assert_eq!(metadata, EncryptionMetadata::default());

    let executor = Arc::new(RecordingExecutor::new());
    let encryptor =
        get_volume_encryptor("sudo", &info, Arc::new(FixedKey), Some(executor.clone()), &metadata)
            .unwrap();
    assert_eq!(encryptor.selection(), EncryptorSelection::NoOp);
    encryptor.attach_volume(&context, &metadata).unwrap();
    assert!(executor.requests().is_empty());
}
