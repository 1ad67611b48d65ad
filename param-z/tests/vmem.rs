mod common;

use std::sync::Arc;

use common::{SilentTransport, node, with_transport};
use param_z::transport::LoopbackNetwork;
use param_z::vmem::client::format_regions;
use param_z::vmem::server::WRITE_LOCKED;
use param_z::vmem::VmemKind;
use param_z::{ContextBuilder, Error, ParamMeta, ParamType, SetMode, Storage, Value};

const SERVER: u16 = 5;
const CLIENT: u16 = 1;

fn server_regions() -> ContextBuilder {
    ContextBuilder::default()
        .with_ram_region(1, "cnf", 256)
        .with_protected_region(2, "boot", 64)
}

#[test]
fn list_regions() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, server_regions());
    let client = node(&net, CLIENT, ContextBuilder::default());

    let regions = client.vmem(Some(SERVER), None).unwrap();
    let names: Vec<&str> = regions.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["cnf", "boot", "col"]);
    assert_eq!(regions[0].size, 256);
    assert_eq!(regions[0].kind, VmemKind::Ram);
    assert_eq!(regions, server.vmem(Some(0), None).unwrap());
    assert!(format_regions(&regions).contains("boot"));

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn backup_and_restore() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, server_regions());
    let client = node(&net, CLIENT, ContextBuilder::default());

    assert_eq!(client.backup(SERVER, 1, None).unwrap(), vec![0u8; 256]);

    // Spans two chunks.
    let image: Vec<u8> = (0..=255u8).collect();
    client.restore(SERVER, 1, None, &image).unwrap();
    assert_eq!(client.backup(SERVER, 1, None).unwrap(), image);
    assert_eq!(server.vmem_table().read_region(1).unwrap(), image);

    assert!(matches!(
        client.restore(SERVER, 1, None, &[0u8; 300]),
        Err(Error::LengthMismatch { expected: 256, actual: 300 })
    ));
    assert!(matches!(client.backup(SERVER, 9, None), Err(Error::NotFound { .. })));

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn protected_region_needs_unlock() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, server_regions());
    let client = node(&net, CLIENT, ContextBuilder::default());

    let image = [0xA5u8; 64];
    assert!(matches!(
        client.restore(SERVER, 2, None, &image),
        Err(Error::Rejected { node: SERVER, status: WRITE_LOCKED })
    ));
    assert_eq!(server.vmem_table().read_region(2).unwrap(), vec![0u8; 64]);

    client.unlock(SERVER, None).unwrap();
    client.restore(SERVER, 2, None, &image).unwrap();
    assert_eq!(client.backup(SERVER, 2, None).unwrap(), image);

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn unlock_without_answer() {
    let ctx = with_transport(Arc::new(SilentTransport), ContextBuilder::default());
    assert!(matches!(ctx.unlock(3, None), Err(Error::NoResponse { node: 3 })));
    assert!(matches!(ctx.unlock(0, None), Err(Error::Config(_))));
    ctx.shutdown().unwrap();
}

#[test]
fn vmem_param_writes_through() {
    let net = LoopbackNetwork::new();
    let server = node(
        &net,
        SERVER,
        server_regions().with_param(
            ParamMeta::new(40, "baud", ParamType::Uint32).with_storage(Storage::Vmem {
                region: 1,
                address: 16,
            }),
            None,
        ),
    );
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let baud = client.find("baud", Some(SERVER)).unwrap();
    client.set(&baud, &Value::Uint(115_200), None, None, SetMode::Default).unwrap();
    let image = client.backup(SERVER, 1, None).unwrap();
    assert_eq!(image[16..20], 115_200u32.to_be_bytes());
    assert!(server.find("baud", None).unwrap().is_vmem());

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn restore_reloads_region_params() {
    let net = LoopbackNetwork::new();
    let server = node(
        &net,
        SERVER,
        server_regions().with_param(
            ParamMeta::new(40, "baud", ParamType::Uint32).with_storage(Storage::Vmem { region: 1, address: 0 }),
            None,
        ),
    );
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let local = server.find("baud", None).unwrap();
    local.set_value(&Value::Uint(9600)).unwrap();

    let mut image = vec![0u8; 256];
    image[..4].copy_from_slice(&115_200u32.to_be_bytes());
    client.restore(SERVER, 1, None, &image).unwrap();
    assert_eq!(local.value().unwrap(), Value::Uint(115_200));
    let baud = client.find("baud", Some(SERVER)).unwrap();
    assert_eq!(baud.value().unwrap(), Value::Uint(115_200));

    image[..4].copy_from_slice(&57_600u32.to_be_bytes());
    server.restore(0, 1, None, &image).unwrap();
    assert_eq!(local.value().unwrap(), Value::Uint(57_600));
    assert_eq!(client.backup(SERVER, 1, None).unwrap(), image);

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn file_region_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cnf.bin");
    let builder = || {
        ContextBuilder::default()
            .with_loopback(&LoopbackNetwork::new())
            .with_servers(false)
            .with_file_region(3, "cnf", &path, 32)
            .with_param(
                ParamMeta::new(41, "label", ParamType::String)
                    .with_array_len(8)
                    .with_storage(Storage::Vmem { region: 3, address: 0 }),
                None,
            )
    };

    let first = node(&LoopbackNetwork::new(), 1, builder());
    let label = first.find("label", None).unwrap();
    label.set_value(&Value::from("sat-1")).unwrap();
    first.shutdown().unwrap();
    drop(first);

    let second = node(&LoopbackNetwork::new(), 1, builder());
    assert_eq!(second.find("label", None).unwrap().value().unwrap(), Value::from("sat-1"));
    assert_eq!(second.backup(0, 3, None).unwrap().len(), 32);
    second.shutdown().unwrap();
}
