mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{SilentTransport, node, with_transport};
use param_z::transport::LoopbackNetwork;
use param_z::{
    ContextBuilder, Error, ParamMask, ParamMeta, ParamType, QueueDirection, SetMode, Storage, Value,
};

const SERVER: u16 = 5;
const CLIENT: u16 = 1;

fn three_params() -> ContextBuilder {
    ContextBuilder::default()
        .without_builtin_params()
        .with_param(
            ParamMeta::new(1, "mode", ParamType::Uint8).with_mask(ParamMask::CONF),
            Some(Value::Uint(2)),
        )
        .with_param(
            ParamMeta::new(2, "temp", ParamType::Float)
                .with_mask(ParamMask::TELEM)
                .with_unit("C"),
            Some(Value::Float(21.5)),
        )
        .with_param(
            ParamMeta::new(3, "gains", ParamType::Int16)
                .with_array_len(4)
                .with_mask(ParamMask::CONF)
                .with_doc("loop gains"),
            Some(Value::array([1i16, -2, 3, -4])),
        )
}

#[test]
fn download_then_forget() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, three_params());
    // Cached entries of another node must survive both operations on node 5.
    let other = ParamMeta::new(1, "mode", ParamType::Uint8)
        .with_node(9)
        .with_storage(Storage::Remote);
    let other_temp = ParamMeta::new(2, "temp", ParamType::Float)
        .with_node(9)
        .with_storage(Storage::Remote);
    let client = node(
        &net,
        CLIENT,
        ContextBuilder::default()
            .with_param(other.clone(), Some(Value::Uint(4)))
            .with_param(other_temp, None),
    );
    let before = client.registry().len();

    assert_eq!(client.download(Some(SERVER), None, None, false).unwrap(), 3);
    assert_eq!(client.registry().len(), before + 3);
    let remote = client.list(ParamMask::all(), Some(SERVER), None).unwrap();
    assert_eq!(remote.len(), 3);
    let temp = client.find("temp", Some(SERVER)).unwrap();
    assert_eq!(temp.unit(), "C");
    assert_eq!(temp.id(), 2);
    assert!(client.find("gains", Some(SERVER)).unwrap().is_array());
    assert_eq!(client.list(ParamMask::all(), Some(9), None).unwrap().len(), 2);
    let cached = client.find("mode", Some(9)).unwrap();
    assert_eq!(cached.meta(), &other);
    assert_eq!(cached.cached().unwrap(), Value::Uint(4));

    // Already known entries are not added twice.
    assert_eq!(client.download(Some(SERVER), None, Some(1), false).unwrap(), 0);

    assert_eq!(client.forget(Some(SERVER), true).unwrap(), 3);
    assert_eq!(client.registry().len(), before);
    assert!(client.list(ParamMask::all(), Some(SERVER), None).unwrap().is_empty());
    assert_eq!(client.find("mode", Some(9)).unwrap().cached().unwrap(), Value::Uint(4));

    client.download(Some(SERVER), None, None, false).unwrap();
    assert_eq!(client.forget(None, false).unwrap(), 5);
    assert!(client.list(ParamMask::all(), Some(9), None).unwrap().is_empty());
    assert!(client.find("test_array_param", Some(0)).is_ok());

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn download_from_nobody() {
    let net = LoopbackNetwork::new();
    let client = node(&net, CLIENT, ContextBuilder::default());
    assert!(matches!(
        client.download(Some(42), Some(Duration::from_millis(50)), None, false),
        Err(Error::NoResponse { node: 42 })
    ));
    client.shutdown().unwrap();
}

#[test]
fn remote_get_and_set() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, three_params());
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let gains = client.find("gains", Some(SERVER)).unwrap();
    assert_eq!(gains.value().unwrap(), Value::array([1i16, -2, 3, -4]));
    assert_eq!(client.get(&gains, Some(-1), true, None).unwrap(), Value::Int(-4));

    client
        .set_array(&gains, &[Value::Int(9), Value::Int(8), Value::Int(7), Value::Int(6)], None, SetMode::Default)
        .unwrap();
    let local = server.find("gains", None).unwrap();
    assert_eq!(local.value().unwrap(), Value::array([9i16, 8, 7, 6]));

    let mode = client.find("mode", Some(SERVER)).unwrap();
    client.set(&mode, &Value::from("7"), None, None, SetMode::Default).unwrap();
    assert_eq!(server.find("mode", None).unwrap().value().unwrap(), Value::Uint(7));
    assert_eq!(mode.cached().unwrap(), Value::Uint(7));
    assert!(mode.timestamp().is_some());

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn long_arrays_move_as_one_batch() {
    let net = LoopbackNetwork::new();
    let server = node(
        &net,
        SERVER,
        ContextBuilder::default()
            .with_param(
                ParamMeta::new(60, "adc", ParamType::Uint16).with_array_len(32),
                Some(Value::array(0u16..32)),
            )
            .with_param(
                ParamMeta::new(61, "samples", ParamType::Uint32).with_array_len(64),
                None,
            ),
    );
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let adc = client.find("adc", Some(SERVER)).unwrap();
    assert_eq!(client.get(&adc, None, true, None).unwrap(), Value::array(0u16..32));
    let doubled: Vec<Value> = (0u16..32).map(|v| Value::from(v * 2)).collect();
    client.set_array(&adc, &doubled, None, SetMode::Default).unwrap();
    assert_eq!(server.find("adc", None).unwrap().value().unwrap(), Value::Array(doubled));

    // 256 bytes of payload do not fit one queue and go out in several exchanges.
    let samples = client.find("samples", Some(SERVER)).unwrap();
    let values: Vec<Value> = (0u32..64).map(|v| Value::from(v * 1000)).collect();
    client.set_array(&samples, &values, None, SetMode::Default).unwrap();
    assert_eq!(samples.cached().unwrap(), Value::Array(values.clone()));
    assert_eq!(server.find("samples", None).unwrap().value().unwrap(), Value::Array(values));
    assert_eq!(samples.value().unwrap(), Value::array((0u32..64).map(|v| v * 1000)));

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn remote_set_rejected_by_type() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, three_params());
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let gains = client.find("gains", Some(SERVER)).unwrap();
    let bad = [Value::Int(1), Value::Int(2), Value::from("three"), Value::Int(4)];
    assert!(matches!(
        client.set_array(&gains, &bad, None, SetMode::Default),
        Err(Error::TypeMismatch { .. })
    ));
    assert_eq!(
        server.find("gains", None).unwrap().value().unwrap(),
        Value::array([1i16, -2, 3, -4])
    );

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn pull_all_and_queue_precedence() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, three_params());
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    assert_eq!(client.pull_all(Some(SERVER), None, None, None, None).unwrap(), 3);
    let temp = client.find("temp", Some(SERVER)).unwrap();
    assert_eq!(temp.cached().unwrap(), Value::Float(21.5));
    assert_eq!(
        client
            .pull_all(Some(SERVER), Some(ParamMask::TELEM), None, None, None)
            .unwrap(),
        1
    );

    server
        .set(&server.find("mode", None).unwrap(), &Value::Uint(4), None, None, SetMode::Default)
        .unwrap();
    server
        .set(&server.find("temp", None).unwrap(), &Value::Float(-5.0), None, None, SetMode::Default)
        .unwrap();

    // A pending get queue narrows the pull-all to its own entries.
    let mode = client.find("mode", Some(SERVER)).unwrap();
    {
        let _guard = client.autosend_guard(false);
        assert_eq!(mode.value().unwrap(), Value::Uint(2));
    }
    assert_eq!(client.pending(QueueDirection::Get).len(), 1);
    assert_eq!(client.pull_all(Some(SERVER), None, None, None, None).unwrap(), 1);
    assert!(client.pending(QueueDirection::Get).is_empty());
    assert_eq!(mode.cached().unwrap(), Value::Uint(4));
    assert_eq!(temp.cached().unwrap(), Value::Float(21.5));

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn deferred_push_with_hwid() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, three_params().with_hwid(0xC0FFEE));
    let client = node(&net, CLIENT, ContextBuilder::default().with_autosend(false));
    client.download(Some(SERVER), None, None, false).unwrap();

    client.cmd_new(QueueDirection::Set, "tune");
    let mode = client.find("mode", Some(SERVER)).unwrap();
    mode.set_value(&Value::Uint(9)).unwrap();
    let gains = client.find("gains", Some(SERVER)).unwrap();
    client.set(&gains, &Value::Int(0), Some(0), None, SetMode::Default).unwrap();
    assert_eq!(client.pending(QueueDirection::Set).len(), 2);
    assert!(client.queue().contains("Queue tune (set"));

    let short = Some(Duration::from_millis(100));
    assert!(client.push(Some(SERVER), short, Some(0xBAD)).unwrap_err().is_no_response());
    assert_eq!(client.pending(QueueDirection::Set).len(), 2);
    assert_eq!(server.find("mode", None).unwrap().value().unwrap(), Value::Uint(2));

    assert_eq!(client.push(Some(SERVER), None, Some(0xC0FFEE)).unwrap(), 2);
    assert!(client.pending(QueueDirection::Set).is_empty());
    assert_eq!(server.find("mode", None).unwrap().value().unwrap(), Value::Uint(9));
    assert_eq!(
        server.find("gains", None).unwrap().value().unwrap(),
        Value::array([0i16, -2, 3, -4])
    );

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn host_override_routes_only() {
    let net = LoopbackNetwork::new();
    // Node 5 relays a cached parameter of node 9.
    let cached = ParamMeta::new(1, "mode", ParamType::Uint8)
        .with_node(9)
        .with_storage(Storage::Remote);
    let server = node(&net, SERVER, three_params().with_param(cached.clone(), Some(Value::Uint(6))));
    let client = node(&net, CLIENT, ContextBuilder::default().with_param(cached, None));

    let mut mode = client.find("mode", Some(9)).unwrap();
    assert!(mode.value().unwrap_err().is_no_response());
    mode.set_host(Some(SERVER));
    assert_eq!(mode.value().unwrap(), Value::Uint(6));
    assert_eq!(mode.node(), 9);

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn set_node_re_resolves_by_name() {
    let net = LoopbackNetwork::new();
    let server = node(&net, SERVER, ContextBuilder::default());
    let client = node(&net, CLIENT, ContextBuilder::default());
    client.download(Some(SERVER), None, None, false).unwrap();

    let mut arr = client.find("test_array_param", Some(0)).unwrap();
    let local = arr.clone();
    arr.set_node(SERVER).unwrap();
    assert_eq!(arr.node(), SERVER);
    assert_ne!(arr, local);
    assert!(arr.set_node(77).is_err());
    assert_eq!(arr.node(), SERVER);

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn silent_node_times_out() {
    let ctx = with_transport(Arc::new(SilentTransport), ContextBuilder::default());
    assert!(ctx.pull_all(Some(3), None, None, None, None).unwrap_err().is_no_response());
    assert!(ctx.download(Some(3), None, None, false).unwrap_err().is_no_response());
    ctx.shutdown().unwrap();
}
