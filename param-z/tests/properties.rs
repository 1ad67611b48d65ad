mod common;

use std::sync::Arc;

use common::{CountingTransport, SilentTransport, with_transport};
use param_z::transport::{LoopbackNetwork, Transport};
use param_z::{
    ContextBuilder, Error, ParamMask, ParamMeta, ParamType, Queue, QueueDirection, SetMode, Storage, Value,
};

fn counting() -> (Arc<CountingTransport<SilentTransport>>, param_z::Context) {
    let transport = Arc::new(CountingTransport::new(SilentTransport));
    let ctx = with_transport(transport.clone() as Arc<dyn Transport>, ContextBuilder::default());
    (transport, ctx)
}

#[test]
fn local_array_set_get_without_network() {
    let (transport, ctx) = counting();
    let arr = ctx.find("test_array_param", None).unwrap();
    assert!(arr.is_array());

    let values: Vec<Value> = (1u8..=8).rev().map(Value::from).collect();
    ctx.set_array(&arr, &values, None, SetMode::Default).unwrap();
    assert_eq!(ctx.get(&arr, None, true, None).unwrap(), Value::Array(values));

    ctx.set(&arr, &Value::array(1u8..=8), None, None, SetMode::Default).unwrap();
    assert_eq!(arr.value().unwrap(), Value::array(1u8..=8));
    assert_eq!(transport.connects(), 0);
    ctx.shutdown().unwrap();
}

#[test]
fn set_array_length_mismatch_is_silent() {
    let (transport, ctx) = counting();
    let remote = ParamMeta::new(1001, "test_array_param", ParamType::Uint8)
        .with_node(9)
        .with_array_len(8)
        .with_storage(Storage::Remote);
    assert!(ctx.registry().insert_if_absent(remote));

    for node in [0, 9] {
        let arr = ctx.find("test_array_param", Some(node)).unwrap();
        let short = vec![Value::Uint(1); 7];
        assert!(matches!(
            ctx.set_array(&arr, &short, None, SetMode::Default),
            Err(Error::LengthMismatch { expected: 8, actual: 7 })
        ));
        assert!(matches!(
            ctx.set_array(&arr, &short, None, SetMode::Queued),
            Err(Error::LengthMismatch { .. })
        ));
    }
    assert_eq!(transport.connects(), 0);
    assert!(ctx.pending(QueueDirection::Set).is_empty());
    ctx.shutdown().unwrap();
}

#[test]
fn find_by_name_and_id_agree() {
    let (_, ctx) = counting();
    for meta in ctx.registry().iter() {
        let by_name = ctx.find(meta.name.as_str(), Some(meta.node)).unwrap();
        let by_id = ctx.find(meta.id, Some(meta.node)).unwrap();
        let by_key = ctx.find(meta.key(), None).unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_id, by_key);
        assert_eq!(ctx.find(&by_key, Some(99)).unwrap(), by_name);
    }

    let other = common::node(&LoopbackNetwork::new(), 3, ContextBuilder::default().with_servers(false));
    assert_ne!(
        ctx.find("test_str", None).unwrap(),
        other.find("test_str", None).unwrap()
    );
    ctx.shutdown().unwrap();
    other.shutdown().unwrap();
}

#[test]
fn negative_offsets() {
    let (_, ctx) = counting();
    let arr = ctx.find("test_array_param", None).unwrap();
    assert_eq!(ctx.get(&arr, Some(-1), false, None).unwrap(), Value::Uint(8));
    assert_eq!(ctx.get(&arr, Some(-8), false, None).unwrap(), Value::Uint(1));
    assert!(matches!(
        ctx.get(&arr, Some(-9), false, None),
        Err(Error::IndexOutOfRange { offset: -9, len: 8 })
    ));
    assert!(matches!(
        ctx.set(&arr, &Value::Uint(0), Some(8), None, SetMode::Default),
        Err(Error::IndexOutOfRange { .. })
    ));
    ctx.shutdown().unwrap();
}

#[test]
fn full_queue_is_unchanged() {
    let meta = ParamMeta::new(1002, "test_str", ParamType::String).with_array_len(80);
    let mut queue = Queue::new(QueueDirection::Set, 2, 200);
    queue.add(&meta, None, Some(&Value::from("first"))).unwrap();
    queue.add(&meta, None, Some(&Value::from("second"))).unwrap();
    let (used, len) = (queue.used(), queue.len());

    assert!(matches!(
        queue.add(&meta, None, Some(&Value::from("third"))),
        Err(Error::QueueFull { .. })
    ));
    assert_eq!(queue.used(), used);
    assert_eq!(queue.len(), len);
}

#[test]
fn remote_pull_without_response_keeps_cache() {
    let meta = ParamMeta::new(30, "gain", ParamType::Int16)
        .with_node(7)
        .with_mask(ParamMask::CONF)
        .with_storage(Storage::Remote);
    let ctx = with_transport(
        Arc::new(SilentTransport),
        ContextBuilder::default().with_param(meta, Some(Value::Int(-3))),
    );
    let gain = ctx.find("gain", Some(7)).unwrap();

    let err = ctx.get(&gain, None, true, None).unwrap_err();
    assert!(err.is_no_response(), "{err}");
    assert_eq!(gain.cached().unwrap(), Value::Int(-3));

    assert!(matches!(
        ctx.set(&gain, &Value::Int(5), None, None, SetMode::Immediate),
        Err(Error::NoResponse { node: 7 })
    ));
    assert_eq!(gain.cached().unwrap(), Value::Int(-3));
    ctx.shutdown().unwrap();
}

#[test]
fn failed_pull_keeps_queue() {
    let meta = ParamMeta::new(30, "gain", ParamType::Int16)
        .with_node(7)
        .with_storage(Storage::Remote);
    let ctx = with_transport(
        Arc::new(SilentTransport),
        ContextBuilder::default()
            .with_autosend(false)
            .with_param(meta, None),
    );
    let gain = ctx.find("gain", Some(7)).unwrap();
    assert_eq!(gain.value().unwrap(), Value::Int(0));
    assert_eq!(ctx.pending(QueueDirection::Get).len(), 1);

    assert!(ctx.pull(Some(7), None).unwrap_err().is_no_response());
    assert_eq!(ctx.pending(QueueDirection::Get).len(), 1);
    ctx.cmd_done();
    assert_eq!(ctx.queue(), "No pending commands\n");
    ctx.shutdown().unwrap();
}

#[test]
fn string_set_from_text_matches_truncation() {
    let (_, ctx) = counting();
    let s = ctx.find("test_str", None).unwrap();
    let long = "x".repeat(100);
    ctx.set(&s, &Value::from(long.as_str()), None, None, SetMode::Default).unwrap();
    let stored = s.cached().unwrap();
    assert_eq!(stored.as_str().map(str::len), Some(80));

    ctx.set(&s, &stored, None, None, SetMode::Default).unwrap();
    assert_eq!(s.cached().unwrap(), stored);
    ctx.shutdown().unwrap();
}

#[test]
fn v1_limits_are_reported_when_staging() {
    let big = ParamMeta::new(40, "big", ParamType::Uint8)
        .with_array_len(300)
        .with_node(5)
        .with_storage(Storage::Remote);
    let ctx = with_transport(
        Arc::new(SilentTransport),
        ContextBuilder::default().with_version(1).with_param(big, None),
    );
    let big = ctx.find("big", Some(5)).unwrap();

    assert!(matches!(
        ctx.set(&big, &Value::Uint(1), Some(299), None, SetMode::Queued),
        Err(Error::ProtocolVersionMismatch { expected: 2, actual: 1 })
    ));
    assert!(ctx.pending(QueueDirection::Set).is_empty());

    ctx.set(&big, &Value::Uint(1), Some(255), None, SetMode::Queued).unwrap();
    assert_eq!(ctx.pending(QueueDirection::Set).len(), 1);
    ctx.shutdown().unwrap();
}
