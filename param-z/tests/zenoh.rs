use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use param_z::{Builder, Context, ContextBuilder, ParamMask, SetMode, Value};
use serde_json::json;

static NEXT_PORT: AtomicU16 = AtomicU16::new(27447);

fn zenoh_node(address: u16, builder: ContextBuilder) -> Context {
    let ctx = builder
        .with_node(address)
        .disable_multicast_scouting()
        .with_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    ctx.init().unwrap();
    ctx
}

#[test]
fn single_session_talks_to_itself() {
    let ctx = zenoh_node(5, ContextBuilder::default());
    // Give the queryables a moment to be declared.
    thread::sleep(Duration::from_millis(200));

    assert_eq!(ctx.download(Some(5), None, None, false).unwrap(), 5);
    let arr = ctx.find("test_array_param", Some(5)).unwrap();
    assert_eq!(arr.value().unwrap(), Value::array(1u8..=8));

    ctx.set(&arr, &Value::Uint(99), Some(0), None, SetMode::Immediate).unwrap();
    let local = ctx.find("test_array_param", Some(0)).unwrap();
    assert_eq!(ctx.get(&local, Some(0), false, None).unwrap(), Value::Uint(99));

    assert!(ctx.pull_all(Some(5), Some(ParamMask::DEBUG), None, None, None).unwrap() >= 2);
    assert_eq!(ctx.vmem(Some(5), None).unwrap().len(), 1);
    ctx.shutdown().unwrap();
}

#[test]
fn two_sessions_over_tcp() {
    let endpoint = format!("tcp/127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::SeqCst));
    let server = zenoh_node(
        7,
        ContextBuilder::default().with_zenoh_json("listen/endpoints", json!([endpoint])),
    );
    let client = zenoh_node(2, ContextBuilder::default().with_connect_endpoints([endpoint.as_str()]));
    thread::sleep(Duration::from_millis(500));

    assert_eq!(client.download(Some(7), None, None, false).unwrap(), 5);
    let s = client.find("test_str", Some(7)).unwrap();
    s.set_value(&Value::from("hello")).unwrap();
    assert_eq!(
        server.find("test_str", None).unwrap().value().unwrap(),
        Value::from("hello")
    );

    server.shutdown().unwrap();
    client.shutdown().unwrap();
}
