#![allow(clippy::unwrap_used)]
// Integration tests for `BacnetClient` against a simulated device on loopback.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use fieldlink_api::bacnet::codec;
use fieldlink_api::{
    ApplicationValue, BacnetClient, BacnetClientConfig, Error, ObjectId, ObjectType, PropertyId,
    PropertyResult, ReadAccessResult, ReadAccessSpec, ReadPropertyMultiple,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn client(timeout: Duration) -> BacnetClient {
    let config = BacnetClientConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        apdu_timeout: timeout,
    };
    BacnetClient::bind(&config, &CancellationToken::new()).await.unwrap()
}

/// A device that answers every request with a fixed present value.
async fn spawn_device(value: f32) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let (invoke_id, specs) = codec::decode_request(&buf[..len]).unwrap();
            let results: Vec<ReadAccessResult> = specs
                .iter()
                .map(|spec| ReadAccessResult {
                    object: spec.object,
                    results: spec
                        .properties
                        .iter()
                        .map(|p| PropertyResult {
                            property: *p,
                            array_index: None,
                            value: Ok(vec![ApplicationValue::Real(value)]),
                        })
                        .collect(),
                })
                .collect();
            let reply = codec::reply::read_property_multiple_ack(invoke_id, &results);
            socket.send_to(&reply, from).await.unwrap();
        }
    });
    addr
}

/// A device that never answers.
async fn spawn_silent_device() -> (SocketAddr, UdpSocket) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    (socket.local_addr().unwrap(), socket)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_property_multiple_round_trip() {
    let device = spawn_device(19.5).await;
    let client = client(Duration::from_secs(2)).await;

    let object = ObjectId::new(ObjectType::AnalogInput, 12);
    let results = client
        .read_property_multiple(device, &[ReadAccessSpec::new(object, [PropertyId::PresentValue])])
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].object, object);
    assert_eq!(
        results[0].results[0].value,
        Ok(vec![ApplicationValue::Real(19.5)])
    );
}

#[tokio::test]
async fn test_silent_device_times_out() {
    let (device, _socket) = spawn_silent_device().await;
    let client = client(Duration::from_millis(50)).await;

    let object = ObjectId::new(ObjectType::AnalogInput, 1);
    let result = client
        .read_property_multiple(device, &[ReadAccessSpec::new(object, [PropertyId::Name])])
        .await;

    match result {
        Err(e) => assert!(e.is_timeout(), "expected timeout, got: {e:?}"),
        Ok(r) => panic!("expected timeout, got: {r:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_client() {
    let device = spawn_device(1.0).await;
    let client = client(Duration::from_secs(1)).await;
    client.shutdown();

    let object = ObjectId::new(ObjectType::AnalogInput, 1);
    let result = client
        .read_property_multiple(device, &[ReadAccessSpec::new(object, [PropertyId::Name])])
        .await;
    assert!(matches!(result, Err(Error::Closed)));
}
