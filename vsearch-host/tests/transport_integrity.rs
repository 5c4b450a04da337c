//! Transport integrity test (§8 "Transport integrity test"): round-trips
//! pseudo-random payloads of every named size across one session, and again
//! across multiple devices, via the `TestDataIntegrity` echo RPC.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vsearch_daemon::dispatch::{serve_session, DaemonContext};
use vsearch_daemon::resources::DeviceResources;
use vsearch_host::client::DeviceClient;
use vsearch_transport::loopback::FnConnector;
use vsearch_transport::SessionRegistry;

const PAYLOAD_SIZES: &[usize] = &[
    1,
    1024,
    512 * 1024,
    1024 * 1024,
    16 * 1024 * 1024,
    32 * 1024 * 1024,
    64 * 1024 * 1024,
    96 * 1024 * 1024,
];

fn registry() -> Arc<SessionRegistry> {
    let connector = FnConnector::new(move |device, mut stream| {
        tokio::spawn(async move {
            let mut ctx = DaemonContext::new(DeviceResources::new(device, 0, 2));
            let _ = serve_session(&mut ctx, &mut stream).await;
        });
    });
    Arc::new(SessionRegistry::new(Arc::new(connector), 16))
}

#[tokio::test]
async fn round_trips_every_named_payload_size_on_one_session() {
    let registry = registry();
    let session = registry.acquire(0).await.unwrap();
    let client = DeviceClient::new(session);
    client.create_context().await.unwrap();

    let mut rng = StdRng::seed_from_u64(0xFEED_FACE);
    for &size in PAYLOAD_SIZES {
        let payload: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        let echoed = client.test_data_integrity(payload.clone()).await.unwrap();
        assert_eq!(echoed, payload, "payload of size {size} did not round-trip identically");
    }

    client.destroy_context().await.unwrap();
    registry.release(0);
}

#[tokio::test]
async fn round_trips_across_multiple_devices_concurrently() {
    let registry = registry();
    let devices = [0u32, 1, 2];
    let mut clients = Vec::new();
    for &device in &devices {
        let session = registry.acquire(device).await.unwrap();
        let client = DeviceClient::new(session);
        client.create_context().await.unwrap();
        clients.push(client);
    }

    let mut rng = StdRng::seed_from_u64(0xC0DE_BEEF);
    let mut handles = Vec::new();
    for client in clients {
        let payloads: Vec<Vec<u8>> = PAYLOAD_SIZES
            .iter()
            .map(|&size| (0..size).map(|_| rng.gen()).collect())
            .collect();
        handles.push(tokio::spawn(async move {
            for payload in payloads {
                let echoed = client.test_data_integrity(payload.clone()).await.unwrap();
                assert_eq!(echoed, payload);
            }
            client.destroy_context().await.unwrap();
        }));
    }

    for h in handles {
        h.await.unwrap();
    }
    for &device in &devices {
        registry.release(device);
    }
}
