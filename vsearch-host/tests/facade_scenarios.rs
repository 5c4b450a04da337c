//! End-to-end façade scenarios (§8 "End-to-end scenarios (literal)"), driven
//! entirely over the in-memory loopback transport: one spawned daemon task
//! per configured device, exercised through `vsearch_host::facade::Index`
//! exactly the way an application would.

use std::sync::Arc;

use vsearch_common::config::{IndexConfig, IvfConfig};
use vsearch_common::Metric;
use vsearch_daemon::dispatch::{serve_session, DaemonContext};
use vsearch_daemon::resources::DeviceResources;
use vsearch_host::facade::Index;
use vsearch_transport::loopback::FnConnector;
use vsearch_transport::SessionRegistry;

fn spawn_daemon_connector(resource_size: usize) -> Arc<SessionRegistry> {
    let connector = FnConnector::new(move |device, mut stream| {
        tokio::spawn(async move {
            let mut ctx = DaemonContext::new(DeviceResources::new(device, resource_size, 2));
            let _ = serve_session(&mut ctx, &mut stream).await;
        });
    });
    Arc::new(SessionRegistry::new(Arc::new(connector), 16))
}

#[tokio::test]
async fn flat_l2_scenario_1() {
    let registry = spawn_daemon_connector(0);
    let config = IndexConfig {
        devices: vec![0],
        resource_size: 0,
    };
    let mut idx = Index::create_flat(&registry, config, 4, Metric::L2).await.unwrap();

    let base = vec![
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    ];
    idx.add(3, &base).await.unwrap();

    let (distances, labels) = idx.search(1, 2, &[1.0, 0.0, 0.0, 0.0], None).await.unwrap();
    assert_eq!(distances[0], 0.0);
    assert_eq!(distances[1], 2.0);
    assert_eq!(labels.len(), 2);

    idx.destroy(&registry).await.unwrap();
}

// The literal §8 scenario 2 (explicit external id 42 on a single inserted
// vector) is exercised directly against the kernel in
// `vsearch-daemon/src/kernels/ivf.rs::ivf_flat_scenario_2`, below the
// façade where explicit ids are still plumbed through. The façade always
// assigns its own ids (round-robin shard policy, §4.5), so this test
// checks the same coarse-routing behavior — one of two well-separated
// centroids, nprobe = 1 — through the façade's auto-assigned id instead.
#[tokio::test]
async fn ivf_flat_add_then_search_round_trip() {
    let registry = spawn_daemon_connector(0);
    let mut ivf = IvfConfig::new(2);
    ivf.base.devices = vec![0];
    ivf.nprobe = 1;
    let mut idx = Index::create_ivf_flat(&registry, ivf, 8, Metric::L2).await.unwrap();

    let mut training = vec![0.0f32; 8];
    training.extend(vec![1.0f32; 8]);
    idx.train(2, &training).await.unwrap();
    let ids = idx.add(1, &[0.1; 8]).await.unwrap();
    assert_eq!(ids.len(), 1);

    let (_, labels) = idx.search(1, 1, &[0.0; 8], None).await.unwrap();
    assert_eq!(labels[0], ids[0]);

    idx.destroy(&registry).await.unwrap();
}

#[tokio::test]
async fn remove_range_scenario_5() {
    let registry = spawn_daemon_connector(0);
    let mut ivf = IvfConfig::new(4);
    ivf.base.devices = vec![0];
    ivf.nprobe = 4;
    let mut idx = Index::create_ivf_flat(&registry, ivf, 4, Metric::L2).await.unwrap();

    let training: Vec<f32> = (0..30).flat_map(|i| vec![i as f32 * 0.01; 4]).collect();
    idx.train(30, &training).await.unwrap();

    let vectors: Vec<f32> = (0..30).flat_map(|i| vec![i as f32 * 0.01; 4]).collect();
    let ids = idx.add(30, &vectors).await.unwrap();
    assert_eq!(idx.ntotal(), 30);

    // A single device assigns ids in strict insertion order, so ids[10..20)
    // are exactly the ten rows to drop.
    let lo = ids[10];
    let hi = ids[19] + 1;
    let removed = idx.remove_range(lo, hi).await.unwrap();
    assert_eq!(removed, 10);
    assert_eq!(idx.ntotal(), 20);

    let (_, labels) = idx.search(30, 1, &vectors, None).await.unwrap();
    for &label in &labels {
        assert!(label < lo || label >= hi, "label {label} should have been removed");
    }

    idx.destroy(&registry).await.unwrap();
}

#[tokio::test]
async fn ivf_pq_ntotal_matches_sum_of_lists_scenario_3() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let registry = spawn_daemon_connector(0);
    let mut ivf = IvfConfig::new(8);
    ivf.base.devices = vec![0];
    ivf.nprobe = 4;
    let mut idx = Index::create_ivf_pq(&registry, ivf, 16, Metric::L2, 4, 8).await.unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let training: Vec<f32> = (0..(200 * 16)).map(|_| rng.gen_range(-1.0..1.0)).collect();
    idx.train(200, &training).await.unwrap();

    let vectors: Vec<f32> = (0..(1000 * 16)).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let ids = idx.add(1000, &vectors).await.unwrap();
    assert_eq!(ids.len(), 1000);
    assert_eq!(idx.ntotal(), 1000);

    let mut sum = 0u64;
    for list_id in 0..8 {
        let lengths = idx.get_list_length(list_id).await.unwrap();
        sum += lengths.iter().sum::<u64>();
    }
    assert_eq!(sum, 1000);

    idx.destroy(&registry).await.unwrap();
}

#[tokio::test]
async fn sq_round_trip_get_base_scenario_4() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let registry = spawn_daemon_connector(0);
    let config = IndexConfig {
        devices: vec![0],
        resource_size: 0,
    };
    let mut idx = Index::create_sq(&registry, config, 8, Metric::L2).await.unwrap();

    let mut rng = StdRng::seed_from_u64(11);
    let vectors: Vec<f32> = (0..(1000 * 8)).map(|_| rng.gen_range(-5.0..5.0)).collect();
    idx.train(1000, &vectors).await.unwrap();
    let ids = idx.add(1000, &vectors).await.unwrap();
    assert_eq!(idx.ntotal(), 1000);

    let exported = idx.get_base().await.unwrap();
    assert_eq!(exported.len(), 1);
    let (ntotal, codes, returned_ids) = &exported[0];
    assert_eq!(*ntotal, 1000);
    assert_eq!(codes.len(), 1000 * 8);
    assert_eq!(returned_ids.as_ref().unwrap().len(), 1000);
    assert_eq!(returned_ids.as_ref().unwrap().as_slice(), ids.as_slice());

    idx.destroy(&registry).await.unwrap();
}

#[tokio::test]
async fn int8_flat_cosine_self_search_scenario_6() {
    let registry = spawn_daemon_connector(0);
    let config = IndexConfig {
        devices: vec![0],
        resource_size: 0,
    };
    let mut idx = Index::create_int8_flat(&registry, config, 4, Metric::Cosine).await.unwrap();

    let base = vec![1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0];
    let ids = idx.add(2, &base).await.unwrap();

    let (distances, labels) = idx.search(1, 1, &[1.0, 2.0, 3.0, 4.0], None).await.unwrap();
    assert_eq!(labels[0], ids[0]);
    let tol = 2f32.powi(-8);
    assert!((distances[0] - 1.0).abs() < tol, "distance {} should be close to 1.0", distances[0]);

    idx.destroy(&registry).await.unwrap();
}
