use serde::{Deserialize, Serialize};

/// 128 MiB, the daemon stack allocator's default pool size per device.
pub const DEFAULT_RESOURCE_SIZE: i64 = 0x0800_0000;

/// Base configuration shared by every index family: which devices to shard
/// across and how much ephemeral memory to give each device's stack
/// allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub devices: Vec<u32>,
    /// Bytes for the per-device stack allocator. `0` disables it (every
    /// reservation falls through to the device allocator); negative means
    /// "use the default".
    pub resource_size: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            devices: vec![0, 1, 2, 3],
            resource_size: DEFAULT_RESOURCE_SIZE,
        }
    }
}

impl IndexConfig {
    pub fn resolved_resource_size(&self) -> usize {
        if self.resource_size < 0 {
            DEFAULT_RESOURCE_SIZE as usize
        } else {
            self.resource_size as usize
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusteringParams {
    pub niter: u32,
    pub max_points_per_centroid: u32,
}

impl ClusteringParams {
    pub fn ivf_default() -> Self {
        Self {
            niter: 10,
            max_points_per_centroid: 256,
        }
    }

    pub fn ivf_sq_default() -> Self {
        Self {
            niter: 16,
            max_points_per_centroid: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfConfig {
    pub base: IndexConfig,
    pub nlist: u32,
    pub nprobe: u32,
    pub use_kmeans_pp: bool,
    pub clustering: ClusteringParams,
}

impl IvfConfig {
    pub fn new(nlist: u32) -> Self {
        Self {
            base: IndexConfig::default(),
            nlist,
            nprobe: 1,
            use_kmeans_pp: false,
            clustering: ClusteringParams::ivf_default(),
        }
    }
}
