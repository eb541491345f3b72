//! Resource dispatching
//!
//! Runs the tiles of a plan across a pool of compute resources:
//! - One feeder thread per resource, at most one tile in flight each
//! - Tiles go to whichever resource reports idle first
//! - Faulted tiles are requeued at the front, preferring another resource
//! - Partials are combined on the dispatching thread only

use super::kernel::{compute_tile_parallel, TileOutput, UnitContext};
use super::{Tile, TilePlan};
use crate::error::{Result, ScampError};
use crate::progress::ProgressReporter;
use crossbeam::channel::{bounded, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Kind of a compute resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Accelerator device handle
    Gpu {
        /// Device identifier
        device: i32,
    },
    /// Host CPU worker group
    Cpu {
        /// Worker threads in the group
        threads: usize,
    },
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Gpu { device } => write!(f, "gpu:{}", device),
            ResourceKind::Cpu { threads } => write!(f, "cpu:{}", threads),
        }
    }
}

/// Tile kernel provided by an accelerator device
pub trait DeviceBackend: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Compute one tile. Hard device errors must be reported as
    /// [`ScampError::ResourceFault`] so the tile is retried elsewhere.
    fn compute_tile(&self, unit: &UnitContext, tile: &Tile) -> Result<TileOutput>;
}

/// Registered accelerator devices, keyed by device id
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<i32, Arc<dyn DeviceBackend>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device backend under `id`
    pub fn register(&mut self, id: i32, backend: Arc<dyn DeviceBackend>) {
        self.devices.insert(id, backend);
    }

    /// Number of usable devices
    pub fn num_available_gpus(&self) -> usize {
        self.devices.len()
    }

    /// Look up a device
    pub fn get(&self, id: i32) -> Option<Arc<dyn DeviceBackend>> {
        self.devices.get(&id).cloned()
    }

    /// Registered device ids in ascending order
    pub fn ids(&self) -> Vec<i32> {
        self.devices.keys().copied().collect()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.ids())
            .finish()
    }
}

/// A single compute resource
#[derive(Clone)]
pub enum Resource {
    /// Accelerator device
    Device {
        /// Device identifier
        id: i32,
        /// Kernel implementation
        backend: Arc<dyn DeviceBackend>,
    },
    /// Host CPU group running the native kernel on a rayon pool
    Host {
        /// Worker threads in the group
        threads: usize,
    },
}

impl Resource {
    /// Resource tag
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Device { id, .. } => ResourceKind::Gpu { device: *id },
            Resource::Host { threads } => ResourceKind::Cpu { threads: *threads },
        }
    }

    fn host_pool(&self) -> Result<Option<rayon::ThreadPool>> {
        match self {
            Resource::Host { threads } => rayon::ThreadPoolBuilder::new()
                .num_threads(*threads)
                .thread_name(|i| format!("scamp-cpu-{}", i))
                .build()
                .map(Some)
                .map_err(|e| ScampError::config(format!("failed to build CPU worker group: {}", e))),
            Resource::Device { .. } => Ok(None),
        }
    }

    fn compute(&self, unit: &UnitContext, tile: &Tile, host: Option<&rayon::ThreadPool>) -> Result<TileOutput> {
        match (self, host) {
            (Resource::Device { backend, .. }, _) => backend.compute_tile(unit, tile),
            (Resource::Host { .. }, Some(pool)) => compute_tile_parallel(unit, tile, pool),
            (Resource::Host { .. }, None) => Err(ScampError::resource_fault(
                self.kind().to_string(),
                "worker group not started",
            )),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Set of resources a job runs on
#[derive(Debug, Clone)]
pub struct ResourcePool {
    resources: Vec<Resource>,
}

impl ResourcePool {
    /// A single CPU worker group (`0` = one thread per core)
    pub fn cpu(threads: usize) -> Self {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        Self {
            resources: vec![Resource::Host { threads }],
        }
    }

    /// Select resources from user options.
    ///
    /// With no devices and no thread count requested, every registered
    /// device is used, or one CPU group sized to the core count when none is
    /// registered. Otherwise exactly the listed devices are used, plus a CPU
    /// group when `threads > 0`.
    pub fn from_options(registry: &DeviceRegistry, gpus: &[i32], threads: usize) -> Result<Self> {
        let mut resources = Vec::new();

        if gpus.is_empty() && threads == 0 {
            for id in registry.ids() {
                if let Some(backend) = registry.get(id) {
                    resources.push(Resource::Device { id, backend });
                }
            }
            if resources.is_empty() {
                resources.push(Resource::Host {
                    threads: num_cpus::get(),
                });
            }
        } else {
            for &id in gpus {
                let backend = registry.get(id).ok_or_else(|| {
                    ScampError::validation(format!(
                        "GPU device {} is not available ({} registered)",
                        id,
                        registry.num_available_gpus()
                    ))
                })?;
                resources.push(Resource::Device { id, backend });
            }
            if threads > 0 {
                resources.push(Resource::Host { threads });
            }
        }

        Ok(Self { resources })
    }

    /// Add a resource
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Resources in the pool
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the pool has no resources
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A tile waiting for a resource
#[derive(Debug)]
struct TileTask {
    tile: Tile,
    faults: usize,
    failed_on: HashSet<usize>,
}

impl TileTask {
    fn new(tile: Tile) -> Self {
        Self {
            tile,
            faults: 0,
            failed_on: HashSet::new(),
        }
    }
}

/// Outcome of a dispatch run
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    /// Tiles merged
    pub tiles: usize,
    /// Tile faults that were retried
    pub retries: usize,
    /// Tiles completed per resource
    pub per_resource: Vec<(ResourceKind, usize)>,
    /// Wall time
    pub duration: Duration,
}

/// Greedy tile dispatcher over a resource pool
pub struct ResourceDispatcher<'a> {
    pool: &'a ResourcePool,
    retry_budget: usize,
    progress: Option<&'a ProgressReporter>,
}

impl<'a> ResourceDispatcher<'a> {
    /// Create a dispatcher allowing `retry_budget` retries per tile
    pub fn new(pool: &'a ResourcePool, retry_budget: usize) -> Self {
        Self {
            pool,
            retry_budget,
            progress: None,
        }
    }

    /// Report tile completion to a progress reporter
    pub fn with_progress(mut self, progress: &'a ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Pick the next task for resource `slot`
    fn next_task(&self, slot: usize, retry: &mut VecDeque<TileTask>, plan: &mut TilePlan) -> Option<TileTask> {
        let all = self.pool.len();
        if let Some(pos) = retry
            .iter()
            .position(|t| !t.failed_on.contains(&slot) || t.failed_on.len() >= all)
        {
            return retry.remove(pos);
        }
        plan.next().map(TileTask::new)
    }

    /// Compute every tile of `plan`, handing each finished tile to `merge`.
    ///
    /// `merge` runs on the calling thread, one tile at a time.
    pub fn run<F>(&self, unit: &UnitContext, mut plan: TilePlan, mut merge: F) -> Result<DispatchStats>
    where
        F: FnMut(TileOutput) -> Result<()>,
    {
        if self.pool.is_empty() {
            return Err(ScampError::config("resource pool is empty"));
        }

        let start = Instant::now();
        let mut stats = DispatchStats {
            per_resource: self.pool.resources().iter().map(|r| (r.kind(), 0)).collect(),
            ..Default::default()
        };
        if let Some(progress) = self.progress {
            progress.set_total_tiles(plan.len() as u64);
        }

        std::thread::scope(|scope| -> Result<()> {
            let (result_tx, result_rx) = unbounded::<(usize, TileTask, Result<TileOutput>)>();
            let mut feeds = Vec::with_capacity(self.pool.len());

            for (slot, resource) in self.pool.resources().iter().enumerate() {
                let (task_tx, task_rx) = bounded::<TileTask>(1);
                let result_tx = result_tx.clone();
                let host = resource.host_pool()?;

                scope.spawn(move || {
                    for task in task_rx {
                        let output = resource.compute(unit, &task.tile, host.as_ref());
                        if result_tx.send((slot, task, output)).is_err() {
                            break;
                        }
                    }
                    debug!("Resource {} shutting down", resource.kind());
                });

                feeds.push(task_tx);
            }
            drop(result_tx);

            let mut retry: VecDeque<TileTask> = VecDeque::new();
            let mut idle: Vec<usize> = (0..self.pool.len()).collect();
            let mut in_flight = 0usize;

            loop {
                let mut still_idle = Vec::with_capacity(idle.len());
                for slot in idle.drain(..) {
                    match self.next_task(slot, &mut retry, &mut plan) {
                        Some(task) => {
                            feeds[slot].send(task).map_err(|_| {
                                ScampError::resource_fault(
                                    self.pool.resources()[slot].kind().to_string(),
                                    "resource thread exited",
                                )
                            })?;
                            in_flight += 1;
                        }
                        None => still_idle.push(slot),
                    }
                }
                idle = still_idle;

                if in_flight == 0 {
                    break;
                }

                let (slot, mut task, output) = result_rx
                    .recv()
                    .map_err(|_| ScampError::invalid_state("all resource threads exited"))?;
                in_flight -= 1;
                idle.push(slot);

                match output {
                    Ok(output) => {
                        merge(output)?;
                        stats.tiles += 1;
                        stats.per_resource[slot].1 += 1;
                        if let Some(progress) = self.progress {
                            progress.tile_done();
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        task.faults += 1;
                        task.failed_on.insert(slot);
                        if task.faults > self.retry_budget {
                            return Err(ScampError::ComputationFailure {
                                tile: task.tile.id,
                                attempts: task.faults,
                                last_error: e.to_string(),
                            });
                        }
                        warn!(
                            "Tile {} failed on {} (attempt {}): {}; requeueing",
                            task.tile.id,
                            self.pool.resources()[slot].kind(),
                            task.faults,
                            e
                        );
                        stats.retries += 1;
                        retry.push_front(task);
                    }
                    Err(e) => return Err(e),
                }
            }

            Ok(())
        })?;

        stats.duration = start.elapsed();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::compute_tile;
    use crate::core::JobSpec;
    use crate::profile::ProfileKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device that runs the host kernel but faults on its first `fail_first` calls
    struct FlakyDevice {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl FlakyDevice {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceBackend for FlakyDevice {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        fn compute_tile(&self, unit: &UnitContext, tile: &Tile) -> Result<TileOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ScampError::resource_fault("gpu", "injected device error"));
            }
            compute_tile(unit, tile)
        }
    }

    fn series(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i as f64) * 0.17).sin() + ((i * 31) % 7) as f64 * 0.1).collect()
    }

    fn run_sum(spec: &JobSpec, pool: &ResourcePool, budget: usize) -> Result<(f64, DispatchStats)> {
        let unit = UnitContext::new(spec)?;
        let mut total = 0.0;
        let stats = ResourceDispatcher::new(pool, budget).run(&unit, TilePlan::for_spec(spec), |out| {
            if let Some(crate::profile::ProfileData::ThresholdedSum(v)) = out.rows.as_ref().map(|a| a.data()) {
                total += v.iter().sum::<f64>();
            }
            Ok(())
        })?;
        Ok((total, stats))
    }

    #[test]
    fn test_all_tiles_merged_once() {
        let spec = JobSpec::ab_join(series(300), series(200), 8)
            .with_kind(ProfileKind::ThresholdedSum)
            .with_max_tile_size(40);
        let pool = ResourcePool::cpu(2).with_resource(Resource::Host { threads: 1 });

        let (total, stats) = run_sum(&spec, &pool, 3).unwrap();
        let (reference, _) = run_sum(&spec, &ResourcePool::cpu(1), 3).unwrap();

        assert_eq!(stats.tiles, TilePlan::for_spec(&spec).len());
        assert_eq!(stats.retries, 0);
        assert!((total - reference).abs() < 1e-6);
    }

    #[test]
    fn test_fault_retried_on_other_resource() {
        let spec = JobSpec::ab_join(series(120), series(120), 8)
            .with_kind(ProfileKind::ThresholdedSum)
            .with_max_tile_size(40);
        let device: Arc<dyn DeviceBackend> = Arc::new(FlakyDevice::new(2));
        let pool = ResourcePool::cpu(1).with_resource(Resource::Device { id: 0, backend: device });

        let (total, stats) = run_sum(&spec, &pool, 3).unwrap();
        let (reference, _) = run_sum(&spec, &ResourcePool::cpu(1), 3).unwrap();

        assert_eq!(stats.retries, 2);
        assert_eq!(stats.tiles, TilePlan::for_spec(&spec).len());
        assert!((total - reference).abs() < 1e-6);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let spec = JobSpec::self_join(series(100), 8).with_max_tile_size(30);
        let device: Arc<dyn DeviceBackend> = Arc::new(FlakyDevice::new(usize::MAX));
        let pool = ResourcePool::cpu(1).with_resource(Resource::Device { id: 0, backend: device.clone() });
        let only_device = ResourcePool {
            resources: vec![Resource::Device { id: 0, backend: device }],
        };
        let unit = UnitContext::new(&spec).unwrap();

        let err = ResourceDispatcher::new(&only_device, 2)
            .run(&unit, TilePlan::for_spec(&spec), |_| Ok(()))
            .unwrap_err();
        match err {
            ScampError::ComputationFailure { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }

        // A healthy resource in the pool absorbs every fault
        assert!(ResourceDispatcher::new(&pool, 2)
            .run(&unit, TilePlan::for_spec(&spec), |_| Ok(()))
            .is_ok());
    }

    #[test]
    fn test_pool_from_options() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.num_available_gpus(), 0);

        let pool = ResourcePool::from_options(&registry, &[], 0).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(matches!(pool.resources()[0].kind(), ResourceKind::Cpu { .. }));

        assert!(ResourcePool::from_options(&registry, &[1], 0)
            .unwrap_err()
            .is_validation());

        registry.register(1, Arc::new(FlakyDevice::new(0)));
        registry.register(0, Arc::new(FlakyDevice::new(0)));
        let pool = ResourcePool::from_options(&registry, &[], 0).unwrap();
        let kinds: Vec<ResourceKind> = pool.resources().iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::Gpu { device: 0 }, ResourceKind::Gpu { device: 1 }]
        );

        let pool = ResourcePool::from_options(&registry, &[1], 4).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.resources()[1].kind(), ResourceKind::Cpu { threads: 4 });
    }
}
