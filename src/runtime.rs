//! The OpenCL runtime: device ownership, program builds, persistence, and
//! queue profiling.
//!
//! One runtime instance owns exactly one device, one context, and one
//! command queue, and is driven by a single controlling thread. Kernel
//! launches themselves happen in the operator layer above; this module
//! provides everything a launch needs and keeps the results of expensive
//! work (compiles, tuning) across launches and across process runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, warn};
use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{
    get_kernel_work_group_info, Kernel, CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE,
    CL_KERNEL_WORK_GROUP_SIZE,
};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_command_queue_properties, cl_kernel_work_group_info};

use crate::cache::{self, CacheImage, CacheState, ProgramRecord, TuningRecord};
use crate::capability::{CapabilitySnapshot, GpuFamily};
use crate::error::{BuildError, CreateError};
use crate::program::{resolve_build_options, BuildKey, ProgramCache};
use crate::tuning::TuningTable;

/// Execution-wave size query, Qualcomm extension.
const CL_KERNEL_WAVE_SIZE_QCOM: cl_kernel_work_group_info = 0xAA02;

/// GPU compute runtime for a single OpenCL device.
pub struct Runtime {
    programs: ProgramCache,
    tuning: TuningTable,
    cache: CacheState,
    queue: CommandQueue,
    context: Context,
    device: Device,
    capability: CapabilitySnapshot,
    profiling: bool,
    queue_counter: u32,
    kernel_time_us: f64,
}

impl Runtime {
    /// Creates a runtime on the first GPU device of the first platform.
    ///
    /// `permit_fp16` is the caller's half-precision policy; it only takes
    /// effect on devices that support half-precision at all. Construction
    /// failure is returned, not unwound, so the embedding engine can fall
    /// back to a different backend.
    pub fn new(permit_fp16: bool) -> Result<Self, CreateError> {
        Self::with_device_index(permit_fp16, 0)
    }

    /// Creates a runtime on a specific GPU device of the first platform.
    pub fn with_device_index(permit_fp16: bool, device_index: usize) -> Result<Self, CreateError> {
        let platforms = get_platforms().map_err(|_| CreateError::NoPlatform)?;
        let platform = platforms.first().ok_or(CreateError::NoPlatform)?;

        let device_ids = platform
            .get_devices(CL_DEVICE_TYPE_GPU)
            .unwrap_or_default();
        let device_id = device_ids
            .get(device_index)
            .copied()
            .ok_or(CreateError::NoDevice)?;
        let device = Device::new(device_id);

        let capability = CapabilitySnapshot::probe(&device, permit_fp16);
        debug!(
            "selected device '{}' ({:?}), fp16 {}",
            capability.device_name(),
            capability.family(),
            if capability.fp16_enabled() { "on" } else { "off" }
        );

        let context = Context::from_device(&device)?;
        let queue = CommandQueue::create_default(&context, 0)?;

        Ok(Runtime {
            programs: ProgramCache::new(),
            tuning: TuningTable::new(),
            cache: CacheState::Empty,
            queue,
            context,
            device,
            capability,
            profiling: false,
            queue_counter: 0,
            kernel_time_us: 0.0,
        })
    }

    /// Whether a GPU device is reachable under the default selection
    /// policy, without constructing a runtime.
    pub fn is_available() -> bool {
        let Ok(platforms) = get_platforms() else {
            return false;
        };
        let Some(platform) = platforms.first() else {
            return false;
        };
        platform
            .get_devices(CL_DEVICE_TYPE_GPU)
            .map(|devices| !devices.is_empty())
            .unwrap_or(false)
    }

    // --- Capability queries -------------------------------------------

    /// The full capability snapshot taken at construction.
    pub fn capability(&self) -> &CapabilitySnapshot {
        &self.capability
    }

    pub fn device_name(&self) -> &str {
        self.capability.device_name()
    }

    pub fn gpu_family(&self) -> GpuFamily {
        self.capability.family()
    }

    /// Raw device half-precision capability, ignoring policy.
    pub fn device_supports_fp16(&self) -> bool {
        self.capability.device_supports_fp16()
    }

    /// Effective half-precision support after applying the policy passed
    /// at construction.
    pub fn fp16_enabled(&self) -> bool {
        self.capability.fp16_enabled()
    }

    pub fn supports_dot_int8(&self) -> bool {
        self.capability.supports_dot_int8()
    }

    pub fn supports_dot_acc_int8(&self) -> bool {
        self.capability.supports_dot_acc_int8()
    }

    pub fn global_mem_cache_size(&self) -> u64 {
        self.capability.global_mem_cache_size()
    }

    pub fn compute_units(&self) -> u32 {
        self.capability.compute_units()
    }

    pub fn max_clock_frequency_mhz(&self) -> u32 {
        self.capability.max_clock_frequency_mhz()
    }

    pub fn max_mem_alloc_size(&self) -> u64 {
        self.capability.max_mem_alloc_size()
    }

    pub fn max_image2d_size(&self) -> [usize; 2] {
        self.capability.max_image2d_size()
    }

    pub fn max_work_item_sizes(&self) -> &[usize] {
        self.capability.max_work_item_sizes()
    }

    pub fn estimated_gflops(&self) -> f32 {
        self.capability.estimated_gflops()
    }

    /// The OpenCL context owned by this runtime.
    pub fn context(&self) -> &Context {
        &self.context
    }

    // --- Program builds and kernels -----------------------------------

    /// Returns the compiled program for the identifier and caller options,
    /// compiling it on first request and memoizing it afterwards.
    pub fn ensure_program(
        &mut self,
        program_name: &str,
        options: &BTreeSet<String>,
    ) -> Result<&Program, BuildError> {
        let key = self.build_key(program_name, options);
        self.programs.ensure(&self.context, key)
    }

    /// Creates a kernel handle for an entry point of a cached program.
    ///
    /// The program is resolved through the build cache, so repeated kernel
    /// creation never recompiles. Handles are cheap and independent: two
    /// calls with the same arguments yield two handles referencing the
    /// same compiled program.
    pub fn build_kernel(
        &mut self,
        program_name: &str,
        kernel_name: &str,
        options: &BTreeSet<String>,
    ) -> Result<Kernel, BuildError> {
        let key = self.build_key(program_name, options);
        let program = self.programs.ensure(&self.context, key)?;
        Ok(Kernel::create(program, kernel_name)?)
    }

    /// Number of distinct compiled programs currently cached.
    pub fn program_cache_len(&self) -> usize {
        self.programs.len()
    }

    /// Maximum work-group size the device accepts for this kernel.
    pub fn max_work_group_size(&self, kernel: &Kernel) -> Result<usize, BuildError> {
        self.kernel_work_group_query(kernel, CL_KERNEL_WORK_GROUP_SIZE)
    }

    /// The kernel's native execution-wave size.
    ///
    /// Adreno exposes the wave size directly; elsewhere the preferred
    /// work-group size multiple is the portable equivalent.
    pub fn native_wave_size(&self, kernel: &Kernel) -> Result<usize, BuildError> {
        let param = match self.capability.family() {
            GpuFamily::Adreno => CL_KERNEL_WAVE_SIZE_QCOM,
            _ => CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE,
        };
        self.kernel_work_group_query(kernel, param)
    }

    fn kernel_work_group_query(
        &self,
        kernel: &Kernel,
        param: cl_kernel_work_group_info,
    ) -> Result<usize, BuildError> {
        let info = get_kernel_work_group_info(kernel.get(), self.device.id(), param)
            .map_err(ClError)?;
        Ok(info.to_size())
    }

    fn build_key(&self, program_name: &str, options: &BTreeSet<String>) -> BuildKey {
        BuildKey {
            program: program_name.to_string(),
            options: resolve_build_options(
                self.capability.fp16_enabled(),
                self.capability.work_group_attribute(),
                options,
            ),
        }
    }

    // --- Tuning table -------------------------------------------------

    /// Looks up a previously recorded local shape for an exact global
    /// shape.
    pub fn tuned_local_size(&self, kernel: &str, global: &[u32]) -> Option<&[u32]> {
        self.tuning.lookup(kernel, global)
    }

    /// Records a tuned local shape, normally called by an external tuning
    /// search.
    pub fn record_tuned_local_size(
        &mut self,
        kernel: impl Into<String>,
        global: Vec<u32>,
        local: Vec<u32>,
    ) {
        self.tuning.record(kernel, global, local);
    }

    pub fn tuning_table(&self) -> &TuningTable {
        &self.tuning
    }

    pub fn tuning_table_mut(&mut self) -> &mut TuningTable {
        &mut self.tuning
    }

    // --- Persistence --------------------------------------------------

    /// Serializes the program cache and tuning table into one blob.
    ///
    /// While an external blob is installed this returns exactly that blob;
    /// the runtime never re-derives a cache over caller-owned bytes.
    pub fn make_cache(&mut self) -> &[u8] {
        if !self.cache.is_external() {
            let image = self.snapshot_image();
            self.cache = CacheState::Owned(cache::encode_image(&image));
        }
        self.cache.bytes()
    }

    /// Installs or clears an externally owned cache blob.
    ///
    /// `Some(blob)` installs the blob (dropping any internally held
    /// buffer) and then loads it best-effort: malformed records and
    /// binaries that fail to relink against the current device are logged
    /// and skipped individually, never failing the call. `None` clears
    /// both the external blob and the internal buffer, so a later
    /// [`Runtime::make_cache`] reflects only state built since.
    pub fn set_cache(&mut self, blob: Option<Arc<[u8]>>) {
        let Some(blob) = blob else {
            self.cache = CacheState::Empty;
            return;
        };
        self.cache = CacheState::External(Arc::clone(&blob));

        let Some(image) = cache::decode_image(&blob) else {
            return;
        };
        let total = image.programs.len();
        let mut linked = 0usize;
        for record in image.programs {
            if self.load_program_record(record) {
                linked += 1;
            }
        }
        let tuned = cache::apply_tuning_records(image.tunings, &mut self.tuning);
        debug!("cache load: {linked}/{total} programs relinked, {tuned} tuning entries");
    }

    fn snapshot_image(&self) -> CacheImage {
        let mut image = CacheImage::default();
        for (key, program) in self.programs.iter() {
            let binaries = match program.get_binaries() {
                Ok(binaries) => binaries,
                Err(e) => {
                    warn!("no binary available for program '{}': {e}", key.program);
                    continue;
                }
            };
            // Multi-device binaries are not preserved; one runtime targets
            // one device.
            let Some(binary) = binaries.into_iter().next() else {
                warn!("program '{}' reported no binaries", key.program);
                continue;
            };
            if binary.is_empty() {
                warn!("program '{}' reported an empty binary", key.program);
                continue;
            }
            image.programs.push(ProgramRecord {
                key: Some(key.program.clone()),
                build_options: Some(key.options.clone()),
                binary: Some(binary),
            });
        }
        for ((kernel, global), local) in self.tuning.iter() {
            image.tunings.push(TuningRecord {
                key: Some(kernel.clone()),
                global: Some(global.clone()),
                local: Some(local.clone()),
            });
        }
        image
    }

    /// Rebuilds one persisted program against the current device. The
    /// stored option string is reused as-is: re-resolving could silently
    /// pair a binary with macros it was not compiled under.
    fn load_program_record(&mut self, record: ProgramRecord) -> bool {
        let Some((name, options, binary)) = record.into_parts() else {
            warn!("persisted program record is incomplete, skipped");
            return false;
        };
        let program = match Program::create_and_build_from_binary(
            &self.context,
            &[binary.as_slice()],
            &options,
        ) {
            Ok(program) => program,
            Err(e) => {
                warn!("cached binary for '{name}' failed to relink: {e}");
                return false;
            }
        };
        let key = BuildKey {
            program: name,
            options,
        };
        if !self.programs.insert_prebuilt(key.clone(), program) {
            debug!("program '{}' already cached, kept the built entry", key.program);
            return false;
        }
        true
    }

    // --- Command queue and profiling ----------------------------------

    /// The command queue all launches of this runtime go through.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Whether the queue currently records profiling timestamps.
    pub fn profiling_enabled(&self) -> bool {
        self.profiling
    }

    /// Recreates the queue with profiling timestamps enabled.
    pub fn enable_profiling(&mut self) -> Result<(), ClError> {
        self.recreate_queue(true)
    }

    /// Recreates the queue with profiling timestamps disabled.
    pub fn disable_profiling(&mut self) -> Result<(), ClError> {
        self.recreate_queue(false)
    }

    fn recreate_queue(&mut self, profiling: bool) -> Result<(), ClError> {
        // The old queue must be fully drained before it is destroyed;
        // replacing a queue with work in flight is undefined behavior at
        // the driver level.
        self.queue.finish()?;
        let properties: cl_command_queue_properties = if profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };
        self.queue = CommandQueue::create_default(&self.context, properties)?;
        self.profiling = profiling;
        Ok(())
    }

    /// Issues a distinct identifier for a logical queue lane layered over
    /// the single physical queue.
    pub fn next_queue_id(&mut self) -> u32 {
        self.queue_counter += 1;
        self.queue_counter
    }

    /// Device time between start and end of the event, in microseconds.
    /// Blocks until the event completes and adds the result to the
    /// running total reported by [`Runtime::kernel_time_us`].
    pub fn time_elapsed(&mut self, event: &Event) -> Result<f64, ClError> {
        event.wait()?;
        let start = event.profiling_command_start()?;
        let end = event.profiling_command_end()?;
        let micros = end.saturating_sub(start) as f64 / 1_000.0;
        self.kernel_time_us += micros;
        Ok(micros)
    }

    /// Time the command spent from enqueue to execution start, in
    /// microseconds. Blocks until the event completes.
    pub fn time_queued_to_start(&self, event: &Event) -> Result<f64, ClError> {
        event.wait()?;
        let queued = event.profiling_command_queued()?;
        let start = event.profiling_command_start()?;
        Ok(start.saturating_sub(queued) as f64 / 1_000.0)
    }

    /// Time the command spent from device submission to execution start,
    /// in microseconds. Blocks until the event completes.
    pub fn time_submit_to_start(&self, event: &Event) -> Result<f64, ClError> {
        event.wait()?;
        let submit = event.profiling_command_submit()?;
        let start = event.profiling_command_start()?;
        Ok(start.saturating_sub(submit) as f64 / 1_000.0)
    }

    /// Accumulated device time of all events measured through
    /// [`Runtime::time_elapsed`], in microseconds.
    pub fn kernel_time_us(&self) -> f64 {
        self.kernel_time_us
    }
}

// The runtime is driven by one owning thread; read-only queries are safe
// to share and OpenCL objects are internally reference counted.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime() -> Option<Runtime> {
        Runtime::new(true).ok()
    }

    fn options_of(tokens: &[&str]) -> BTreeSet<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_runtime_creation() {
        let Some(runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        println!(
            "device: {} ({:?}), {} CUs @ {} MHz",
            runtime.device_name(),
            runtime.gpu_family(),
            runtime.compute_units(),
            runtime.max_clock_frequency_mhz()
        );
        assert!(!runtime.max_work_item_sizes().is_empty());
        assert!(runtime.estimated_gflops() > 0.0);
        // Policy can only narrow the device capability.
        assert!(runtime.device_supports_fp16() || !runtime.fp16_enabled());
    }

    #[test]
    fn test_ensure_program_is_memoized() {
        let Some(mut runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };

        let tile16 = options_of(&["-DTILE=16"]);
        runtime.ensure_program("matmul", &tile16).unwrap();
        assert_eq!(runtime.program_cache_len(), 1);

        // Identical request: no new entry, no recompilation.
        runtime.ensure_program("matmul", &tile16).unwrap();
        assert_eq!(runtime.program_cache_len(), 1);

        // Different options resolve to a different key.
        let tile32 = options_of(&["-DTILE=32"]);
        runtime.ensure_program("matmul", &tile32).unwrap();
        assert_eq!(runtime.program_cache_len(), 2);
    }

    #[test]
    fn test_unknown_program_is_an_error() {
        let Some(mut runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        let err = runtime
            .ensure_program("no_such_program", &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownSource(name) if name == "no_such_program"));
        assert_eq!(runtime.program_cache_len(), 0);
    }

    #[test]
    fn test_kernel_queries() {
        let Some(mut runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        let kernel = runtime
            .build_kernel("matmul", "matmul", &BTreeSet::new())
            .unwrap();
        let max_wg = runtime.max_work_group_size(&kernel).unwrap();
        assert!(max_wg > 0);

        let wave = runtime.native_wave_size(&kernel).unwrap();
        assert!(wave > 0);

        // A second handle for the same entry point is independent but does
        // not grow the program cache.
        let _again = runtime
            .build_kernel("matmul", "matmul", &BTreeSet::new())
            .unwrap();
        assert_eq!(runtime.program_cache_len(), 1);
    }

    #[test]
    fn test_cache_round_trip() {
        let Some(mut first) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        first.ensure_program("matmul", &BTreeSet::new()).unwrap();
        first.record_tuned_local_size("conv3x3", vec![64, 64], vec![8, 8]);

        let blob: Arc<[u8]> = first.make_cache().to_vec().into();
        assert!(!blob.is_empty());

        let mut second = Runtime::new(true).unwrap();
        second.set_cache(Some(Arc::clone(&blob)));

        // Tuning entries are reconstructed exactly.
        assert_eq!(second.tuned_local_size("conv3x3", &[64, 64]), Some(&[8u32, 8][..]));
        assert_eq!(second.tuned_local_size("conv3x3", &[32, 32]), None);
        // Programs either relinked or were skipped, never duplicated.
        assert!(second.program_cache_len() <= 1);

        // While the external blob is installed it is echoed verbatim.
        assert_eq!(second.make_cache(), &blob[..]);
    }

    #[test]
    fn test_clearing_external_cache_drops_stale_bytes() {
        let Some(mut runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        runtime.record_tuned_local_size("gemm", vec![128], vec![32]);
        let blob: Arc<[u8]> = runtime.make_cache().to_vec().into();

        runtime.set_cache(Some(Arc::clone(&blob)));
        assert_eq!(runtime.make_cache(), &blob[..]);

        runtime.set_cache(None);
        runtime.record_tuned_local_size("gemm2", vec![256], vec![64]);
        let regenerated = runtime.make_cache().to_vec();
        let image = crate::cache::decode_image(&regenerated).unwrap();
        // The regenerated blob reflects the live tables, not the old bytes.
        assert_eq!(image.tunings.len(), runtime.tuning_table().len());
    }

    #[test]
    fn test_profiling_toggle_and_queue_ids() {
        let Some(mut runtime) = test_runtime() else {
            println!("No OpenCL GPU device available, skipping test");
            return;
        };
        assert!(!runtime.profiling_enabled());
        runtime.enable_profiling().unwrap();
        assert!(runtime.profiling_enabled());
        runtime.disable_profiling().unwrap();
        assert!(!runtime.profiling_enabled());

        let a = runtime.next_queue_id();
        let b = runtime.next_queue_id();
        assert!(b > a);
        assert_eq!(runtime.kernel_time_us(), 0.0);
    }
}
