//! One-time device and platform capability probing.
//!
//! The snapshot is taken once during runtime construction and is read-only
//! afterwards. Everything that varies by GPU vendor is funnelled through
//! [`GpuFamily`] so that workarounds live behind one enum instead of string
//! comparisons scattered through call sites.

use opencl3::device::Device;

/// GPU vendor family, classified from the device name/vendor strings.
///
/// The set is closed on purpose: every vendor-specific decision in the
/// runtime dispatches on this enum, and an unrecognized device falls into
/// `Other` with conservative defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuFamily {
    /// Qualcomm Adreno series.
    Adreno,
    /// ARM Mali series.
    Mali,
    /// AMD Radeon series.
    Radeon,
    /// Anything else (desktop NVIDIA, Intel, software implementations, ...).
    Other,
}

/// Rough single-precision throughput by device name, in gflops per
/// compute unit per MHz scaled to a common baseline. Devices absent from
/// the table get [`DEFAULT_GFLOPS`].
static ESTIMATED_GFLOPS: &[(&str, f32)] = &[
    ("Mali-T860", 6.83),
    ("Mali-T880", 6.83),
    ("Mali-G51", 6.83),
    ("Mali-G52", 6.83),
    ("Mali-G71", 31.61),
    ("Mali-G72", 31.61),
    ("Mali-G76", 31.61),
    ("Adreno (TM) 505", 3.19),
    ("Adreno (TM) 506", 4.74),
    ("Adreno (TM) 512", 14.23),
    ("Adreno (TM) 530", 25.40),
    ("Adreno (TM) 540", 42.74),
    ("Adreno (TM) 615", 16.77),
    ("Adreno (TM) 616", 18.77),
    ("Adreno (TM) 618", 18.77),
    ("Adreno (TM) 630", 42.74),
    ("Adreno (TM) 640", 42.74),
];

/// Neutral throughput estimate for devices not in the lookup table.
const DEFAULT_GFLOPS: f32 = 4.0;

const DOT_INT8_EXTENSION: &str = "cl_arm_integer_dot_product_int8";
const DOT_ACC_INT8_EXTENSION: &str = "cl_arm_integer_dot_product_accumulate_int8";

/// Immutable snapshot of the selected device's capabilities.
///
/// Optional feature probes that fail are recorded as unsupported (or zero
/// for limits); nothing in here is fatal. Platform/device absence is
/// handled before the snapshot is taken.
#[derive(Debug, Clone)]
pub struct CapabilitySnapshot {
    device_name: String,
    device_vendor: String,
    device_version: String,
    family: GpuFamily,
    device_fp16: bool,
    fp16_enabled: bool,
    dot_int8: bool,
    dot_acc_int8: bool,
    global_mem_cache_size: u64,
    compute_units: u32,
    max_clock_frequency_mhz: u32,
    max_mem_alloc_size: u64,
    max_image2d_size: [usize; 2],
    max_work_item_sizes: Vec<usize>,
    estimated_gflops: f32,
    work_group_attribute: bool,
}

impl CapabilitySnapshot {
    /// Probes the given device. `permit_fp16` is the caller's policy; the
    /// raw device capability is kept alongside the policy-filtered one.
    pub(crate) fn probe(device: &Device, permit_fp16: bool) -> Self {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());
        let device_vendor = device.vendor().unwrap_or_else(|_| "Unknown".into());
        let device_version = device.version().unwrap_or_else(|_| "Unknown".into());
        let extensions = device.extensions().unwrap_or_default();

        let family = classify(&device_name, &device_vendor);

        // A present but zero fp config also counts as unsupported.
        let device_fp16 = device.half_fp_config().map(|cfg| cfg != 0).unwrap_or(false);

        let work_group_attribute = match (family, adreno_series(&device_version)) {
            (GpuFamily::Adreno, Some(series)) => adreno_allows_attribute(series),
            _ => true,
        };

        CapabilitySnapshot {
            family,
            device_fp16,
            fp16_enabled: device_fp16 && permit_fp16,
            dot_int8: extensions.contains(DOT_INT8_EXTENSION),
            dot_acc_int8: extensions.contains(DOT_ACC_INT8_EXTENSION),
            global_mem_cache_size: device.global_mem_cache_size().unwrap_or(0),
            compute_units: device.max_compute_units().unwrap_or(0),
            max_clock_frequency_mhz: device.max_clock_frequency().unwrap_or(0),
            max_mem_alloc_size: device.max_mem_alloc_size().unwrap_or(0),
            max_image2d_size: [
                device.image2d_max_height().unwrap_or(0),
                device.image2d_max_width().unwrap_or(0),
            ],
            max_work_item_sizes: device.max_work_item_sizes().unwrap_or_default(),
            estimated_gflops: estimated_gflops(&device_name),
            device_name,
            device_vendor,
            device_version,
            work_group_attribute,
        }
    }

    /// Device name as reported by the driver.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Device vendor as reported by the driver.
    pub fn device_vendor(&self) -> &str {
        &self.device_vendor
    }

    /// Device OpenCL version string.
    pub fn device_version(&self) -> &str {
        &self.device_version
    }

    /// Vendor family used to select workarounds.
    pub fn family(&self) -> GpuFamily {
        self.family
    }

    /// Raw half-precision capability of the device, ignoring policy.
    pub fn device_supports_fp16(&self) -> bool {
        self.device_fp16
    }

    /// Effective half-precision support: device capability intersected
    /// with the policy passed at construction.
    pub fn fp16_enabled(&self) -> bool {
        self.fp16_enabled
    }

    /// `cl_arm_integer_dot_product_int8` support.
    pub fn supports_dot_int8(&self) -> bool {
        self.dot_int8
    }

    /// `cl_arm_integer_dot_product_accumulate_int8` support.
    pub fn supports_dot_acc_int8(&self) -> bool {
        self.dot_acc_int8
    }

    /// Global memory cache size in bytes.
    pub fn global_mem_cache_size(&self) -> u64 {
        self.global_mem_cache_size
    }

    /// Number of parallel compute units.
    pub fn compute_units(&self) -> u32 {
        self.compute_units
    }

    /// Maximum clock frequency in MHz.
    pub fn max_clock_frequency_mhz(&self) -> u32 {
        self.max_clock_frequency_mhz
    }

    /// Maximum size of a single memory allocation in bytes.
    pub fn max_mem_alloc_size(&self) -> u64 {
        self.max_mem_alloc_size
    }

    /// Maximum 2-D image size as `[height, width]`.
    pub fn max_image2d_size(&self) -> [usize; 2] {
        self.max_image2d_size
    }

    /// Maximum work items per dimension.
    pub fn max_work_item_sizes(&self) -> &[usize] {
        &self.max_work_item_sizes
    }

    /// Coarse relative-throughput estimate for scheduling heuristics.
    pub fn estimated_gflops(&self) -> f32 {
        self.estimated_gflops
    }

    /// Whether kernels may carry a required work-group size attribute on
    /// this device.
    pub fn work_group_attribute(&self) -> bool {
        self.work_group_attribute
    }
}

fn classify(name: &str, vendor: &str) -> GpuFamily {
    if name.contains("Adreno") || name.contains("QUALCOMM") || vendor.contains("QUALCOMM") {
        GpuFamily::Adreno
    } else if name.contains("Mali") {
        GpuFamily::Mali
    } else if vendor.contains("Advanced Micro Devices") || name.contains("Radeon") {
        GpuFamily::Radeon
    } else {
        GpuFamily::Other
    }
}

/// Extracts the Adreno series number from a version string such as
/// `"OpenCL 2.0 Adreno(TM) 506"`.
fn adreno_series(version: &str) -> Option<u32> {
    version.split_whitespace().last()?.parse().ok()
}

/// Some Adreno drivers miscompile kernels that carry a work-group size
/// attribute; the attribute stays off for the affected series.
fn adreno_allows_attribute(series: u32) -> bool {
    !(301..512).contains(&series)
}

fn estimated_gflops(device_name: &str) -> f32 {
    ESTIMATED_GFLOPS
        .iter()
        .find(|(name, _)| *name == device_name)
        .map(|(_, gflops)| *gflops)
        .unwrap_or(DEFAULT_GFLOPS)
}
