//! Program compilation, build-option resolution, and the build cache.
//!
//! Programs are memoized by [`BuildKey`]: the source identifier plus the
//! fully resolved option string. Resolving before keying means requests
//! that differ only in capability-derived macros can never collide, and
//! identical requests always hit the memo regardless of call order.

use std::collections::BTreeSet;

use log::{debug, warn};
use opencl3::context::Context;
use opencl3::program::Program;
use rustc_hash::FxHashMap;

use crate::error::BuildError;
use crate::sources;

/// Baseline compiler flags appended to every build.
const BASE_BUILD_OPTIONS: &str = " -cl-mad-enable";

/// Cache key for a compiled program.
///
/// `options` is the resolved option string, not the caller's raw set, so
/// the key doubles as the persistence key: the same logical request on the
/// same device produces a byte-identical key across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub program: String,
    pub options: String,
}

/// Resolves the deterministic build-option string for a compile request.
///
/// Layout: precision macros, the work-group attribute switch, caller
/// tokens in set order, then the baseline flags. Caller options come as a
/// `BTreeSet` so the concatenation is independent of insertion order.
pub fn resolve_build_options(
    fp16: bool,
    work_group_attribute: bool,
    caller: &BTreeSet<String>,
) -> String {
    let mut options = String::from(if fp16 {
        "-DFLOAT=half -DFLOAT4=half4 -DFLOAT16=half16 \
         -DRI_F=read_imageh -DWI_F=write_imageh \
         -DCONVERT_FLOAT4=convert_half4 -DFP16_ENABLED"
    } else {
        "-DFLOAT=float -DFLOAT4=float4 -DFLOAT16=float16 \
         -DRI_F=read_imagef -DWI_F=write_imagef \
         -DCONVERT_FLOAT4=convert_float4"
    });

    if work_group_attribute {
        options.push_str(" -DSET_ATTRIBUTE=1");
    } else {
        options.push_str(" -DSET_ATTRIBUTE=0");
    }

    for token in caller {
        options.push(' ');
        options.push_str(token);
    }

    options.push_str(BASE_BUILD_OPTIONS);
    options
}

/// Memoizing cache of compiled programs, keyed by [`BuildKey`].
///
/// Entries are never evicted: the number of distinct kernels is bounded by
/// the model graph and known at load time. The cache exclusively owns each
/// program; callers get references.
#[derive(Default)]
pub struct ProgramCache {
    programs: FxHashMap<BuildKey, Program>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn get(&self, key: &BuildKey) -> Option<&Program> {
        self.programs.get(key)
    }

    /// Returns the cached program for `key`, compiling it first if absent.
    ///
    /// A hit performs no compiler work at all. On a miss, the embedded
    /// source is compiled with the key's option string; the compiler log
    /// is captured into the error on rejection and the failure is not
    /// retried.
    pub(crate) fn ensure(&mut self, context: &Context, key: BuildKey) -> Result<&Program, BuildError> {
        if !self.programs.contains_key(&key) {
            let source = sources::program_source(&key.program)
                .ok_or_else(|| BuildError::UnknownSource(key.program.clone()))?;
            let program = Program::create_and_build_from_source(context, source, &key.options)
                .map_err(|e| {
                    let log = e.to_string();
                    warn!("program '{}' failed to build: {log}", key.program);
                    BuildError::CompileFailed {
                        program: key.program.clone(),
                        log,
                    }
                })?;
            debug!("compiled program '{}' with options '{}'", key.program, key.options);
            self.programs.insert(key.clone(), program);
        }
        Ok(self.programs.get(&key).unwrap())
    }

    /// Inserts a program reconstructed from a persisted binary.
    ///
    /// Refuses to replace an existing entry so a key can never remap to a
    /// different program within one runtime. Returns whether the program
    /// was inserted.
    pub(crate) fn insert_prebuilt(&mut self, key: BuildKey, program: Program) -> bool {
        if self.programs.contains_key(&key) {
            return false;
        }
        self.programs.insert(key, program);
        true
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&BuildKey, &Program)> {
        self.programs.iter()
    }
}
