//! Embedded OpenCL kernel sources.
//!
//! Sources are compiled into the binary with `include_str!` and resolved by
//! program identifier at build time. They are written against the macro set
//! the build-option resolver defines: `FLOAT`/`FLOAT4`/`FLOAT16` for the
//! active precision, `RI_F`/`WI_F` for image reads/writes in that precision,
//! `CONVERT_FLOAT4` for conversions, and `SET_ATTRIBUTE` to gate work-group
//! size attributes.
//!
//! Image-based kernels use the packed-channel layout: an image pixel holds
//! four consecutive channels, image x = channel_quad * width + x.

static PROGRAM_SOURCES: &[(&str, &str)] = &[
    ("binary", include_str!("kernels/binary.cl")),
    ("conv2d", include_str!("kernels/conv2d.cl")),
    ("depthwise_conv2d", include_str!("kernels/depthwise_conv2d.cl")),
    ("matmul", include_str!("kernels/matmul.cl")),
    ("softmax", include_str!("kernels/softmax.cl")),
];

/// Resolves a program identifier to its embedded source text.
pub fn program_source(name: &str) -> Option<&'static str> {
    PROGRAM_SOURCES
        .iter()
        .find(|(program, _)| *program == name)
        .map(|(_, source)| *source)
}

/// Identifiers of all embedded programs.
pub fn program_names() -> impl Iterator<Item = &'static str> {
    PROGRAM_SOURCES.iter().map(|(program, _)| *program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sources_resolve() {
        for name in program_names() {
            let source = program_source(name).unwrap();
            assert!(source.contains("__kernel"), "{name} has no kernel entry point");
        }
    }

    #[test]
    fn test_unknown_source_is_none() {
        assert!(program_source("does_not_exist").is_none());
    }
}
