#![allow(dead_code)]

use dashi_compute::gpu::{Context, KernelLibrary, NullBackend, NullInfo};
use dashi_compute::logging::{init_logging, LoggingConfig};

/// Host module declaring every kernel in [`library`].
pub const KERNELS: &[u8] = b"# test kernels
entry add_one
entry square
entry scale
entry copy
";

pub fn init_test_logging() {
    init_logging(LoggingConfig {
        is_test: true,
        ..Default::default()
    });
}

/// `add_one`: out[i] = in[i] + 1, slots 0 -> 1.
/// `square`: out[i] = in[i]^2, slots 0 -> 1.
/// `scale`: out[i] = in[i] * k, with k read from the constant at slot 2.
/// `copy`: out[i] = in[i], slots 0 -> 1.
pub fn library() -> KernelLibrary {
    KernelLibrary::new()
        .with_kernel("add_one", |inv| {
            let i = inv.global_id[0] as usize;
            if i < inv.len::<u32>(0)? {
                let v: u32 = inv.read(0, i)?;
                inv.write(1, i, v + 1)?;
            }
            Ok(())
        })
        .with_kernel("square", |inv| {
            let i = inv.global_id[0] as usize;
            if i < inv.len::<u32>(0)? {
                let v: u32 = inv.read(0, i)?;
                inv.write(1, i, v * v)?;
            }
            Ok(())
        })
        .with_kernel("scale", |inv| {
            let i = inv.global_id[0] as usize;
            if i < inv.len::<f32>(0)? {
                let k: f32 = inv.read(2, 0)?;
                let v: f32 = inv.read(0, i)?;
                inv.write(1, i, v * k)?;
            }
            Ok(())
        })
        .with_kernel("copy", |inv| {
            let i = inv.global_id[0] as usize;
            if i < inv.len::<u32>(0)? {
                let v: u32 = inv.read(0, i)?;
                inv.write(1, i, v)?;
            }
            Ok(())
        })
}

pub fn null_context() -> Context<NullBackend> {
    init_test_logging();
    Context::<NullBackend>::new(&NullInfo {
        kernels: library(),
        ..Default::default()
    })
    .unwrap()
}

pub fn null_context_with_budget(budget: usize) -> Context<NullBackend> {
    init_test_logging();
    Context::<NullBackend>::new(&NullInfo {
        kernels: library(),
        memory_budget: Some(budget),
        ..Default::default()
    })
    .unwrap()
}
