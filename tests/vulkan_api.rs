#![cfg(feature = "dashi-vulkan-tests")]

mod common;

use dashi_compute::gpu::*;
use serial_test::serial;

fn context() -> Context<VulkanBackend> {
    common::init_test_logging();
    Context::<VulkanBackend>::new(&VulkanInfo {
        app_name: "dashi-compute tests".to_string(),
        enable_validation: Some(true),
        ..Default::default()
    })
    .unwrap()
}

fn add_constant() -> &'static [u32] {
    inline_spirv::inline_spirv!(
        r#"
#version 450

layout(local_size_x = 64) in;

layout(binding = 0) buffer InputBuffer {
    float inputData[];
};

layout(binding = 1) buffer OutputBuffer {
    float outputData[];
};

layout(binding = 2) uniform Params {
    float num_to_add;
    uint count;
};

void main() {
    uint index = gl_GlobalInvocationID.x;
    if (index < count) {
        outputData[index] = inputData[index] + num_to_add;
    }
}
"#,
        comp
    )
}

fn double_in_place() -> &'static [u32] {
    inline_spirv::inline_spirv!(
        r#"
#version 450

layout(local_size_x = 64) in;

layout(binding = 0) buffer Data {
    uint data[];
};

void main() {
    uint index = gl_GlobalInvocationID.x;
    if (index < data.length()) {
        data[index] = data[index] * 2;
    }
}
"#,
        comp
    )
}

#[test]
#[serial]
fn test_context() {
    let ctx = context();
    assert_eq!(ctx.backend(), BackendKind::Vulkan);
    assert!(ctx.limits().max_workgroup_invocations >= 64);
    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_buffer_round_trip() {
    let mut ctx = context();
    let initial = vec![8u8; 1280];
    let buffer = ctx
        .make_buffer(&BufferInfo {
            debug_name: "Test Buffer",
            byte_size: initial.len(),
            initial_data: Some(&initial),
            ..Default::default()
        })
        .unwrap();

    let mut out = vec![0u8; initial.len()];
    ctx.read_buffer(buffer, &mut out, 0).unwrap();
    assert_eq!(out, initial);

    ctx.write_buffer(buffer, &[1, 2, 3], 1277).unwrap();
    let mut tail = [0u8; 3];
    ctx.read_buffer(buffer, &mut tail, 1277).unwrap();
    assert_eq!(tail, [1, 2, 3]);

    ctx.delete_buffer(buffer).unwrap();
    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_dispatch_with_constants() {
    let mut ctx = context();
    let count = 100usize;
    let input: Vec<f32> = (0..count).map(|i| i as f32).collect();

    let src = ctx
        .create_buffer(count * 4, BufferUsage::Structured)
        .unwrap();
    let dst = ctx
        .create_buffer(count * 4, BufferUsage::Structured)
        .unwrap();
    let params = ctx.create_buffer(16, BufferUsage::Constant).unwrap();
    ctx.write_slice(src, &input, 0).unwrap();
    ctx.write_slice(params, &[10.0f32], 0).unwrap();
    ctx.write_slice(params, &[count as u32], 4).unwrap();

    let kernel = ctx
        .create_kernel(bytemuck::cast_slice(add_constant()), "main")
        .unwrap();
    ctx.set_kernel(kernel).unwrap();
    ctx.set_kernel_buffer(src, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(dst, 1, BufferBinding::Output).unwrap();
    ctx.set_kernel_buffer(params, 2, BufferBinding::Constant).unwrap();
    ctx.dispatch([count as u32, 1, 1], [64, 1, 1]).unwrap();

    let out: Vec<f32> = ctx.read_vec(dst, count, 0).unwrap();
    for (i, v) in out.iter().enumerate() {
        assert_eq!(*v, i as f32 + 10.0);
    }
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);

    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_back_to_back_dispatches_are_ordered() {
    let mut ctx = context();
    let data = ctx.create_buffer(256 * 4, BufferUsage::Structured).unwrap();
    let values: Vec<u32> = (0..256).collect();
    ctx.write_slice(data, &values, 0).unwrap();

    let kernel = ctx
        .create_kernel(bytemuck::cast_slice(double_in_place()), "main")
        .unwrap();
    for _ in 0..3 {
        ctx.set_kernel(kernel).unwrap();
        ctx.set_kernel_buffer(data, 0, BufferBinding::Output).unwrap();
        ctx.dispatch([256, 1, 1], [64, 1, 1]).unwrap();
    }

    let out: Vec<u32> = ctx.read_vec(data, 256, 0).unwrap();
    assert_eq!(out, values.iter().map(|v| v * 8).collect::<Vec<_>>());
    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_kernel_errors() {
    let mut ctx = context();

    assert!(matches!(
        ctx.create_kernel(b"not spirv at all", "main"),
        Err(ComputeError::Compile { .. })
    ));
    assert!(matches!(
        ctx.create_kernel(bytemuck::cast_slice(double_in_place()), "other"),
        Err(ComputeError::EntryPointNotFound(_))
    ));
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);

    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_binding_validation() {
    let mut ctx = context();
    let structured = ctx.create_buffer(64, BufferUsage::Structured).unwrap();
    let constant = ctx.create_buffer(64, BufferUsage::Constant).unwrap();
    let kernel = ctx
        .create_kernel(bytemuck::cast_slice(add_constant()), "main")
        .unwrap();
    ctx.set_kernel(kernel).unwrap();

    // Slot 2 is a uniform block; slot 5 does not exist.
    assert!(ctx
        .set_kernel_buffer(constant, 0, BufferBinding::Constant)
        .is_err());
    assert!(ctx
        .set_kernel_buffer(structured, 5, BufferBinding::Input)
        .is_err());

    // Missing slot 2 at dispatch time.
    ctx.set_kernel_buffer(structured, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(structured, 1, BufferBinding::Output).unwrap();
    assert!(ctx.dispatch([64, 1, 1], [64, 1, 1]).is_err());

    // Group size must match the compiled local size.
    ctx.set_kernel_buffer(structured, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(structured, 1, BufferBinding::Output).unwrap();
    ctx.set_kernel_buffer(constant, 2, BufferBinding::Constant).unwrap();
    assert!(ctx.dispatch([64, 1, 1], [32, 1, 1]).is_err());

    ctx.destroy().unwrap();
}

#[test]
#[serial]
fn test_deferred_release() {
    let mut ctx = context();
    let data = ctx.create_buffer(64 * 4, BufferUsage::Structured).unwrap();
    let kernel = ctx
        .create_kernel(bytemuck::cast_slice(double_in_place()), "main")
        .unwrap();

    ctx.set_kernel(kernel).unwrap();
    ctx.set_kernel_buffer(data, 0, BufferBinding::Output).unwrap();
    ctx.dispatch([64, 1, 1], [64, 1, 1]).unwrap();

    ctx.delete_buffer(data).unwrap();
    ctx.delete_kernel(kernel).unwrap();
    ctx.finish().unwrap();
    ctx.destroy().unwrap();
}
