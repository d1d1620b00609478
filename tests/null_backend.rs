mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{null_context, null_context_with_budget, KERNELS};
use dashi_compute::gpu::*;

#[test]
fn reports_null_backend() {
    let ctx = null_context();
    assert_eq!(ctx.backend(), BackendKind::Null);
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
    ctx.destroy().unwrap();
}

#[test]
fn destroy_without_work_is_safe() {
    let ctx = null_context();
    assert_eq!(ctx.device().submissions(), 0);
    ctx.destroy().unwrap();
}

#[test]
fn write_then_read_round_trips() {
    let mut ctx = null_context();
    let buf = ctx.create_buffer(64, BufferUsage::Structured).unwrap();

    let data: Vec<u8> = (0..64).collect();
    ctx.write_buffer(buf, &data, 0).unwrap();

    let mut out = vec![0u8; 64];
    ctx.read_buffer(buf, &mut out, 0).unwrap();
    assert_eq!(out, data);

    ctx.write_buffer(buf, &[0xaa; 8], 16).unwrap();
    let mut window = [0u8; 10];
    ctx.read_buffer(buf, &mut window, 15).unwrap();
    assert_eq!(window, [15, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 24]);

    // Clean reads never touch the device.
    assert_eq!(ctx.device().submissions(), 0);
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
}

#[test]
fn initial_data_is_uploaded() {
    let mut ctx = null_context();
    let data = [7u8; 32];
    let buf = ctx
        .make_buffer(&BufferInfo {
            debug_name: "seeded",
            byte_size: 64,
            initial_data: Some(&data),
            ..Default::default()
        })
        .unwrap();

    let out: Vec<u8> = ctx.read_vec(buf, 64, 0).unwrap();
    assert_eq!(&out[..32], &data);
    assert!(out[32..].iter().all(|&b| b == 0));
}

#[test]
fn dispatch_results_are_visible_without_manual_sync() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(40, BufferUsage::Structured).unwrap();
    let output = ctx.create_buffer(40, BufferUsage::Structured).unwrap();
    let values: Vec<u32> = (0..10).collect();
    ctx.write_slice(input, &values, 0).unwrap();

    let kernel = ctx.create_kernel(KERNELS, "add_one").unwrap();
    ctx.set_kernel(kernel).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(output, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([10, 1, 1], [3, 1, 1]).unwrap();

    // Recorded only.
    assert_eq!(ctx.encoder_state(), EncoderState::Encoding);
    assert_eq!(ctx.device().dispatches(), 0);
    assert!(ctx.buffer_info(output).unwrap().dirty);

    let out: Vec<u32> = ctx.read_vec(output, 10, 0).unwrap();
    assert_eq!(out, (1..=10).collect::<Vec<u32>>());
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
    assert_eq!(ctx.device().submissions(), 1);
    assert_eq!(ctx.device().dispatches(), 1);
    assert!(!ctx.buffer_info(output).unwrap().dirty);

    // Second read is clean and does not submit again.
    let again: Vec<u32> = ctx.read_vec(output, 10, 0).unwrap();
    assert_eq!(again, out);
    assert_eq!(ctx.device().submissions(), 1);
}

#[test]
fn writes_never_drain_recorded_work() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let output = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let other = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    ctx.write_slice(input, &[1u32, 2, 3, 4], 0).unwrap();

    let kernel = ctx.create_kernel(KERNELS, "add_one").unwrap();
    ctx.set_kernel(kernel).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(output, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([4, 1, 1], [4, 1, 1]).unwrap();

    ctx.write_slice(other, &[9u32; 4], 0).unwrap();
    ctx.write_buffer(other, &[0xff; 4], 12).unwrap();

    assert_eq!(ctx.encoder_state(), EncoderState::Encoding);
    assert_eq!(ctx.device().submissions(), 0);
    assert_eq!(ctx.device().dispatches(), 0);

    // Clean buffers are read straight away as well.
    let seen: Vec<u32> = ctx.read_vec(other, 3, 0).unwrap();
    assert_eq!(seen, vec![9, 9, 9]);
    assert_eq!(ctx.encoder_state(), EncoderState::Encoding);
    assert_eq!(ctx.device().submissions(), 0);

    assert_eq!(ctx.read_vec::<u32>(output, 4, 0).unwrap(), vec![2, 3, 4, 5]);
    assert_eq!(ctx.device().submissions(), 1);
}

#[test]
fn chained_dispatches_see_each_other() {
    let mut ctx = null_context();
    let a = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let b = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let c = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    ctx.write_slice(a, &[1u32, 2, 3, 4], 0).unwrap();

    let add_one = ctx.create_kernel(KERNELS, "add_one").unwrap();
    let square = ctx.create_kernel(KERNELS, "square").unwrap();

    ctx.set_kernel(add_one).unwrap();
    ctx.set_kernel_buffer(a, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(b, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([4, 1, 1], [64, 1, 1]).unwrap();

    ctx.set_kernel(square).unwrap();
    ctx.set_kernel_buffer(b, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(c, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([4, 1, 1], [64, 1, 1]).unwrap();

    assert_eq!(ctx.read_vec::<u32>(c, 4, 0).unwrap(), vec![4, 9, 16, 25]);
    assert_eq!(ctx.device().submissions(), 1);
}

#[test]
fn constant_buffers_feed_kernels() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(12, BufferUsage::Structured).unwrap();
    let output = ctx.create_buffer(12, BufferUsage::Structured).unwrap();
    let factor = ctx.create_buffer(16, BufferUsage::Constant).unwrap();
    ctx.write_slice(input, &[1.0f32, 2.0, 3.0], 0).unwrap();
    ctx.write_slice(factor, &[2.5f32], 0).unwrap();

    let scale = ctx.create_kernel(KERNELS, "scale").unwrap();
    ctx.set_kernel(scale).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(output, 1, BufferBinding::Output).unwrap();
    ctx.set_kernel_buffer(factor, 2, BufferBinding::Constant).unwrap();
    ctx.dispatch([3, 1, 1], [2, 1, 1]).unwrap();

    assert_eq!(ctx.read_vec::<f32>(output, 3, 0).unwrap(), vec![2.5, 5.0, 7.5]);
}

#[test]
fn out_of_range_transfers_are_rejected() {
    let mut ctx = null_context();
    let buf = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let mut one = [0u8; 1];

    let overflowing = [(16, 1), (15, 2), (0, 17), (17, 0), (usize::MAX, 1)];
    for (offset, len) in overflowing {
        let mut dst = vec![0u8; len];
        assert!(
            matches!(
                ctx.read_buffer(buf, &mut dst, offset),
                Err(ComputeError::InvalidArgument(_))
            ),
            "read offset {} len {}",
            offset,
            len
        );
        assert!(
            matches!(
                ctx.write_buffer(buf, &vec![0u8; len], offset),
                Err(ComputeError::InvalidArgument(_))
            ),
            "write offset {} len {}",
            offset,
            len
        );
    }

    // The last byte and an empty transfer at the end are fine.
    ctx.read_buffer(buf, &mut one, 15).unwrap();
    ctx.read_buffer(buf, &mut [], 16).unwrap();
    ctx.write_buffer(buf, &[1], 15).unwrap();
}

#[test]
fn buffer_creation_validates_arguments() {
    let mut ctx = null_context();
    assert!(matches!(
        ctx.create_buffer(0, BufferUsage::Structured),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(ctx
        .create_structured_buffer(64, BufferUsage::Structured, 12)
        .is_err());
    assert!(ctx
        .create_structured_buffer(64, BufferUsage::Structured, 0)
        .is_err());

    let buf = ctx
        .create_structured_buffer(64, BufferUsage::Structured, 16)
        .unwrap();
    let desc = ctx.buffer_info(buf).unwrap();
    assert_eq!(desc.byte_size, 64);
    assert_eq!(desc.element_size, Some(16));
    assert!(!desc.dirty);

    let too_big = ctx.limits().max_constant_buffer_size + 1;
    assert!(ctx.create_buffer(too_big, BufferUsage::Constant).is_err());

    let seed = [0u8; 8];
    assert!(ctx
        .make_buffer(&BufferInfo {
            byte_size: 4,
            initial_data: Some(&seed),
            ..Default::default()
        })
        .is_err());
}

#[test]
fn allocation_failure_is_out_of_memory() {
    let mut ctx = null_context_with_budget(128);
    let a = ctx.create_buffer(100, BufferUsage::Structured).unwrap();
    assert!(matches!(
        ctx.create_buffer(64, BufferUsage::Structured),
        Err(ComputeError::OutOfMemory)
    ));

    ctx.delete_buffer(a).unwrap();
    ctx.create_buffer(64, BufferUsage::Structured).unwrap();
}

#[test]
fn invalid_source_fails_cleanly() {
    let mut ctx = null_context();
    let buf = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();

    // Idle: compile failure leaves the controller idle.
    assert!(matches!(
        ctx.create_kernel(b"kernel void main() {}", "main"),
        Err(ComputeError::Compile { .. })
    ));
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);

    // Encoding: compile failure leaves the open pass usable.
    ctx.set_kernel(copy).unwrap();
    assert!(ctx.create_kernel(&[0xff, 0x00, 0xfe], "main").is_err());
    assert_eq!(ctx.encoder_state(), EncoderState::Encoding);
    ctx.set_kernel_buffer(buf, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(buf, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([4, 1, 1], [4, 1, 1]).unwrap();
    ctx.finish().unwrap();
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
}

#[test]
fn missing_entry_point_is_distinct_from_compile_errors() {
    let mut ctx = null_context();
    match ctx.create_kernel(KERNELS, "does_not_exist") {
        Err(ComputeError::EntryPointNotFound(name)) => assert_eq!(name, "does_not_exist"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("kernel should not resolve"),
    }

    // Declared in the module but never registered on the host.
    assert!(matches!(
        ctx.create_kernel(b"entry ghost", "ghost"),
        Err(ComputeError::EntryPointNotFound(_))
    ));
}

#[test]
fn second_kernel_replaces_the_first() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    let first_out = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    let second_out = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    ctx.write_slice(input, &[3u32, 4], 0).unwrap();

    let add_one = ctx.create_kernel(KERNELS, "add_one").unwrap();
    let square = ctx.create_kernel(KERNELS, "square").unwrap();

    ctx.set_kernel(add_one).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(first_out, 1, BufferBinding::Output).unwrap();

    ctx.set_kernel(square).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(second_out, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([2, 1, 1], [2, 1, 1]).unwrap();

    assert_eq!(ctx.read_vec::<u32>(second_out, 2, 0).unwrap(), vec![9, 16]);
    // Bound to the replaced kernel only; never written.
    assert_eq!(ctx.read_vec::<u32>(first_out, 2, 0).unwrap(), vec![0, 0]);
    assert_eq!(ctx.device().dispatches(), 1);
}

#[test]
fn bindings_do_not_survive_a_dispatch() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(4, BufferUsage::Structured).unwrap();
    let output = ctx.create_buffer(4, BufferUsage::Structured).unwrap();
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();

    ctx.set_kernel(copy).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(output, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([1, 1, 1], [1, 1, 1]).unwrap();

    // Same kernel, no bindings: the kernel finds slot 0 empty when it runs.
    ctx.dispatch([1, 1, 1], [1, 1, 1]).unwrap();
    assert!(matches!(ctx.finish(), Err(ComputeError::Kernel(_))));
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
}

#[test]
fn compute_calls_require_an_open_pass() {
    let mut ctx = null_context();
    let buf = ctx.create_buffer(4, BufferUsage::Structured).unwrap();

    assert!(matches!(
        ctx.set_kernel_buffer(buf, 0, BufferBinding::Input),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.dispatch([1, 1, 1], [1, 1, 1]),
        Err(ComputeError::InvalidArgument(_))
    ));

    // Reading dirty data closes the pass; the kernel must be bound again.
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();
    ctx.set_kernel(copy).unwrap();
    ctx.set_kernel_buffer(buf, 1, BufferBinding::Output).unwrap();
    let mut out = [0u8; 4];
    ctx.read_buffer(buf, &mut out, 0).unwrap();
    assert!(ctx.dispatch([1, 1, 1], [1, 1, 1]).is_err());
}

#[test]
fn dispatch_shape_is_validated() {
    let mut ctx = null_context();
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();
    ctx.set_kernel(copy).unwrap();

    assert!(matches!(
        ctx.dispatch([4, 1, 1], [0, 1, 1]),
        Err(ComputeError::InvalidArgument(_))
    ));
    let max = ctx.limits().max_workgroup_invocations;
    assert!(ctx.dispatch([4, 1, 1], [max + 1, 1, 1]).is_err());

    // Zero threads is an empty grid: accepted, nothing recorded.
    ctx.dispatch([0, 1, 1], [4, 1, 1]).unwrap();
    ctx.finish().unwrap();
    assert_eq!(ctx.device().dispatches(), 0);
}

#[test]
fn binding_kind_must_match_usage() {
    let mut ctx = null_context();
    let constant = ctx.create_buffer(16, BufferUsage::Constant).unwrap();
    let structured = ctx.create_buffer(16, BufferUsage::Structured).unwrap();
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();
    ctx.set_kernel(copy).unwrap();

    assert!(ctx
        .set_kernel_buffer(constant, 1, BufferBinding::Output)
        .is_err());
    assert!(ctx
        .set_kernel_buffer(structured, 2, BufferBinding::Constant)
        .is_err());
    // A rejected Output binding does not mark the buffer dirty.
    assert!(!ctx.buffer_info(constant).unwrap().dirty);
}

#[test]
fn deleting_in_use_resources_defers_release() {
    let mut ctx = null_context();
    let input = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    let output = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    ctx.write_slice(input, &[5u32, 6], 0).unwrap();
    let copy = ctx.create_kernel(KERNELS, "copy").unwrap();

    ctx.set_kernel(copy).unwrap();
    ctx.set_kernel_buffer(input, 0, BufferBinding::Input).unwrap();
    ctx.set_kernel_buffer(output, 1, BufferBinding::Output).unwrap();
    ctx.dispatch([2, 1, 1], [2, 1, 1]).unwrap();

    // The recorded dispatch still runs against the deleted input.
    ctx.delete_buffer(input).unwrap();
    ctx.delete_kernel(copy).unwrap();
    assert_eq!(ctx.device().live_buffers(), 2);

    assert_eq!(ctx.read_vec::<u32>(output, 2, 0).unwrap(), vec![5, 6]);
    assert_eq!(ctx.device().live_buffers(), 1);
    assert_eq!(ctx.device().live_kernels(), 0);
}

#[test]
fn stale_handles_are_invalid_arguments() {
    let mut ctx = null_context();
    let buf = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    let kernel = ctx.create_kernel(KERNELS, "copy").unwrap();
    ctx.delete_buffer(buf).unwrap();
    ctx.delete_kernel(kernel).unwrap();

    // Slot reuse must not revive the old handles.
    let fresh = ctx.create_buffer(8, BufferUsage::Structured).unwrap();
    assert_ne!(fresh, buf);

    assert!(matches!(
        ctx.set_kernel(kernel),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.buffer_info(buf),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(ctx.delete_kernel(kernel).is_err());
    assert_eq!(ctx.encoder_state(), EncoderState::Idle);
}

#[test]
fn destroy_drains_outstanding_dispatches() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let library = common::library().with_kernel("count", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let mut ctx = Context::<NullBackend>::new(&NullInfo {
        kernels: library,
        ..Default::default()
    })
    .unwrap();

    let kernel = ctx.create_kernel(b"entry count", "count").unwrap();
    ctx.set_kernel(kernel).unwrap();
    ctx.dispatch([10, 2, 1], [4, 1, 1]).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    ctx.destroy().unwrap();
    // 3 groups of 4 on x, 2 on y.
    assert_eq!(hits.load(Ordering::SeqCst), 24);
}

#[test]
fn dropping_a_context_also_drains() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let library = KernelLibrary::new().with_kernel("count", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    {
        let mut ctx = Context::<NullBackend>::new(&NullInfo {
            kernels: library,
            ..Default::default()
        })
        .unwrap();
        let kernel = ctx.create_kernel(b"entry count", "count").unwrap();
        ctx.set_kernel(kernel).unwrap();
        ctx.dispatch([5, 1, 1], [5, 1, 1]).unwrap();
    }

    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[test]
fn independent_contexts_do_not_interact() {
    let mut a = null_context();
    let mut b = null_context();
    let buf_a = a.create_buffer(4, BufferUsage::Structured).unwrap();
    let buf_b = b.create_buffer(4, BufferUsage::Structured).unwrap();

    a.write_slice(buf_a, &[1u32], 0).unwrap();
    b.write_slice(buf_b, &[2u32], 0).unwrap();

    let copy = a.create_kernel(KERNELS, "copy").unwrap();
    a.set_kernel(copy).unwrap();
    assert_eq!(b.encoder_state(), EncoderState::Idle);

    assert_eq!(a.read_vec::<u32>(buf_a, 1, 0).unwrap(), vec![1]);
    assert_eq!(b.read_vec::<u32>(buf_b, 1, 0).unwrap(), vec![2]);
}

#[test]
fn handles_from_another_context_are_rejected() {
    let mut a = null_context();
    let mut b = null_context();
    let buf_a = a.create_buffer(4, BufferUsage::Structured).unwrap();
    let buf_b = b.create_buffer(64, BufferUsage::Structured).unwrap();
    let kernel_a = a.create_kernel(KERNELS, "copy").unwrap();

    assert!(matches!(
        b.buffer_info(buf_a),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        b.write_buffer(buf_a, &[1, 2, 3, 4], 0),
        Err(ComputeError::InvalidArgument(_))
    ));
    let mut out = [0u8; 4];
    assert!(matches!(
        b.read_buffer(buf_a, &mut out, 0),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        b.delete_buffer(buf_a),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        b.set_kernel(kernel_a),
        Err(ComputeError::InvalidArgument(_))
    ));
    assert!(matches!(
        b.delete_kernel(kernel_a),
        Err(ComputeError::InvalidArgument(_))
    ));

    // Both contexts keep their own resources.
    assert_eq!(b.device().live_buffers(), 1);
    assert_eq!(b.buffer_info(buf_b).unwrap().byte_size, 64);
    assert_eq!(b.encoder_state(), EncoderState::Idle);
    assert_eq!(a.buffer_info(buf_a).unwrap().byte_size, 4);
    a.set_kernel(kernel_a).unwrap();
}
