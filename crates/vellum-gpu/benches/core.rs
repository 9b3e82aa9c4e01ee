use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vellum_gpu::headless::HeadlessDevice;
use vellum_gpu::{
    CommandListType, CommandQueue, DescriptorHeapType, GpuConfig, GpuSession, ResourceDesc,
    ResourceState, UploadBuffer, ALL_SUBRESOURCES,
};

fn session() -> Arc<GpuSession<HeadlessDevice>> {
    Arc::new(GpuSession::new(
        Arc::new(HeadlessDevice::auto_retire()),
        GpuConfig::default(),
    ))
}

fn bench_descriptors(c: &mut Criterion) {
    let session = session();
    let mut group = c.benchmark_group("Descriptor allocator");

    group.bench_function("allocate and release 256 runs", |b| {
        b.iter(|| {
            for i in 0..256u32 {
                let allocation = session
                    .allocate_descriptors(DescriptorHeapType::CbvSrvUav, i % 16 + 1)
                    .unwrap();
                black_box(allocation.descriptor_handle(0));
            }
            session.release_stale_descriptors(session.current_frame());
            session.advance_frame();
        });
    });

    group.finish();
}

fn bench_state_tracking(c: &mut Criterion) {
    let session = session();
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct).unwrap();
    let resources: Vec<_> = (0..64)
        .map(|i| {
            session
                .create_resource(
                    &ResourceDesc::buffer(256),
                    ResourceState::COMMON,
                    None,
                    &format!("bench {i}"),
                )
                .unwrap()
        })
        .collect();

    let mut group = c.benchmark_group("Resource state tracking");

    group.bench_function("64 resources, 3 transitions each", |b| {
        b.iter(|| {
            let mut list = queue.get_command_list().unwrap();
            for resource in &resources {
                list.transition_barrier(resource, ResourceState::COPY_DEST, ALL_SUBRESOURCES, false);
                list.transition_barrier(resource, ResourceState::UNORDERED_ACCESS, ALL_SUBRESOURCES, false);
                list.transition_barrier(resource, ResourceState::COMMON, ALL_SUBRESOURCES, false);
            }
            black_box(queue.execute_command_list(list).unwrap());
        });
    });

    group.finish();
}

fn bench_upload(c: &mut Criterion) {
    let session = session();
    let mut upload = UploadBuffer::new(Arc::clone(session.device()), 64 * 1024);
    let data = [0u8; 192];

    let mut group = c.benchmark_group("Upload buffer");

    group.bench_function("1024 constant allocations", |b| {
        b.iter(|| {
            for _ in 0..1024 {
                let mut allocation = upload.allocate(data.len() as u64, 256).unwrap();
                allocation.write(&data).unwrap();
                black_box(allocation.gpu_address());
            }
            upload.reset();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_descriptors, bench_state_tracking, bench_upload);
criterion_main!(benches);
