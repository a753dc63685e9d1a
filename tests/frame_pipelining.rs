//! Frame loop and array relocation tests.
//!
//! These drive a [`Renderer`] on the dummy device and check, through the
//! device event log, that old stores survive until every frame slot has moved
//! past them and that every binding copy is rewritten before that happens.

mod common;

use rstest::rstest;

use common::{buffer_destroyed_at, renderer, uniform_layout, written_at};
use talus::backend::{DeviceEvent, RecordedCommand};
use talus::resources::IndexData;
use talus::{
    BindResource, DrawBinding, Drawable, DrawableBuilder, ResourceArrayDescriptor, SlotRequest,
};

#[test]
fn test_two_frames_in_flight_alternate() {
    let mut renderer = renderer(2);
    let scene: Vec<Drawable> = Vec::new();

    let mut worked_on = Vec::new();
    let mut next = Vec::new();
    for _ in 0..4 {
        worked_on.push(renderer.current_frame());
        next.push(renderer.tick(1.0 / 60.0, &scene).unwrap());
    }

    assert_eq!(worked_on, vec![0, 1, 0, 1]);
    assert_eq!(next, vec![1, 0, 1, 0]);
    let events = renderer.context().device().events();
    let waits: Vec<&DeviceEvent> = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::FenceWaited { .. }))
        .collect();
    assert_eq!(waits.len(), 4);
    // Fences start signaled, later waits see the previous submission complete
    assert!(waits
        .iter()
        .all(|e| matches!(e, DeviceEvent::FenceWaited { signaled: true, .. })));
    let presented: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Presented { image_index } => Some(*image_index),
            _ => None,
        })
        .collect();
    assert_eq!(presented, vec![0, 1, 0, 1]);
    assert!((renderer.stats().elapsed_seconds - 4.0 / 60.0).abs() < 1e-9);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
fn test_growth_retires_store_after_every_slot(#[case] frames: u32) {
    let mut renderer = renderer(frames);
    let scene: Vec<Drawable> = Vec::new();
    let ctx = renderer.context_mut();
    let objects = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64).with_capacity(1))
        .unwrap();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(table, 0, BindResource::Array(objects)).unwrap();

    let old = ctx.array(objects).unwrap().store();
    ctx.allocate(objects).unwrap();
    ctx.allocate(objects).unwrap();
    let new = ctx.array(objects).unwrap().store();
    assert_ne!(old, new);
    assert_eq!(ctx.array(objects).unwrap().capacity(), 2);

    for _ in 0..frames - 1 {
        renderer.tick(0.0, &scene).unwrap();
        assert!(renderer.context().device().is_buffer_alive(old));
    }
    renderer.tick(0.0, &scene).unwrap();

    let ctx = renderer.context();
    assert!(!ctx.device().is_buffer_alive(old));
    assert!(ctx.reclaim_queue().is_empty());

    let events = ctx.device().events();
    let destroyed = buffer_destroyed_at(events, old).unwrap();
    let set = ctx.binding_table(table).unwrap().set();
    let array = ctx.array(objects).unwrap();
    for copy in 0..frames {
        let descriptor = array.descriptor(copy);
        let written = written_at(events, set, copy, 0, descriptor)
            .unwrap_or_else(|| panic!("copy {copy} never refreshed"));
        assert!(written < destroyed);
        assert_eq!(ctx.device().binding(set, copy, 0), Some(descriptor));
    }
}

#[test]
fn test_array_shared_by_two_tables_refreshes_both() {
    let mut renderer = renderer(2);
    let scene: Vec<Drawable> = Vec::new();
    let ctx = renderer.context_mut();
    let objects = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64).with_capacity(1))
        .unwrap();
    let first = ctx.create_binding_table(&uniform_layout()).unwrap();
    let second = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(first, 0, BindResource::Array(objects)).unwrap();
    ctx.bind(second, 0, BindResource::Array(objects)).unwrap();
    assert_eq!(ctx.binding_refs(objects.into()).len(), 2);

    let old = ctx.array(objects).unwrap().store();
    ctx.allocate(objects).unwrap();
    ctx.allocate(objects).unwrap();

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();

    let ctx = renderer.context();
    let events = ctx.device().events();
    let destroyed = buffer_destroyed_at(events, old).unwrap();
    let array = ctx.array(objects).unwrap();
    for table in [first, second] {
        let set = ctx.binding_table(table).unwrap().set();
        for copy in 0..2 {
            let written = written_at(events, set, copy, 0, array.descriptor(copy)).unwrap();
            assert!(written < destroyed);
        }
    }
}

#[test]
fn test_growth_forces_rerecord_of_each_slot() {
    let mut renderer = renderer(2);
    let pipeline = renderer.context_mut().device_mut().register_pipeline("flat");
    let ctx = renderer.context_mut();
    let objects = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64).with_capacity(1))
        .unwrap();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(table, 0, BindResource::Array(objects)).unwrap();
    let first = DrawableBuilder::new(pipeline)
        .with_vertex_count(3)
        .with_binding(table, &[(objects, SlotRequest::Allocate)])
        .build(ctx)
        .unwrap();
    let mut scene = vec![first];

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();
    assert_eq!(renderer.stats().rerecords, 2);

    let second = DrawableBuilder::new(pipeline)
        .with_vertex_count(3)
        .with_binding(table, &[(objects, SlotRequest::Allocate)])
        .build(renderer.context_mut())
        .unwrap();
    assert_eq!(second.slot(objects), Some(1));
    scene.push(second);

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();
    assert_eq!(renderer.stats().rerecords, 4);

    let list = renderer.command_list(0).unwrap();
    let offsets: Vec<Vec<u32>> = renderer
        .context()
        .device()
        .commands(list)
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BindBindingSet {
                dynamic_offsets, ..
            } => Some(dynamic_offsets.clone()),
            _ => None,
        })
        .collect();
    // 64-byte elements padded to the 256-byte uniform alignment
    assert_eq!(offsets, vec![vec![0], vec![256]]);
}

#[test]
fn test_plain_and_indexed_draws() {
    let mut renderer = renderer(2);
    let pipeline = renderer.context_mut().device_mut().register_pipeline("mesh");
    let ctx = renderer.context_mut();
    let vertices = ctx
        .create_vertex_buffer("quad", &[[0.0f32; 3]; 4])
        .unwrap();
    let indices = ctx
        .create_index_buffer("quad", &IndexData::U16(vec![0, 1, 2, 2, 3, 0]))
        .unwrap();

    let triangle = DrawableBuilder::new(pipeline)
        .with_vertex_buffer(vertices)
        .with_vertex_count(3)
        .build(ctx)
        .unwrap();
    let quads = DrawableBuilder::new(pipeline)
        .with_vertex_buffer(vertices)
        .with_index_buffer(indices)
        .with_instance_count(2)
        .build(ctx)
        .unwrap();
    let scene = vec![triangle, quads];

    renderer.tick(0.0, &scene).unwrap();

    let list = renderer.command_list(0).unwrap();
    let commands = renderer.context().device().commands(list);
    assert!(commands.contains(&RecordedCommand::Draw {
        vertex_count: 3,
        instance_count: 1
    }));
    assert!(commands.contains(&RecordedCommand::DrawIndexed {
        index_count: 6,
        instance_count: 2
    }));
    assert!(commands.contains(&RecordedCommand::BindIndexBuffer {
        buffer: indices.buffer,
        format: talus::backend::IndexFormat::Uint16,
    }));
}

#[test]
fn test_dynamic_index_mismatch_records_nothing() {
    let mut renderer = renderer(2);
    let pipeline = renderer.context_mut().device_mut().register_pipeline("flat");
    let ctx = renderer.context_mut();
    let objects = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64))
        .unwrap();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(table, 0, BindResource::Array(objects)).unwrap();

    let mut broken = Drawable::new(pipeline);
    broken.vertex_count = 3;
    broken.bindings.push(DrawBinding {
        table,
        dynamic_indices: Vec::new(),
    });

    let err = renderer.tick(0.0, &vec![broken]).unwrap_err();
    assert!(err.is_misuse());
    let list = renderer.command_list(0).unwrap();
    assert!(renderer.context().device().commands(list).is_empty());

    // The slot's fence was never reset, so the frame can be retried
    let empty: Vec<Drawable> = Vec::new();
    assert_eq!(renderer.tick(0.0, &empty).unwrap(), 1);
}

#[test]
fn test_destroyed_table_outlives_frames_in_flight() {
    let mut renderer = renderer(3);
    let scene: Vec<Drawable> = Vec::new();
    let ctx = renderer.context_mut();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.destroy_binding_table(table).unwrap();
    assert!(ctx.binding_table(table).is_err());

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();
    assert_eq!(renderer.context().reclaim_queue().pending(), 1);
    renderer.tick(0.0, &scene).unwrap();
    assert!(renderer.context().reclaim_queue().is_empty());
}

#[test]
fn test_rebind_rewrites_each_copy_when_idle_and_rerecords() {
    let mut renderer = renderer(2);
    let pipeline = renderer.context_mut().device_mut().register_pipeline("flat");
    let ctx = renderer.context_mut();
    let first = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64).with_label("first"))
        .unwrap();
    let second = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64).with_label("second"))
        .unwrap();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(table, 0, BindResource::Array(first)).unwrap();
    let drawable = DrawableBuilder::new(pipeline)
        .with_vertex_count(3)
        .with_binding(table, &[(first, SlotRequest::Allocate)])
        .build(ctx)
        .unwrap();
    let scene = vec![drawable];

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();
    assert_eq!(renderer.stats().rerecords, 2);

    let ctx = renderer.context_mut();
    let set = ctx.binding_table(table).unwrap().set();
    let old = ctx.array(first).unwrap().descriptor(0);
    ctx.bind(table, 0, BindResource::Array(second)).unwrap();
    // Nothing is written while the copies may still be in use
    assert_eq!(ctx.device().binding(set, 0, 0), Some(old));
    assert!(ctx.binding_refs(first.into()).is_empty());

    renderer.tick(0.0, &scene).unwrap();
    renderer.tick(0.0, &scene).unwrap();

    assert_eq!(renderer.stats().rerecords, 4);
    let ctx = renderer.context();
    let array = ctx.array(second).unwrap();
    for copy in 0..2 {
        assert_eq!(ctx.device().binding(set, copy, 0), Some(array.descriptor(copy)));
    }
    assert!(ctx.reclaim_queue().is_empty());
}

#[test]
fn test_destroyed_array_cannot_be_recorded() {
    let mut renderer = renderer(2);
    let pipeline = renderer.context_mut().device_mut().register_pipeline("flat");
    let ctx = renderer.context_mut();
    let objects = ctx
        .create_array(&ResourceArrayDescriptor::uniform(64))
        .unwrap();
    let table = ctx.create_binding_table(&uniform_layout()).unwrap();
    ctx.bind(table, 0, BindResource::Array(objects)).unwrap();
    let drawable = DrawableBuilder::new(pipeline)
        .with_vertex_count(3)
        .with_binding(table, &[(objects, SlotRequest::Allocate)])
        .build(ctx)
        .unwrap();
    let scene = vec![drawable];
    renderer.tick(0.0, &scene).unwrap();

    let ctx = renderer.context_mut();
    let store = ctx.array(objects).unwrap().store();
    ctx.destroy_array(objects).unwrap();
    assert!(ctx.binding_table(table).unwrap().bound(0).is_none());
    assert!(ctx.binding_refs(objects.into()).is_empty());

    let err = renderer.tick(0.0, &scene).unwrap_err();
    assert!(err.is_misuse());
    let list = renderer.command_list(1).unwrap();
    assert!(renderer.context().device().commands(list).is_empty());
    assert!(renderer.context().device().is_buffer_alive(store));
}
