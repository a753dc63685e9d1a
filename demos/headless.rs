//! # Headless Demo
//!
//! Runs the frame loop on the dummy device: a growing set of objects, each
//! with a slot in a per-frame uniform array, plus a glyph atlas that fills up
//! and grows while frames are in flight.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example headless -- --frames 120 --objects 64
//! ```

use clap::Parser;
use glam::{Mat4, Vec3};

use talus::backend::{BindingKind, BindingLayout, TextureFormat};
use talus::{
    BindResource, Drawable, DrawableBuilder, GraphicsResult, Renderer, RendererConfig,
    ResourceArrayDescriptor, SlotRequest,
};

/// Talus headless frame loop.
#[derive(Parser, Debug)]
#[command(name = "headless", about = "Frame pipelining on the dummy backend", version)]
struct Args {
    /// Frames the CPU may run ahead of the GPU.
    #[arg(long, default_value_t = 2)]
    frames_in_flight: u32,

    /// Staging stack size in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    staging_size: u64,

    /// Number of frames to render.
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Objects added over the run, one every few frames.
    #[arg(long, default_value_t = 32)]
    objects: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ObjectUniforms {
    model: [[f32; 4]; 4],
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        log::error!("Headless run failed: {e}");
        std::process::exit(if e.is_fatal() { 2 } else { 1 });
    }
}

fn run(args: &Args) -> GraphicsResult<()> {
    let config = RendererConfig::default()
        .with_frames_in_flight(args.frames_in_flight)
        .with_staging_size(args.staging_size);
    config.validate()?;

    let device = talus::DummyDevice::new().with_swapchain_images(args.frames_in_flight + 1);
    let mut renderer = Renderer::new(device, &config)?;

    let ctx = renderer.context_mut();
    let pipeline = ctx.device_mut().register_pipeline("flat");
    let objects = ctx.create_array(
        &ResourceArrayDescriptor::uniform(std::mem::size_of::<ObjectUniforms>() as u64)
            .with_label("objects")
            .with_capacity(4),
    )?;
    let atlas_desc = ctx
        .atlas_descriptor(128, 32, TextureFormat::R8Unorm)
        .with_label("glyphs");
    let atlas = ctx.create_atlas(&atlas_desc)?;

    let layout = BindingLayout::new()
        .with_label("object")
        .with_entry(0, BindingKind::UniformArray)
        .with_entry(1, BindingKind::CombinedImageSampler);
    let table = ctx.create_binding_table(&layout)?;
    ctx.bind(table, 0, BindResource::Array(objects))?;
    ctx.bind(table, 1, BindResource::Atlas(atlas))?;

    let mut scene: Vec<Drawable> = Vec::new();
    let spawn_every = (args.frames / args.objects.max(1)).max(1);

    for frame in 0..args.frames {
        let ctx = renderer.context_mut();
        if frame % spawn_every == 0 && (scene.len() as u32) < args.objects {
            let drawable = DrawableBuilder::new(pipeline)
                .with_label(format!("object {}", scene.len()))
                .with_vertex_count(6)
                .with_binding(table, &[(objects, SlotRequest::Allocate)])
                .build(ctx)?;
            scene.push(drawable);

            // One glyph per object
            let size = 8 + (scene.len() as u32 % 3) * 4;
            let glyph = ctx.atlas_allocate(atlas, size, size)?;
            glyph.pixels.fill(0xff);
            ctx.atlas_commit(atlas)?;
            renderer.mark_scene_changed();
        }

        let slot = renderer.current_frame();
        let time = frame as f32 / 60.0;
        let ctx = renderer.context_mut();
        for (i, drawable) in scene.iter().enumerate() {
            let Some(index) = drawable.slot(objects) else {
                continue;
            };
            let model = Mat4::from_rotation_z(time + i as f32) * Mat4::from_translation(Vec3::X);
            let uniforms = ObjectUniforms {
                model: model.to_cols_array_2d(),
            };
            ctx.write_pod(objects, slot, index, &uniforms)?;
        }

        renderer.tick(1.0 / 60.0, &scene)?;
    }

    let stats = renderer.stats();
    let ctx = renderer.context();
    log::info!(
        "Rendered {} frames ({} re-records), {} objects in {} slots, atlas {}x{}",
        stats.frames,
        stats.rerecords,
        scene.len(),
        ctx.array(objects)?.capacity(),
        ctx.atlas(atlas)?.extent().width,
        ctx.atlas(atlas)?.extent().height,
    );

    for drawable in scene {
        renderer.context_mut().release_drawable(drawable)?;
    }
    let device = renderer.shutdown()?;
    log::info!(
        "Shut down with {} buffers and {} images alive",
        device.live_buffer_count(),
        device.live_image_count()
    );
    Ok(())
}
