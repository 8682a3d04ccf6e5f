// Graphics pipeline - immutable once built, swapped atomically.
//
// A pipeline bakes the swapchain extent into its viewport, so it is a
// child of the swapchain and is rebuilt alongside it. Callers hold the
// current pipeline through `PipelineSlot`, which hands out `Arc` clones
// so an in-flight frame keeps its pipeline alive across a swap.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use crate::core::{DrawUniforms, Vertex2D};
use crate::ownership::ChildResource;
use crate::vulkan::shader::Shader;
use crate::vulkan::swapchain::Swapchain;

/// Holder for the active pipeline. Readers get an `Arc` snapshot; a store
/// replaces the slot without touching pipelines still referenced by
/// in-flight frames.
pub struct PipelineSlot<T> {
    current: Mutex<Option<Arc<T>>>,
}

impl<T> PipelineSlot<T> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub fn store(&self, value: Arc<T>) {
        *self.current.lock() = Some(value);
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.current.lock().clone()
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }
}

impl<T> Default for PipelineSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    // Registration order pass -> layout -> pipeline; the reverse-order
    // cascade and the field drop order both destroy the pipeline first.
    _pipeline_child: ChildResource<Swapchain>,
    _layout_child: ChildResource<Swapchain>,
    _pass_child: ChildResource<Swapchain>,
}

impl GraphicsPipeline {
    /// Builds a pipeline drawing alpha-blended triangle lists of
    /// [`Vertex2D`] into the swapchain's color attachment.
    pub fn new(
        swapchain: &Swapchain,
        device: &ash::Device,
        vertex_shader: &Shader,
        fragment_shader: &Shader,
    ) -> Result<Self> {
        let render_pass = Self::create_render_pass(device, swapchain.format)?;
        // Each handle gets its guard as soon as it exists, so a failure in
        // any later step unwinds through the guards already registered
        // instead of leaking the earlier handles.
        let pass_child = {
            let raw_device = device.clone();
            swapchain.children.register(move || unsafe {
                raw_device.destroy_render_pass(render_pass, None);
            })
        };

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(size_of::<DrawUniforms>() as u32)
            .build();

        let push_constant_ranges = [push_constant_range];
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let layout_child = {
            let raw_device = device.clone();
            swapchain.children.register(move || unsafe {
                raw_device.destroy_pipeline_layout(layout, None);
            })
        };

        let shader_stages = [vertex_shader.stage_info(), fragment_shader.stage_info()];

        let binding_descriptions = [vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex2D>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()];

        let attribute_descriptions = [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex2D, position) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(offset_of!(Vertex2D, color) as u32)
                .build(),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let extent = swapchain.extent;
        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()];

        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipeline = unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info.build()],
                None,
            )
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?[0];

        let pipeline_child = {
            let raw_device = device.clone();
            swapchain.children.register(move || unsafe {
                raw_device.destroy_pipeline(pipeline, None);
            })
        };

        Ok(Self {
            pipeline,
            layout,
            render_pass,
            extent,
            _pipeline_child: pipeline_child,
            _layout_child: layout_child,
            _pass_child: pass_child,
        })
    }

    fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_refs = [color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build();

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn slot_starts_empty() {
        let slot: PipelineSlot<u32> = PipelineSlot::new();
        assert!(slot.load().is_none());
    }

    #[test]
    fn store_replaces_but_readers_keep_their_snapshot() {
        let slot = PipelineSlot::new();
        slot.store(Arc::new("first"));

        let snapshot = slot.load().unwrap();
        slot.store(Arc::new("second"));

        // The old snapshot is unaffected by the swap.
        assert_eq!(*snapshot, "first");
        assert_eq!(*slot.load().unwrap(), "second");
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = PipelineSlot::new();
        slot.store(Arc::new(7u32));
        slot.clear();
        assert!(slot.load().is_none());
    }

    #[test]
    fn concurrent_loads_and_stores_always_see_whole_values() {
        let slot = Arc::new(PipelineSlot::new());
        slot.store(Arc::new(0u64));

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for i in 1..=1000u64 {
                    slot.store(Arc::new(i));
                }
            })
        };

        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut last = 0u64;
                for _ in 0..1000 {
                    let value = *slot.load().unwrap();
                    // Values only move forward; no torn or stale-after-new reads.
                    assert!(value >= last);
                    last = value;
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
