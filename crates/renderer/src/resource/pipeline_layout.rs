//! Pipeline layouts with a single descriptor set.

use ash::vk;
use forge_rhi::NativeObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::RenderResult;

/// Marker for the pipeline layout kind.
pub enum PipelineLayout {}

/// What a binding slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// A block of the per-instance buffer, addressed by dynamic offset.
    InstanceUniform {
        #[serde(default)]
        large: bool,
    },
    /// The draw call's block in the per-material buffer.
    MaterialUniform,
    SampledImage,
    StorageBuffer,
    StorageImage,
}

impl DescriptorKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::InstanceUniform { .. } => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorKind::MaterialUniform => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    #[serde(skip, default = "all_graphics")]
    pub stages: vk::ShaderStageFlags,
}

fn all_graphics() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::ALL_GRAPHICS
}

impl DescriptorBinding {
    pub fn new(binding: u32, kind: DescriptorKind, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind,
            stages,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PipelineLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

impl PipelineLayoutDesc {
    /// The per-instance binding, if any.
    pub fn instance_binding(&self) -> Option<&DescriptorBinding> {
        self.bindings
            .iter()
            .find(|b| matches!(b.kind, DescriptorKind::InstanceUniform { .. }))
    }

    pub fn binding_of(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

#[derive(Debug, Default)]
pub struct PipelineLayoutNative {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
}

impl ResourceKind for PipelineLayout {
    type Desc = PipelineLayoutDesc;
    type Native = PipelineLayoutNative;

    const NAME: &'static str = "PipelineLayout";
    const CAPACITY: usize = 1024;

    fn create_native(
        _resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &PipelineLayoutDesc,
    ) -> RenderResult<PipelineLayoutNative> {
        let instance_bindings = desc
            .bindings
            .iter()
            .filter(|b| matches!(b.kind, DescriptorKind::InstanceUniform { .. }))
            .count();
        if instance_bindings > 1 {
            return Err(invalid::<Self>(name, "more than one instance uniform binding"));
        }
        let material_bindings = desc
            .bindings
            .iter()
            .filter(|b| b.kind == DescriptorKind::MaterialUniform)
            .count();
        if material_bindings > 1 {
            return Err(invalid::<Self>(name, "more than one material uniform binding"));
        }
        for (i, binding) in desc.bindings.iter().enumerate() {
            if desc.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(invalid::<Self>(
                    name,
                    format!("binding {} declared twice", binding.binding),
                ));
            }
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let set_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = ctx.device.create_descriptor_set_layout(&set_info)?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match ctx.device.create_pipeline_layout(&layout_info) {
            Ok(layout) => layout,
            Err(e) => {
                ctx.release_queue
                    .release_object(NativeObject::DescriptorSetLayout(set_layout));
                return Err(e.into());
            }
        };

        debug!("Created pipeline layout '{}' ({} bindings)", name, bindings.len());
        Ok(PipelineLayoutNative { set_layout, layout })
    }

    fn release_native(native: PipelineLayoutNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue
            .release_object(NativeObject::PipelineLayout(native.layout));
        ctx.release_queue
            .release_object(NativeObject::DescriptorSetLayout(native.set_layout));
    }

    resource_manager_accessors!(pipeline_layouts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_support::Fixture;

    #[test]
    fn test_descriptor_types() {
        assert_eq!(
            DescriptorKind::InstanceUniform { large: true }.descriptor_type(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            DescriptorKind::SampledImage.descriptor_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn test_binding_from_json_defaults_to_graphics_stages() {
        let binding: DescriptorBinding =
            serde_json::from_str(r#"{ "binding": 0, "kind": { "instance_uniform": {} } }"#)
                .unwrap();
        assert_eq!(binding.kind, DescriptorKind::InstanceUniform { large: false });
        assert_eq!(binding.stages, vk::ShaderStageFlags::ALL_GRAPHICS);
    }

    #[test]
    fn test_duplicate_instance_binding_is_rejected() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let layout = resources.create::<PipelineLayout>("twice");
        resources.reset_to_default(layout);
        let stages = vk::ShaderStageFlags::VERTEX;
        resources.desc_mut(layout).bindings = vec![
            DescriptorBinding::new(0, DescriptorKind::InstanceUniform { large: false }, stages),
            DescriptorBinding::new(1, DescriptorKind::InstanceUniform { large: true }, stages),
        ];
        assert!(resources.create_resources(&mut ctx, &[layout]).is_err());
    }

    #[test]
    fn test_release_queues_both_objects() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let layout = resources.create::<PipelineLayout>("mesh");
        resources.reset_to_default(layout);
        resources.desc_mut(layout).bindings = vec![
            DescriptorBinding::new(
                0,
                DescriptorKind::InstanceUniform { large: false },
                vk::ShaderStageFlags::VERTEX,
            ),
            DescriptorBinding::new(
                1,
                DescriptorKind::SampledImage,
                vk::ShaderStageFlags::FRAGMENT,
            ),
        ];
        resources.create_resources(&mut ctx, &[layout]).unwrap();
        resources.destroy_resources(&mut ctx, &[layout]);
        assert_eq!(ctx.release_queue.len(), 2);
    }
}
