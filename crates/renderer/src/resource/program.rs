//! GPU programs: one shader module per stage.

use std::io::Cursor;
use std::sync::Arc;

use ash::vk;
use forge_rhi::NativeObject;
use tracing::debug;

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::{RenderError, RenderResult};

/// Entry point of every stage.
pub(crate) const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Marker for the program kind.
pub enum GpuProgram {}

#[derive(Clone, Debug)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Arc<[u32]>,
}

#[derive(Clone, Debug, Default)]
pub struct GpuProgramDesc {
    pub stages: Vec<ShaderStage>,
}

impl GpuProgramDesc {
    pub fn is_compute(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.stage == vk::ShaderStageFlags::COMPUTE)
    }
}

#[derive(Debug, Default)]
pub struct GpuProgramNative {
    pub modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

impl GpuProgramNative {
    /// Stage infos for pipeline creation.
    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'static>> {
        self.modules
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect()
    }
}

/// Decode SPIR-V bytes into words, checking size and magic number.
pub fn spirv_from_bytes(bytes: &[u8]) -> RenderResult<Arc<[u32]>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| {
        RenderError::InvalidDescription {
            kind: GpuProgram::NAME,
            name: String::from("<spirv>"),
            reason: e.to_string(),
        }
    })?;
    Ok(Arc::from(words))
}

impl ResourceKind for GpuProgram {
    type Desc = GpuProgramDesc;
    type Native = GpuProgramNative;

    const NAME: &'static str = "GpuProgram";
    const CAPACITY: usize = 1024;

    fn create_native(
        _resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &GpuProgramDesc,
    ) -> RenderResult<GpuProgramNative> {
        if desc.stages.is_empty() {
            return Err(invalid::<Self>(name, "no shader stages"));
        }
        if desc.is_compute() && desc.stages.len() > 1 {
            return Err(invalid::<Self>(name, "compute stage mixed with graphics stages"));
        }

        let mut native = GpuProgramNative::default();
        for stage in &desc.stages {
            match ctx.device.create_shader_module(&stage.code) {
                Ok(module) => native.modules.push((stage.stage, module)),
                Err(e) => {
                    // Don't leak the stages created so far.
                    Self::release_native(native, ctx);
                    return Err(e.into());
                }
            }
        }

        debug!("Created GPU program '{}' ({} stages)", name, native.modules.len());
        Ok(native)
    }

    fn release_native(native: GpuProgramNative, ctx: &mut ResourceContext<'_>) {
        for (_, module) in native.modules {
            ctx.release_queue
                .release_object(NativeObject::ShaderModule(module));
        }
    }

    resource_manager_accessors!(programs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_support::Fixture;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn test_spirv_from_bytes() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 1, 0]);
        let words = spirv_from_bytes(&bytes).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words.len(), 2);

        assert!(spirv_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_failed_stage_releases_earlier_modules() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let program = resources.create::<GpuProgram>("broken");
        resources.reset_to_default(program);
        resources.desc_mut(program).stages = vec![
            ShaderStage {
                stage: vk::ShaderStageFlags::VERTEX,
                code: Arc::from(vec![SPIRV_MAGIC]),
            },
            ShaderStage {
                stage: vk::ShaderStageFlags::FRAGMENT,
                code: Arc::from(Vec::<u32>::new()),
            },
        ];
        assert!(resources.create_resources(&mut ctx, &[program]).is_err());
        assert!(!resources.programs.has_native(program));
        assert_eq!(ctx.release_queue.len(), 1);
    }

    #[test]
    fn test_stage_infos_use_main() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let program = resources.create::<GpuProgram>("sprite");
        resources.reset_to_default(program);
        let stages = [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT];
        resources.desc_mut(program).stages = stages
            .into_iter()
            .map(|stage| ShaderStage {
                stage,
                code: Arc::from(vec![SPIRV_MAGIC]),
            })
            .collect();
        resources.create_resources(&mut ctx, &[program]).unwrap();

        let infos = resources.native(program).stage_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].p_name, ENTRY_POINT.as_ptr());
        assert_eq!(infos[1].stage, vk::ShaderStageFlags::FRAGMENT);
    }
}
