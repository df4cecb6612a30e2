//! Shared immutable samplers.

use std::sync::Arc;

use ash::vk;
use forge_rhi::{GpuDevice, NativeObject, RhiResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The fixed set of samplers draw calls can pick from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    LinearRepeat,
    LinearClamp,
    NearestClamp,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 3] = [
        SamplerKind::LinearRepeat,
        SamplerKind::LinearClamp,
        SamplerKind::NearestClamp,
    ];

    fn create_info(self) -> vk::SamplerCreateInfo<'static> {
        let (filter, mipmap_mode, address_mode) = match self {
            SamplerKind::LinearRepeat => (
                vk::Filter::LINEAR,
                vk::SamplerMipmapMode::LINEAR,
                vk::SamplerAddressMode::REPEAT,
            ),
            SamplerKind::LinearClamp => (
                vk::Filter::LINEAR,
                vk::SamplerMipmapMode::LINEAR,
                vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ),
            SamplerKind::NearestClamp => (
                vk::Filter::NEAREST,
                vk::SamplerMipmapMode::NEAREST,
                vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ),
        };
        vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(vk::LOD_CLAMP_NONE)
    }
}

/// Owns one sampler per [`SamplerKind`] for the lifetime of the device.
pub struct Samplers {
    device: Arc<dyn GpuDevice>,
    samplers: [vk::Sampler; SamplerKind::ALL.len()],
}

impl Samplers {
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let mut samplers = [vk::Sampler::null(); SamplerKind::ALL.len()];
        for (i, kind) in SamplerKind::ALL.into_iter().enumerate() {
            match device.create_sampler(&kind.create_info()) {
                Ok(sampler) => samplers[i] = sampler,
                Err(e) => {
                    for created in &samplers[..i] {
                        device.destroy(NativeObject::Sampler(*created));
                    }
                    return Err(e);
                }
            }
        }
        debug!("Created {} samplers", samplers.len());
        Ok(Self { device, samplers })
    }

    #[inline]
    pub fn get(&self, kind: SamplerKind) -> vk::Sampler {
        self.samplers[kind as usize]
    }
}

impl Drop for Samplers {
    fn drop(&mut self) {
        for sampler in self.samplers {
            self.device.destroy(NativeObject::Sampler(sampler));
        }
        debug!("Destroyed samplers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_rhi::headless::HeadlessDevice;

    #[test]
    fn test_each_kind_has_its_own_sampler() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let samplers = Samplers::new(device).unwrap();
        assert_ne!(
            samplers.get(SamplerKind::LinearRepeat),
            samplers.get(SamplerKind::NearestClamp)
        );
    }

    #[test]
    fn test_drop_destroys_samplers() {
        let headless = Arc::new(HeadlessDevice::new());
        drop(Samplers::new(headless.clone()).unwrap());
        let destroyed = headless.destroyed_objects();
        assert_eq!(destroyed.len(), 3);
        assert!(destroyed.iter().all(|o| matches!(o, NativeObject::Sampler(_))));
    }
}
