//! Uniform block layouts written into uniform memory.
//!
//! Both structs are `#[repr(C)]` and `Pod`, so they can be handed to
//! [`crate::resource::draw_call::update_uniform_memory`] or written as bytes
//! into a material block. Their sizes fit the default small block (256 bytes).

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Per-instance data, rewritten every frame.
///
/// # Memory Layout
///
/// - Offset 0: model-view-projection matrix (64 bytes)
/// - Offset 64: model matrix (64 bytes)
/// - Offset 128: tint (16 bytes)
/// - Total size: 144 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct InstanceUniforms {
    pub model_view_projection: Mat4,
    pub model: Mat4,
    pub tint: Vec4,
}

impl InstanceUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(view_projection: Mat4, model: Mat4, tint: Vec4) -> Self {
        Self {
            model_view_projection: view_projection * model,
            model,
            tint,
        }
    }
}

/// Per-material data, written once when the draw call is created.
///
/// # Memory Layout
///
/// - Offset 0: base color (16 bytes)
/// - Offset 16: roughness, metallic and two free parameters (16 bytes)
/// - Total size: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct MaterialUniforms {
    pub base_color: Vec4,
    pub params: Vec4,
}

impl MaterialUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(base_color: Vec4, roughness: f32, metallic: f32) -> Self {
        Self {
            base_color,
            params: Vec4::new(roughness, metallic, 0.0, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_instance_uniforms_size() {
        // 2 Mat4 (2 * 64) + Vec4 (16) = 144 bytes
        assert_eq!(InstanceUniforms::SIZE, 144);
        assert_eq!(std::mem::align_of::<InstanceUniforms>(), 16);
    }

    #[test]
    fn test_material_uniforms_size() {
        assert_eq!(MaterialUniforms::SIZE, 32);
    }

    #[test]
    fn test_instance_uniforms_new() {
        let view_projection = Mat4::perspective_rh(60.0_f32.to_radians(), 1.5, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let ubo = InstanceUniforms::new(view_projection, model, Vec4::ONE);

        assert_eq!(ubo.model, model);
        assert_eq!(ubo.model_view_projection, view_projection * model);
        assert_eq!(bytemuck::bytes_of(&ubo).len(), InstanceUniforms::SIZE);
    }

    #[test]
    fn test_material_params_layout() {
        let material = MaterialUniforms::new(Vec4::new(1.0, 0.5, 0.25, 1.0), 0.8, 0.1);
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&material));
        assert_eq!(&floats[4..6], &[0.8, 0.1]);
    }
}
