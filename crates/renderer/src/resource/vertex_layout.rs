//! Vertex input layouts.
//!
//! A layout owns no device objects; "creating" it validates the description
//! so pipelines can rely on it.

use forge_rhi::state::VertexFormat;
use forge_rhi::vk;
use serde::{Deserialize, Serialize};

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::RenderResult;

/// Marker for the vertex layout kind.
pub enum VertexLayout {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexBinding {
    pub stride: u32,
    #[serde(default)]
    pub per_instance: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexLayoutDesc {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayoutDesc {
    /// One interleaved per-vertex binding with consecutive locations.
    pub fn packed(formats: &[VertexFormat]) -> Self {
        let mut offset = 0;
        let attributes = formats
            .iter()
            .enumerate()
            .map(|(location, &format)| {
                let attribute = VertexAttribute {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();
        Self {
            bindings: vec![VertexBinding {
                stride: offset,
                per_instance: false,
            }],
            attributes,
        }
    }

    pub fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(i, b)| vk::VertexInputBindingDescription {
                binding: i as u32,
                stride: b.stride,
                input_rate: if b.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect()
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format.to_vk(),
                offset: a.offset,
            })
            .collect()
    }
}

impl ResourceKind for VertexLayout {
    type Desc = VertexLayoutDesc;
    type Native = ();

    const NAME: &'static str = "VertexLayout";
    const CAPACITY: usize = 8;

    fn create_native(
        _resources: &Resources,
        _ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &VertexLayoutDesc,
    ) -> RenderResult<()> {
        for attribute in &desc.attributes {
            let Some(binding) = desc.bindings.get(attribute.binding as usize) else {
                return Err(invalid::<Self>(
                    name,
                    format!(
                        "attribute {} uses missing binding {}",
                        attribute.location, attribute.binding
                    ),
                ));
            };
            if attribute.offset + attribute.format.size() > binding.stride {
                return Err(invalid::<Self>(
                    name,
                    format!(
                        "attribute {} overruns the stride of binding {}",
                        attribute.location, attribute.binding
                    ),
                ));
            }
        }
        Ok(())
    }

    fn release_native(_native: (), _ctx: &mut ResourceContext<'_>) {}

    resource_manager_accessors!(vertex_layouts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_support::Fixture;

    #[test]
    fn test_packed_layout() {
        let desc = VertexLayoutDesc::packed(&[
            VertexFormat::Float3,
            VertexFormat::Float2,
            VertexFormat::UByte4Norm,
        ]);
        assert_eq!(desc.bindings[0].stride, 24);
        let attributes = desc.attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].location, 2);
        assert_eq!(attributes[2].format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_layout_from_json() {
        let desc: VertexLayoutDesc = serde_json::from_str(
            r#"{
                "bindings": [{ "stride": 16 }, { "stride": 64, "per_instance": true }],
                "attributes": [
                    { "location": 0, "binding": 0, "format": "float4", "offset": 0 },
                    { "location": 1, "binding": 1, "format": "float4", "offset": 48 }
                ]
            }"#,
        )
        .unwrap();
        let bindings = desc.binding_descriptions();
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
    }

    #[test]
    fn test_missing_binding_is_rejected() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let layout = resources.create::<VertexLayout>("bad");
        resources.reset_to_default(layout);
        resources.desc_mut(layout).attributes.push(VertexAttribute {
            location: 0,
            binding: 3,
            format: VertexFormat::Float,
            offset: 0,
        });
        let err = resources.create_resources(&mut ctx, &[layout]).unwrap_err();
        assert!(err.to_string().contains("missing binding 3"));
    }
}
