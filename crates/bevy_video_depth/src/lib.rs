use bevy::{
    asset::{AssetPath, RenderAssetUsages, embedded_asset, embedded_path},
    mesh::MeshVertexBufferLayoutRef,
    pbr::{Material, MaterialPipeline, MaterialPipelineKey, MaterialPlugin},
    prelude::*,
    render::render_resource::{
        AsBindGroup, Extent3d, RenderPipelineDescriptor, SpecializedMeshPipelineError,
        TextureDimension, TextureFormat,
    },
    shader::ShaderRef,
};
use burn_video_depth::{
    CameraProjection, CompositeRenderer, CompositeSnapshot, DepthField, DrawingBuffer, Frame,
};
use image::DynamicImage;

pub mod platform;

/// Side-by-side quad material: colour on the right half, depth on the left.
#[derive(Asset, TypePath, AsBindGroup, Debug, Clone, Default)]
pub struct CompositeMaterial {
    #[texture(0)]
    #[sampler(1)]
    pub color: Option<Handle<Image>>,

    #[texture(2, sample_type = "float", filterable = false)]
    #[sampler(3, sampler_type = "non_filtering")]
    pub depth: Option<Handle<Image>>,

    /// `x` set while colour is bound, `y` while depth is bound.
    #[uniform(4)]
    pub slots: Vec4,
}

impl Material for CompositeMaterial {
    fn fragment_shader() -> ShaderRef {
        let path = embedded_path!("composite.wgsl");
        ShaderRef::from(AssetPath::from_path_buf(path).with_source("embedded"))
    }

    fn alpha_mode(&self) -> AlphaMode {
        AlphaMode::Blend
    }

    fn specialize(
        _pipeline: &MaterialPipeline,
        descriptor: &mut RenderPipelineDescriptor,
        _layout: &MeshVertexBufferLayoutRef,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        // visible from both sides
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

pub struct CompositePlugin;

impl Plugin for CompositePlugin {
    fn build(&self, app: &mut App) {
        embedded_asset!(app, "composite.wgsl");
        app.add_plugins(MaterialPlugin::<CompositeMaterial>::default())
            .init_resource::<BoundTextures>();
    }
}

/// Colour texture for a decoded frame, `None` for empty frames.
pub fn color_image(frame: &Frame) -> Option<Image> {
    if frame.is_empty() {
        return None;
    }

    let rgba = DynamicImage::ImageRgb8(frame.image().clone()).to_rgba8();
    Some(Image::new(
        Extent3d {
            width: frame.width(),
            height: frame.height(),
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        rgba.into_raw(),
        TextureFormat::Rgba8UnormSrgb,
        RenderAssetUsages::RENDER_WORLD,
    ))
}

/// Single-channel 32-bit float texture holding the normalized depth.
pub fn depth_image(field: &DepthField) -> Option<Image> {
    if field.width() == 0 || field.height() == 0 {
        return None;
    }

    let data = field
        .values()
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();

    Some(Image::new(
        Extent3d {
            width: field.width() as u32,
            height: field.height() as u32,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        data,
        TextureFormat::R32Float,
        RenderAssetUsages::RENDER_WORLD,
    ))
}

/// Bridge texture ids currently bound to the quad material.
#[derive(Resource, Debug, Default)]
pub struct BoundTextures {
    color: Option<u64>,
    depth: Option<u64>,
}

/// Renders controller snapshots through the quad material and the camera
/// projection. Only re-uploads a slot when its texture id changed; the
/// superseded image handle is dropped with the old material binding.
pub struct BevyCompositeRenderer<'a> {
    pub images: &'a mut Assets<Image>,
    pub materials: &'a mut Assets<CompositeMaterial>,
    pub material: AssetId<CompositeMaterial>,
    pub projection: Option<&'a mut Projection>,
    pub bound: &'a mut BoundTextures,
}

impl CompositeRenderer for BevyCompositeRenderer<'_> {
    fn set_drawing_buffer(&mut self, _buffer: DrawingBuffer, projection: &CameraProjection) {
        if let Some(Projection::Perspective(perspective)) = self.projection.as_deref_mut() {
            perspective.fov = projection.fov_y_radians;
            perspective.aspect_ratio = projection.aspect_ratio;
            perspective.near = projection.near;
            perspective.far = projection.far;
        }
    }

    fn render(&mut self, snapshot: &CompositeSnapshot, changed: bool) {
        if !changed {
            return;
        }

        let color_id = snapshot.color.as_ref().map(|texture| texture.id());
        let depth_id = snapshot.depth.as_ref().map(|texture| texture.id());
        if color_id == self.bound.color && depth_id == self.bound.depth {
            return;
        }

        let Some(material) = self.materials.get_mut(self.material) else {
            return;
        };

        if color_id != self.bound.color {
            material.color = snapshot
                .color
                .as_ref()
                .and_then(|texture| color_image(texture.frame()))
                .map(|image| self.images.add(image));
            self.bound.color = color_id;
        }

        if depth_id != self.bound.depth {
            material.depth = snapshot
                .depth
                .as_ref()
                .and_then(|texture| depth_image(texture.field()))
                .map(|image| self.images.add(image));
            self.bound.depth = depth_id;
        }

        material.slots = Vec4::new(
            if material.color.is_some() { 1.0 } else { 0.0 },
            if material.depth.is_some() { 1.0 } else { 0.0 },
            0.0,
            0.0,
        );
    }
}
