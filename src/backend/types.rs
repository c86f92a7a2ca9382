//! Common types shared between backends

use std::hash::{Hash, Hasher};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth24Plus
                | TextureFormat::Depth24PlusStencil8
                | TextureFormat::Depth32Float
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const INDEX: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture descriptor. `layers > 1` creates a 2D array texture.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            layers: 1,
            mip_levels: 1,
            sample_count: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

/// Which part of a texture a view covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureViewDimension {
    /// A single layer, used as an attachment or a plain 2D texture
    Layer(u32),
    /// All layers as a 2D array
    Array,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureViewDescriptor {
    pub dimension: TextureViewDimension,
}

impl Default for TextureViewDescriptor {
    fn default() -> Self {
        Self {
            dimension: TextureViewDimension::Layer(0),
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float32x2 | VertexFormat::Sint32x2 => 8,
            VertexFormat::Float32x3 | VertexFormat::Sint32x3 => 12,
            VertexFormat::Float32x4 | VertexFormat::Sint32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Interleaved vertex buffer layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn is_line(&self) -> bool {
        matches!(self, PrimitiveTopology::LineList | PrimitiveTopology::LineStrip)
    }

    /// Number of triangles produced by `count` vertices or indices.
    pub fn triangle_count(&self, count: u32) -> u32 {
        match self {
            PrimitiveTopology::TriangleList => count / 3,
            PrimitiveTopology::TriangleStrip => count.saturating_sub(2),
            _ => 0,
        }
    }
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Face culling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CullFace {
    #[default]
    Back,
    Front,
    None,
}

/// Compare function for depth/stencil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Stencil operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
    IncrementWrap,
    DecrementWrap,
}

/// Stencil test configuration for one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare: CompareFunction,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub fail_op: StencilOperation,
    pub depth_fail_op: StencilOperation,
    pub pass_op: StencilOperation,
}

/// Depth bias applied while polygon offset is enabled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

impl Eq for PolygonOffset {}

impl Hash for PolygonOffset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.factor.to_bits().hash(state);
        self.units.to_bits().hash(state);
    }
}

/// Alpha-to-coverage with an explicit sample coverage value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleCoverage {
    pub value: f32,
    pub invert: bool,
}

impl SampleCoverage {
    /// Sample mask equivalent of the coverage value for `sample_count` samples.
    pub fn mask(&self, sample_count: u32) -> u64 {
        let samples = sample_count.clamp(1, 64);
        let covered = (self.value.clamp(0.0, 1.0) * samples as f32).round() as u32;
        let all = if samples == 64 { u64::MAX } else { (1u64 << samples) - 1 };
        let mask = if covered >= 64 { u64::MAX } else { (1u64 << covered) - 1 };
        if self.invert {
            !mask & all
        } else {
            mask & all
        }
    }
}

impl Eq for SampleCoverage {}

impl Hash for SampleCoverage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.to_bits().hash(state);
        self.invert.hash(state);
    }
}

/// A single GL-style state toggle. Backends fold these into a [`PipelineState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    DepthTest(bool),
    DepthFunc(CompareFunction),
    DepthMask(bool),
    ColorMask(bool),
    CullFace(CullFace),
    FrontFace(FrontFace),
    Blend(bool),
    BlendFunc(BlendFactor, BlendFactor),
    PolygonOffset(Option<PolygonOffset>),
    Stencil(Option<StencilState>),
    AlphaToCoverage(Option<SampleCoverage>),
    LineWidth(f32),
    Topology(PrimitiveTopology),
}

/// Accumulated fixed-function state. Explicit backends bake it into pipelines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineState {
    pub depth_test: bool,
    pub depth_compare: CompareFunction,
    pub depth_write: bool,
    pub color_write: bool,
    pub cull_face: CullFace,
    pub front_face: FrontFace,
    pub blend: bool,
    pub blend_src: BlendFactor,
    pub blend_dst: BlendFactor,
    pub polygon_offset: Option<PolygonOffset>,
    pub stencil: Option<StencilState>,
    pub alpha_to_coverage: Option<SampleCoverage>,
    pub line_width: f32,
    pub topology: PrimitiveTopology,
}

impl Default for PipelineState {
    /// Baseline state every camera render starts from.
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_compare: CompareFunction::LessEqual,
            depth_write: true,
            color_write: true,
            cull_face: CullFace::Back,
            front_face: FrontFace::Ccw,
            blend: true,
            blend_src: BlendFactor::One,
            blend_dst: BlendFactor::OneMinusSrcAlpha,
            polygon_offset: None,
            stencil: None,
            alpha_to_coverage: None,
            line_width: 1.0,
            topology: PrimitiveTopology::TriangleList,
        }
    }
}

impl PipelineState {
    pub fn apply(&mut self, change: StateChange) {
        match change {
            StateChange::DepthTest(enabled) => self.depth_test = enabled,
            StateChange::DepthFunc(func) => self.depth_compare = func,
            StateChange::DepthMask(enabled) => self.depth_write = enabled,
            StateChange::ColorMask(enabled) => self.color_write = enabled,
            StateChange::CullFace(face) => self.cull_face = face,
            StateChange::FrontFace(face) => self.front_face = face,
            StateChange::Blend(enabled) => self.blend = enabled,
            StateChange::BlendFunc(src, dst) => {
                self.blend_src = src;
                self.blend_dst = dst;
            }
            StateChange::PolygonOffset(offset) => self.polygon_offset = offset,
            StateChange::Stencil(stencil) => self.stencil = stencil,
            StateChange::AlphaToCoverage(coverage) => self.alpha_to_coverage = coverage,
            StateChange::LineWidth(width) => self.line_width = width,
            StateChange::Topology(topology) => self.topology = topology,
        }
    }
}

impl Eq for PipelineState {}

impl Hash for PipelineState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_test.hash(state);
        self.depth_compare.hash(state);
        self.depth_write.hash(state);
        self.color_write.hash(state);
        self.cull_face.hash(state);
        self.front_face.hash(state);
        self.blend.hash(state);
        self.blend_src.hash(state);
        self.blend_dst.hash(state);
        self.polygon_offset.hash(state);
        self.stencil.hash(state);
        self.alpha_to_coverage.hash(state);
        self.line_width.to_bits().hash(state);
        self.topology.hash(state);
    }
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler descriptor
#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            compare: None,
        }
    }
}

/// Size, format and sample count of one framebuffer attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub sample_count: u32,
}

/// Completeness check shared by all backends, returning the reason on failure.
pub fn check_framebuffer_complete(
    color: Option<AttachmentInfo>,
    depth_stencil: Option<AttachmentInfo>,
) -> Result<(), String> {
    match (color, depth_stencil) {
        (None, None) => Err("missing attachment".to_string()),
        (Some(c), _) if c.format.is_depth() => {
            Err(format!("color attachment has depth format {:?}", c.format))
        }
        (_, Some(d)) if !d.format.is_depth() => {
            Err(format!("depth attachment has color format {:?}", d.format))
        }
        (Some(c), Some(d)) if c.width != d.width || c.height != d.height => Err(format!(
            "attachment dimensions differ ({}x{} vs {}x{})",
            c.width, c.height, d.width, d.height
        )),
        (Some(c), Some(d)) if c.sample_count != d.sample_count => Err(format!(
            "attachment sample counts differ ({} vs {})",
            c.sample_count, d.sample_count
        )),
        (Some(a), _) | (None, Some(a)) if a.width == 0 || a.height == 0 => {
            Err("zero-sized attachment".to_string())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_coverage_mask() {
        let half = SampleCoverage { value: 0.5, invert: false };
        assert_eq!(half.mask(4), 0b0011);
        let inverted = SampleCoverage { value: 0.5, invert: true };
        assert_eq!(inverted.mask(4), 0b1100);
        let full = SampleCoverage { value: 1.0, invert: false };
        assert_eq!(full.mask(1), 1);
    }

    #[test]
    fn test_pipeline_state_apply() {
        let mut state = PipelineState::default();
        state.apply(StateChange::DepthTest(false));
        state.apply(StateChange::BlendFunc(BlendFactor::SrcAlpha, BlendFactor::One));
        assert!(!state.depth_test);
        assert_eq!(state.blend_src, BlendFactor::SrcAlpha);
        state.apply(StateChange::DepthTest(true));
        state.apply(StateChange::BlendFunc(BlendFactor::One, BlendFactor::OneMinusSrcAlpha));
        assert_eq!(state, PipelineState::default());
    }

    #[test]
    fn test_framebuffer_completeness() {
        let color = AttachmentInfo {
            width: 64,
            height: 64,
            format: TextureFormat::Rgba8Unorm,
            sample_count: 1,
        };
        let depth = AttachmentInfo {
            format: TextureFormat::Depth24Plus,
            ..color
        };
        assert!(check_framebuffer_complete(Some(color), Some(depth)).is_ok());
        assert!(check_framebuffer_complete(None, Some(depth)).is_ok());
        assert!(check_framebuffer_complete(None, None).is_err());

        let small_depth = AttachmentInfo { width: 32, ..depth };
        assert!(check_framebuffer_complete(Some(color), Some(small_depth)).is_err());
        assert!(check_framebuffer_complete(Some(depth), None).is_err());
    }
}
