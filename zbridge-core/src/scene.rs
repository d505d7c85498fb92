use std::collections::HashMap;

use glam::{DAffine3, DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::geometry::{Point3, Range3, Vector3};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:X}", self.0)
            }
        }
    };
}

id_type!(EntityId);
id_type!(LayerId);
id_type!(
    /// 块定义标识；模型空间本身也是一个块。
    BlockId
);
id_type!(LinetypeId);
id_type!(MaterialId);

/// 三态符号属性：绝对值、随容器（图层）、随引用（实例化父级）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbology<T> {
    Absolute(T),
    ByContainer,
    ByReference,
}

impl<T> Default for Symbology<T> {
    fn default() -> Self {
        Symbology::ByContainer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Indexed(u8),
    Rgb { r: u8, g: u8, b: u8 },
}

impl Color {
    pub const BLACK: Color = Color::Rgb { r: 0, g: 0, b: 0 };
    pub const WHITE: Color = Color::Indexed(7);
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

/// 线宽，单位 0.01 mm。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineWeight(pub u16);

impl LineWeight {
    pub const ZERO: LineWeight = LineWeight(0);
}

/// 透明度，0 为不透明，1 为全透明。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transparency(pub f64);

impl Transparency {
    pub const OPAQUE: Transparency = Transparency(0.0);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub name: String,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub off: bool,
    /// 保留的“随块”图层（通常为 0 层），其属性值视为随引用。
    #[serde(default)]
    pub passthrough: bool,
    /// 不打印的定义点图层。
    #[serde(default)]
    pub non_plot: bool,
    #[serde(default)]
    pub color: Color,
    #[serde(default)]
    pub linetype: Option<LinetypeId>,
    #[serde(default)]
    pub weight: LineWeight,
    #[serde(default)]
    pub material: Option<MaterialId>,
    #[serde(default)]
    pub transparency: Transparency,
}

impl LayerRecord {
    pub fn new(id: LayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            frozen: false,
            off: false,
            passthrough: false,
            non_plot: false,
            color: Color::default(),
            linetype: None,
            weight: LineWeight::ZERO,
            material: None,
            transparency: Transparency::OPAQUE,
        }
    }

    #[inline]
    pub fn is_displayed(&self) -> bool {
        !self.frozen && !self.off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: BlockId,
    pub name: String,
    /// 匿名块（如标注、阵列生成的块）不参与共享部件。
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default = "BlockDefinition::default_base_point")]
    pub base_point: Point3,
    #[serde(default)]
    pub children: Vec<EntityId>,
}

impl BlockDefinition {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            anonymous: name.starts_with('*'),
            name,
            base_point: Self::default_base_point(),
            children: Vec::new(),
        }
    }

    fn default_base_point() -> Point3 {
        Point3::new(0.0, 0.0, 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReference {
    pub block: BlockId,
    pub transform: DAffine3,
    /// 跟随块参照绘制的属性实体。
    #[serde(default)]
    pub attributes: Vec<DrawableEntity>,
    /// 块坐标系下的空间过滤范围。
    #[serde(default)]
    pub clip: Option<Range3>,
}

impl BlockReference {
    pub fn new(block: BlockId, transform: DAffine3) -> Self {
        Self {
            block,
            transform,
            attributes: Vec::new(),
            clip: None,
        }
    }

    /// 以插入点、绕 Z 轴旋转角与三轴比例构造块参照。
    pub fn placed(block: BlockId, insert: Point3, rotation: f64, scale: Vector3) -> Self {
        let transform = DAffine3::from_scale_rotation_translation(
            scale.as_vec3(),
            DQuat::from_rotation_z(rotation),
            insert.as_vec3(),
        );
        Self::new(block, transform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolylineVertex {
    pub position: Point3,
    #[serde(default)]
    pub bulge: f64,
}

impl PolylineVertex {
    pub fn new(position: Point3) -> Self {
        Self {
            position,
            bulge: 0.0,
        }
    }

    pub fn with_bulge(position: Point3, bulge: f64) -> Self {
        Self { position, bulge }
    }
}

/// 网格/壳体的面、边颜色覆盖。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorOverrides {
    #[serde(default)]
    pub face_colors: Vec<Color>,
    #[serde(default)]
    pub edge_colors: Vec<Color>,
}

fn default_normal() -> Vector3 {
    Vector3::unit_z()
}

/// 实体绘制时回调的图元种类。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Primitive {
    Line {
        start: Point3,
        end: Point3,
    },
    Polyline {
        vertices: Vec<PolylineVertex>,
        #[serde(default)]
        closed: bool,
        #[serde(default = "default_normal")]
        normal: Vector3,
    },
    Circle {
        center: Point3,
        radius: f64,
        #[serde(default = "default_normal")]
        normal: Vector3,
    },
    Arc {
        center: Point3,
        radius: f64,
        #[serde(default = "default_normal")]
        normal: Vector3,
        start_angle: f64,
        sweep_angle: f64,
    },
    /// 实心填充多边形（SOLID/TRACE）。
    Polygon {
        points: Vec<Point3>,
    },
    Mesh {
        rows: usize,
        columns: usize,
        points: Vec<Point3>,
        #[serde(default)]
        overrides: ColorOverrides,
    },
    Shell {
        points: Vec<Point3>,
        faces: Vec<i32>,
        #[serde(default)]
        edge_visibility: Option<Vec<bool>>,
        #[serde(default)]
        overrides: ColorOverrides,
    },
    Text {
        position: Point3,
        content: String,
        height: f64,
        #[serde(default)]
        rotation: f64,
    },
    Xline {
        base: Point3,
        through: Point3,
    },
    Ray {
        origin: Point3,
        through: Point3,
    },
    RowOfDots {
        count: usize,
        start: Point3,
        step: Vector3,
    },
    /// 世界坐标线段，不受块变换栈影响。
    WorldLine {
        start: Point3,
        end: Point3,
    },
    Point {
        position: Point3,
    },
    Unsupported {
        kind: String,
    },
}

/// 图元访问者。未覆盖的方法统一落到 `unsupported`。
pub trait PrimitiveVisitor {
    fn unsupported(&mut self, kind: &str);

    fn line(&mut self, _start: Point3, _end: Point3) {
        self.unsupported("line");
    }

    fn polyline(&mut self, _vertices: &[PolylineVertex], _closed: bool, _normal: Vector3) {
        self.unsupported("polyline");
    }

    fn circle(&mut self, _center: Point3, _radius: f64, _normal: Vector3) {
        self.unsupported("circle");
    }

    fn arc(&mut self, _center: Point3, _radius: f64, _normal: Vector3, _start: f64, _sweep: f64) {
        self.unsupported("arc");
    }

    fn polygon(&mut self, _points: &[Point3]) {
        self.unsupported("polygon");
    }

    fn mesh(&mut self, _rows: usize, _columns: usize, _points: &[Point3], _overrides: &ColorOverrides) {
        self.unsupported("mesh");
    }

    fn shell(
        &mut self,
        _points: &[Point3],
        _faces: &[i32],
        _edge_visibility: Option<&[bool]>,
        _overrides: &ColorOverrides,
    ) {
        self.unsupported("shell");
    }

    fn text(&mut self, _position: Point3, _content: &str, _height: f64, _rotation: f64) {
        self.unsupported("text");
    }

    fn xline(&mut self, _base: Point3, _through: Point3) {
        self.unsupported("xline");
    }

    fn ray(&mut self, _origin: Point3, _through: Point3) {
        self.unsupported("ray");
    }

    fn row_of_dots(&mut self, _count: usize, _start: Point3, _step: Vector3) {
        self.unsupported("row_of_dots");
    }

    fn world_line(&mut self, _start: Point3, _end: Point3) {
        self.unsupported("world_line");
    }

    fn point(&mut self, _position: Point3) {
        self.unsupported("point");
    }
}

impl Primitive {
    pub fn accept<V: PrimitiveVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            Primitive::Line { start, end } => visitor.line(*start, *end),
            Primitive::Polyline {
                vertices,
                closed,
                normal,
            } => visitor.polyline(vertices, *closed, *normal),
            Primitive::Circle {
                center,
                radius,
                normal,
            } => visitor.circle(*center, *radius, *normal),
            Primitive::Arc {
                center,
                radius,
                normal,
                start_angle,
                sweep_angle,
            } => visitor.arc(*center, *radius, *normal, *start_angle, *sweep_angle),
            Primitive::Polygon { points } => visitor.polygon(points),
            Primitive::Mesh {
                rows,
                columns,
                points,
                overrides,
            } => visitor.mesh(*rows, *columns, points, overrides),
            Primitive::Shell {
                points,
                faces,
                edge_visibility,
                overrides,
            } => visitor.shell(points, faces, edge_visibility.as_deref(), overrides),
            Primitive::Text {
                position,
                content,
                height,
                rotation,
            } => visitor.text(*position, content, *height, *rotation),
            Primitive::Xline { base, through } => visitor.xline(*base, *through),
            Primitive::Ray { origin, through } => visitor.ray(*origin, *through),
            Primitive::RowOfDots { count, start, step } => visitor.row_of_dots(*count, *start, *step),
            Primitive::WorldLine { start, end } => visitor.world_line(*start, *end),
            Primitive::Point { position } => visitor.point(*position),
            Primitive::Unsupported { kind } => visitor.unsupported(kind),
        }
    }

    /// 图元定义点的粗略范围，用于空间过滤。无限线与无法估计的图元返回 `None`。
    pub fn range(&self) -> Option<Range3> {
        let points = |pts: &[Point3]| Range3::from_points(pts.iter().map(|p| p.as_vec3()));
        let range = match self {
            Primitive::Line { start, end } | Primitive::WorldLine { start, end } => {
                points(&[*start, *end])
            }
            Primitive::Polyline { vertices, .. } => {
                Range3::from_points(vertices.iter().map(|v| v.position.as_vec3()))
            }
            Primitive::Circle { center, radius, .. } | Primitive::Arc { center, radius, .. } => {
                let c = center.as_vec3();
                Range3::new(c - DVec3::splat(radius.abs()), c + DVec3::splat(radius.abs()))
            }
            Primitive::Polygon { points: pts }
            | Primitive::Mesh { points: pts, .. }
            | Primitive::Shell { points: pts, .. } => points(pts),
            Primitive::Text { position, .. } | Primitive::Point { position } => points(&[*position]),
            Primitive::RowOfDots { count, start, step } => {
                let last = start.as_vec3() + step.as_vec3() * count.saturating_sub(1) as f64;
                Range3::from_points([start.as_vec3(), last])
            }
            Primitive::Xline { .. } | Primitive::Ray { .. } | Primitive::Unsupported { .. } => {
                return None;
            }
        };
        (!range.is_empty()).then_some(range)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    Primitives { primitives: Vec<Primitive> },
    BlockReference(BlockReference),
    /// 标注：由匿名块承载几何。
    Dimension(BlockReference),
}

impl EntityKind {
    pub fn block_reference(&self) -> Option<&BlockReference> {
        match self {
            EntityKind::BlockReference(reference) | EntityKind::Dimension(reference) => {
                Some(reference)
            }
            EntityKind::Primitives { .. } => None,
        }
    }
}

fn default_linetype_scale() -> f64 {
    1.0
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawableEntity {
    pub id: EntityId,
    pub layer: LayerId,
    /// 独立转换时用于解析“随引用”属性的模板父实体。
    #[serde(default)]
    pub symbology_parent: Option<EntityId>,
    #[serde(default)]
    pub color: Symbology<Color>,
    #[serde(default)]
    pub linetype: Symbology<Option<LinetypeId>>,
    #[serde(default)]
    pub material: Symbology<Option<MaterialId>>,
    #[serde(default)]
    pub weight: Symbology<LineWeight>,
    #[serde(default)]
    pub transparency: Symbology<Transparency>,
    #[serde(default = "default_linetype_scale")]
    pub linetype_scale: f64,
    #[serde(default)]
    pub thickness: f64,
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// 带有非几何附加数据（扩展数据等），即使没有几何也要保留占位元素。
    #[serde(default)]
    pub attached_data: bool,
    pub kind: EntityKind,
}

impl DrawableEntity {
    pub fn new(id: EntityId, layer: LayerId, kind: EntityKind) -> Self {
        Self {
            id,
            layer,
            symbology_parent: None,
            color: Symbology::ByContainer,
            linetype: Symbology::ByContainer,
            material: Symbology::ByContainer,
            weight: Symbology::ByContainer,
            transparency: Symbology::ByContainer,
            linetype_scale: default_linetype_scale(),
            thickness: 0.0,
            visible: true,
            attached_data: false,
            kind,
        }
    }

    pub fn with_primitives(id: EntityId, layer: LayerId, primitives: Vec<Primitive>) -> Self {
        Self::new(id, layer, EntityKind::Primitives { primitives })
    }

    pub fn with_color(mut self, color: Symbology<Color>) -> Self {
        self.color = color;
        self
    }

    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    pub fn is_dimension(&self) -> bool {
        matches!(self.kind, EntityKind::Dimension(_))
    }

    /// 块参照是否带属性（需要占位宿主元素）。
    pub fn hosts_attached_data(&self) -> bool {
        self.attached_data
            || self
                .kind
                .block_reference()
                .is_some_and(|reference| !reference.attributes.is_empty())
    }

    pub fn range(&self) -> Option<Range3> {
        match &self.kind {
            EntityKind::Primitives { primitives } => {
                let mut range = Range3::empty();
                for primitive in primitives {
                    range.include_range(&primitive.range()?);
                }
                (!range.is_empty()).then_some(range)
            }
            EntityKind::BlockReference(_) | EntityKind::Dimension(_) => None,
        }
    }
}

/// 源场景读取接口：实体属性、图层查找、块子实体的有序遍历。
pub trait SceneReader {
    fn model_space(&self) -> BlockId;
    fn passthrough_layer(&self) -> LayerId;
    fn layer(&self, id: LayerId) -> Option<&LayerRecord>;
    fn block(&self, id: BlockId) -> Option<&BlockDefinition>;
    fn entity(&self, id: EntityId) -> Option<&DrawableEntity>;
    fn has_linetype(&self, id: LinetypeId) -> bool;
    fn has_material(&self, id: MaterialId) -> bool;

    fn block_children(&self, id: BlockId) -> &[EntityId] {
        self.block(id)
            .map(|block| block.children.as_slice())
            .unwrap_or(&[])
    }

    /// 模型空间下的顶层实体。
    fn top_level(&self) -> &[EntityId] {
        self.block_children(self.model_space())
    }
}

const MODEL_SPACE_ID: u64 = 0;
const PASSTHROUGH_LAYER_ID: u64 = 0;

/// 常驻内存的源场景。
#[derive(Debug, Clone)]
pub struct Scene {
    model_space: BlockId,
    passthrough_layer: LayerId,
    layers: HashMap<LayerId, LayerRecord>,
    blocks: HashMap<BlockId, BlockDefinition>,
    entities: HashMap<EntityId, DrawableEntity>,
    linetypes: HashMap<LinetypeId, String>,
    materials: HashMap<MaterialId, String>,
}

impl Scene {
    pub fn new() -> Self {
        let model_space = BlockId::new(MODEL_SPACE_ID);
        let passthrough_layer = LayerId::new(PASSTHROUGH_LAYER_ID);

        let mut layer0 = LayerRecord::new(passthrough_layer, "0");
        layer0.passthrough = true;
        layer0.color = Color::WHITE;

        let mut scene = Self {
            model_space,
            passthrough_layer,
            layers: HashMap::new(),
            blocks: HashMap::new(),
            entities: HashMap::new(),
            linetypes: HashMap::new(),
            materials: HashMap::new(),
        };
        scene.layers.insert(passthrough_layer, layer0);
        scene
            .blocks
            .insert(model_space, BlockDefinition::new(model_space, "*Model_Space"));
        scene
    }

    pub fn add_layer(&mut self, layer: LayerRecord) {
        self.layers.insert(layer.id, layer);
    }

    /// 替换 0 层记录（保持其随块语义）。
    pub fn layer0_mut(&mut self) -> Option<&mut LayerRecord> {
        self.layers.get_mut(&self.passthrough_layer)
    }

    pub fn add_block(&mut self, block: BlockDefinition) {
        self.blocks.insert(block.id, block);
    }

    pub fn add_linetype(&mut self, id: LinetypeId, name: impl Into<String>) {
        self.linetypes.insert(id, name.into());
    }

    pub fn add_material(&mut self, id: MaterialId, name: impl Into<String>) {
        self.materials.insert(id, name.into());
    }

    /// 把实体加入指定块（或模型空间）的子序列末尾。块不存在时返回 `false`。
    pub fn add_entity(&mut self, owner: BlockId, entity: DrawableEntity) -> bool {
        let Some(block) = self.blocks.get_mut(&owner) else {
            return false;
        };
        block.children.push(entity.id);
        self.entities.insert(entity.id, entity);
        true
    }

    /// 登记实体但不挂到任何块下（例如仅作为符号模板父实体）。
    pub fn insert_detached(&mut self, entity: DrawableEntity) {
        self.entities.insert(entity.id, entity);
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerRecord> {
        self.layers.values()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockDefinition> {
        self.blocks.values()
    }

    pub fn entities(&self) -> impl Iterator<Item = &DrawableEntity> {
        self.entities.values()
    }

    pub fn next_entity_id(&self) -> EntityId {
        let max = self.entities.keys().map(|id| id.get()).max().unwrap_or(0);
        EntityId::new(max + 1)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneReader for Scene {
    fn model_space(&self) -> BlockId {
        self.model_space
    }

    fn passthrough_layer(&self) -> LayerId {
        self.passthrough_layer
    }

    fn layer(&self, id: LayerId) -> Option<&LayerRecord> {
        self.layers.get(&id)
    }

    fn block(&self, id: BlockId) -> Option<&BlockDefinition> {
        self.blocks.get(&id)
    }

    fn entity(&self, id: EntityId) -> Option<&DrawableEntity> {
        self.entities.get(&id)
    }

    fn has_linetype(&self, id: LinetypeId) -> bool {
        self.linetypes.contains_key(&id)
    }

    fn has_material(&self, id: MaterialId) -> bool {
        self.materials.contains_key(&id)
    }
}
