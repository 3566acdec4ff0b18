use crate::error::{LinkError, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Width of the fixed name field in every node record.
pub const NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum NodeType {
    Group = 0,
    Geo = 1,
    Light = 2,
    Camera = 3,
}

impl NodeType {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(NodeType::Group),
            1 => Some(NodeType::Geo),
            2 => Some(NodeType::Light),
            3 => Some(NodeType::Camera),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum LightType {
    Spot = 0,
    Directional = 1,
    Point = 2,
    Area = 3,
    None = 4,
}

impl LightType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(LightType::Spot),
            1 => Some(LightType::Directional),
            2 => Some(LightType::Point),
            3 => Some(LightType::Area),
            4 => Some(LightType::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MaterialType {
    Standard = 0,
    ByName = 1,
    ShaderByName = 2,
    ShaderFromSource = 3,
}

impl MaterialType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(MaterialType::Standard),
            1 => Some(MaterialType::ByName),
            2 => Some(MaterialType::ShaderByName),
            3 => Some(MaterialType::ShaderFromSource),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoNode {
    pub geo_id: i32,
    pub texture_id: i32,
    pub material_id: i32,
    pub roughness: f32,
    pub color: [f32; 4],
}

impl Default for GeoNode {
    fn default() -> Self {
        Self {
            geo_id: -1,
            texture_id: -1,
            material_id: -1,
            roughness: 0.166,
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightNode {
    pub light_type: LightType,
    pub intensity: f32,
    pub angle: f32,
    pub range: f32,
    pub exposure: f32,
    pub color: [f32; 3],
}

impl Default for LightNode {
    fn default() -> Self {
        Self {
            light_type: LightType::Spot,
            intensity: 1.0,
            angle: 60.0,
            range: 500.0,
            exposure: 3.0,
            color: [1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraNode {
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub aspect: f32,
    pub focal_distance: f32,
    pub aperture: f32,
}

impl Default for CameraNode {
    fn default() -> Self {
        Self {
            fov: 70.0,
            near: 1.0,
            far: 1000.0,
            aspect: 16.0 / 9.0,
            focal_distance: 5.0,
            aperture: 2.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Group,
    Geo(GeoNode),
    Light(LightNode),
    Camera(CameraNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Group => NodeType::Group,
            NodeKind::Geo(_) => NodeType::Geo,
            NodeKind::Light(_) => NodeType::Light,
            NodeKind::Camera(_) => NodeType::Camera,
        }
    }
}

/// One entry of the flattened, pre-order scene hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub editable: bool,
    pub child_count: i32,
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub rotation: [f32; 4],
    pub kind: NodeKind,
}

impl Node {
    pub fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            name: truncate_name(name).to_string(),
            editable: false,
            child_count: 0,
            position: [0.0, 0.0, 0.0],
            scale: [1.0, 1.0, 1.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            kind,
        }
    }

    pub fn group(name: &str) -> Self {
        Self::new(name, NodeKind::Group)
    }

    pub fn with_children(mut self, child_count: i32) -> Self {
        self.child_count = child_count;
        self
    }

    pub fn with_editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    pub fn with_transform(mut self, position: [f32; 3], rotation: [f32; 4], scale: [f32; 3]) -> Self {
        self.position = position;
        self.rotation = rotation;
        self.scale = scale;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Cuts a name to the fixed field width without splitting a UTF-8 sequence.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= NAME_LEN {
        return name;
    }
    let mut end = NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneHeader {
    pub light_intensity_factor: f32,
    pub texture_binary_type: i32,
}

impl Default for SceneHeader {
    fn default() -> Self {
        Self {
            light_intensity_factor: 1.0,
            texture_binary_type: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometryPackage {
    /// Dedup key; not transmitted.
    pub instance_id: String,
    pub vertices: Vec<f32>,
    pub indices: Vec<i32>,
    pub normals: Vec<f32>,
    pub uvs: Vec<f32>,
    pub bone_weights: Vec<f32>,
    pub bone_indices: Vec<i32>,
}

impl GeometryPackage {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("vertices", self.vertices.len(), 3),
            ("normals", self.normals.len(), 3),
            ("uvs", self.uvs.len(), 2),
            ("bone weights", self.bone_weights.len(), 4),
        ];

        for (field, len, stride) in checks {
            if len % stride != 0 {
                return Err(LinkError::InvalidScene(format!(
                    "Geometry '{}': {} length {} is not a multiple of {}",
                    self.instance_id, field, len, stride
                )));
            }
        }

        if self.bone_indices.len() != self.bone_weights.len() {
            return Err(LinkError::InvalidScene(format!(
                "Geometry '{}': {} bone indices for {} bone weights",
                self.instance_id,
                self.bone_indices.len(),
                self.bone_weights.len()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TexturePackage {
    /// Dedup key; not transmitted.
    pub path: Option<String>,
    pub width: i32,
    pub height: i32,
    pub format: i32,
    pub data: Vec<u8>,
}

impl TexturePackage {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderProperty {
    pub id: i32,
    pub property_type: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialPackage {
    pub material_type: MaterialType,
    pub name: String,
    pub src: String,
    pub material_id: i32,
    pub texture_ids: Vec<i32>,
    pub texture_offsets: Vec<[f32; 2]>,
    pub texture_scales: Vec<[f32; 2]>,
    pub shader_config: Vec<bool>,
    pub shader_properties: Vec<ShaderProperty>,
}

impl MaterialPackage {
    pub fn new(material_type: MaterialType, name: &str, material_id: i32) -> Self {
        Self {
            material_type,
            name: name.to_string(),
            src: String::new(),
            material_id,
            texture_ids: Vec::new(),
            texture_offsets: Vec::new(),
            texture_scales: Vec::new(),
            shader_config: Vec::new(),
            shader_properties: Vec::new(),
        }
    }

    pub fn with_texture(mut self, texture_id: i32, offset: [f32; 2], scale: [f32; 2]) -> Self {
        self.texture_ids.push(texture_id);
        self.texture_offsets.push(offset);
        self.texture_scales.push(scale);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let textures = self.texture_ids.len();
        if self.texture_offsets.len() != textures || self.texture_scales.len() != textures {
            return Err(LinkError::InvalidScene(format!(
                "Material '{}': {} texture ids, {} offsets, {} scales",
                self.name,
                textures,
                self.texture_offsets.len(),
                self.texture_scales.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneStats {
    pub groups: usize,
    pub geo_nodes: usize,
    pub lights: usize,
    pub cameras: usize,
}

/// Immutable scene served for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub header: SceneHeader,
    pub nodes: Vec<Node>,
    pub geometry: Vec<GeometryPackage>,
    pub textures: Vec<TexturePackage>,
    pub materials: Vec<MaterialPackage>,
}

impl SceneSnapshot {
    pub fn stats(&self) -> SceneStats {
        let mut stats = SceneStats::default();
        for node in &self.nodes {
            match node.kind {
                NodeKind::Group => stats.groups += 1,
                NodeKind::Geo(_) => stats.geo_nodes += 1,
                NodeKind::Light(_) => stats.lights += 1,
                NodeKind::Camera(_) => stats.cameras += 1,
            }
        }
        stats
    }

    pub fn validate(&self) -> Result<()> {
        reconstruct_tree(&self.nodes)?;

        for package in &self.geometry {
            package.validate()?;
        }
        for material in &self.materials {
            material.validate()?;
        }

        let geometry_count = self.geometry.len() as i32;
        for node in &self.nodes {
            if let NodeKind::Geo(geo) = &node.kind {
                if geo.geo_id >= geometry_count {
                    return Err(LinkError::InvalidScene(format!(
                        "Node '{}' references geometry {} of {}",
                        node.name, geo.geo_id, geometry_count
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Rebuilds parent links from the `child_count` sequence of a pre-order node list.
///
/// The first node is the root; the counts must account for every following node exactly once.
pub fn reconstruct_tree(nodes: &[Node]) -> Result<Vec<Option<usize>>> {
    let mut parents = Vec::with_capacity(nodes.len());
    // (node index, children still expected)
    let mut open: Vec<(usize, i32)> = Vec::new();

    for (index, node) in nodes.iter().enumerate() {
        if node.child_count < 0 {
            return Err(LinkError::InvalidScene(format!(
                "Node {} ('{}') has negative child count {}",
                index, node.name, node.child_count
            )));
        }

        while matches!(open.last(), Some((_, 0))) {
            open.pop();
        }

        let parent = match open.last_mut() {
            Some((parent, remaining)) => {
                *remaining -= 1;
                Some(*parent)
            }
            None if index == 0 => None,
            None => {
                return Err(LinkError::InvalidScene(format!(
                    "{} nodes left over after the hierarchy closed at node {}",
                    nodes.len() - index,
                    index - 1
                )));
            }
        };

        parents.push(parent);
        open.push((index, node.child_count));
    }

    let missing: i64 = open.iter().map(|(_, remaining)| i64::from(*remaining)).sum();
    if missing > 0 {
        return Err(LinkError::InvalidScene(format!(
            "Hierarchy expects {} more nodes than the list holds",
            missing
        )));
    }

    Ok(parents)
}

/// Collects flattened records from a scene producer into a [`SceneSnapshot`].
///
/// Geometry is deduplicated by `instance_id`, textures by path. Every `push_*` call
/// returns the arena index of the node it created.
pub struct SceneBuilder {
    snapshot: SceneSnapshot,
    geometry_index: AHashMap<String, i32>,
    texture_index: AHashMap<String, i32>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::with_header(SceneHeader::default())
    }

    pub fn with_header(header: SceneHeader) -> Self {
        Self {
            snapshot: SceneSnapshot {
                header,
                ..Default::default()
            },
            geometry_index: AHashMap::new(),
            texture_index: AHashMap::new(),
        }
    }

    pub fn push_node(&mut self, node: Node) -> usize {
        self.snapshot.nodes.push(node);
        self.snapshot.nodes.len() - 1
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.snapshot.nodes.get_mut(index)
    }

    pub fn add_geometry(&mut self, package: GeometryPackage) -> i32 {
        if !package.instance_id.is_empty() {
            if let Some(id) = self.geometry_index.get(&package.instance_id) {
                return *id;
            }
        }

        let id = self.snapshot.geometry.len() as i32;
        if !package.instance_id.is_empty() {
            self.geometry_index.insert(package.instance_id.clone(), id);
        }
        self.snapshot.geometry.push(package);
        id
    }

    pub fn add_texture(&mut self, texture: TexturePackage) -> i32 {
        if let Some(path) = &texture.path {
            if let Some(id) = self.texture_index.get(path) {
                return *id;
            }
        }

        let id = self.snapshot.textures.len() as i32;
        if let Some(path) = &texture.path {
            self.texture_index.insert(path.clone(), id);
        }
        self.snapshot.textures.push(texture);
        id
    }

    pub fn add_material(&mut self, mut material: MaterialPackage) -> i32 {
        let id = self.snapshot.materials.len() as i32;
        material.material_id = id;
        self.snapshot.materials.push(material);
        id
    }

    /// Pushes a geometry node, wiring `geo_id` (and `texture_id` when a texture is given).
    pub fn push_geo(
        &mut self,
        mut node: Node,
        geometry: GeometryPackage,
        texture: Option<TexturePackage>,
    ) -> usize {
        let geo_id = self.add_geometry(geometry);
        let texture_id = texture.map(|t| self.add_texture(t));

        match &mut node.kind {
            NodeKind::Geo(geo) => {
                geo.geo_id = geo_id;
                if let Some(texture_id) = texture_id {
                    geo.texture_id = texture_id;
                }
            }
            _ => {
                node.kind = NodeKind::Geo(GeoNode {
                    geo_id,
                    texture_id: texture_id.unwrap_or(-1),
                    ..Default::default()
                });
            }
        }

        self.push_node(node)
    }

    pub fn node_count(&self) -> usize {
        self.snapshot.nodes.len()
    }

    pub fn finish(self) -> Result<SceneSnapshot> {
        self.snapshot.validate()?;
        Ok(self.snapshot)
    }
}

impl Default for SceneBuilder {
    fn default() -> Self {
        Self::new()
    }
}
