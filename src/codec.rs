//! Byte-exact packing of scene records for the distribution channel.
//!
//! All integers and floats are little-endian. Every decoder checks the remaining length
//! before reading, so malformed input ends in a [`DecodeError`] rather than a panic.

use crate::error::{DecodeError, LinkError, Result};
use crate::scene::{
    truncate_name, CameraNode, GeoNode, GeometryPackage, LightNode, LightType, MaterialPackage,
    MaterialType, Node, NodeKind, NodeType, SceneHeader, ShaderProperty, TexturePackage, NAME_LEN,
};
use bytes::{BufMut, Bytes, BytesMut};

pub const NODE_SIZE: usize = 112;
pub const GEO_NODE_SIZE: usize = NODE_SIZE + 32;
pub const LIGHT_NODE_SIZE: usize = NODE_SIZE + 32;
pub const CAMERA_NODE_SIZE: usize = NODE_SIZE + 24;
pub const HEADER_RECORD_SIZE: usize = 8;

/// Record size for each node type tag, excluding the 4-byte tag itself.
pub fn record_size(node_type: NodeType) -> usize {
    match node_type {
        NodeType::Group => NODE_SIZE,
        NodeType::Geo => GEO_NODE_SIZE,
        NodeType::Light => LIGHT_NODE_SIZE,
        NodeType::Camera => CAMERA_NODE_SIZE,
    }
}

pub fn pack_header(header: &SceneHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_RECORD_SIZE);
    buf.put_f32_le(header.light_intensity_factor);
    buf.put_i32_le(header.texture_binary_type);
    buf.freeze()
}

pub fn unpack_header(data: &[u8]) -> std::result::Result<SceneHeader, DecodeError> {
    let mut reader = Reader::new(data);
    let header = SceneHeader {
        light_intensity_factor: reader.f32()?,
        texture_binary_type: reader.i32()?,
    };
    reader.finish()?;
    Ok(header)
}

pub fn pack_nodes(nodes: &[Node]) -> Bytes {
    let capacity = nodes.iter().map(|n| 4 + record_size(n.node_type())).sum();
    let mut buf = BytesMut::with_capacity(capacity);

    for node in nodes {
        buf.put_i32_le(node.node_type().tag());
        put_node_base(&mut buf, node);

        match &node.kind {
            NodeKind::Group => {}
            NodeKind::Geo(geo) => {
                buf.put_i32_le(geo.geo_id);
                buf.put_i32_le(geo.texture_id);
                buf.put_i32_le(geo.material_id);
                buf.put_f32_le(geo.roughness);
                put_f32s(&mut buf, &geo.color);
            }
            NodeKind::Light(light) => {
                buf.put_i32_le(light.light_type as i32);
                buf.put_f32_le(light.intensity);
                buf.put_f32_le(light.angle);
                buf.put_f32_le(light.range);
                buf.put_f32_le(light.exposure);
                put_f32s(&mut buf, &light.color);
            }
            NodeKind::Camera(camera) => {
                buf.put_f32_le(camera.fov);
                buf.put_f32_le(camera.near);
                buf.put_f32_le(camera.far);
                buf.put_f32_le(camera.aspect);
                buf.put_f32_le(camera.focal_distance);
                buf.put_f32_le(camera.aperture);
            }
        }
    }

    buf.freeze()
}

fn put_node_base(buf: &mut BytesMut, node: &Node) {
    buf.put_u8(node.editable as u8);
    buf.put_bytes(0, 3);
    buf.put_i32_le(node.child_count);
    put_f32s(buf, &node.position);
    put_f32s(buf, &node.scale);
    put_f32s(buf, &node.rotation);

    let name = truncate_name(&node.name).as_bytes();
    buf.put_slice(name);
    buf.put_bytes(0, NAME_LEN - name.len());
}

pub fn unpack_nodes(data: &[u8]) -> std::result::Result<Vec<Node>, DecodeError> {
    let mut reader = Reader::new(data);
    let mut nodes = Vec::new();

    while !reader.is_empty() {
        let tag = reader.i32()?;
        let node_type = NodeType::from_tag(tag).ok_or(DecodeError::UnknownNodeKind(tag))?;
        // whole record must be present before any field is read
        reader.require(record_size(node_type))?;

        let editable = reader.u8()? != 0;
        reader.skip(3)?;
        let child_count = reader.i32()?;
        let position = reader.f32_array()?;
        let scale = reader.f32_array()?;
        let rotation = reader.f32_array()?;
        let name = reader.fixed_str(NAME_LEN)?;

        let kind = match node_type {
            NodeType::Group => NodeKind::Group,
            NodeType::Geo => NodeKind::Geo(GeoNode {
                geo_id: reader.i32()?,
                texture_id: reader.i32()?,
                material_id: reader.i32()?,
                roughness: reader.f32()?,
                color: reader.f32_array()?,
            }),
            NodeType::Light => {
                let raw_type = reader.i32()?;
                let light_type = LightType::from_i32(raw_type).ok_or(DecodeError::UnknownEnum {
                    field: "light type",
                    value: raw_type,
                })?;
                NodeKind::Light(LightNode {
                    light_type,
                    intensity: reader.f32()?,
                    angle: reader.f32()?,
                    range: reader.f32()?,
                    exposure: reader.f32()?,
                    color: reader.f32_array()?,
                })
            }
            NodeType::Camera => NodeKind::Camera(CameraNode {
                fov: reader.f32()?,
                near: reader.f32()?,
                far: reader.f32()?,
                aspect: reader.f32()?,
                focal_distance: reader.f32()?,
                aperture: reader.f32()?,
            }),
        };

        nodes.push(Node {
            name,
            editable,
            child_count,
            position,
            scale,
            rotation,
            kind,
        });
    }

    Ok(nodes)
}

/// Packs geometry blocks. Fails when a package's list lengths do not match their strides.
pub fn pack_geometry(packages: &[GeometryPackage]) -> Result<Bytes> {
    let mut buf = BytesMut::new();

    for package in packages {
        package.validate()?;

        put_count(&mut buf, package.vertices.len() / 3)?;
        put_f32s(&mut buf, &package.vertices);

        put_count(&mut buf, package.indices.len())?;
        put_i32s(&mut buf, &package.indices);

        put_count(&mut buf, package.normals.len() / 3)?;
        put_f32s(&mut buf, &package.normals);

        put_count(&mut buf, package.uvs.len() / 2)?;
        put_f32s(&mut buf, &package.uvs);

        put_count(&mut buf, package.bone_weights.len() / 4)?;
        put_f32s(&mut buf, &package.bone_weights);
        put_i32s(&mut buf, &package.bone_indices);
    }

    Ok(buf.freeze())
}

pub fn unpack_geometry(data: &[u8]) -> std::result::Result<Vec<GeometryPackage>, DecodeError> {
    let mut reader = Reader::new(data);
    let mut packages = Vec::new();

    while !reader.is_empty() {
        let vertex_count = reader.count()?;
        let vertices = reader.f32_vec(vertex_count, 3)?;

        let index_count = reader.count()?;
        let indices = reader.i32_vec(index_count, 1)?;

        let normal_count = reader.count()?;
        let normals = reader.f32_vec(normal_count, 3)?;

        let uv_count = reader.count()?;
        let uvs = reader.f32_vec(uv_count, 2)?;

        let bone_count = reader.count()?;
        let bone_weights = reader.f32_vec(bone_count, 4)?;
        let bone_indices = reader.i32_vec(bone_count, 4)?;

        packages.push(GeometryPackage {
            instance_id: String::new(),
            vertices,
            indices,
            normals,
            uvs,
            bone_weights,
            bone_indices,
        });
    }

    Ok(packages)
}

pub fn pack_textures(textures: &[TexturePackage]) -> Result<Bytes> {
    let size = textures.iter().map(|t| 16 + t.data.len()).sum();
    let mut buf = BytesMut::with_capacity(size);

    for texture in textures {
        buf.put_i32_le(texture.width);
        buf.put_i32_le(texture.height);
        buf.put_i32_le(texture.format);
        put_count(&mut buf, texture.data.len())?;
        buf.put_slice(&texture.data);
    }

    Ok(buf.freeze())
}

pub fn unpack_textures(data: &[u8]) -> std::result::Result<Vec<TexturePackage>, DecodeError> {
    let mut reader = Reader::new(data);
    let mut textures = Vec::new();

    while !reader.is_empty() {
        let width = reader.i32()?;
        let height = reader.i32()?;
        let format = reader.i32()?;
        let size = reader.count()?;
        let data = reader.bytes(size)?.to_vec();

        textures.push(TexturePackage {
            path: None,
            width,
            height,
            format,
            data,
        });
    }

    Ok(textures)
}

pub fn pack_materials(materials: &[MaterialPackage]) -> Result<Bytes> {
    let mut buf = BytesMut::new();

    for material in materials {
        material.validate()?;

        buf.put_i32_le(material.material_type as i32);
        put_str(&mut buf, &material.name)?;
        put_str(&mut buf, &material.src)?;
        buf.put_i32_le(material.material_id);

        put_count(&mut buf, material.texture_ids.len())?;
        put_i32s(&mut buf, &material.texture_ids);
        for offset in &material.texture_offsets {
            put_f32s(&mut buf, offset);
        }
        for scale in &material.texture_scales {
            put_f32s(&mut buf, scale);
        }

        put_count(&mut buf, material.shader_config.len())?;
        for flag in &material.shader_config {
            buf.put_u8(*flag as u8);
        }

        put_count(&mut buf, material.shader_properties.len())?;
        for property in &material.shader_properties {
            buf.put_i32_le(property.id);
            buf.put_i32_le(property.property_type);
            put_count(&mut buf, property.data.len())?;
            buf.put_slice(&property.data);
        }
    }

    Ok(buf.freeze())
}

pub fn unpack_materials(data: &[u8]) -> std::result::Result<Vec<MaterialPackage>, DecodeError> {
    let mut reader = Reader::new(data);
    let mut materials = Vec::new();

    while !reader.is_empty() {
        let raw_type = reader.i32()?;
        let material_type = MaterialType::from_i32(raw_type).ok_or(DecodeError::UnknownEnum {
            field: "material type",
            value: raw_type,
        })?;
        let name = reader.string()?;
        let src = reader.string()?;
        let material_id = reader.i32()?;

        let texture_count = reader.count()?;
        let texture_ids = reader.i32_vec(texture_count, 1)?;
        // offsets and scales: two f32 each per texture
        reader.require_elements(texture_count, 16)?;
        let mut texture_offsets = Vec::with_capacity(texture_count);
        for _ in 0..texture_count {
            texture_offsets.push(reader.f32_array()?);
        }
        let mut texture_scales = Vec::with_capacity(texture_count);
        for _ in 0..texture_count {
            texture_scales.push(reader.f32_array()?);
        }

        let config_count = reader.count()?;
        let shader_config = reader.bytes(config_count)?.iter().map(|b| *b != 0).collect();

        let property_count = reader.count()?;
        reader.require_elements(property_count, 12)?;
        let mut shader_properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            let id = reader.i32()?;
            let property_type = reader.i32()?;
            let len = reader.count()?;
            shader_properties.push(ShaderProperty {
                id,
                property_type,
                data: reader.bytes(len)?.to_vec(),
            });
        }

        materials.push(MaterialPackage {
            material_type,
            name,
            src,
            material_id,
            texture_ids,
            texture_offsets,
            texture_scales,
            shader_config,
            shader_properties,
        });
    }

    Ok(materials)
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| LinkError::InvalidScene(format!("Element count {} exceeds i32", count)))?;
    buf.put_i32_le(count);
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_count(buf, value.len())?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_f32s(buf: &mut BytesMut, values: &[f32]) {
    for v in values {
        buf.put_f32_le(*v);
    }
}

fn put_i32s(buf: &mut BytesMut, values: &[i32]) {
    for v in values {
        buf.put_i32_le(*v);
    }
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn require(&self, needed: usize) -> std::result::Result<(), DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn require_elements(&self, count: usize, width: usize) -> std::result::Result<(), DecodeError> {
        let needed = count.checked_mul(width).ok_or(DecodeError::Truncated {
            needed: usize::MAX,
            available: self.remaining(),
        })?;
        self.require(needed)
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], DecodeError> {
        self.require(len)?;
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> std::result::Result<(), DecodeError> {
        self.bytes(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn i32(&mut self) -> std::result::Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> std::result::Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn count(&mut self) -> std::result::Result<usize, DecodeError> {
        let value = self.i32()?;
        usize::try_from(value).map_err(|_| DecodeError::NegativeCount(value))
    }

    fn f32_array<const N: usize>(&mut self) -> std::result::Result<[f32; N], DecodeError> {
        let mut out = [0.0f32; N];
        for v in out.iter_mut() {
            *v = self.f32()?;
        }
        Ok(out)
    }

    fn f32_vec(&mut self, count: usize, stride: usize) -> std::result::Result<Vec<f32>, DecodeError> {
        let elements = count.saturating_mul(stride);
        self.require_elements(elements, 4)?;
        (0..elements).map(|_| self.f32()).collect()
    }

    fn i32_vec(&mut self, count: usize, stride: usize) -> std::result::Result<Vec<i32>, DecodeError> {
        let elements = count.saturating_mul(stride);
        self.require_elements(elements, 4)?;
        (0..elements).map(|_| self.i32()).collect()
    }

    fn string(&mut self) -> std::result::Result<String, DecodeError> {
        let len = self.count()?;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Zero-padded field; the value ends at the first NUL.
    fn fixed_str(&mut self, width: usize) -> std::result::Result<String, DecodeError> {
        let raw = self.bytes(width)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
        std::str::from_utf8(&raw[..end])
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn finish(&self) -> std::result::Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nodes() -> Vec<Node> {
        vec![
            Node::group("root").with_children(3),
            Node::new(
                "crate",
                NodeKind::Geo(GeoNode {
                    geo_id: 0,
                    texture_id: 1,
                    material_id: -1,
                    roughness: 0.5,
                    color: [0.2, 0.4, 0.6, 1.0],
                }),
            )
            .with_editable(true)
            .with_transform([1.0, 2.0, 3.0], [0.0, 0.7071, 0.0, 0.7071], [2.0, 2.0, 2.0]),
            Node::new(
                "key_light",
                NodeKind::Light(LightNode {
                    light_type: LightType::Directional,
                    ..Default::default()
                }),
            ),
            Node::new("shot_cam", NodeKind::Camera(CameraNode::default())).with_editable(true),
        ]
    }

    #[test]
    fn test_node_record_sizes() {
        let nodes = sample_nodes();
        let packed = pack_nodes(&nodes);
        assert_eq!(packed.len(), 4 * 4 + NODE_SIZE + GEO_NODE_SIZE + LIGHT_NODE_SIZE + CAMERA_NODE_SIZE);
        assert_eq!(&packed[..4], &0i32.to_le_bytes());
        assert_eq!(GEO_NODE_SIZE, 144);
        assert_eq!(CAMERA_NODE_SIZE, 136);
    }

    #[test]
    fn test_node_list_round_trip() {
        let nodes = sample_nodes();
        let decoded = unpack_nodes(&pack_nodes(&nodes)).unwrap();
        assert_eq!(decoded, nodes);
    }

    #[test]
    fn test_truncated_node_list() {
        let packed = pack_nodes(&sample_nodes());
        for cut in [1, 4, 50, packed.len() - 1] {
            let err = unpack_nodes(&packed[..cut]).unwrap_err();
            assert!(err.is_truncated(), "cut at {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_unknown_node_tag() {
        let mut packed = pack_nodes(&[Node::group("root")]).to_vec();
        packed[..4].copy_from_slice(&9i32.to_le_bytes());
        assert_eq!(unpack_nodes(&packed), Err(DecodeError::UnknownNodeKind(9)));
    }

    #[test]
    fn test_long_name_is_truncated() {
        let packed = pack_nodes(&[Node {
            name: "n".repeat(90),
            ..Node::group("")
        }]);
        assert_eq!(packed.len(), 4 + NODE_SIZE);
        assert_eq!(unpack_nodes(&packed).unwrap()[0].name.len(), NAME_LEN);
    }

    #[test]
    fn test_geometry_blocks() {
        let package = GeometryPackage {
            instance_id: "tri".to_string(),
            vertices: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            indices: vec![0, 1, 2],
            normals: vec![0.0; 9],
            uvs: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            bone_weights: vec![1.0, 0.0, 0.0, 0.0],
            bone_indices: vec![3, 0, 0, 0],
        };

        let packed = pack_geometry(std::slice::from_ref(&package)).unwrap();
        assert_eq!(&packed[..4], &3i32.to_le_bytes());

        let decoded = unpack_geometry(&packed).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].instance_id, "");
        assert_eq!(decoded[0].vertices, package.vertices);
        assert_eq!(decoded[0].bone_indices, package.bone_indices);
    }

    #[test]
    fn test_geometry_rejects_bad_stride() {
        let package = GeometryPackage {
            vertices: vec![0.0; 4],
            ..Default::default()
        };
        assert!(pack_geometry(&[package]).is_err());
    }

    #[test]
    fn test_geometry_huge_count() {
        let mut data = Vec::new();
        data.extend_from_slice(&i32::MAX.to_le_bytes());
        assert!(unpack_geometry(&data).unwrap_err().is_truncated());

        data.clear();
        data.extend_from_slice(&(-2i32).to_le_bytes());
        assert_eq!(unpack_geometry(&data), Err(DecodeError::NegativeCount(-2)));
    }

    #[test]
    fn test_textures() {
        let textures = vec![
            TexturePackage {
                path: Some("wood.png".to_string()),
                width: 2,
                height: 1,
                format: 4,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
            TexturePackage::default(),
        ];

        let decoded = unpack_textures(&pack_textures(&textures).unwrap()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path, None);
        assert_eq!(decoded[0].data, textures[0].data);
        assert_eq!(decoded[1].byte_size(), 0);
    }

    #[test]
    fn test_materials() {
        let mut material = MaterialPackage::new(MaterialType::ShaderByName, "Standard", 0)
            .with_texture(3, [0.0, 0.5], [1.0, 1.0]);
        material.src = "Lit".to_string();
        material.shader_config = vec![true, false, true];
        material.shader_properties.push(ShaderProperty {
            id: 12,
            property_type: 2,
            data: 0.5f32.to_le_bytes().to_vec(),
        });

        let packed = pack_materials(std::slice::from_ref(&material)).unwrap();
        assert_eq!(unpack_materials(&packed).unwrap(), vec![material]);

        let mut bad = packed.to_vec();
        bad[..4].copy_from_slice(&7i32.to_le_bytes());
        assert!(matches!(
            unpack_materials(&bad),
            Err(DecodeError::UnknownEnum { field: "material type", value: 7 })
        ));
    }

    #[test]
    fn test_header() {
        let header = SceneHeader {
            light_intensity_factor: 0.5,
            texture_binary_type: 1,
        };
        let packed = pack_header(&header);
        assert_eq!(packed.len(), HEADER_RECORD_SIZE);
        assert_eq!(unpack_header(&packed).unwrap(), header);
        assert!(unpack_header(&packed[..6]).unwrap_err().is_truncated());

        let mut long = packed.to_vec();
        long.push(0);
        assert_eq!(unpack_header(&long), Err(DecodeError::TrailingBytes(1)));
    }
}
