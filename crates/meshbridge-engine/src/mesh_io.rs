use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::host::Vec3;

/// Triangle soup read from a mesh file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<Vec<u32>>,
}

pub fn load_mesh(path: &Path) -> Result<MeshData> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let bytes = std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("mesh file is empty: {}", path.display());
    }
    let mesh = match ext.as_str() {
        "obj" => parse_obj(&String::from_utf8_lossy(&bytes))?,
        "stl" => parse_stl(&bytes)?,
        other => bail!("unsupported mesh format '.{other}' ({})", path.display()),
    };
    if mesh.vertices.is_empty() {
        bail!("mesh has no vertices: {}", path.display());
    }
    Ok(mesh)
}

/// Reads `v` and `f` records of a Wavefront OBJ. Negative (relative) face
/// indices are resolved against the vertices read so far.
pub fn parse_obj(text: &str) -> Result<MeshData> {
    let mut mesh = MeshData::default();
    for (line_no, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("v") => {
                let coords: Vec<f64> = parts.take(3).filter_map(|v| v.parse().ok()).collect();
                if coords.len() != 3 {
                    bail!("malformed vertex on line {}", line_no + 1);
                }
                mesh.vertices.push([coords[0], coords[1], coords[2]]);
            }
            Some("f") => {
                let count = mesh.vertices.len() as i64;
                let mut face = Vec::new();
                for token in parts {
                    let index_text = token.split('/').next().unwrap_or("");
                    let index: i64 = index_text
                        .parse()
                        .with_context(|| format!("malformed face on line {}", line_no + 1))?;
                    let resolved = if index < 0 { count + index } else { index - 1 };
                    if resolved < 0 || resolved >= count {
                        bail!("face index out of range on line {}", line_no + 1);
                    }
                    face.push(resolved as u32);
                }
                if face.len() >= 3 {
                    mesh.faces.push(face);
                }
            }
            _ => {}
        }
    }
    Ok(mesh)
}

pub fn parse_stl(bytes: &[u8]) -> Result<MeshData> {
    if is_binary_stl(bytes) {
        parse_binary_stl(bytes)
    } else {
        parse_ascii_stl(&String::from_utf8_lossy(bytes))
    }
}

fn is_binary_stl(bytes: &[u8]) -> bool {
    if bytes.len() < 84 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    bytes.len() == 84 + count * 50
}

fn parse_binary_stl(bytes: &[u8]) -> Result<MeshData> {
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let mut mesh = MeshData::default();
    for tri in 0..count {
        let base = 84 + tri * 50 + 12;
        let mut face = Vec::with_capacity(3);
        for corner in 0..3 {
            let offset = base + corner * 12;
            let read = |at: usize| -> f64 {
                f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as f64
            };
            mesh.vertices
                .push([read(offset), read(offset + 4), read(offset + 8)]);
            face.push((mesh.vertices.len() - 1) as u32);
        }
        mesh.faces.push(face);
    }
    Ok(mesh)
}

fn parse_ascii_stl(text: &str) -> Result<MeshData> {
    let mut mesh = MeshData::default();
    let mut face = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("vertex") => {
                let coords: Vec<f64> = parts.take(3).filter_map(|v| v.parse().ok()).collect();
                if coords.len() != 3 {
                    bail!("malformed STL vertex");
                }
                mesh.vertices.push([coords[0], coords[1], coords[2]]);
                face.push((mesh.vertices.len() - 1) as u32);
            }
            Some("endfacet") => {
                if face.len() >= 3 {
                    mesh.faces.push(std::mem::take(&mut face));
                }
                face.clear();
            }
            _ => {}
        }
    }
    Ok(mesh)
}
