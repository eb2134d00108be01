use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use meshbridge_contracts::{RemeshMode, RemeshStage, RenderView};
use tracing::debug;

use crate::host::{Bounds, HostError, HostResult, SceneHost, Vec3};
use crate::mesh_io::{self, MeshData};

const BACKGROUND: Rgb<u8> = Rgb([24, 24, 28]);
const SILHOUETTE: Rgb<u8> = Rgb([214, 214, 220]);

/// One remesh operator application, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct RemeshRecord {
    pub object: String,
    pub stage: RemeshStage,
    pub mode: RemeshMode,
    pub octree_depth: u8,
}

#[derive(Debug, Clone)]
struct SceneObject {
    /// World-space positions; every transform is baked.
    vertices: Vec<Vec3>,
    faces: Vec<Vec<u32>>,
    origin: Vec3,
    visible: bool,
    parent: Option<String>,
}

/// In-memory scene used when no real 3D application is attached.
#[derive(Debug, Clone)]
pub struct HeadlessHost {
    objects: BTreeMap<String, SceneObject>,
    order: Vec<String>,
    active: Option<String>,
    remesh_available: bool,
    remesh_log: Vec<RemeshRecord>,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HeadlessHost {
    pub fn new(remesh_available: bool) -> Self {
        Self {
            objects: BTreeMap::new(),
            order: Vec::new(),
            active: None,
            remesh_available,
            remesh_log: Vec::new(),
        }
    }

    pub fn remesh_log(&self) -> &[RemeshRecord] {
        &self.remesh_log
    }

    /// Adds a top-level mesh and makes it active. Returns the unique name it
    /// was stored under.
    pub fn add_object(&mut self, name: &str, mesh: MeshData) -> String {
        let name = self.unique_name(name);
        self.insert(name.clone(), mesh, None);
        self.active = Some(name.clone());
        name
    }

    pub fn add_child(&mut self, parent: &str, name: &str, mesh: MeshData) -> HostResult<String> {
        if !self.objects.contains_key(parent) {
            return Err(HostError::Invalidated(parent.to_string()));
        }
        let name = self.unique_name(name);
        self.insert(name.clone(), mesh, Some(parent.to_string()));
        Ok(name)
    }

    /// Removes an object and its children, the way background tooling in a
    /// real host can.
    pub fn delete(&mut self, name: &str) -> bool {
        if self.objects.remove(name).is_none() {
            return false;
        }
        self.order.retain(|existing| existing != name);
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        for child in self.children(name) {
            self.delete(&child);
        }
        true
    }

    pub fn vertices(&self, name: &str) -> Option<&[Vec3]> {
        self.objects.get(name).map(|object| object.vertices.as_slice())
    }

    pub fn origin(&self, name: &str) -> Option<Vec3> {
        self.objects.get(name).map(|object| object.origin)
    }

    fn insert(&mut self, name: String, mesh: MeshData, parent: Option<String>) {
        let origin = Bounds::from_points(mesh.vertices.iter())
            .map(|bounds| bounds.min)
            .unwrap_or([0.0; 3]);
        self.objects.insert(
            name.clone(),
            SceneObject {
                vertices: mesh.vertices,
                faces: mesh.faces,
                origin,
                visible: true,
                parent,
            },
        );
        self.order.push(name);
    }

    fn unique_name(&self, base: &str) -> String {
        let base = if base.trim().is_empty() { "mesh" } else { base.trim() };
        if !self.objects.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}.{n:03}"))
            .find(|candidate| !self.objects.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    fn object_mut(&mut self, name: &str) -> HostResult<&mut SceneObject> {
        self.objects
            .get_mut(name)
            .ok_or_else(|| HostError::Invalidated(name.to_string()))
    }

    fn visible_bounds(&self) -> Option<Bounds> {
        Bounds::from_points(
            self.objects
                .values()
                .filter(|object| object.visible)
                .flat_map(|object| object.vertices.iter()),
        )
    }

    fn render_view(&self, view: RenderView, resolution: u32, scene: &Bounds) -> RgbImage {
        let mut img = RgbImage::from_pixel(resolution, resolution, BACKGROUND);
        let center = scene.center();
        let extent = scene.max_dimension().max(f64::EPSILON) * 1.1;
        let size = resolution as f64;
        let (sin, cos) = view.yaw_degrees().to_radians().sin_cos();

        let project = |point: &Vec3| -> (f64, f64) {
            let x = point[0] - center[0];
            let y = point[1] - center[1];
            let u = x * cos + y * sin;
            let v = point[2] - center[2];
            ((u / extent + 0.5) * size, (0.5 - v / extent) * size)
        };

        for object in self.objects.values().filter(|object| object.visible) {
            let projected: Vec<(f64, f64)> = object.vertices.iter().map(project).collect();
            if object.faces.is_empty() {
                for &(u, v) in &projected {
                    put(&mut img, u, v);
                }
                continue;
            }
            for face in &object.faces {
                for idx in 1..face.len().saturating_sub(1) {
                    let corners = [face[0], face[idx], face[idx + 1]];
                    let Some(tri) = corners
                        .iter()
                        .map(|&i| projected.get(i as usize).copied())
                        .collect::<Option<Vec<_>>>()
                    else {
                        continue;
                    };
                    fill_triangle(&mut img, tri[0], tri[1], tri[2]);
                }
            }
        }
        img
    }
}

fn put(img: &mut RgbImage, u: f64, v: f64) {
    if u < 0.0 || v < 0.0 {
        return;
    }
    let (x, y) = (u as u32, v as u32);
    if x < img.width() && y < img.height() {
        img.put_pixel(x, y, SILHOUETTE);
    }
}

fn fill_triangle(img: &mut RgbImage, a: (f64, f64), b: (f64, f64), c: (f64, f64)) {
    let min_x = a.0.min(b.0).min(c.0).floor().max(0.0) as u32;
    let max_x = a.0.max(b.0).max(c.0).ceil().min(img.width() as f64 - 1.0);
    let min_y = a.1.min(b.1).min(c.1).floor().max(0.0) as u32;
    let max_y = a.1.max(b.1).max(c.1).ceil().min(img.height() as f64 - 1.0);
    if max_x < 0.0 || max_y < 0.0 {
        return;
    }
    let edge = |p: (f64, f64), q: (f64, f64), r: (f64, f64)| {
        (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
    };
    let area = edge(a, b, c);
    if area.abs() < f64::EPSILON {
        put(img, a.0, a.1);
        return;
    }
    for y in min_y..=max_y as u32 {
        for x in min_x..=max_x as u32 {
            let p = (x as f64 + 0.5, y as f64 + 0.5);
            let w0 = edge(b, c, p) / area;
            let w1 = edge(c, a, p) / area;
            let w2 = edge(a, b, p) / area;
            if w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0 {
                img.put_pixel(x, y, SILHOUETTE);
            }
        }
    }
}

impl SceneHost for HeadlessHost {
    fn render_views(&mut self, target_dir: &Path, resolution: u32) -> HostResult<Vec<PathBuf>> {
        fs::create_dir_all(target_dir)?;
        let scene = self.visible_bounds().unwrap_or(Bounds {
            min: [-0.5; 3],
            max: [0.5; 3],
        });
        let mut written = Vec::with_capacity(RenderView::ALL.len());
        for view in RenderView::ALL {
            let path = target_dir.join(view.file_name());
            self.render_view(view, resolution, &scene)
                .save(&path)
                .map_err(|err| HostError::Failed(format!("{} render failed: {err}", view.as_str())))?;
            written.push(path);
        }
        debug!(dir = %target_dir.display(), "rendered {} views", written.len());
        Ok(written)
    }

    fn import_mesh(&mut self, path: &Path) -> HostResult<String> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !matches!(ext.as_str(), "obj" | "stl") {
            return Err(HostError::Unsupported(format!(
                "headless host cannot import '.{ext}' files"
            )));
        }
        let mesh = mesh_io::load_mesh(path).map_err(|err| HostError::Failed(format!("{err:#}")))?;
        let stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("mesh");
        Ok(self.add_object(stem, mesh))
    }

    fn mesh_objects(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                self.objects
                    .get(name.as_str())
                    .map(|object| object.parent.is_none() && object.visible)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn active_object(&self) -> Option<String> {
        self.active
            .clone()
            .filter(|name| self.objects.contains_key(name))
    }

    fn bounds(&self, name: &str) -> Option<Bounds> {
        Bounds::from_points(self.objects.get(name)?.vertices.iter())
    }

    fn is_visible(&self, name: &str) -> Option<bool> {
        self.objects.get(name).map(|object| object.visible)
    }

    fn children(&self, name: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|child| {
                self.objects
                    .get(child.as_str())
                    .and_then(|object| object.parent.as_deref())
                    == Some(name)
            })
            .cloned()
            .collect()
    }

    fn set_origin_to_bounds_center(&mut self, name: &str) -> HostResult<()> {
        let center = self
            .bounds(name)
            .ok_or_else(|| HostError::Invalidated(name.to_string()))?
            .center();
        self.object_mut(name)?.origin = center;
        Ok(())
    }

    fn set_location(&mut self, name: &str, location: Vec3) -> HostResult<()> {
        let object = self.object_mut(name)?;
        let delta = [
            location[0] - object.origin[0],
            location[1] - object.origin[1],
            location[2] - object.origin[2],
        ];
        for vertex in &mut object.vertices {
            for axis in 0..3 {
                vertex[axis] += delta[axis];
            }
        }
        object.origin = location;
        Ok(())
    }

    fn apply_scale(&mut self, name: &str, factor: f64) -> HostResult<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(HostError::Failed(format!("invalid scale factor {factor}")));
        }
        let object = self.object_mut(name)?;
        let origin = object.origin;
        for vertex in &mut object.vertices {
            for axis in 0..3 {
                vertex[axis] = origin[axis] + (vertex[axis] - origin[axis]) * factor;
            }
        }
        Ok(())
    }

    fn apply_rotation_z(&mut self, name: &str, degrees: f64) -> HostResult<()> {
        let (sin, cos) = degrees.to_radians().sin_cos();
        let object = self.object_mut(name)?;
        let origin = object.origin;
        for vertex in &mut object.vertices {
            let x = vertex[0] - origin[0];
            let y = vertex[1] - origin[1];
            vertex[0] = origin[0] + x * cos - y * sin;
            vertex[1] = origin[1] + x * sin + y * cos;
        }
        Ok(())
    }

    fn apply_remesh(
        &mut self,
        name: &str,
        stage: RemeshStage,
        mode: RemeshMode,
        octree_depth: u8,
    ) -> HostResult<()> {
        if !self.remesh_available {
            return Err(HostError::Unsupported("remesh operator unavailable".to_string()));
        }
        let extent = self
            .bounds(name)
            .ok_or_else(|| HostError::Invalidated(name.to_string()))?
            .max_dimension();
        let object = self.object_mut(name)?;
        let cell = extent / f64::from(1u32 << octree_depth.min(16));
        if cell > 0.0 {
            let origin = object.origin;
            for vertex in &mut object.vertices {
                for axis in 0..3 {
                    let local = (vertex[axis] - origin[axis]) / cell;
                    let snapped = match mode {
                        RemeshMode::Blocks => local.floor() + 0.5,
                        RemeshMode::Smooth | RemeshMode::Sharp => local.round(),
                    };
                    vertex[axis] = origin[axis] + snapped * cell;
                }
            }
        }
        self.remesh_log.push(RemeshRecord {
            object: name.to_string(),
            stage,
            mode,
            octree_depth,
        });
        Ok(())
    }

    fn set_visible(&mut self, name: &str, visible: bool) -> HostResult<()> {
        self.object_mut(name)?.visible = visible;
        Ok(())
    }

    fn supports_remesh(&self) -> bool {
        self.remesh_available
    }
}

/// Axis-aligned box with the given dimensions, minimum corner at `min`.
pub fn box_mesh(min: Vec3, size: Vec3) -> MeshData {
    let [x0, y0, z0] = min;
    let [x1, y1, z1] = [x0 + size[0], y0 + size[1], z0 + size[2]];
    MeshData {
        vertices: vec![
            [x0, y0, z0],
            [x1, y0, z0],
            [x1, y1, z0],
            [x0, y1, z0],
            [x0, y0, z1],
            [x1, y0, z1],
            [x1, y1, z1],
            [x0, y1, z1],
        ],
        faces: vec![
            vec![0, 1, 2, 3],
            vec![4, 5, 6, 7],
            vec![0, 1, 5, 4],
            vec![1, 2, 6, 5],
            vec![2, 3, 7, 6],
            vec![3, 0, 4, 7],
        ],
    }
}

/// Writes `mesh` as Wavefront OBJ.
pub fn write_obj(path: &Path, mesh: &MeshData) -> std::io::Result<()> {
    let mut out = String::new();
    for [x, y, z] in &mesh.vertices {
        out.push_str(&format!("v {x} {y} {z}\n"));
    }
    for face in &mesh.faces {
        let indices: Vec<String> = face.iter().map(|i| (i + 1).to_string()).collect();
        out.push_str(&format!("f {}\n", indices.join(" ")));
    }
    fs::write(path, out)
}
