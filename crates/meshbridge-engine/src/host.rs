use std::path::{Path, PathBuf};

use meshbridge_contracts::{RemeshMode, RemeshStage};
use thiserror::Error;

pub type Vec3 = [f64; 3];

#[derive(Debug, Error)]
pub enum HostError {
    /// The object was deleted or renamed behind our back.
    #[error("scene object '{0}' no longer exists")]
    Invalidated(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;

/// World-space axis-aligned bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bounds = Self {
            min: first,
            max: first,
        };
        for point in iter {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(point[axis]);
                bounds.max[axis] = bounds.max[axis].max(point[axis]);
            }
        }
        Some(bounds)
    }

    pub fn dimensions(&self) -> Vec3 {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn max_dimension(&self) -> f64 {
        let [x, y, z] = self.dimensions();
        x.max(y).max(z)
    }

    pub fn center(&self) -> Vec3 {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    /// Orientation flag compared across regenerations.
    pub fn x_at_least_y(&self) -> bool {
        let [x, y, _] = self.dimensions();
        x >= y
    }
}

/// The 3D application hosting the plugin side of the pipeline.
///
/// Objects are addressed by name and every query re-resolves that name, so a
/// caller holding a name across steps learns about external deletion from a
/// `None` or `HostError::Invalidated` instead of touching a dead handle.
pub trait SceneHost {
    /// Renders the front/right/back/left views into `target_dir`, blocking
    /// until all four files exist.
    fn render_views(&mut self, target_dir: &Path, resolution: u32) -> HostResult<Vec<PathBuf>>;

    /// Imports a mesh file and returns the name of the new object, which also
    /// becomes the active object.
    fn import_mesh(&mut self, path: &Path) -> HostResult<String>;

    /// Visible top-level mesh objects, oldest first.
    fn mesh_objects(&self) -> Vec<String>;

    fn active_object(&self) -> Option<String>;

    /// `None` once the object no longer exists.
    fn bounds(&self, name: &str) -> Option<Bounds>;

    fn is_visible(&self, name: &str) -> Option<bool>;

    fn children(&self, name: &str) -> Vec<String>;

    /// Moves the origin to the bounding-box center without moving geometry.
    fn set_origin_to_bounds_center(&mut self, name: &str) -> HostResult<()>;

    fn set_location(&mut self, name: &str, location: Vec3) -> HostResult<()>;

    /// Uniform scale baked into vertex positions.
    fn apply_scale(&mut self, name: &str, factor: f64) -> HostResult<()>;

    /// Rotation about the vertical axis baked into vertex positions.
    fn apply_rotation_z(&mut self, name: &str, degrees: f64) -> HostResult<()>;

    fn apply_remesh(
        &mut self,
        name: &str,
        stage: RemeshStage,
        mode: RemeshMode,
        octree_depth: u8,
    ) -> HostResult<()>;

    fn set_visible(&mut self, name: &str, visible: bool) -> HostResult<()>;

    fn supports_remesh(&self) -> bool {
        true
    }
}

/// Snapshot of the mesh a new import replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneMeshRef {
    pub name: String,
    pub max_dimension: f64,
    pub x_at_least_y: bool,
    pub visible: bool,
}

impl SceneMeshRef {
    pub fn capture<H: SceneHost + ?Sized>(host: &H, name: &str) -> Option<Self> {
        let bounds = host.bounds(name)?;
        Some(Self {
            name: name.to_string(),
            max_dimension: bounds.max_dimension(),
            x_at_least_y: bounds.x_at_least_y(),
            visible: host.is_visible(name).unwrap_or(false),
        })
    }

    /// The object the next import visually replaces: the active object when
    /// it is a visible mesh, otherwise the newest visible mesh.
    pub fn current<H: SceneHost + ?Sized>(host: &H) -> Option<Self> {
        let meshes = host.mesh_objects();
        let name = host
            .active_object()
            .filter(|active| meshes.contains(active))
            .or_else(|| meshes.last().cloned())?;
        Self::capture(host, &name)
    }
}
