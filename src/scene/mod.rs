//! Scene management
//!
//! The scene is an arena of [`SceneObject`]s linked by parent/child ids plus
//! an ordered light list. The renderer reads transforms and bounds from it
//! and writes back occlusion query state.

mod bounds;
mod camera;
mod light;

pub use bounds::*;
pub use camera::*;
pub use light::*;

use glam::Mat4;

use crate::backend::QueryHandle;
use crate::render_data::RenderData;

/// Index of an object in its [`Scene`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

/// GPU occlusion query bookkeeping for one object.
///
/// At most one query is outstanding per object. `visible` holds the result
/// of the last query that completed.
#[derive(Debug, Clone, Copy, Default)]
pub struct OcclusionState {
    pub(crate) query: Option<QueryHandle>,
    pub(crate) issued: bool,
    pub(crate) visible: bool,
}

impl OcclusionState {
    pub fn is_query_issued(&self) -> bool {
        self.issued
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

/// A node of the scene graph
#[derive(Debug)]
pub struct SceneObject {
    pub name: String,
    /// Transform relative to the parent
    pub local: Mat4,
    pub enabled: bool,
    pub render_data: Option<RenderData>,
    /// Draw only after a GPU occlusion query found visible samples
    pub occlusion_candidate: bool,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    world: Mat4,
    bounds: BoundingVolume,
    subtree_bounds: BoundingVolume,
    occlusion: OcclusionState,
}

impl SceneObject {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            local: Mat4::IDENTITY,
            enabled: true,
            render_data: None,
            occlusion_candidate: false,
            parent: None,
            children: Vec::new(),
            world: Mat4::IDENTITY,
            bounds: BoundingVolume::empty(),
            subtree_bounds: BoundingVolume::empty(),
            occlusion: OcclusionState::default(),
        }
    }

    pub fn with_render_data(mut self, render_data: RenderData) -> Self {
        self.render_data = Some(render_data);
        self
    }

    pub fn with_transform(mut self, local: Mat4) -> Self {
        self.local = local;
        self
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    /// Model matrix computed by [`Scene::update_transforms`]
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    /// World space bounds of this object's own mesh
    pub fn bounds(&self) -> BoundingVolume {
        self.bounds
    }

    /// World space bounds of this object and all its descendants
    pub fn subtree_bounds(&self) -> BoundingVolume {
        self.subtree_bounds
    }

    pub fn occlusion(&self) -> &OcclusionState {
        &self.occlusion
    }

    pub(crate) fn occlusion_mut(&mut self) -> &mut OcclusionState {
        &mut self.occlusion
    }
}

/// The scene containing all renderable content
#[derive(Debug, Default)]
pub struct Scene {
    objects: Vec<SceneObject>,
    roots: Vec<ObjectId>,
    pub lights: Vec<Light>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object under `parent`, or as a root.
    pub fn add_object(&mut self, mut object: SceneObject, parent: Option<ObjectId>) -> ObjectId {
        let id = ObjectId(self.objects.len());
        match parent {
            Some(p) if p.0 < self.objects.len() => {
                object.parent = Some(p);
                self.objects[p.0].children.push(id);
            }
            Some(p) => {
                log::error!("Scene: parent {:?} of {} does not exist", p, object.name);
                self.roots.push(id);
            }
            None => self.roots.push(id),
        }
        self.objects.push(object);
        id
    }

    pub fn add_light(&mut self, light: Light) -> usize {
        self.lights.push(light);
        self.lights.len() - 1
    }

    pub fn object(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(id.0)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(id.0)
    }

    pub fn roots(&self) -> &[ObjectId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &SceneObject)> {
        self.objects.iter().enumerate().map(|(i, o)| (ObjectId(i), o))
    }

    /// Recompute world matrices and subtree bounds, parents before children.
    pub fn update_transforms(&mut self) {
        let roots = self.roots.clone();
        for root in roots {
            self.update_subtree(root, Mat4::IDENTITY);
        }
    }

    fn update_subtree(&mut self, id: ObjectId, parent_world: Mat4) -> BoundingVolume {
        let object = &mut self.objects[id.0];
        object.world = parent_world * object.local;
        let world = object.world;
        object.bounds = match object.render_data.as_ref().and_then(|rd| rd.mesh()) {
            Some(mesh) => mesh.bounding_volume().transform(&world),
            None => BoundingVolume::empty(),
        };
        let mut subtree = object.bounds;
        let children = object.children.clone();
        for child in children {
            let child_bounds = self.update_subtree(child, world);
            subtree.expand_volume(&child_bounds);
        }
        self.objects[id.0].subtree_bounds = subtree;
        subtree
    }

    /// An object together with the light list, borrowed at the same time.
    pub(crate) fn object_and_lights_mut(
        &mut self,
        id: ObjectId,
    ) -> Option<(&mut SceneObject, &[Light])> {
        let object = self.objects.get_mut(id.0)?;
        Some((object, &self.lights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Material, Mesh};
    use glam::Vec3;
    use std::sync::Arc;

    fn cube_object(name: &str, at: Vec3) -> SceneObject {
        let mut rd = RenderData::new(Arc::new(Mesh::cube()));
        rd.add_pass(Arc::new(Material::new("", "")), None);
        SceneObject::new(name)
            .with_render_data(rd)
            .with_transform(Mat4::from_translation(at))
    }

    #[test]
    fn test_world_matrices_and_subtree_bounds() {
        let mut scene = Scene::new();
        let parent = scene.add_object(cube_object("parent", Vec3::new(1.0, 0.0, 0.0)), None);
        let child = scene.add_object(cube_object("child", Vec3::new(0.0, 2.0, 0.0)), Some(parent));
        scene.update_transforms();

        let child_obj = scene.object(child).unwrap();
        assert_eq!(child_obj.world_matrix().w_axis.truncate(), Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(child_obj.parent(), Some(parent));

        let parent_obj = scene.object(parent).unwrap();
        assert_eq!(parent_obj.bounds().max, Vec3::new(1.5, 0.5, 0.5));
        let subtree = parent_obj.subtree_bounds();
        assert_eq!(subtree.min, Vec3::new(0.5, -0.5, -0.5));
        assert_eq!(subtree.max, Vec3::new(1.5, 2.5, 0.5));
    }

    #[test]
    fn test_missing_parent_becomes_root() {
        let mut scene = Scene::new();
        let id = scene.add_object(SceneObject::new("orphan"), Some(ObjectId(7)));
        assert_eq!(scene.roots(), &[id]);
    }
}
