//! View frustum culling

use glam::{Mat4, Vec3, Vec4};

use crate::scene::{BoundingVolume, ObjectId, Scene};

/// Result of testing a volume against the frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

/// Six clip planes extracted from a view-projection matrix.
///
/// Plane normals point inward; `xyz` is normalized and `w` is the distance.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb/Hartmann plane extraction for a `[0, 1]` depth range.
    pub fn from_matrix(view_projection: &Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);
        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > f32::EPSILON {
                *plane /= len;
            }
        }
        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(point) + p.w >= 0.0)
    }

    pub fn classify(&self, volume: &BoundingVolume) -> Containment {
        if !volume.is_valid() {
            return Containment::Outside;
        }
        let mut inside = true;
        for plane in &self.planes {
            let normal = plane.truncate();
            // corner furthest along the normal, and the one opposite
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), volume.max, volume.min);
            let negative = Vec3::select(normal.cmpge(Vec3::ZERO), volume.min, volume.max);
            if normal.dot(positive) + plane.w < 0.0 {
                return Containment::Outside;
            }
            if normal.dot(negative) + plane.w < 0.0 {
                inside = false;
            }
        }
        if inside {
            Containment::Inside
        } else {
            Containment::Intersecting
        }
    }
}

/// A visible object and its distance to the camera.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Visible {
    pub id: ObjectId,
    pub distance: f32,
}

/// Walk the scene graph and collect every enabled object whose bounds
/// intersect the frustum. A subtree fully inside the frustum skips the
/// plane tests for its descendants.
pub(crate) fn frustum_cull(scene: &Scene, frustum: &Frustum, camera_position: Vec3) -> Vec<Visible> {
    let mut visible = Vec::new();
    for &root in scene.roots() {
        cull_subtree(scene, frustum, camera_position, root, true, &mut visible);
    }
    visible
}

fn cull_subtree(
    scene: &Scene,
    frustum: &Frustum,
    camera_position: Vec3,
    id: ObjectId,
    continue_cull: bool,
    out: &mut Vec<Visible>,
) {
    let Some(object) = scene.object(id) else {
        return;
    };
    if !object.enabled {
        return;
    }

    let mut continue_cull = continue_cull;
    if continue_cull {
        match frustum.classify(&object.subtree_bounds()) {
            Containment::Outside => return,
            Containment::Inside => continue_cull = false,
            Containment::Intersecting => {}
        }
    }

    let bounds = object.bounds();
    let drawable = object
        .render_data
        .as_ref()
        .is_some_and(|rd| rd.mesh().is_some() && rd.pass_count() > 0);
    if drawable && (!continue_cull || frustum.classify(&bounds) != Containment::Outside) {
        let center = if bounds.is_valid() {
            bounds.center()
        } else {
            object.world_matrix().w_axis.truncate()
        };
        out.push(Visible {
            id,
            distance: (center - camera_position).length(),
        });
    }

    for &child in object.children() {
        cull_subtree(scene, frustum, camera_position, child, continue_cull, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frustum() -> Frustum {
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        Frustum::from_matrix(&proj)
    }

    fn unit_box_at(center: Vec3) -> BoundingVolume {
        BoundingVolume::from_min_max(center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[test]
    fn test_classify() {
        let f = frustum();
        assert_eq!(f.classify(&unit_box_at(Vec3::new(0.0, 0.0, -5.0))), Containment::Inside);
        assert_eq!(f.classify(&unit_box_at(Vec3::new(0.0, 0.0, 5.0))), Containment::Outside);
        assert_eq!(
            f.classify(&unit_box_at(Vec3::new(5.0, 0.0, -5.0))),
            Containment::Intersecting
        );
        assert_eq!(f.classify(&unit_box_at(Vec3::new(0.0, 0.0, -200.0))), Containment::Outside);
        assert_eq!(f.classify(&BoundingVolume::empty()), Containment::Outside);
    }

    #[test]
    fn test_contains_point() {
        let f = frustum();
        assert!(f.contains_point(Vec3::new(0.0, 0.0, -1.0)));
        assert!(!f.contains_point(Vec3::new(0.0, 0.0, 1.0)));
    }
}
