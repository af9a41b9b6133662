use std::f32::consts::TAU;

use glam::{Mat4, Vec3, Vec4};

use crate::accel::row_major_3x4;
use crate::mesh::{MeshSlot, SlotArray};

/// Animation state of the two mesh instances.
///
/// The ground never moves. The model is scaled by `pos_scale.w`, spun about
/// +Y by `angle`, then moved to `pos_scale.xyz`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneState {
    angle: f32,
    step: f32,
    pos_scale: Vec4,
}

impl SceneState {
    pub fn new(pos_scale: Vec4, step_degrees: f32) -> Self {
        SceneState {
            angle: 0.0,
            step: step_degrees.to_radians(),
            pos_scale,
        }
    }

    /// Advances the model rotation by one step, wrapping into [0, 2π).
    pub fn advance(&mut self) {
        self.angle = (self.angle + self.step).rem_euclid(TAU);
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn pos_scale(&self) -> Vec4 {
        self.pos_scale
    }

    pub fn rotation(&self) -> Mat4 {
        Mat4::from_rotation_y(self.angle)
    }

    pub fn ground_transform() -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, -0.5, 0.0))
            * Mat4::from_scale(Vec3::new(8.0, 0.5, 8.0))
    }

    pub fn model_transform(&self) -> Mat4 {
        Mat4::from_translation(self.pos_scale.truncate())
            * self.rotation()
            * Mat4::from_scale(Vec3::splat(self.pos_scale.w))
    }

    pub fn world_transforms(&self) -> SlotArray<Mat4> {
        SlotArray::from_fn(|slot| match slot {
            MeshSlot::Ground => Self::ground_transform(),
            MeshSlot::Model => self.model_transform(),
        })
    }

    /// Row-major 3x4 transforms in instance order.
    pub fn instance_transforms(&self) -> SlotArray<[f32; 12]> {
        self.world_transforms().map(|_, world| row_major_3x4(*world))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_accumulates_step() {
        let mut scene = SceneState::new(Vec4::new(0.0, 0.0, 0.0, 1.0), 0.1);
        for _ in 0..10 {
            scene.advance();
        }
        assert!((scene.angle() - 1.0f32.to_radians()).abs() < 1e-5);
    }

    #[test]
    fn test_advance_wraps() {
        let mut scene = SceneState::new(Vec4::ONE, 90.0);
        for _ in 0..5 {
            scene.advance();
        }
        assert!((scene.angle() - 90.0f32.to_radians()).abs() < 1e-5);
        assert!(scene.angle() < TAU);
    }

    #[test]
    fn test_ground_transform_is_fixed() {
        let mut scene = SceneState::new(Vec4::new(1.0, 2.0, 3.0, 0.5), 0.1);
        let before = scene.instance_transforms()[MeshSlot::Ground];
        scene.advance();
        assert_eq!(scene.instance_transforms()[MeshSlot::Ground], before);
        let top = SceneState::ground_transform().transform_point3(Vec3::new(0.0, 1.0, 0.0));
        assert!(top.abs_diff_eq(Vec3::ZERO, 1e-6));
    }

    #[test]
    fn test_model_transform_order() {
        let mut scene = SceneState::new(Vec4::new(1.0, 2.0, 3.0, 2.0), 90.0);
        scene.advance();
        // +X scaled to 2, then rotated a quarter turn about +Y onto -Z
        let p = scene.model_transform().transform_point3(Vec3::X);
        assert!(p.abs_diff_eq(Vec3::new(1.0, 2.0, 1.0), 1e-5));
        let rows = scene.instance_transforms()[MeshSlot::Model];
        assert_eq!([rows[3], rows[7], rows[11]], [1.0, 2.0, 3.0]);
    }
}
