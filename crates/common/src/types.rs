use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Spatial transform: position, rotation, scale and the orientation of the
/// scale axes.
///
/// Entity transforms are stored relative to their environment; environment
/// transforms are relative to the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub scale_orientation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
        scale_orientation: Quat::IDENTITY,
    };

    /// Identity transform moved to `position`.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Identity transform rotated about +Y by `degrees`.
    pub fn from_y_rotation_degrees(degrees: f32) -> Self {
        Self {
            rotation: Quat::from_rotation_y(degrees.to_radians()),
            ..Self::IDENTITY
        }
    }

    /// Homogeneous matrix `T * R * SO * S * SO^-1`.
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_translation(self.position)
            * Mat4::from_quat(self.rotation)
            * Mat4::from_quat(self.scale_orientation)
            * Mat4::from_scale(self.scale)
            * Mat4::from_quat(self.scale_orientation.inverse())
    }

    /// Decompose an affine matrix. The scale orientation of the result is identity.
    pub fn from_mat4(m: Mat4) -> Self {
        let (scale, rotation, position) = m.to_scale_rotation_translation();
        Self {
            position,
            rotation: rotation.normalize(),
            scale,
            scale_orientation: Quat::IDENTITY,
        }
    }

    /// Inverse transform, so that `t.inverse() * t` is the identity.
    pub fn inverse(&self) -> Self {
        Self::from_mat4(self.to_mat4().inverse())
    }

    /// Apply this transform to a point.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.to_mat4().transform_point3(point)
    }

    /// Component-wise comparison with tolerance. Quaternions `q` and `-q`
    /// describe the same rotation and compare equal.
    pub fn abs_diff_eq(&self, other: &Self, eps: f32) -> bool {
        fn quat_eq(a: Quat, b: Quat, eps: f32) -> bool {
            a.abs_diff_eq(b, eps) || a.abs_diff_eq(-b, eps)
        }
        self.position.abs_diff_eq(other.position, eps)
            && self.scale.abs_diff_eq(other.scale, eps)
            && quat_eq(self.rotation, other.rotation, eps)
            && quat_eq(self.scale_orientation, other.scale_orientation, eps)
    }
}

impl Mul for Transform {
    type Output = Transform;

    /// Compose: `parent * child` maps child-local coordinates into the parent's space.
    fn mul(self, rhs: Transform) -> Transform {
        Transform::from_mat4(self.to_mat4() * rhs.to_mat4())
    }
}
