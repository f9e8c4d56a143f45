// Per-image uniform data

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Matches the `UniformBufferObject` block in shaders/mesh.vert
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Model spinning around +Z at 90 degrees per second, seen from above at an angle
    pub fn spinning(elapsed_secs: f32, width: u32, height: u32) -> Self {
        let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);

        let aspect = width as f32 / height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn projection_flips_y_and_tracks_aspect() {
        let ubo = UniformBufferObject::spinning(0.0, 1600, 800);

        assert!(ubo.proj.y_axis.y < 0.0);
        // x scale = y scale / aspect
        assert_relative_eq!(ubo.proj.x_axis.x, -ubo.proj.y_axis.y / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn model_rotates_a_quarter_turn_per_second() {
        let ubo = UniformBufferObject::spinning(1.0, 800, 600);
        let rotated = ubo.model.transform_vector3(Vec3::X);

        assert_relative_eq!(rotated.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(rotated.y, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let ubo = UniformBufferObject::spinning(0.0, 800, 0);
        assert!(ubo.proj.x_axis.x.is_finite());
    }

    #[test]
    fn layout_is_three_column_major_matrices() {
        assert_eq!(UniformBufferObject::SIZE, 3 * 64);
    }
}
