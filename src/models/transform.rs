//! Rigid/affine placement transforms as delivered by the traversal engine.

use glam::{DAffine3, DMat3, DVec3};
use serde::{Deserialize, Serialize};

const IDENTITY_EPSILON: f64 = 1e-9;

/// An affine transform expressed as three basis vectors plus an origin.
///
/// Composition follows the host convention `parent.multiply(local)`: the
/// local transform is applied first, then the parent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransformRepr", into = "TransformRepr")]
pub struct Transform(DAffine3);

#[derive(Serialize, Deserialize)]
struct TransformRepr {
    #[serde(default = "unit_x")]
    basis_x: [f64; 3],
    #[serde(default = "unit_y")]
    basis_y: [f64; 3],
    #[serde(default = "unit_z")]
    basis_z: [f64; 3],
    #[serde(default)]
    origin: [f64; 3],
}

fn unit_x() -> [f64; 3] {
    [1.0, 0.0, 0.0]
}

fn unit_y() -> [f64; 3] {
    [0.0, 1.0, 0.0]
}

fn unit_z() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

impl From<TransformRepr> for Transform {
    fn from(repr: TransformRepr) -> Self {
        Transform::from_basis(repr.basis_x, repr.basis_y, repr.basis_z, repr.origin)
    }
}

impl From<Transform> for TransformRepr {
    fn from(t: Transform) -> Self {
        TransformRepr {
            basis_x: t.0.matrix3.x_axis.to_array(),
            basis_y: t.0.matrix3.y_axis.to_array(),
            basis_z: t.0.matrix3.z_axis.to_array(),
            origin: t.0.translation.to_array(),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform(DAffine3::IDENTITY);

    pub fn from_basis(
        basis_x: [f64; 3],
        basis_y: [f64; 3],
        basis_z: [f64; 3],
        origin: [f64; 3],
    ) -> Self {
        Transform(DAffine3::from_mat3_translation(
            DMat3::from_cols(
                DVec3::from_array(basis_x),
                DVec3::from_array(basis_y),
                DVec3::from_array(basis_z),
            ),
            DVec3::from_array(origin),
        ))
    }

    pub fn from_translation(origin: [f64; 3]) -> Self {
        Transform(DAffine3::from_translation(DVec3::from_array(origin)))
    }

    /// `self * local`.
    pub fn multiply(&self, local: &Transform) -> Transform {
        Transform(self.0 * local.0)
    }

    pub fn is_identity(&self) -> bool {
        self.0.abs_diff_eq(DAffine3::IDENTITY, IDENTITY_EPSILON)
    }

    pub fn origin(&self) -> [f64; 3] {
        self.0.translation.to_array()
    }

    pub fn apply_to_point(&self, point: [f64; 3]) -> [f64; 3] {
        self.0.transform_point3(DVec3::from_array(point)).to_array()
    }

    /// Column-major glTF node matrix, or `None` for the identity so the node
    /// can omit the property.
    pub fn to_gltf_matrix(&self) -> Option<[f32; 16]> {
        if self.is_identity() {
            return None;
        }
        let m = self.0.matrix3;
        let o = self.0.translation;
        Some([
            m.x_axis.x as f32,
            m.x_axis.y as f32,
            m.x_axis.z as f32,
            0.0,
            m.y_axis.x as f32,
            m.y_axis.y as f32,
            m.y_axis.z as f32,
            0.0,
            m.z_axis.x as f32,
            m.z_axis.y as f32,
            m.z_axis.z as f32,
            0.0,
            o.x as f32,
            o.y as f32,
            o.z as f32,
            1.0,
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_has_no_matrix() {
        assert!(Transform::IDENTITY.is_identity());
        assert_eq!(Transform::IDENTITY.to_gltf_matrix(), None);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let t = Transform::from_translation([1.0, 2.0, 3.0]);
        let m = t.to_gltf_matrix().unwrap();
        assert_eq!(&m[12..16], &[1.0, 2.0, 3.0, 1.0]);
        assert_eq!(m[0], 1.0);
        assert_eq!(m[5], 1.0);
        assert_eq!(m[10], 1.0);
    }

    #[test]
    fn multiply_applies_local_first() {
        // Rotate 90 degrees about Z, then translate.
        let parent = Transform::from_basis(
            [0.0, 1.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            [10.0, 0.0, 0.0],
        );
        let local = Transform::from_translation([1.0, 0.0, 0.0]);
        let combined = parent.multiply(&local);
        let p = combined.apply_to_point([0.0, 0.0, 0.0]);
        assert!((p[0] - 10.0).abs() < 1e-12);
        assert!((p[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn serde_defaults_to_identity() {
        let t: Transform = serde_json::from_str("{}").unwrap();
        assert!(t.is_identity());
        let t: Transform = serde_json::from_str(r#"{"origin":[0,0,5]}"#).unwrap();
        assert_eq!(t.origin(), [0.0, 0.0, 5.0]);
    }
}
