//! 仿射变换分解：把线性部分拆成 旋转 × 斜切，仅接受刚体运动或带符号的均匀缩放。

use glam::{DAffine3, DMat3, DVec3};
use thiserror::Error;

/// 判定均匀缩放的相对容差（相对于列长度平方的均值）。
pub const UNIFORM_SCALE_TOLERANCE: f64 = 1.0e-6;
/// 行列式绝对值低于该值视为奇异矩阵。
pub const SINGULAR_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum DecomposeError {
    #[error("变换包含非均匀缩放或剪切，列长度平方为 {squared_lengths:?}")]
    NonUniform { squared_lengths: [f64; 3] },
}

/// 分解结果：`linear = rotation * scale`，`scale < 0` 表示镜像。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decomposition {
    pub rotation: DMat3,
    pub translation: DVec3,
    pub scale: f64,
    /// 输入近似奇异或含非有限值，已回退为单位变换。
    pub degenerate: bool,
}

impl Decomposition {
    pub fn identity() -> Self {
        Self {
            rotation: DMat3::IDENTITY,
            translation: DVec3::ZERO,
            scale: 1.0,
            degenerate: false,
        }
    }

    #[inline]
    pub fn is_mirrored(&self) -> bool {
        self.scale < 0.0
    }

    #[inline]
    pub fn is_rigid(&self) -> bool {
        (self.scale - 1.0).abs() <= UNIFORM_SCALE_TOLERANCE
    }

    /// 去掉缩放后的刚体部分。
    pub fn rigid(&self) -> DAffine3 {
        DAffine3::from_mat3_translation(self.rotation, self.translation)
    }

    pub fn recompose(&self) -> DAffine3 {
        DAffine3::from_mat3_translation(self.rotation * self.scale, self.translation)
    }
}

pub fn decompose(transform: &DAffine3) -> Result<Decomposition, DecomposeError> {
    let linear = transform.matrix3;
    let translation = if transform.translation.is_finite() {
        transform.translation
    } else {
        DVec3::ZERO
    };

    let determinant = linear.determinant();
    if !linear.is_finite() || !determinant.is_finite() || determinant.abs() < SINGULAR_TOLERANCE {
        return Ok(Decomposition {
            translation,
            degenerate: true,
            ..Decomposition::identity()
        });
    }

    let gram = linear.transpose() * linear;
    let squared_lengths = [gram.x_axis.x, gram.y_axis.y, gram.z_axis.z];
    let mean = squared_lengths.iter().sum::<f64>() / 3.0;
    let tolerance = UNIFORM_SCALE_TOLERANCE * mean;

    for column in 0..3 {
        let values = gram.col(column).to_array();
        for (row, value) in values.iter().enumerate() {
            let expected = if row == column { mean } else { 0.0 };
            if (value - expected).abs() > tolerance {
                return Err(DecomposeError::NonUniform { squared_lengths });
            }
        }
    }

    let scale = determinant.signum() * determinant.abs().cbrt();
    Ok(Decomposition {
        rotation: linear * (1.0 / scale),
        translation,
        scale,
        degenerate: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DQuat;

    fn assert_affine_close(a: &DAffine3, b: &DAffine3) {
        assert!(a.abs_diff_eq(*b, 1e-9), "{a:?} != {b:?}");
    }

    #[test]
    fn identity_is_rigid() {
        let result = decompose(&DAffine3::IDENTITY).expect("identity decomposes");
        assert!(result.is_rigid());
        assert!(!result.is_mirrored());
        assert!(!result.degenerate);
    }

    #[test]
    fn rotation_translation_and_uniform_scale_recompose() {
        let transform = DAffine3::from_scale_rotation_translation(
            DVec3::splat(2.5),
            DQuat::from_euler(glam::EulerRot::ZYX, 0.7, -0.3, 1.1),
            DVec3::new(10.0, -4.0, 2.0),
        );
        let result = decompose(&transform).expect("uniform scale decomposes");
        assert!((result.scale - 2.5).abs() < 1e-9);
        assert!((result.rotation.determinant() - 1.0).abs() < 1e-9);
        assert_affine_close(&result.recompose(), &transform);
    }

    #[test]
    fn mirror_reports_negative_scale() {
        let transform = DAffine3::from_translation(DVec3::new(1.0, 2.0, 0.0))
            * DAffine3::from_rotation_z(0.4)
            * DAffine3::from_scale(DVec3::new(-3.0, 3.0, 3.0));
        let result = decompose(&transform).expect("mirror decomposes");
        assert!(result.is_mirrored());
        assert!((result.scale + 3.0).abs() < 1e-9);
        assert!((result.rotation.determinant() - 1.0).abs() < 1e-9);
        assert_affine_close(&result.recompose(), &transform);
    }

    #[test]
    fn shear_and_non_uniform_scale_fail() {
        let shear = DAffine3::from_mat3(DMat3::from_cols(
            DVec3::X,
            DVec3::new(0.5, 1.0, 0.0),
            DVec3::Z,
        ));
        assert!(matches!(decompose(&shear), Err(DecomposeError::NonUniform { .. })));

        let stretched = DAffine3::from_scale(DVec3::new(1.0, 2.0, 1.0));
        assert!(decompose(&stretched).is_err());
        // 重复调用结果一致
        assert_eq!(decompose(&stretched), decompose(&stretched));
    }

    #[test]
    fn singular_falls_back_to_flagged_identity() {
        let flat = DAffine3::from_scale(DVec3::new(1.0, 1.0, 0.0))
            * DAffine3::from_translation(DVec3::new(0.0, 0.0, 0.0));
        let moved = DAffine3 {
            translation: DVec3::new(5.0, 0.0, 0.0),
            ..flat
        };
        let result = decompose(&moved).expect("degenerate input still succeeds");
        assert!(result.degenerate);
        assert_eq!(result.rotation, DMat3::IDENTITY);
        assert_eq!(result.translation, DVec3::new(5.0, 0.0, 0.0));

        let nan = DAffine3::from_scale(DVec3::splat(f64::NAN));
        assert!(decompose(&nan).expect("nan degenerates").degenerate);
    }
}
