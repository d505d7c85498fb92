pub mod scene;
pub mod transform;

pub mod geometry {
    use std::f64::consts::TAU;

    use glam::{DAffine3, DVec3};
    use serde::{Deserialize, Serialize};

    /// 圆弧包围盒采样段数。
    const ARC_RANGE_SAMPLES: usize = 32;
    /// 任意轴算法的阈值（法向接近世界 Z 轴时改用 Y 轴叉乘）。
    const ARBITRARY_AXIS_LIMIT: f64 = 1.0 / 64.0;

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point3(DVec3);

    impl Point3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }
    }

    impl From<DVec3> for Point3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector3(DVec3);

    impl Vector3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn unit_z() -> Self {
            Self(DVec3::Z)
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        pub fn normalize(self) -> Option<Self> {
            let len_sq = self.length_squared();
            if len_sq <= f64::EPSILON {
                None
            } else {
                Some(Self(self.0 / len_sq.sqrt()))
            }
        }
    }

    impl From<DVec3> for Vector3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 三维轴对齐包围盒，空盒以 `min > max` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Range3 {
        min: DVec3,
        max: DVec3,
    }

    impl Range3 {
        pub fn new(min: DVec3, max: DVec3) -> Self {
            Self {
                min: min.min(max),
                max: min.max(max),
            }
        }

        pub fn empty() -> Self {
            Self {
                min: DVec3::splat(f64::INFINITY),
                max: DVec3::splat(f64::NEG_INFINITY),
            }
        }

        pub fn from_points(points: impl IntoIterator<Item = DVec3>) -> Self {
            let mut range = Self::empty();
            for point in points {
                range.include_point(point);
            }
            range
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
        }

        #[inline]
        pub fn min(&self) -> DVec3 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> DVec3 {
            self.max
        }

        pub fn include_point(&mut self, point: DVec3) {
            if !point.is_finite() {
                return;
            }
            self.min = self.min.min(point);
            self.max = self.max.max(point);
        }

        pub fn include_range(&mut self, other: &Range3) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        pub fn center(&self) -> DVec3 {
            (self.min + self.max) * 0.5
        }

        pub fn intersects(&self, other: &Range3) -> bool {
            if self.is_empty() || other.is_empty() {
                return false;
            }
            self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
        }

        /// 变换八个角点后重新求包围盒。
        pub fn transformed(&self, transform: &DAffine3) -> Range3 {
            if self.is_empty() {
                return *self;
            }
            let mut out = Range3::empty();
            for corner in 0..8 {
                let point = DVec3::new(
                    if corner & 1 == 0 { self.min.x } else { self.max.x },
                    if corner & 2 == 0 { self.min.y } else { self.max.y },
                    if corner & 4 == 0 { self.min.z } else { self.max.z },
                );
                out.include_point(transform.transform_point3(point));
            }
            out
        }
    }

    impl Default for Range3 {
        fn default() -> Self {
            Self::empty()
        }
    }

    /// DXF 任意轴算法：由法向求对象坐标系的 X 轴。
    pub fn arbitrary_x_axis(normal: DVec3) -> DVec3 {
        let n = normal.normalize_or_zero();
        if n == DVec3::ZERO {
            return DVec3::X;
        }
        let axis = if n.x.abs() < ARBITRARY_AXIS_LIMIT && n.y.abs() < ARBITRARY_AXIS_LIMIT {
            DVec3::Y.cross(n)
        } else {
            DVec3::Z.cross(n)
        };
        axis.normalize_or(DVec3::X)
    }

    /// 以中心与两条共轭半轴表示的椭圆弧；两轴正交且等长时即为圆弧。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct EllipticArc {
        pub center: DVec3,
        pub vector0: DVec3,
        pub vector90: DVec3,
        pub start: f64,
        pub sweep: f64,
    }

    impl EllipticArc {
        pub fn circular(center: DVec3, radius: f64, normal: DVec3, start: f64, sweep: f64) -> Self {
            let x_axis = arbitrary_x_axis(normal);
            let y_axis = normal.normalize_or(DVec3::Z).cross(x_axis);
            Self {
                center,
                vector0: x_axis * radius,
                vector90: y_axis * radius,
                start,
                sweep,
            }
        }

        #[inline]
        pub fn point_at(&self, angle: f64) -> DVec3 {
            self.center + self.vector0 * angle.cos() + self.vector90 * angle.sin()
        }

        pub fn start_point(&self) -> DVec3 {
            self.point_at(self.start)
        }

        pub fn end_point(&self) -> DVec3 {
            self.point_at(self.start + self.sweep)
        }

        pub fn is_full(&self) -> bool {
            self.sweep.abs() >= TAU - 1.0e-12
        }

        /// 圆弧半径；非圆时返回 `None`。
        pub fn radius(&self) -> Option<f64> {
            let r0 = self.vector0.length();
            let r90 = self.vector90.length();
            let orthogonal = self.vector0.dot(self.vector90).abs() <= 1.0e-9 * r0.max(r90).max(1.0);
            if orthogonal && (r0 - r90).abs() <= 1.0e-9 * r0.max(1.0) {
                Some(r0)
            } else {
                None
            }
        }

        pub fn transform(&mut self, transform: &DAffine3) {
            self.center = transform.transform_point3(self.center);
            self.vector0 = transform.transform_vector3(self.vector0);
            self.vector90 = transform.transform_vector3(self.vector90);
        }

        pub fn range(&self) -> Range3 {
            let mut range = Range3::empty();
            range.include_point(self.start_point());
            range.include_point(self.end_point());
            for step in 1..ARC_RANGE_SAMPLES {
                let t = step as f64 / ARC_RANGE_SAMPLES as f64;
                range.include_point(self.point_at(self.start + self.sweep * t));
            }
            range
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum CurvePrimitive {
        LineString { points: Vec<DVec3> },
        Arc(EllipticArc),
    }

    impl CurvePrimitive {
        pub fn transform(&mut self, transform: &DAffine3) {
            match self {
                CurvePrimitive::LineString { points } => {
                    for point in points.iter_mut() {
                        *point = transform.transform_point3(*point);
                    }
                }
                CurvePrimitive::Arc(arc) => arc.transform(transform),
            }
        }

        pub fn range(&self) -> Range3 {
            match self {
                CurvePrimitive::LineString { points } => Range3::from_points(points.iter().copied()),
                CurvePrimitive::Arc(arc) => arc.range(),
            }
        }

        fn weight(&self) -> usize {
            match self {
                CurvePrimitive::LineString { points } => points.len(),
                CurvePrimitive::Arc(_) => 3,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BoundaryLoop {
        pub points: Vec<DVec3>,
        pub hole: bool,
    }

    /// 转换后的边界几何。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Geometry {
        Curve {
            curve: CurvePrimitive,
        },
        Chain {
            segments: Vec<CurvePrimitive>,
            closed: bool,
        },
        Shape {
            points: Vec<DVec3>,
            filled: bool,
        },
        Region {
            loops: Vec<BoundaryLoop>,
        },
        /// 索引从 1 开始，0 分隔面片，负索引表示其后的边不可见。
        Polyface {
            points: Vec<DVec3>,
            indices: Vec<i32>,
        },
        PointString {
            points: Vec<DVec3>,
        },
        Text {
            origin: DVec3,
            x_axis: DVec3,
            y_axis: DVec3,
            content: String,
        },
        Extrusion {
            profile: Box<Geometry>,
            vector: DVec3,
            capped: bool,
        },
    }

    impl Geometry {
        pub fn line(start: DVec3, end: DVec3) -> Self {
            Geometry::Curve {
                curve: CurvePrimitive::LineString {
                    points: vec![start, end],
                },
            }
        }

        pub fn kind(&self) -> &'static str {
            match self {
                Geometry::Curve { .. } => "curve",
                Geometry::Chain { .. } => "chain",
                Geometry::Shape { .. } => "shape",
                Geometry::Region { .. } => "region",
                Geometry::Polyface { .. } => "polyface",
                Geometry::PointString { .. } => "point_string",
                Geometry::Text { .. } => "text",
                Geometry::Extrusion { .. } => "extrusion",
            }
        }

        pub fn transform(&mut self, transform: &DAffine3) {
            let apply = |points: &mut Vec<DVec3>| {
                for point in points.iter_mut() {
                    *point = transform.transform_point3(*point);
                }
            };
            match self {
                Geometry::Curve { curve } => curve.transform(transform),
                Geometry::Chain { segments, .. } => {
                    for segment in segments.iter_mut() {
                        segment.transform(transform);
                    }
                }
                Geometry::Shape { points, .. }
                | Geometry::Polyface { points, .. }
                | Geometry::PointString { points } => apply(points),
                Geometry::Region { loops } => {
                    for boundary in loops.iter_mut() {
                        apply(&mut boundary.points);
                    }
                }
                Geometry::Text {
                    origin,
                    x_axis,
                    y_axis,
                    ..
                } => {
                    *origin = transform.transform_point3(*origin);
                    *x_axis = transform.transform_vector3(*x_axis);
                    *y_axis = transform.transform_vector3(*y_axis);
                }
                Geometry::Extrusion {
                    profile, vector, ..
                } => {
                    profile.transform(transform);
                    *vector = transform.transform_vector3(*vector);
                }
            }
        }

        pub fn range(&self) -> Range3 {
            match self {
                Geometry::Curve { curve } => curve.range(),
                Geometry::Chain { segments, .. } => {
                    let mut range = Range3::empty();
                    for segment in segments {
                        range.include_range(&segment.range());
                    }
                    range
                }
                Geometry::Shape { points, .. }
                | Geometry::Polyface { points, .. }
                | Geometry::PointString { points } => Range3::from_points(points.iter().copied()),
                Geometry::Region { loops } => {
                    Range3::from_points(loops.iter().flat_map(|l| l.points.iter().copied()))
                }
                Geometry::Text {
                    origin,
                    x_axis,
                    y_axis,
                    content,
                } => {
                    let advance = *x_axis * content.chars().count().max(1) as f64;
                    Range3::from_points([*origin, *origin + advance, *origin + advance + *y_axis, *origin + *y_axis])
                }
                Geometry::Extrusion {
                    profile, vector, ..
                } => {
                    let base = profile.range();
                    let mut range = base;
                    range.include_range(&base.transformed(&DAffine3::from_translation(*vector)));
                    range
                }
            }
        }

        /// 粗略的几何体量（点数），用于元素分块。
        pub fn weight(&self) -> usize {
            match self {
                Geometry::Curve { curve } => curve.weight(),
                Geometry::Chain { segments, .. } => segments.iter().map(CurvePrimitive::weight).sum(),
                Geometry::Shape { points, .. }
                | Geometry::Polyface { points, .. }
                | Geometry::PointString { points } => points.len(),
                Geometry::Region { loops } => loops.iter().map(|l| l.points.len()).sum(),
                Geometry::Text { .. } => 2,
                Geometry::Extrusion { profile, .. } => profile.weight() * 2,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::{FRAC_PI_2, PI};

    use glam::{DAffine3, DVec3};

    use super::geometry::*;

    #[test]
    fn range_tracks_points_and_transforms() {
        let mut range = Range3::empty();
        assert!(range.is_empty());
        range.include_point(DVec3::new(1.0, 2.0, 0.0));
        range.include_point(DVec3::new(-1.0, 0.0, 3.0));
        assert_eq!(range.min(), DVec3::new(-1.0, 0.0, 0.0));
        assert_eq!(range.max(), DVec3::new(1.0, 2.0, 3.0));

        let moved = range.transformed(&DAffine3::from_translation(DVec3::new(10.0, 0.0, 0.0)));
        assert!((moved.min().x - 9.0).abs() < 1e-9);
        assert!((moved.max().x - 11.0).abs() < 1e-9);
        assert!(moved.intersects(&Range3::new(DVec3::new(10.0, 1.0, 1.0), DVec3::new(20.0, 2.0, 2.0))));
        assert!(!moved.intersects(&range));
    }

    #[test]
    fn circular_arc_on_xy_plane() {
        let arc = EllipticArc::circular(DVec3::ZERO, 2.0, DVec3::Z, 0.0, PI);
        let end = arc.end_point();
        assert!((end.x + 2.0).abs() < 1e-9);
        assert!(end.y.abs() < 1e-9);
        assert_eq!(arc.radius().map(|r| (r - 2.0).abs() < 1e-9), Some(true));

        let range = arc.range();
        assert!((range.max().y - 2.0).abs() < 1e-9);
        assert!(range.min().y.abs() < 1e-9);
    }

    #[test]
    fn arc_under_non_uniform_scale_is_elliptic() {
        let mut arc = EllipticArc::circular(DVec3::ZERO, 1.0, DVec3::Z, 0.0, FRAC_PI_2);
        arc.transform(&DAffine3::from_scale(DVec3::new(2.0, 1.0, 1.0)));
        assert!(arc.radius().is_none());
        assert!((arc.start_point().x - 2.0).abs() < 1e-9);
    }

    #[test]
    fn geometry_transform_and_weight() {
        let mut chain = Geometry::Chain {
            segments: vec![
                CurvePrimitive::LineString {
                    points: vec![DVec3::ZERO, DVec3::X, DVec3::new(1.0, 1.0, 0.0)],
                },
                CurvePrimitive::Arc(EllipticArc::circular(DVec3::ZERO, 1.0, DVec3::Z, 0.0, PI)),
            ],
            closed: false,
        };
        assert_eq!(chain.weight(), 6);
        chain.transform(&DAffine3::from_translation(DVec3::new(0.0, 0.0, 5.0)));
        let range = chain.range();
        assert!((range.min().z - 5.0).abs() < 1e-9);
        assert!((range.max().z - 5.0).abs() < 1e-9);
    }

    #[test]
    fn arbitrary_axis_matches_world_x_for_z_normal() {
        assert_eq!(arbitrary_x_axis(DVec3::Z), DVec3::X);
        let axis = arbitrary_x_axis(DVec3::X);
        assert!(axis.dot(DVec3::X).abs() < 1e-9);
        assert!((axis.length() - 1.0).abs() < 1e-9);
    }
}
