//! 图元参数到边界几何的转换规则。

use glam::DVec3;
use thiserror::Error;
use zbridge_core::geometry::{
    BoundaryLoop, CurvePrimitive, EllipticArc, Geometry, Point3, arbitrary_x_axis,
};
use zbridge_core::scene::{Color, ColorOverrides, PolylineVertex};

/// |bulge| 小于该值视为直线段。
pub const ZERO_BULGE: f64 = 1.0e-8;
/// |bulge| 大于该值时包角已在舍入误差内接近整圆，按直线处理并报告。
pub const MAX_BULGE: f64 = 1.0e4;
/// 二维目标下允许的 Z 偏差。
pub const PLANAR_TOLERANCE: f64 = 1.0e-4;
/// 点重合判定容差。
pub const POINT_TOLERANCE: f64 = 1.0e-10;
/// 超过该长度的面表不再逐面扫描最大顶点数。
pub const LARGE_FACE_LIST: usize = 1000;
pub const LARGE_FACE_LIST_MAX: usize = 100;
/// 厚度绝对值低于该值视为无厚度。
pub const THICKNESS_EPSILON: f64 = 1.0e-10;
/// 点列允许的最大点数，超出视为数据损坏。
pub const MAX_DOT_COUNT: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionIssue {
    #[error("non-finite coordinates")]
    NonFinite,
    #[error("face vertex count of {count} [expected {max}]")]
    FaceVertexCountExceeded { count: usize, max: usize },
    #[error("face index {index} out of range for {len} points")]
    IndexOutOfRange { index: i32, len: usize },
    #[error("face list truncated at entry {0}")]
    TruncatedFaceList(usize),
    #[error("mesh of {rows}x{columns} has only {points} points")]
    GridSizeMismatch {
        rows: usize,
        columns: usize,
        points: usize,
    },
    #[error("point count of {count} exceeds the limit of {max}")]
    PointCountExceeded { count: usize, max: usize },
    #[error("non-planar geometry rejected by a 2D target")]
    NonPlanar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolylineOutcome {
    pub geometry: Option<Geometry>,
    /// 超出有效角度范围、被当作直线处理的凸度段数。
    pub rejected_bulges: usize,
}

/// 由弦端点与凸度求圆弧。凸度为正时绕法向逆时针。
pub fn bulge_arc(start: DVec3, end: DVec3, bulge: f64, normal: DVec3) -> Option<EllipticArc> {
    let chord = end - start;
    let length = chord.length();
    if length < POINT_TOLERANCE || bulge.abs() < ZERO_BULGE || bulge.abs() > MAX_BULGE {
        return None;
    }
    let normal = normal.normalize_or(DVec3::Z);
    let theta = 4.0 * bulge.atan();
    let half = theta * 0.5;
    let radius = length / (2.0 * half.sin().abs());
    let left = normal.cross(chord / length);
    let center = (start + end) * 0.5 + left * (length * 0.5 / half.tan());

    let x_axis = arbitrary_x_axis(normal);
    let y_axis = normal.cross(x_axis);
    let offset = start - center;
    let start_angle = offset.dot(y_axis).atan2(offset.dot(x_axis));
    Some(EllipticArc::circular(center, radius, normal, start_angle, theta))
}

/// 多段线：零凸度段合并为一条折线，插入圆弧前先冲刷当前折线。
pub fn polyline_geometry(
    vertices: &[PolylineVertex],
    closed: bool,
    normal: DVec3,
) -> Result<PolylineOutcome, ConversionIssue> {
    if vertices
        .iter()
        .any(|vertex| !vertex.position.is_finite() || !vertex.bulge.is_finite())
    {
        return Err(ConversionIssue::NonFinite);
    }
    if vertices.len() < 2 {
        return Ok(PolylineOutcome {
            geometry: None,
            rejected_bulges: 0,
        });
    }

    let count = vertices.len();
    let segment_count = if closed { count } else { count - 1 };
    let mut segments: Vec<CurvePrimitive> = Vec::new();
    let mut run: Vec<DVec3> = Vec::new();
    let mut rejected_bulges = 0;

    for index in 0..segment_count {
        let start = vertices[index].position.as_vec3();
        let end = vertices[(index + 1) % count].position.as_vec3();
        let bulge = vertices[index].bulge;
        if start.distance(end) < POINT_TOLERANCE {
            continue;
        }

        if bulge.abs() > MAX_BULGE {
            rejected_bulges += 1;
        }
        match bulge_arc(start, end, bulge, normal) {
            Some(arc) => {
                flush_run(&mut run, &mut segments);
                segments.push(CurvePrimitive::Arc(arc));
            }
            None => {
                if run.is_empty() {
                    run.push(start);
                }
                run.push(end);
            }
        }
    }
    flush_run(&mut run, &mut segments);

    let geometry = match segments.len() {
        0 => None,
        1 if matches!(segments[0], CurvePrimitive::LineString { .. }) => {
            segments.pop().map(|curve| Geometry::Curve { curve })
        }
        _ => Some(Geometry::Chain { segments, closed }),
    };
    Ok(PolylineOutcome {
        geometry,
        rejected_bulges,
    })
}

fn flush_run(run: &mut Vec<DVec3>, segments: &mut Vec<CurvePrimitive>) {
    if run.len() >= 2 {
        segments.push(CurvePrimitive::LineString {
            points: std::mem::take(run),
        });
    } else {
        run.clear();
    }
}

/// 2×2 网格折叠为一个四边形，其余生成四边形网格面。
pub fn mesh_geometry(
    rows: usize,
    columns: usize,
    points: &[Point3],
    planar_only: bool,
) -> Result<Option<Geometry>, ConversionIssue> {
    let Some(total) = rows.checked_mul(columns) else {
        return Err(ConversionIssue::GridSizeMismatch {
            rows,
            columns,
            points: points.len(),
        });
    };
    if total == 0 {
        return Ok(None);
    }
    if points.len() < total {
        return Err(ConversionIssue::GridSizeMismatch {
            rows,
            columns,
            points: points.len(),
        });
    }
    let grid: Vec<DVec3> = points[..total].iter().map(|p| p.as_vec3()).collect();
    if grid.iter().any(|p| !p.is_finite()) {
        return Err(ConversionIssue::NonFinite);
    }

    if rows == 2 && columns == 2 {
        return Ok(Some(Geometry::Shape {
            points: vec![grid[0], grid[1], grid[3], grid[2], grid[0]],
            filled: false,
        }));
    }
    if planar_only && grid.iter().any(|p| p.z.abs() > PLANAR_TOLERANCE) {
        return Err(ConversionIssue::NonPlanar);
    }
    if rows < 2 || columns < 2 {
        return Ok(Some(Geometry::Curve {
            curve: CurvePrimitive::LineString { points: grid },
        }));
    }

    let mut indices = Vec::with_capacity((rows - 1) * (columns - 1) * 5);
    for row in 0..rows - 1 {
        for column in 0..columns - 1 {
            let first = row * columns + column;
            for index in [first, first + 1, first + columns + 1, first + columns] {
                indices.push(index as i32 + 1);
            }
            indices.push(0);
        }
    }
    Ok(Some(Geometry::Polyface {
        points: grid,
        indices,
    }))
}

/// 等距点列。
pub fn row_of_dots(count: usize, start: DVec3, step: DVec3) -> Result<Option<Geometry>, ConversionIssue> {
    if count == 0 {
        return Ok(None);
    }
    if count > MAX_DOT_COUNT {
        return Err(ConversionIssue::PointCountExceeded {
            count,
            max: MAX_DOT_COUNT,
        });
    }
    if !start.is_finite() || !step.is_finite() {
        return Err(ConversionIssue::NonFinite);
    }
    let points: Vec<DVec3> = (0..count).map(|i| start + step * i as f64).collect();
    if points.iter().any(|p| !p.is_finite()) {
        return Err(ConversionIssue::NonFinite);
    }
    Ok(Some(Geometry::PointString { points }))
}

/// 面表中单面最大顶点数。超长面表不逐面扫描，取经验上限。
pub fn max_face_vertices(faces: &[i32]) -> usize {
    if faces.len() > LARGE_FACE_LIST {
        let first = faces[0].unsigned_abs() as usize;
        return if first > LARGE_FACE_LIST_MAX {
            20 * first
        } else {
            LARGE_FACE_LIST_MAX
        };
    }
    let mut max = 0;
    let mut cursor = 0;
    while cursor < faces.len() {
        let count = faces[cursor].unsigned_abs() as usize;
        max = max.max(count);
        cursor += count + 1;
    }
    max
}

struct FaceLoop<'f> {
    hole: bool,
    indices: &'f [i32],
}

/// 按面表依次切出每个环；结构损坏时整体失败，不输出部分结果。
fn split_faces(faces: &[i32], point_count: usize) -> Result<Vec<FaceLoop<'_>>, ConversionIssue> {
    let max = max_face_vertices(faces);
    let mut loops = Vec::new();
    let mut cursor = 0;
    while cursor < faces.len() {
        let header = faces[cursor];
        let count = header.unsigned_abs() as usize;
        if count > max {
            return Err(ConversionIssue::FaceVertexCountExceeded { count, max });
        }
        let begin = cursor + 1;
        let end = begin + count;
        if end > faces.len() {
            return Err(ConversionIssue::TruncatedFaceList(cursor));
        }
        let indices = &faces[begin..end];
        if let Some(&bad) = indices
            .iter()
            .find(|&&index| index < 0 || index as usize >= point_count)
        {
            return Err(ConversionIssue::IndexOutOfRange {
                index: bad,
                len: point_count,
            });
        }
        loops.push(FaceLoop {
            hole: header < 0,
            indices,
        });
        cursor = end;
    }
    Ok(loops)
}

/// 二维目标：面表转为区域，正计数为实体环、负计数为孔洞环。
pub fn shell_region(points: &[Point3], faces: &[i32]) -> Result<Option<Geometry>, ConversionIssue> {
    let loops = split_faces(faces, points.len())?;
    let mut boundaries = Vec::with_capacity(loops.len());
    for face in loops {
        let mut vertices: Vec<DVec3> = Vec::with_capacity(face.indices.len());
        for &index in face.indices {
            let vertex = points[index as usize].as_vec3();
            if !vertex.is_finite() {
                return Err(ConversionIssue::NonFinite);
            }
            if vertex.z.abs() > PLANAR_TOLERANCE {
                return Err(ConversionIssue::NonPlanar);
            }
            // 与首点重合的顶点（三角形 SOLID 常见）直接丢弃
            if let Some(first) = vertices.first() {
                if first.distance(vertex) <= POINT_TOLERANCE {
                    continue;
                }
            }
            vertices.push(vertex);
        }
        if vertices.len() >= 3 {
            boundaries.push(BoundaryLoop {
                points: vertices,
                hole: face.hole,
            });
        }
    }
    if boundaries.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Geometry::Region { loops: boundaries }))
    }
}

/// 三维目标：面表转为网格面，不可见边以负索引标记。
pub fn shell_polyface(
    points: &[Point3],
    faces: &[i32],
    edge_visibility: Option<&[bool]>,
) -> Result<Option<Geometry>, ConversionIssue> {
    let loops = split_faces(faces, points.len())?;
    let vertices: Vec<DVec3> = points.iter().map(|p| p.as_vec3()).collect();
    if vertices.iter().any(|p| !p.is_finite()) {
        return Err(ConversionIssue::NonFinite);
    }
    let mut indices = Vec::with_capacity(faces.len());
    let mut edge = 0;
    for face in loops {
        let mut face_indices = Vec::with_capacity(face.indices.len());
        let mut first: Option<DVec3> = None;
        for &index in face.indices {
            let visible = edge_visibility
                .and_then(|flags| flags.get(edge).copied())
                .unwrap_or(true);
            edge += 1;
            let vertex = vertices[index as usize];
            match first {
                None => first = Some(vertex),
                // 与首点重合的顶点丢弃，边标志仍按原位置计数
                Some(first) if first.distance(vertex) <= POINT_TOLERANCE => continue,
                Some(_) => {}
            }
            let one_based = index + 1;
            face_indices.push(if visible { one_based } else { -one_based });
        }
        if face_indices.len() >= 3 {
            indices.extend(face_indices);
            indices.push(0);
        }
    }
    if indices.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Geometry::Polyface {
            points: vertices,
            indices,
        }))
    }
}

/// 只取首个面/边颜色；边颜色优先，除非有面颜色且按着色输出。
pub fn color_override(overrides: &ColorOverrides, prefer_face_colors: bool) -> Option<Color> {
    let face = overrides.face_colors.first().copied();
    let edge = overrides.edge_colors.first().copied();
    match (face, edge) {
        (Some(face), Some(_)) if prefer_face_colors => Some(face),
        (_, Some(edge)) => Some(edge),
        (face, None) => face,
    }
}

pub fn extrude(profile: Geometry, normal: DVec3, thickness: f64, capped: bool) -> Geometry {
    Geometry::Extrusion {
        profile: Box::new(profile),
        vector: normal.normalize_or(DVec3::Z) * thickness,
        capped,
    }
}
