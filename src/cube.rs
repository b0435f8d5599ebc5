// The one mesh we draw: a flat-shaded unit cube
//
// Eight corners of [0,1]^3 expanded into 36 vertices, two triangles per face,
// each face in its own color. Triangles are counter-clockwise when seen from
// outside the cube.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Interleaved position + color, both vec4 on the shader side
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

impl Vertex {
    const fn new(position: [f32; 4], color: [f32; 4]) -> Self {
        Self { position, color }
    }

    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position (location 0)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, position) as u32)
                .build(),
            // Color (location 1)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, color) as u32)
                .build(),
        ]
    }
}

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const YELLOW: [f32; 4] = [1.0, 1.0, 0.0, 1.0];
const MAGENTA: [f32; 4] = [1.0, 0.0, 1.0, 1.0];
const CYAN: [f32; 4] = [0.0, 1.0, 1.0, 1.0];

// Corners, named by which faces they touch
const LBF: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const RBF: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const RTF: [f32; 4] = [1.0, 1.0, 0.0, 1.0];
const LTF: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const RBB: [f32; 4] = [1.0, 0.0, 1.0, 1.0];
const LBB: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const RTB: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
const LTB: [f32; 4] = [0.0, 1.0, 1.0, 1.0];

/// Two triangles sharing the first and third corner
const fn face(a: [f32; 4], b: [f32; 4], c: [f32; 4], d: [f32; 4], color: [f32; 4]) -> [Vertex; 6] {
    [
        Vertex::new(a, color),
        Vertex::new(b, color),
        Vertex::new(c, color),
        Vertex::new(a, color),
        Vertex::new(c, color),
        Vertex::new(d, color),
    ]
}

const FRONT: [Vertex; 6] = face(LBF, LTF, RTF, RBF, RED);
const RIGHT: [Vertex; 6] = face(RBF, RTF, RTB, RBB, GREEN);
const LEFT: [Vertex; 6] = face(LBF, LBB, LTB, LTF, BLUE);
const TOP: [Vertex; 6] = face(LTF, LTB, RTB, RTF, YELLOW);
const BOTTOM: [Vertex; 6] = face(LBF, RBF, RBB, LBB, MAGENTA);
const BACK: [Vertex; 6] = face(LBB, RBB, RTB, LTB, CYAN);

pub const CUBE_FACES: [[Vertex; 6]; 6] = [FRONT, RIGHT, LEFT, TOP, BOTTOM, BACK];

pub const CUBE_VERTEX_COUNT: u32 = 36;

/// The cube as one flat triangle list
pub fn cube_vertices() -> Vec<Vertex> {
    CUBE_FACES.iter().flatten().copied().collect()
}

/// Static model-view-projection for the cube
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub eye: Vec3,
    pub fov_degrees: f32,
}

impl Camera {
    const NEAR: f32 = 0.1;
    const FAR: f32 = 100.0;

    pub fn new(eye: [f32; 3], fov_degrees: f32) -> Self {
        Self {
            eye: Vec3::from(eye),
            fov_degrees,
        }
    }

    /// Centers the unit cube on the origin and looks at it from `eye`.
    ///
    /// The projection uses a [0, 1] depth range and flips Y, since Vulkan's
    /// framebuffer Y axis points down.
    pub fn model_view_projection(&self, extent: vk::Extent2D) -> Mat4 {
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;

        let model = Mat4::from_translation(Vec3::splat(-0.5));
        let view = Mat4::look_at_rh(self.eye, Vec3::ZERO, Vec3::Y);
        let mut projection =
            Mat4::perspective_rh(self.fov_degrees.to_radians(), aspect, Self::NEAR, Self::FAR);
        projection.y_axis.y *= -1.0;

        projection * view * model
    }
}

/// Push constant block matching `cube.vert`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    pub mvp: [f32; 16],
}

impl PushConstants {
    pub const SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

    pub fn new(mvp: Mat4) -> Self {
        Self {
            mvp: mvp.to_cols_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn position(vertex: &Vertex) -> Vec4 {
        Vec4::from(vertex.position)
    }

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn thirty_six_vertices() {
        let vertices = cube_vertices();
        assert_eq!(vertices.len(), CUBE_VERTEX_COUNT as usize);
        assert_eq!(vertices.len() % 3, 0);
        assert!(vertices.iter().all(|v| v.position[3] == 1.0));
        assert!(vertices
            .iter()
            .flat_map(|v| v.position[..3].iter())
            .all(|&c| c == 0.0 || c == 1.0));
    }

    #[test]
    fn layout_matches_shader() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let [binding] = Vertex::binding_descriptions();
        assert_eq!(binding.stride, 32);

        let [pos, color] = Vertex::attribute_descriptions();
        assert_eq!((pos.location, pos.offset), (0, 0));
        assert_eq!((color.location, color.offset), (1, 16));

        assert_eq!(PushConstants::SIZE, 64);
    }

    #[test]
    fn every_triangle_faces_outward() {
        let center = Vec3::splat(0.5);
        for triangle in cube_vertices().chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| position(&triangle[i]).truncate());
            let normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(
                normal.dot(centroid - center) > 0.0,
                "triangle {:?} is wound inward",
                triangle
            );
        }
    }

    #[test]
    fn faces_are_flat_and_distinct() {
        let mut colors = Vec::new();
        for face in CUBE_FACES.iter() {
            let color = face[0].color;
            assert!(face.iter().all(|v| v.color == color));
            assert!(!colors.contains(&color));
            colors.push(color);

            // All six vertices of a face lie on one plane of the cube
            let axis = (0..3)
                .find(|&i| face.iter().all(|v| v.position[i] == face[0].position[i]))
                .expect("face is not axis aligned");
            let plane = face[0].position[axis];
            assert!(plane == 0.0 || plane == 1.0);
        }
    }

    #[test]
    fn camera_sees_the_whole_cube() {
        let camera = Camera::new([2.0, 1.5, 2.5], 45.0);
        let mvp = camera.model_view_projection(extent());

        let center = mvp * Vec4::new(0.5, 0.5, 0.5, 1.0);
        let ndc = center / center.w;
        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);

        for vertex in cube_vertices() {
            let clip = mvp * position(&vertex);
            assert!(clip.w > 0.0);
            let ndc = clip / clip.w;
            assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0);
            assert!((0.0..=1.0).contains(&ndc.z));
        }
    }

    #[test]
    fn y_axis_points_down_on_screen() {
        let camera = Camera::new([0.0, 0.0, 3.0], 45.0);
        let mvp = camera.model_view_projection(extent());
        let top = mvp * Vec4::new(0.5, 1.0, 0.5, 1.0);
        assert!(top.y / top.w < 0.0);
    }

    #[test]
    fn degenerate_extent_does_not_divide_by_zero() {
        let camera = Camera::new([2.0, 1.5, 2.5], 45.0);
        let mvp = camera.model_view_projection(vk::Extent2D {
            width: 0,
            height: 0,
        });
        assert!(mvp.is_finite());
    }
}
