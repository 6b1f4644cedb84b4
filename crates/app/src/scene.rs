//! Scene data shared with the ray-march compute shader.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Workgroup size declared by `trace.comp`.
pub const LOCAL_SIZE: (u32, u32) = (16, 16);

/// Per-frame values pushed to the compute pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameParams {
    /// Camera position in xyz, vertical field of view in radians in w.
    pub camera: Vec4,
    /// Pixels actually traced this frame.
    pub render_extent: [u32; 2],
    pub time: f32,
    pub frame: u32,
}

impl FrameParams {
    /// Camera orbiting the origin once every twenty seconds.
    pub fn orbit(elapsed: f32, frame: u64, render_extent: vk::Extent2D) -> Self {
        let angle = elapsed * std::f32::consts::TAU / 20.0;
        let eye = Vec3::new(angle.sin() * 6.0, 2.0, angle.cos() * 6.0);
        Self {
            camera: eye.extend(45f32.to_radians()),
            render_extent: [render_extent.width, render_extent.height],
            time: elapsed,
            frame: frame as u32,
        }
    }
}

/// Lighting and march settings, bound as a uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TraceParams {
    /// Direction towards the sun, normalized.
    pub sun_dir: Vec4,
    pub sky_color: Vec4,
    pub sphere_count: u32,
    pub max_steps: u32,
    pub _pad: [u32; 2],
}

impl TraceParams {
    pub fn new(sphere_count: usize) -> Self {
        Self {
            sun_dir: Vec3::new(0.4, 0.8, 0.3).normalize().extend(0.0),
            sky_color: Vec4::new(0.45, 0.6, 0.85, 1.0),
            sphere_count: sphere_count as u32,
            max_steps: 128,
            _pad: [0; 2],
        }
    }

    /// Moves the sun along a slow arc.
    pub fn with_sun_at(mut self, elapsed: f32) -> Self {
        let angle = elapsed * 0.1;
        self.sun_dir = Vec3::new(angle.cos() * 0.5, 0.8, angle.sin() * 0.5)
            .normalize()
            .extend(0.0);
        self
    }
}

/// One sphere in the storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Sphere {
    /// Center in xyz, radius in w.
    pub center_radius: Vec4,
    pub albedo: Vec4,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32, albedo: Vec3) -> Self {
        Self {
            center_radius: center.extend(radius),
            albedo: albedo.extend(1.0),
        }
    }
}

/// A ring of spheres around a large ground sphere.
pub fn default_spheres() -> Vec<Sphere> {
    let mut spheres = vec![Sphere::new(
        Vec3::new(0.0, -1000.0, 0.0),
        999.0,
        Vec3::splat(0.6),
    )];
    let ring = 7;
    for i in 0..ring {
        let angle = i as f32 * std::f32::consts::TAU / ring as f32;
        let hue = i as f32 / ring as f32;
        spheres.push(Sphere::new(
            Vec3::new(angle.cos() * 2.5, 0.0, angle.sin() * 2.5),
            0.6,
            Vec3::new(hue, 1.0 - hue, 0.5),
        ));
    }
    spheres.push(Sphere::new(Vec3::ZERO, 1.0, Vec3::new(0.9, 0.9, 0.9)));
    spheres
}

/// The part of the storage image that is traced and shown.
///
/// The image keeps its creation size, so larger windows are upscaled.
pub fn render_extent(window: vk::Extent2D, image: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: window.width.min(image.width).max(1),
        height: window.height.min(image.height).max(1),
    }
}
