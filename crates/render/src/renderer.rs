use glam::Vec3;
use std::fmt::Write as _;
use worldbase_kernel::WorldDatabase;

/// Camera/view configuration for rendering.
#[derive(Debug, Clone, Copy)]
pub struct RenderView {
    /// Camera position in world space.
    pub eye: Vec3,
    /// Point the camera is looking at.
    pub target: Vec3,
    /// Field of view in degrees.
    pub fov_degrees: f32,
}

impl Default for RenderView {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 10.0, 10.0),
            target: Vec3::ZERO,
            fov_degrees: 60.0,
        }
    }
}

/// Produces output from a read-only view of the world database.
pub trait Renderer {
    type Output;

    fn render(&self, db: &WorldDatabase, view: &RenderView) -> Self::Output;
}

/// Plain-text frame: environments with their world bounds, tiles and the
/// world positions of resident entities.
#[derive(Debug, Default)]
pub struct DebugTextRenderer {
    /// Append the full database dump after the frame.
    pub verbose: bool,
}

impl DebugTextRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

impl Renderer for DebugTextRenderer {
    type Output = String;

    fn render(&self, db: &WorldDatabase, view: &RenderView) -> String {
        let mut out = String::new();
        let entities: usize = db.environments().map(|e| e.entity_count()).sum();
        let _ = writeln!(
            out,
            "=== World (environments={}, entities={}) ===",
            db.environments().count(),
            entities
        );
        let _ = writeln!(
            out,
            "Camera: eye=({:.1}, {:.1}, {:.1}) target=({:.1}, {:.1}, {:.1}) fov={:.0}",
            view.eye.x,
            view.eye.y,
            view.eye.z,
            view.target.x,
            view.target.y,
            view.target.z,
            view.fov_degrees
        );
        match db.environment_at_world_position(view.eye) {
            Some(env) => {
                let _ = writeln!(out, "Eye inside environment {}", env.id());
            }
            None => out.push_str("Eye outside all environments\n"),
        }

        for env in db.environments() {
            let (min_x, min_z, max_x, max_z) = env.world_bounds();
            let _ = writeln!(
                out,
                "  env {} [{}..{}) x [{}..{}) tiles={} entities={}{}",
                env.id(),
                min_x,
                max_x,
                min_z,
                max_z,
                env.grid().tile_count(),
                env.entity_count(),
                if env.is_visible() { "" } else { " (hidden)" }
            );
            for entity in env.entities() {
                let p = entity.world_transformation().position;
                let _ = writeln!(
                    out,
                    "    [{}] type={} pos=({:.2}, {:.2}, {:.2})",
                    entity.environment_based_id(),
                    entity.entity_type_id(),
                    p.x,
                    p.y,
                    p.z
                );
            }
        }

        if self.verbose {
            out.push_str(&db.dump());
        }
        out
    }
}
