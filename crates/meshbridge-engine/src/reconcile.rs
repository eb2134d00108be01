use meshbridge_contracts::{RemeshCycleState, RemeshStage};
use tracing::{debug, warn};

use crate::host::{HostError, SceneHost, SceneMeshRef};

/// Rotation applied when the new mesh's orientation flag disagrees with the
/// mesh it replaces.
pub const ORIENTATION_FIX_DEGREES: f64 = 45.0;

/// What a reconciliation pass did to a freshly imported mesh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconcileReport {
    /// Name the result ended up under. Differs from the imported name when
    /// the object vanished mid-pass and the active object was used instead.
    pub object: Option<String>,
    pub scale_factor: Option<f64>,
    pub rotated: bool,
    pub remesh: Option<(RemeshStage, u8)>,
    pub hidden: Vec<String>,
    pub warnings: Vec<String>,
    pub fallback: bool,
}

impl ReconcileReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

/// Fits a newly imported mesh to the one it replaces.
///
/// Steps run in a fixed order: recenter, scale, rotate, remesh, hide the
/// previous mesh. Each step re-resolves the object by name; a vanished object
/// degrades to the host's active object and never aborts the pass.
#[derive(Debug, Clone, Copy)]
pub struct MeshReconciler {
    remesh_available: bool,
}

impl MeshReconciler {
    pub fn new(remesh_available: bool) -> Self {
        Self { remesh_available }
    }

    pub fn reconcile<H: SceneHost + ?Sized>(
        &self,
        host: &mut H,
        new_name: &str,
        previous: Option<&SceneMeshRef>,
        remesh: &mut RemeshCycleState,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut name = new_name.to_string();

        let Some(bounds) = resolve(host, &mut name, &mut report).and_then(|n| host.bounds(&n))
        else {
            report.warn(format!("imported mesh '{new_name}' no longer resolves"));
            return report;
        };

        // Measured before any transform so rotation compares raw geometry.
        let new_max = bounds.max_dimension();
        let new_flag = bounds.x_at_least_y();
        let scale = if new_max <= 0.0 || !new_max.is_finite() {
            report.warn(format!(
                "mesh '{name}' has zero extent; scaling skipped"
            ));
            None
        } else {
            match previous {
                Some(prev) if prev.max_dimension > 0.0 => Some(prev.max_dimension / new_max),
                Some(prev) => {
                    report.warn(format!(
                        "previous mesh '{}' has zero extent; normalizing to unit size",
                        prev.name
                    ));
                    Some(1.0 / new_max)
                }
                None => Some(1.0 / new_max),
            }
        };

        self.step(host, &mut name, &mut report, "recenter", |host, n| {
            host.set_origin_to_bounds_center(n)?;
            host.set_location(n, [0.0; 3])
        });

        if let Some(factor) = scale {
            if self.step(host, &mut name, &mut report, "scale", |host, n| {
                host.apply_scale(n, factor)
            }) {
                report.scale_factor = Some(factor);
            }
        }

        if let Some(prev) = previous {
            if prev.x_at_least_y != new_flag
                && self.step(host, &mut name, &mut report, "rotate", |host, n| {
                    host.apply_rotation_z(n, ORIENTATION_FIX_DEGREES)
                })
            {
                report.rotated = true;
            }
        }

        if remesh.enabled {
            if !self.remesh_available || !host.supports_remesh() {
                report.warn("remesh requested but the host has no remesh operator".to_string());
            } else {
                let stage = remesh.stage;
                let mode = remesh.mode;
                if let Some(depth) = stage.octree_depth() {
                    if self.step(host, &mut name, &mut report, "remesh", |host, n| {
                        host.apply_remesh(n, stage, mode, depth)
                    }) {
                        report.remesh = Some((stage, depth));
                    }
                }
                remesh.advance();
                debug!(from = %stage, to = %remesh.stage, "remesh stage advanced");
            }
        }

        if let Some(prev) = previous {
            hide_with_children(host, &prev.name, &name, &mut report);
        }

        report.object = Some(name);
        report
    }

    /// Runs one step against the freshly resolved object. Returns whether it
    /// was applied.
    fn step<H, F>(
        &self,
        host: &mut H,
        name: &mut String,
        report: &mut ReconcileReport,
        label: &str,
        apply: F,
    ) -> bool
    where
        H: SceneHost + ?Sized,
        F: Fn(&mut H, &str) -> Result<(), HostError>,
    {
        let Some(target) = resolve(host, name, report) else {
            report.warn(format!("{label} skipped: no object to apply it to"));
            return false;
        };
        match apply(host, &target) {
            Ok(()) => true,
            Err(HostError::Invalidated(gone)) => {
                report.warn(format!("{label} skipped: '{gone}' was removed mid-step"));
                false
            }
            Err(err) => {
                report.warn(format!("{label} failed on '{target}': {err}"));
                false
            }
        }
    }
}

/// Re-resolves `name`; when it is gone, switches to the active object.
fn resolve<H: SceneHost + ?Sized>(
    host: &H,
    name: &mut String,
    report: &mut ReconcileReport,
) -> Option<String> {
    if host.bounds(name).is_some() {
        return Some(name.clone());
    }
    let fallback = host.active_object().filter(|active| host.bounds(active).is_some())?;
    report.warn(format!(
        "object '{name}' no longer resolves; continuing with active object '{fallback}'"
    ));
    report.fallback = true;
    *name = fallback.clone();
    Some(fallback)
}

fn hide_with_children<H: SceneHost + ?Sized>(
    host: &mut H,
    previous: &str,
    keep: &str,
    report: &mut ReconcileReport,
) {
    if previous == keep {
        return;
    }
    if host.is_visible(previous).is_none() {
        report.warn(format!(
            "previous mesh '{previous}' no longer exists; nothing to hide"
        ));
        return;
    }
    let mut targets = vec![previous.to_string()];
    targets.extend(host.children(previous));
    for target in targets {
        if target == keep {
            continue;
        }
        match host.set_visible(&target, false) {
            Ok(()) => report.hidden.push(target),
            Err(err) => report.warn(format!("could not hide '{target}': {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use meshbridge_contracts::RemeshMode;

    use super::*;
    use crate::headless::{box_mesh, HeadlessHost};

    fn previous(host: &mut HeadlessHost, size: [f64; 3]) -> SceneMeshRef {
        let name = host.add_object("previous", box_mesh([0.0; 3], size));
        SceneMeshRef::capture(host, &name).unwrap_or_else(|| panic!("previous mesh missing"))
    }

    #[test]
    fn scale_matches_previous_max_dimension() {
        let mut host = HeadlessHost::default();
        let prev = previous(&mut host, [10.0, 4.0, 2.0]);
        let name = host.add_object("new", box_mesh([3.0, 3.0, 3.0], [5.0, 2.0, 1.0]));

        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            &name,
            Some(&prev),
            &mut RemeshCycleState::default(),
        );
        assert_eq!(report.scale_factor, Some(2.0));
        assert!(!report.rotated);
        let bounds = host.bounds(&name).unwrap_or_else(|| panic!("new mesh missing"));
        assert!((bounds.max_dimension() - 10.0).abs() < 1e-9);
        assert!(bounds.center().iter().all(|v| v.abs() < 1e-9));
        assert_eq!(report.hidden, vec!["previous".to_string()]);
        assert_eq!(host.is_visible("previous"), Some(false));
    }

    #[test]
    fn zero_extent_skips_scaling_with_a_warning() {
        let mut host = HeadlessHost::default();
        let prev = previous(&mut host, [10.0, 4.0, 2.0]);
        let name = host.add_object("flat", box_mesh([1.0; 3], [0.0, 0.0, 0.0]));

        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            &name,
            Some(&prev),
            &mut RemeshCycleState::default(),
        );
        assert_eq!(report.scale_factor, None);
        assert!(report.warnings.iter().any(|w| w.contains("zero extent")));
    }

    #[test]
    fn orientation_mismatch_rotates_exactly_once() {
        let mut host = HeadlessHost::default();
        let prev = previous(&mut host, [4.0, 2.0, 1.0]);
        assert!(prev.x_at_least_y);
        let name = host.add_object("tall", box_mesh([0.0; 3], [1.0, 3.0, 1.0]));

        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            &name,
            Some(&prev),
            &mut RemeshCycleState::default(),
        );
        assert!(report.rotated);

        let mut host = HeadlessHost::default();
        let prev = previous(&mut host, [4.0, 2.0, 1.0]);
        let name = host.add_object("wide", box_mesh([0.0; 3], [3.0, 1.0, 1.0]));
        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            &name,
            Some(&prev),
            &mut RemeshCycleState::default(),
        );
        assert!(!report.rotated);
    }

    #[test]
    fn first_import_normalizes_to_unit_size() {
        let mut host = HeadlessHost::default();
        let name = host.add_object("first", box_mesh([0.0; 3], [4.0, 1.0, 2.0]));
        let report =
            MeshReconciler::new(true).reconcile(&mut host, &name, None, &mut RemeshCycleState::default());
        assert_eq!(report.scale_factor, Some(0.25));
        assert!(report.hidden.is_empty());
        assert!(!report.rotated);
    }

    #[test]
    fn remesh_stage_cycles_and_stage_three_is_a_no_op() {
        let mut host = HeadlessHost::default();
        let reconciler = MeshReconciler::new(true);
        let mut state = RemeshCycleState {
            enabled: true,
            mode: RemeshMode::Blocks,
            ..RemeshCycleState::default()
        };

        let mut stages = Vec::new();
        for idx in 0..4 {
            let previous = SceneMeshRef::current(&host);
            let name = host.add_object(&format!("gen{idx}"), box_mesh([0.0; 3], [2.0, 1.0, 1.0]));
            stages.push(state.stage.number());
            let report = reconciler.reconcile(&mut host, &name, previous.as_ref(), &mut state);
            assert_eq!(report.remesh.is_some(), idx % 3 != 2);
        }
        assert_eq!(stages, vec![1, 2, 3, 1]);
        let depths: Vec<u8> = host.remesh_log().iter().map(|r| r.octree_depth).collect();
        assert_eq!(depths, vec![5, 7, 5]);
    }

    #[test]
    fn missing_remesh_operator_leaves_stage_alone() {
        let mut host = HeadlessHost::new(false);
        let name = host.add_object("mesh", box_mesh([0.0; 3], [1.0; 3]));
        let mut state = RemeshCycleState {
            enabled: true,
            ..RemeshCycleState::default()
        };
        let report = MeshReconciler::new(true).reconcile(&mut host, &name, None, &mut state);
        assert_eq!(state.stage, RemeshStage::One);
        assert!(report.remesh.is_none());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn vanished_import_falls_back_to_active_object() {
        let mut host = HeadlessHost::default();
        let survivor = host.add_object("survivor", box_mesh([0.0; 3], [2.0; 3]));
        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            "deleted-by-tooling",
            None,
            &mut RemeshCycleState::default(),
        );
        assert!(report.fallback);
        assert_eq!(report.object.as_deref(), Some(survivor.as_str()));
        assert_eq!(report.scale_factor, Some(0.5));
    }

    #[test]
    fn nothing_to_resolve_is_reported_not_raised() {
        let mut host = HeadlessHost::default();
        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            "ghost",
            None,
            &mut RemeshCycleState::default(),
        );
        assert!(report.object.is_none());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn previous_children_are_hidden_too() -> Result<(), HostError> {
        let mut host = HeadlessHost::default();
        let prev_name = host.add_object("previous", box_mesh([0.0; 3], [1.0; 3]));
        let child = host.add_child(&prev_name, "rig", box_mesh([0.0; 3], [0.2; 3]))?;
        let prev = SceneMeshRef::capture(&host, &prev_name);
        let name = host.add_object("new", box_mesh([0.0; 3], [1.0; 3]));

        let report = MeshReconciler::new(true).reconcile(
            &mut host,
            &name,
            prev.as_ref(),
            &mut RemeshCycleState::default(),
        );
        assert_eq!(report.hidden, vec![prev_name, child.clone()]);
        assert_eq!(host.is_visible(&child), Some(false));
        Ok(())
    }
}
