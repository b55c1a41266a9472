//! Headless sessions: a scene, a set of mounted extensions and a scripted
//! sequence of host actions, plus the report produced by running them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::camera::CameraRecord;
use crate::capability::{ExtensionKind, Placement};
use crate::config::BridgeConfig;
use crate::diagnostics::ExtensionDiagnostic;
use crate::events::MouseEvent;
use crate::extension_log::LogLine;
use crate::host::{ClockState, HeadlessEngine, LayerHost, RenderingEngine, TreeHost, Viewport};
use crate::layer::{Layer, Tag};
use crate::shell::{command_counts, AppliedCommand, BridgeContext, EditorShell, MountRequest};

/// One extension to mount at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionMount {
    pub instance_id: String,
    pub extension_id: String,
    pub placement: Placement,

    /// Path to the Rhai source, relative to the session file.
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Inline source. Used when `script` is absent.
    #[serde(default)]
    pub source: Option<String>,
}

/// A host-side change applied between pumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostAction {
    MoveCamera {
        camera: Option<CameraRecord>,
    },
    #[serde(rename_all = "camelCase")]
    Select {
        #[serde(default)]
        layer_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Tick {
        seconds: f64,
    },
    Resize(Viewport),
    Pointer(MouseEvent),
    Hide {
        ids: Vec<String>,
    },
    Show {
        ids: Vec<String>,
    },
    ReplaceScene {
        scene: Layer,
    },
    SetSceneProperty {
        property: Value,
    },
    SetTags {
        tags: Vec<Tag>,
    },
    #[serde(rename_all = "camelCase")]
    Unmount {
        instance_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Reload {
        instance_id: String,
        #[serde(default)]
        script: Option<PathBuf>,
        #[serde(default)]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResetRunCount {
        #[serde(default)]
        instance_id: Option<String>,
    },
    Pump,
}

/// Everything needed to replay a session deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    #[serde(default)]
    pub config: BridgeConfig,

    /// Root of the layer tree.
    pub scene: Layer,

    #[serde(default)]
    pub camera: Option<CameraRecord>,

    #[serde(default)]
    pub clock: Option<ClockState>,

    #[serde(default)]
    pub viewport: Option<Viewport>,

    #[serde(default)]
    pub tags: Vec<Tag>,

    #[serde(default)]
    pub scene_property: Value,

    #[serde(default)]
    pub extensions: Vec<ExtensionMount>,

    #[serde(default)]
    pub actions: Vec<HostAction>,
}

impl SessionSpec {
    /// Load a session file. Returns the spec and the directory script paths
    /// are resolved against.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session {}", path.display()))?;
        let spec: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse session {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((spec, base))
    }
}

/// Per-instance section of the report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionReport {
    pub instance_id: String,
    pub extension_id: String,
    pub kind: ExtensionKind,

    /// SHA-256 of the last source the instance ran.
    pub source_sha256: String,

    /// `None` once the instance was unmounted.
    pub run_count: Option<u32>,

    pub logs: Vec<LogLine>,
    pub diagnostics: Vec<ExtensionDiagnostic>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub engine: String,
    pub extensions: Vec<ExtensionReport>,
    pub command_counts: BTreeMap<String, usize>,

    /// Bridge-level diagnostics (message routing failures).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<ExtensionDiagnostic>,

    pub final_camera: Option<CameraRecord>,
    pub visible_layers: Vec<String>,

    /// Common slices captured by the inspection hook.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inspected: Vec<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SessionReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))
    }
}

/// Hex SHA-256 of a script source.
pub fn source_digest(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn resolve_source(
    base_dir: &Path,
    script: Option<&Path>,
    inline: Option<&str>,
) -> Result<Option<String>> {
    match (script, inline) {
        (Some(script), _) => {
            let path = base_dir.join(script);
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Ok(Some(source))
        }
        (None, Some(inline)) => Ok(Some(inline.to_string())),
        (None, None) => Ok(None),
    }
}

type Shell = EditorShell<HeadlessEngine, TreeHost>;

fn report_for(shell: &Shell, id: &str) -> Option<ExtensionReport> {
    let record = shell.registry().get(id)?;
    Some(ExtensionReport {
        instance_id: id.to_string(),
        extension_id: record.extension_id.clone(),
        kind: record.kind,
        source_sha256: source_digest(shell.instance_source(id).unwrap_or_default()),
        run_count: Some(record.run_count),
        logs: shell.instance_logs(id),
        diagnostics: shell.instance_diagnostics(id),
    })
}

/// Execute `spec` headlessly and report what happened.
pub fn run_session(spec: SessionSpec, base_dir: &Path) -> Result<SessionReport> {
    let started_at = Utc::now();
    let mut warnings = Vec::new();
    if let Some(id) = spec.scene.first_duplicate_id() {
        bail!("Scene has duplicate layer id {id:?}");
    }

    let inspected = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&inspected);
    let ctx = BridgeContext::new(spec.config.clone())
        .with_inspect(Box::new(move |common| sink.borrow_mut().push(common.to_json())));

    let mut engine = HeadlessEngine::new(spec.config.engine_name.clone());
    engine.set_camera(spec.camera);
    let mut shell = EditorShell::new(ctx, engine, TreeHost::new(spec.scene));
    if let Some(clock) = spec.clock {
        shell.set_clock(clock);
    }
    if let Some(viewport) = spec.viewport {
        shell.resize(viewport);
    }
    if !spec.tags.is_empty() {
        shell.set_tags(spec.tags);
    }
    if !spec.scene_property.is_null() {
        shell.set_scene_property(spec.scene_property);
    }

    let mut applied: Vec<AppliedCommand> = Vec::new();
    let mut finished: BTreeMap<String, ExtensionReport> = BTreeMap::new();

    for mount in spec.extensions {
        let source = resolve_source(base_dir, mount.script.as_deref(), mount.source.as_deref())?;
        let Some(source) = source else {
            bail!("Extension {} has neither script nor source", mount.instance_id);
        };
        let instance_id = mount.instance_id.clone();
        let result = shell.mount(MountRequest {
            instance_id: mount.instance_id,
            extension_id: mount.extension_id,
            placement: mount.placement,
            source,
        });
        if let Err(err) = result {
            log::warn!("Mount of {instance_id} failed: {err}");
            warnings.push(format!("mount {instance_id}: {err}"));
        }
        applied.extend(shell.take_applied());
    }

    for (index, action) in spec.actions.into_iter().enumerate() {
        log::debug!("Action {index}: {action:?}");
        let outcome = apply_action(&mut shell, action, base_dir, &mut finished)?;
        if let Err(message) = outcome {
            log::warn!("Action {index} failed: {message}");
            warnings.push(format!("action {index}: {message}"));
        }
        let step = shell.take_applied();
        if !step.is_empty() {
            log::info!("Action {index} applied {} command(s)", step.len());
        }
        applied.extend(step);
    }

    for id in shell.registry().ids() {
        if let Some(report) = report_for(&shell, id) {
            finished.insert(id.clone(), report);
        }
    }

    let visible_layers = shell
        .store()
        .snapshot()
        .flattened_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let inspected = inspected.borrow().clone();

    Ok(SessionReport {
        started_at,
        finished_at: Utc::now(),
        engine: spec.config.engine_name,
        extensions: finished.into_values().collect(),
        command_counts: command_counts(&applied),
        diagnostics: shell.diagnostics().iter().cloned().collect(),
        final_camera: shell.engine().camera(),
        visible_layers,
        inspected,
        warnings,
    })
}

/// Apply one action. The outer error aborts the session (unreadable files);
/// the inner one is recorded as a warning and the session continues.
fn apply_action(
    shell: &mut Shell,
    action: HostAction,
    base_dir: &Path,
    finished: &mut BTreeMap<String, ExtensionReport>,
) -> Result<std::result::Result<(), String>> {
    match action {
        HostAction::MoveCamera { camera } => {
            shell.engine_mut().set_camera(camera);
            shell.pump();
        }
        HostAction::Select { layer_id, reason } => {
            shell
                .host_mut()
                .select(layer_id.as_deref(), reason.as_deref());
            shell.pump();
        }
        HostAction::Tick { seconds } => shell.tick(seconds),
        HostAction::Resize(viewport) => shell.resize(viewport),
        HostAction::Pointer(event) => {
            shell.engine_mut().push_mouse_event(event);
            shell.pump();
        }
        HostAction::Hide { ids } => {
            shell.host_mut().hide(&ids);
            shell.pump();
        }
        HostAction::Show { ids } => {
            shell.host_mut().show(&ids);
            shell.pump();
        }
        HostAction::ReplaceScene { scene } => {
            if let Some(id) = scene.first_duplicate_id() {
                return Ok(Err(format!("replacement scene has duplicate layer id {id:?}")));
            }
            shell.host_mut().replace(scene);
            shell.pump();
        }
        HostAction::SetSceneProperty { property } => shell.set_scene_property(property),
        HostAction::SetTags { tags } => shell.set_tags(tags),
        HostAction::Unmount { instance_id } => {
            let mut report = report_for(shell, &instance_id);
            if let Err(err) = shell.unmount(&instance_id) {
                return Ok(Err(err.to_string()));
            }
            if let Some(report) = report.as_mut() {
                report.run_count = None;
            }
            finished.extend(report.map(|r| (instance_id, r)));
        }
        HostAction::Reload {
            instance_id,
            script,
            source,
        } => {
            let source = resolve_source(base_dir, script.as_deref(), source.as_deref())?;
            if let Err(err) = shell.reload(&instance_id, source) {
                return Ok(Err(err.to_string()));
            }
        }
        HostAction::ResetRunCount { instance_id } => {
            shell.reset_run_count(instance_id.as_deref());
        }
        HostAction::Pump => shell.pump(),
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> SessionSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_actions_parse() {
        let actions: Vec<HostAction> = serde_json::from_value(json!([
            { "action": "select", "layerId": "a" },
            { "action": "tick", "seconds": 0.5 },
            { "action": "resize", "width": 320, "height": 200 },
            { "action": "pointer", "kind": "click", "x": 1.0, "y": 2.0 },
            { "action": "resetRunCount" },
            { "action": "pump" }
        ]))
        .unwrap();
        assert_eq!(actions.len(), 6);
        assert!(matches!(&actions[0], HostAction::Select { layer_id: Some(id), .. } if id == "a"));
        assert!(matches!(&actions[2], HostAction::Resize(v) if v.width == 320 && !v.is_mobile));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(
            source_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_run_inline_session() {
        let spec = spec(json!({
            "scene": { "id": "root", "children": [ { "id": "a" }, { "id": "b" } ] },
            "extensions": [{
                "instanceId": "w1",
                "extensionId": "ext",
                "placement": { "kind": "widget", "id": "p1", "extensionId": "ext" },
                "source": "api.on(\"select\", |id| { api.layers.hide(id); log.info(\"hid \" + id); });"
            }],
            "actions": [
                { "action": "select", "layerId": "b" },
                { "action": "unmount", "instanceId": "w1" },
                { "action": "unmount", "instanceId": "w1" }
            ]
        }));
        let report = run_session(spec, Path::new(".")).unwrap();
        assert_eq!(report.visible_layers, vec!["a"]);
        assert_eq!(report.command_counts.get("hide"), Some(&1));
        assert_eq!(report.extensions.len(), 1);
        let ext = &report.extensions[0];
        assert_eq!(ext.run_count, None);
        assert_eq!(ext.logs.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_missing_script_aborts() {
        let spec = spec(json!({
            "scene": { "id": "root" },
            "extensions": [{
                "instanceId": "w1",
                "extensionId": "ext",
                "placement": { "kind": "widget", "id": "p1", "extensionId": "ext" },
                "script": "does-not-exist.rhai"
            }]
        }));
        assert!(run_session(spec, Path::new("/nonexistent")).is_err());
    }

    #[test]
    fn test_duplicate_layer_ids_abort_session() {
        let spec = spec(json!({
            "scene": { "id": "root", "children": [ { "id": "a" }, { "id": "a" } ] }
        }));
        let err = run_session(spec, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("\"a\""));
    }

    #[test]
    fn test_replacement_scene_with_duplicates_is_refused() {
        let spec = spec(json!({
            "scene": { "id": "root", "children": [ { "id": "a" }, { "id": "b" } ] },
            "actions": [
                {
                    "action": "replaceScene",
                    "scene": { "id": "root", "children": [
                        { "id": "x", "children": [ { "id": "y" } ] },
                        { "id": "y" }
                    ] }
                }
            ]
        }));
        let report = run_session(spec, Path::new(".")).unwrap();
        assert_eq!(report.visible_layers, vec!["a", "b"]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("\"y\""));
    }

    #[test]
    fn test_final_camera_is_reported() {
        let spec = spec(json!({
            "scene": { "id": "root" },
            "camera": { "lat": 35.0, "lng": 139.0, "height": 1000.0, "heading": 0.0, "pitch": -0.5, "roll": 0.0, "fov": 1.0 },
            "extensions": [{
                "instanceId": "w1",
                "extensionId": "ext",
                "placement": { "kind": "widget", "id": "p1", "extensionId": "ext" },
                "source": "api.visualizer.camera.zoomIn(2.0);"
            }]
        }));
        let report = run_session(spec, Path::new(".")).unwrap();
        let camera = report.final_camera.unwrap();
        assert!(camera.height < 1000.0);
        assert_eq!(report.command_counts.get("zoomIn"), Some(&1));
    }
}
