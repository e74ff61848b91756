//! Scene loading and validation.
//!
//! A scene is a JSON file describing the topology of a run: the nodes with
//! their roles, the radio links with per-link RSSI/SNR, and channel
//! parameters. Simulator-wide defaults (tick, duration, seed) live in a
//! separate TOML file so scenes stay purely topological.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::simulation::radio::{DEFAULT_AIRTIME_MS, LoraParameters, lora_airtime_ms};
use crate::simulation::runner::{DEFAULT_TICK_MS, SimRunner};

/// Node role as written in scene files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneNodeKind {
    Repeater,
    Companion,
}

/// One node declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneNode {
    pub name: String,
    pub kind: SceneNodeKind,
    /// Map position in meters, for display only.
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Preset wall clock (unix seconds) applied at start.
    #[serde(default)]
    pub set_time: Option<u32>,
}

/// One bidirectional link declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneLink {
    pub a: String,
    pub b: String,
    #[serde(default = "default_link_rssi")]
    pub rssi: i16,
    #[serde(default = "default_link_snr")]
    pub snr: i16,
}

fn default_link_rssi() -> i16 {
    -70
}

fn default_link_snr() -> i16 {
    32
}

/// Root scene structure.
#[derive(Debug, Deserialize)]
pub struct Scene {
    pub nodes: Vec<SceneNode>,
    #[serde(default)]
    pub links: Vec<SceneLink>,
    /// Master seed; the config-file seed applies when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Fixed frame airtime in milliseconds. When `lora_parameters` is
    /// present the airtime is computed from it instead.
    #[serde(default)]
    pub airtime_ms: Option<u64>,
    #[serde(default)]
    pub lora_parameters: Option<LoraParameters>,
    /// Log-normal RSSI shadowing sigma in dB; 0 disables.
    #[serde(default)]
    pub shadowing_sigma: f64,
}

/// Load and validate a scene from a JSON file.
pub fn load_scene(path: &str) -> anyhow::Result<Scene> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read scene file: {path}"))?;
    let scene: Scene = serde_json::from_str(&data).context("Invalid scene JSON")?;
    validate_scene(&scene)?;
    Ok(scene)
}

/// Validate a scene: at least one node, unique names, links referencing
/// declared nodes only.
pub fn validate_scene(scene: &Scene) -> anyhow::Result<()> {
    if scene.nodes.is_empty() {
        bail!("Scene must contain at least one node");
    }

    let mut names = HashSet::new();
    for node in &scene.nodes {
        if node.name.is_empty() {
            bail!("Scene contains a node with an empty name");
        }
        if !names.insert(node.name.as_str()) {
            bail!("Duplicate node name: {}", node.name);
        }
    }

    for link in &scene.links {
        for end in [&link.a, &link.b] {
            if !names.contains(end.as_str()) {
                bail!("Link references unknown node: {end}");
            }
        }
        if link.a == link.b {
            bail!("Link from {} to itself", link.a);
        }
    }

    if scene.shadowing_sigma < 0.0 {
        bail!("shadowing_sigma must be non-negative");
    }

    Ok(())
}

/// Instantiate a runner from a scene. `default_seed` applies when the scene
/// does not pin one.
pub fn build_runner(scene: &Scene, default_seed: u64) -> SimRunner {
    let mut runner = SimRunner::new(scene.seed.unwrap_or(default_seed));

    // A typical advert frame dominates traffic; size the airtime for it.
    const AIRTIME_REFERENCE_FRAME: usize = 120;
    runner.radio.airtime_ms = match (&scene.lora_parameters, scene.airtime_ms) {
        (Some(lora), _) => lora_airtime_ms(AIRTIME_REFERENCE_FRAME, lora),
        (None, Some(fixed)) => fixed,
        (None, None) => DEFAULT_AIRTIME_MS,
    };
    runner.radio.shadowing_sigma = scene.shadowing_sigma;

    for node in &scene.nodes {
        match node.kind {
            SceneNodeKind::Repeater => runner.add_repeater(&node.name),
            SceneNodeKind::Companion => runner.add_companion(&node.name),
        };
        if let Some(unix_time) = node.set_time {
            if let Some(n) = runner.node_mut(&node.name) {
                n.time_sync.set_time(unix_time);
            }
        }
    }
    for link in &scene.links {
        runner.set_link(&link.a, &link.b, link.rssi, link.snr);
    }
    runner
}

/// Simulator defaults, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub tick_ms: u64,
    pub duration_ms: u64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            tick_ms: DEFAULT_TICK_MS,
            duration_ms: 60_000,
            seed: 7,
        }
    }
}

impl SimConfig {
    /// Load defaults from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<SimConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE_JSON: &str = r#"{
        "seed": 42,
        "airtime_ms": 100,
        "nodes": [
            {"name": "RelayA", "kind": "repeater", "x": 0, "y": 0, "set_time": 1700000000},
            {"name": "RelayB", "kind": "repeater", "x": 500, "y": 0},
            {"name": "Phone", "kind": "companion", "x": 900, "y": 50}
        ],
        "links": [
            {"a": "RelayA", "b": "RelayB", "rssi": -70, "snr": 32},
            {"a": "RelayB", "b": "Phone"}
        ]
    }"#;

    #[test]
    fn scene_parses_and_builds_a_runner() {
        let scene: Scene = serde_json::from_str(SCENE_JSON).unwrap();
        validate_scene(&scene).unwrap();

        let runner = build_runner(&scene, 1);
        assert_eq!(runner.radio.airtime_ms, 100);
        assert!(runner.node("RelayA").unwrap().is_repeater());
        assert!(!runner.node("Phone").unwrap().is_repeater());
        assert!(runner.node("RelayA").unwrap().time_sync.is_synchronized());
        assert!(!runner.node("RelayB").unwrap().time_sync.is_synchronized());

        // Defaulted link values.
        let link = runner.radio.get_link("RelayB", "Phone").unwrap();
        assert_eq!((link.rssi, link.snr), (-70, 32));
    }

    #[test]
    fn lora_parameters_override_fixed_airtime() {
        let json = r#"{
            "nodes": [{"name": "N", "kind": "repeater"}],
            "airtime_ms": 5,
            "lora_parameters": {
                "bandwidth_hz": 125000,
                "spreading_factor": 7,
                "coding_rate": 1,
                "preamble_symbols": 8.0,
                "crc_enabled": true,
                "low_data_rate_optimization": false
            }
        }"#;
        let scene: Scene = serde_json::from_str(json).unwrap();
        let runner = build_runner(&scene, 1);
        assert_ne!(runner.radio.airtime_ms, 5);
        assert!(runner.radio.airtime_ms > 50);
    }

    #[test]
    fn validation_rejects_bad_scenes() {
        let empty: Scene = serde_json::from_str(r#"{"nodes": []}"#).unwrap();
        assert!(validate_scene(&empty).is_err());

        let dup: Scene = serde_json::from_str(
            r#"{"nodes": [{"name": "A", "kind": "repeater"}, {"name": "A", "kind": "companion"}]}"#,
        )
        .unwrap();
        assert!(validate_scene(&dup).unwrap_err().to_string().contains("Duplicate"));

        let ghost: Scene = serde_json::from_str(
            r#"{"nodes": [{"name": "A", "kind": "repeater"}],
                "links": [{"a": "A", "b": "B"}]}"#,
        )
        .unwrap();
        assert!(validate_scene(&ghost).unwrap_err().to_string().contains("unknown node"));

        let self_link: Scene = serde_json::from_str(
            r#"{"nodes": [{"name": "A", "kind": "repeater"}],
                "links": [{"a": "A", "b": "A"}]}"#,
        )
        .unwrap();
        assert!(validate_scene(&self_link).is_err());
    }

    #[test]
    fn sim_config_parses_toml() {
        let config: SimConfig = toml::from_str("tick_ms = 20\nduration_ms = 30000\nseed = 5").unwrap();
        assert_eq!(config.tick_ms, 20);
        assert_eq!(config.duration_ms, 30_000);
        assert_eq!(config.seed, 5);

        let defaults: SimConfig = toml::from_str("").unwrap();
        assert_eq!(defaults.tick_ms, DEFAULT_TICK_MS);
        assert_eq!(defaults.duration_ms, 60_000);
    }
}
