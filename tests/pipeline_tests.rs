//! Pipeline integration tests
//!
//! Runs the engine with the built-in pipes over real directories:
//!
//! - Pass-through copies and tag stripping
//! - Sprite sheet packing with hash-named textures
//! - Cached re-runs and restarts
//! - Orphan pruning on edit, delete and pipeline change
//! - Pipeline signatures
//! - Relative roots

use image::{Rgba, RgbaImage};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use assetpipe::asset::content_hash;
use assetpipe::build::{BuildContext, PipelineEngine, TreeChange};
use assetpipe::pipe::{AssetSettings, Pipe};
use assetpipe::pipes::cache_buster::hashed_name;
use assetpipe::pipes::manifest::Manifest;
use assetpipe::pipes::{create_pipe, default_pipes};
use assetpipe::tags::{TagValue, Tags};

// ============================================================================
// Test Utilities
// ============================================================================

/// Source in `assets/`, output in `public/`, cache in `cache/`.
fn create_test_context(temp: &TempDir) -> BuildContext {
    fs::create_dir_all(temp.path().join("assets")).unwrap();
    BuildContext::new(temp.path().join("assets"), temp.path().join("public"))
        .with_cache_dir(temp.path().join("cache"))
        .with_jobs(2)
}

fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn create_sprite(dir: &Path, name: &str, size: u32, shade: u8) {
    fs::create_dir_all(dir).unwrap();
    RgbaImage::from_pixel(size, size, Rgba([shade, 255 - shade, 64, 255])).save(dir.join(name)).unwrap();
}

/// Switches the working directory for the lifetime of the guard.
struct CurrentDir(PathBuf);

impl CurrentDir {
    fn enter(dir: &Path) -> Self {
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        Self(previous)
    }
}

impl Drop for CurrentDir {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.0);
    }
}

fn pipes(names: &[&str]) -> Vec<Box<dyn Pipe>> {
    names.iter().map(|n| create_pipe(n, &json!({})).unwrap()).collect()
}

/// Every file below `dir`, relative and `/`-separated, with its bytes.
fn snapshot_dir(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(dir).unwrap().to_string_lossy().replace('\\', "/");
                files.insert(relative, fs::read(&path).unwrap());
            }
        }
    }
    files
}

// ============================================================================
// Pass-through
// ============================================================================

#[test]
fn test_empty_pipeline_copies_sources() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let src = ctx.source_root().to_path_buf();
    create_test_file(&src, "icon.png", b"not really a png");
    create_test_file(&src, "ui/hero{fix}.txt", b"hero");

    let mut engine = PipelineEngine::new(ctx, Vec::new()).unwrap();
    let result = engine.build().unwrap();

    assert_eq!(result.transformed, 0);
    assert_eq!(result.copied, 2);
    let out = snapshot_dir(&temp.path().join("public"));
    assert_eq!(out.len(), 2);
    assert_eq!(out["icon.png"], b"not really a png");
    assert_eq!(out["ui/hero.txt"], b"hero");
}

#[test]
fn test_ignored_files_are_not_sources() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp).with_ignore(vec!["**/*.psd".to_string()]);
    let src = ctx.source_root().to_path_buf();
    create_test_file(&src, "art/hero.psd", b"layers");
    create_test_file(&src, "art/hero.txt", b"flat");

    let mut engine = PipelineEngine::new(ctx, Vec::new()).unwrap();
    engine.build().unwrap();

    let out = snapshot_dir(&temp.path().join("public"));
    assert_eq!(out.keys().collect::<Vec<_>>(), vec!["art/hero.txt"]);
}

// ============================================================================
// Default pipeline
// ============================================================================

#[test]
fn test_sprite_folder_packs_and_busts() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let sprites = ctx.source_root().join("sprites{tps}");
    for i in 0..10u8 {
        create_sprite(&sprites, &format!("s{}.png", i), 8 + u32::from(i), i * 20);
    }

    let mut engine = PipelineEngine::new(ctx, default_pipes()).unwrap();
    let result = engine.build().unwrap();
    assert!(result.is_clean(), "{}", result.summary());

    let public = temp.path().join("public");
    let out = snapshot_dir(&public);
    let textures: Vec<&String> = out.keys().filter(|k| k.ends_with(".png")).collect();
    let sheets: Vec<&String> = out.keys().filter(|k| k.ends_with(".json") && *k != "manifest.json").collect();
    assert_eq!(textures.len(), 2, "{:?}", out.keys());
    assert_eq!(sheets.len(), 2, "{:?}", out.keys());
    assert!(out.contains_key("manifest.json"));

    for sheet_name in sheets {
        let sheet: Value = serde_json::from_slice(&out[sheet_name]).unwrap();
        assert_eq!(sheet["frames"].as_object().unwrap().len(), 10);

        // The sheet points at the hash-named texture that was actually written
        let image = sheet["meta"]["image"].as_str().unwrap();
        assert!(out.contains_key(image), "{} -> {}", sheet_name, image);

        // And its own name carries the hash of what it now contains
        let stem = if sheet_name.starts_with("sprites@0.5x") { "sprites@0.5x.json" } else { "sprites.json" };
        assert_eq!(sheet_name, &hashed_name(stem, &content_hash(&out[sheet_name])));
    }

    // Individual sprites are consumed by the sheet
    assert!(!out.keys().any(|k| k.contains("s0")));

    let manifest: Manifest = serde_json::from_slice(&out["manifest.json"]).unwrap();
    let entry = manifest.bundles[0].assets.iter().find(|a| a.alias.contains(&"sprites".to_string())).unwrap();
    assert_eq!(entry.src.len(), 4);
}

#[test]
fn test_json_is_minified_and_hash_named() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let src = ctx.source_root().to_path_buf();
    create_test_file(&src, "data/levels.json", b"{\n  \"level\": 1\n}\n");
    create_test_file(&src, "data/raw{nc}.json", b"{ \"keep\": true }");

    let mut engine = PipelineEngine::new(ctx, default_pipes()).unwrap();
    engine.build().unwrap();

    let out = snapshot_dir(&temp.path().join("public"));
    let minified = br#"{"level":1}"#;
    let levels = format!("data/{}", hashed_name("levels.json", &content_hash(minified)));
    assert_eq!(out[&levels], minified);

    let raw = format!("data/{}", hashed_name("raw.json", &content_hash(b"{ \"keep\": true }")));
    assert_eq!(out[&raw], b"{ \"keep\": true }");
}

#[test]
fn test_path_override_injects_tags() {
    let temp = TempDir::new().unwrap();
    let mut tags = Tags::new();
    tags.insert("nc".to_string(), TagValue::Bool(true));
    let settings = AssetSettings::new(vec!["vendor/*.json".to_string()], Default::default(), tags).unwrap();
    let ctx = create_test_context(&temp).with_overrides(vec![settings]);
    create_test_file(ctx.source_root(), "vendor/lib.json", b"{ \"v\": 2 }");

    let mut engine = PipelineEngine::new(ctx, pipes(&["json"])).unwrap();
    let result = engine.build().unwrap();

    assert_eq!(result.transformed, 0);
    let out = snapshot_dir(&temp.path().join("public"));
    assert_eq!(out["vendor/lib.json"], b"{ \"v\": 2 }");
}

// ============================================================================
// Incremental runs
// ============================================================================

#[test]
fn test_second_run_is_fully_cached() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let src = ctx.source_root().to_path_buf();
    for i in 0..4u8 {
        create_sprite(&src.join("ui{tps}"), &format!("b{}.png", i), 16, i * 50);
    }
    create_test_file(&src, "config.json", b"{ \"a\": [1, 2, 3] }");

    let mut engine = PipelineEngine::new(ctx, default_pipes()).unwrap();
    let first = engine.build().unwrap();
    assert!(first.transformed > 0);
    let before = snapshot_dir(&temp.path().join("public"));

    let second = engine.run().unwrap();
    assert_eq!(second.transformed, 0);
    assert!(second.deleted.is_empty());
    assert_eq!(snapshot_dir(&temp.path().join("public")), before);
}

#[test]
fn test_restart_reuses_persisted_cache() {
    let temp = TempDir::new().unwrap();
    create_test_file(&temp.path().join("assets"), "a.json", b"[1, 2]");
    create_test_file(&temp.path().join("assets"), "b.json", b"[3, 4]");

    let mut engine = PipelineEngine::new(create_test_context(&temp), default_pipes()).unwrap();
    assert!(engine.build().unwrap().transformed > 0);
    let before = snapshot_dir(&temp.path().join("public"));
    drop(engine);

    let mut restarted = PipelineEngine::new(create_test_context(&temp), default_pipes()).unwrap();
    let result = restarted.build().unwrap();
    assert_eq!(result.transformed, 0);
    assert!(result.cached > 0);
    assert_eq!(snapshot_dir(&temp.path().join("public")), before);
}

#[test]
fn test_disabled_cache_reprocesses_everything() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp).with_cache(false);
    create_test_file(ctx.source_root(), "a.json", b"[1]");

    let mut engine = PipelineEngine::new(ctx, pipes(&["json"])).unwrap();
    assert_eq!(engine.build().unwrap().transformed, 1);
    assert_eq!(engine.run().unwrap().transformed, 1);
    assert!(!temp.path().join("cache").exists());
}

#[test]
fn test_pipeline_change_prunes_previous_outputs() {
    let temp = TempDir::new().unwrap();
    create_test_file(&temp.path().join("assets"), "a.json", b"[1, 2]");
    let busted = hashed_name("a.json", &content_hash(b"[1, 2]"));

    let mut engine = PipelineEngine::new(create_test_context(&temp), pipes(&["cache-buster"])).unwrap();
    engine.build().unwrap();
    let first_cache = engine.store().cache_file().unwrap();
    drop(engine);
    let out: Vec<String> = snapshot_dir(&temp.path().join("public")).into_keys().collect();
    assert_eq!(out, vec![busted.clone()]);

    // Same project, different pipeline: the hash-named copy goes
    let mut engine = PipelineEngine::new(create_test_context(&temp), Vec::new()).unwrap();
    let result = engine.build().unwrap();
    assert_eq!(result.deleted, vec![PathBuf::from(&busted)]);
    let out: Vec<String> = snapshot_dir(&temp.path().join("public")).into_keys().collect();
    assert_eq!(out, vec!["a.json".to_string()]);
    assert!(!first_cache.exists());
    drop(engine);

    // And back again
    let mut engine = PipelineEngine::new(create_test_context(&temp), pipes(&["cache-buster"])).unwrap();
    engine.build().unwrap();
    let out: Vec<String> = snapshot_dir(&temp.path().join("public")).into_keys().collect();
    assert_eq!(out, vec![busted]);
}

#[test]
fn test_repeated_runs_keep_the_tree_bounded() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    for i in 0..20 {
        create_test_file(ctx.source_root(), &format!("data_{}.json", i), b"{ \"n\": 1 }");
    }

    let mut engine = PipelineEngine::new(ctx, default_pipes()).unwrap();
    engine.build().unwrap();
    engine.run().unwrap();
    let live = engine.tree().len();
    let slots = engine.tree().slot_count();

    for _ in 0..20 {
        engine.run().unwrap();
    }
    assert_eq!(engine.tree().len(), live);
    assert_eq!(engine.tree().slot_count(), slots);
}

#[test]
#[serial]
fn test_relative_roots_accept_absolute_events() {
    let temp = TempDir::new().unwrap();
    create_test_file(&temp.path().join("assets"), "a.txt", b"a");
    let _cwd = CurrentDir::enter(temp.path());

    let ctx = BuildContext::new("assets", "public").with_cache_dir("cache");
    let mut engine = PipelineEngine::new(ctx, Vec::new()).unwrap();
    assert!(engine.context().source_root().is_absolute());
    engine.build().unwrap();
    assert!(temp.path().join("public/a.txt").exists());

    // Watchers report absolute, possibly canonical, paths
    let added = create_test_file(&temp.path().join("assets"), "new.txt", b"n");
    let changes = engine.apply_changes(&[added.canonicalize().unwrap()]);
    assert_eq!(changes, vec![TreeChange::Added(PathBuf::from("new.txt"))]);

    engine.run().unwrap();
    assert!(temp.path().join("public/new.txt").exists());
}

#[test]
fn test_edit_replaces_hash_named_output() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let src = ctx.source_root().to_path_buf();
    let a = create_test_file(&src, "a.txt", b"first");
    create_test_file(&src, "b.txt", b"other");

    let mut engine = PipelineEngine::new(ctx, pipes(&["cache-buster"])).unwrap();
    engine.build().unwrap();
    let old_a = hashed_name("a.txt", &content_hash(b"first"));
    let b = hashed_name("b.txt", &content_hash(b"other"));

    fs::write(&a, b"second").unwrap();
    let changes = engine.apply_changes(&[a.clone()]);
    assert_eq!(changes, vec![TreeChange::Changed(PathBuf::from("a.txt"))]);

    let result = engine.run().unwrap();
    let new_a = hashed_name("a.txt", &content_hash(b"second"));
    assert_eq!(result.transformed, 1);
    assert_eq!(result.deleted, vec![PathBuf::from(&old_a)]);
    assert_eq!(result.written, vec![PathBuf::from(&new_a)]);

    let out = snapshot_dir(&temp.path().join("public"));
    assert_eq!(out.keys().cloned().collect::<Vec<_>>(), vec![new_a, b]);
}

#[test]
fn test_unchanged_event_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let a = create_test_file(ctx.source_root(), "a.txt", b"same");

    let mut engine = PipelineEngine::new(ctx, pipes(&["cache-buster"])).unwrap();
    engine.build().unwrap();

    fs::write(&a, b"same").unwrap();
    assert!(engine.apply_changes(&[a]).is_empty());
}

#[test]
fn test_delete_removes_only_its_outputs() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let src = ctx.source_root().to_path_buf();
    let gone = create_test_file(&src, "gone.txt", b"bye");
    create_test_file(&src, "kept.txt", b"hi");

    let mut engine = PipelineEngine::new(ctx, pipes(&["cache-buster"])).unwrap();
    engine.build().unwrap();

    fs::remove_file(&gone).unwrap();
    let changes = engine.apply_changes(&[gone]);
    assert_eq!(changes, vec![TreeChange::Removed(PathBuf::from("gone.txt"))]);

    let result = engine.run().unwrap();
    assert_eq!(result.deleted, vec![PathBuf::from(hashed_name("gone.txt", &content_hash(b"bye")))]);
    let out = snapshot_dir(&temp.path().join("public"));
    assert_eq!(out.keys().cloned().collect::<Vec<_>>(), vec![hashed_name("kept.txt", &content_hash(b"hi"))]);
}

#[test]
fn test_sprite_edit_repacks_folder() {
    let temp = TempDir::new().unwrap();
    let ctx = create_test_context(&temp);
    let folder = ctx.source_root().join("icons{tps}");
    create_sprite(&folder, "a.png", 8, 10);
    create_sprite(&folder, "b.png", 8, 200);

    let mut engine = PipelineEngine::new(ctx, default_pipes()).unwrap();
    engine.build().unwrap();
    let before = snapshot_dir(&temp.path().join("public"));

    create_sprite(&folder, "c.png", 12, 120);
    let changes = engine.apply_changes(&[folder.join("c.png")]);
    assert_eq!(changes.len(), 1);

    let result = engine.run().unwrap();
    assert!(result.transformed > 0);
    // Both resolutions of the old sheet are gone: two textures, two sheets
    assert_eq!(result.deleted.len(), 4, "{:?}", result.deleted);

    let after = snapshot_dir(&temp.path().join("public"));
    assert_eq!(after.len(), before.len());
    for name in before.keys().filter(|k| *k != "manifest.json") {
        assert!(!after.contains_key(name), "stale output {}", name);
    }
}

// ============================================================================
// Signatures
// ============================================================================

#[test]
fn test_signature_tracks_pipeline_not_runtime_settings() {
    let temp = TempDir::new().unwrap();
    let base = PipelineEngine::new(create_test_context(&temp), default_pipes()).unwrap();
    let signature = base.signature().to_string();

    let more_jobs = PipelineEngine::new(create_test_context(&temp).with_jobs(8), default_pipes()).unwrap();
    assert_eq!(more_jobs.signature(), signature);

    let uncached = PipelineEngine::new(create_test_context(&temp).with_cache(false), default_pipes()).unwrap();
    assert_eq!(uncached.signature(), signature);

    let reordered = PipelineEngine::new(create_test_context(&temp), pipes(&["cache-buster", "json"])).unwrap();
    let original = PipelineEngine::new(create_test_context(&temp), pipes(&["json", "cache-buster"])).unwrap();
    assert_ne!(reordered.signature(), original.signature());

    let custom = vec![create_pipe("json", &json!({"tags": {"nc": "raw"}})).unwrap()];
    let plain = PipelineEngine::new(create_test_context(&temp), pipes(&["json"])).unwrap();
    let tuned = PipelineEngine::new(create_test_context(&temp), custom).unwrap();
    assert_ne!(tuned.signature(), plain.signature());

    let elsewhere =
        PipelineEngine::new(create_test_context(&temp).with_output_root(temp.path().join("dist")), default_pipes())
            .unwrap();
    assert_ne!(elsewhere.signature(), signature);
}

#[test]
fn test_duplicate_pipe_names_are_rejected() {
    let temp = TempDir::new().unwrap();
    let result = PipelineEngine::new(create_test_context(&temp), pipes(&["json", "json"]));
    assert!(result.is_err());
}
