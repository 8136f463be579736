//! Pipeline engine: runs the ordered pipe list over the asset tree.
//!
//! # How It Works
//!
//! 1. Every source entry loses its transform chain. Entries whose content
//!    hash matches their cache record get back the chain the *reusable*
//!    stages built last time (every stage before the first pipe with a
//!    `finish` step); the rest are dirty.
//! 2. Each pipe runs as one stage: `start`, then `test`/`transform` over the
//!    eligible entries, then `finish`. Reusable stages only visit dirty
//!    entries; later stages visit everything.
//! 3. Within a stage, entries are gathered into waves. A wave never contains
//!    an entry below a folder claimed in the same wave, so a folder pipe's
//!    `skip_children` takes effect before its children are considered.
//!    Each wave runs on a bounded worker pool and the results are applied to
//!    the tree in traversal order.
//! 4. Final leaves are written to the output tree, outputs emitted on the
//!    previous run but not on this one are deleted, and the cache is saved.

use crate::asset::{AssetId, AssetTree};
use crate::build::cache::{pipeline_signature, restore_entry, snapshot_entry, CacheRecord, CacheStore};
use crate::build::discovery::{discover, sync_path, IgnoreSet, TreeChange};
use crate::build::{BuildContext, PipelineError, RunResult, TransformFailure};
use crate::pipe::options::{merge_options, path_key, resolve_options};
use crate::pipe::{
    AssetView, FinishContext, Pipe, PipeCapabilities, PipeError, PipeOptions, TransformOutput,
};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

type Outcome = Result<Option<TransformOutput>, PipeError>;

/// Pipe name reported for failures while writing the output tree.
const OUTPUT_STAGE: &str = "output";

/// A pipe together with what was learned about it at registration.
struct RegisteredPipe {
    pipe: Box<dyn Pipe>,
    name: String,
    capabilities: PipeCapabilities,
    defaults: Value,
}

/// Runs pipes over a tree and keeps the output tree in sync with it.
pub struct PipelineEngine {
    context: BuildContext,
    pipes: Vec<RegisteredPipe>,
    ignore: IgnoreSet,
    store: CacheStore,
    tree: AssetTree,
    pool: rayon::ThreadPool,
    reusable_stages: usize,
}

impl PipelineEngine {
    /// Register pipes and open the cache.
    ///
    /// Relative roots in `context` are resolved against the current
    /// directory. Fails before anything is processed if pipe names clash, an
    /// option record does not validate, an ignore pattern is invalid or the
    /// worker pool cannot be created.
    pub fn new(context: BuildContext, pipes: Vec<Box<dyn Pipe>>) -> Result<Self, PipelineError> {
        let cwd = std::env::current_dir().map_err(|e| PipelineError::filesystem(Path::new("."), e))?;
        let context = context.resolved_against(&cwd);

        let mut registered: Vec<RegisteredPipe> = Vec::with_capacity(pipes.len());
        for pipe in pipes {
            let name = pipe.name().to_string();
            if name.is_empty() {
                return Err(PipelineError::Configuration("pipe with an empty name".to_string()));
            }
            if registered.iter().any(|p| p.name == name) {
                return Err(PipelineError::Configuration(format!("duplicate pipe name '{}'", name)));
            }

            let defaults = pipe.default_options();
            if !defaults.is_object() {
                return Err(PipelineError::Configuration(format!(
                    "pipe '{}': default options must be an object",
                    name
                )));
            }
            pipe.validate_options(&PipeOptions::new(defaults.clone()))
                .map_err(|e| PipelineError::Configuration(format!("pipe '{}': {}", name, e)))?;

            let capabilities = pipe.capabilities();
            registered.push(RegisteredPipe { pipe, name, capabilities, defaults });
        }

        for settings in context.overrides() {
            for (pipe_name, value) in settings.settings() {
                match registered.iter().find(|p| &p.name == pipe_name) {
                    Some(p) => {
                        let merged = PipeOptions::new(merge_options(&p.defaults, value));
                        p.pipe.validate_options(&merged).map_err(|e| {
                            PipelineError::Configuration(format!(
                                "override {:?} for pipe '{}': {}",
                                settings.files(),
                                pipe_name,
                                e
                            ))
                        })?;
                    }
                    None => {
                        warn!(pipe = %pipe_name, "path override targets a pipe that is not in the pipeline")
                    }
                }
            }
        }

        let ignore = IgnoreSet::new(context.ignore())
            .map_err(|e| PipelineError::Configuration(format!("invalid ignore pattern: {}", e)))?
            .with_excluded(context.nested_generated_dirs());

        let signature = {
            let pipes: Vec<(&str, &Value)> =
                registered.iter().map(|p| (p.name.as_str(), &p.defaults)).collect();
            pipeline_signature(&pipes, context.output_root(), context.ignore(), context.overrides())
        };
        let store = if context.is_cache_enabled() {
            CacheStore::open(context.cache_dir(), signature).with_output_root(context.output_root())
        } else {
            CacheStore::in_memory(signature)
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(context.jobs())
            .build()
            .map_err(|e| PipelineError::Configuration(format!("failed to create worker pool: {}", e)))?;

        let reusable_stages =
            registered.iter().position(|p| p.capabilities.finish).unwrap_or(registered.len());
        let tree = AssetTree::new(context.source_root()).with_overrides(context.overrides().to_vec());

        Ok(Self { context, pipes: registered, ignore, store, tree, pool, reusable_stages })
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    /// The managed tree as left by the last run.
    pub fn tree(&self) -> &AssetTree {
        &self.tree
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Cache signature of this pipeline configuration.
    pub fn signature(&self) -> &str {
        self.store.signature()
    }

    pub fn pipe_names(&self) -> Vec<&str> {
        self.pipes.iter().map(|p| p.name.as_str()).collect()
    }

    /// Number of leading stages whose results are reused from the cache.
    pub fn reusable_stages(&self) -> usize {
        self.reusable_stages
    }

    /// Output location of an entry.
    pub fn output_path(&self, id: AssetId) -> PathBuf {
        self.tree.output_path(id, self.context.output_root())
    }

    /// Rebuild the tree from the source directory.
    pub fn scan(&mut self) -> Result<(), PipelineError> {
        let source_root = self.context.source_root().to_path_buf();
        if !source_root.is_dir() {
            return Err(PipelineError::filesystem(
                &source_root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "source root is not a directory"),
            ));
        }

        let mut tree =
            AssetTree::new(&source_root).with_overrides(self.context.overrides().to_vec());
        discover(&mut tree, &self.ignore).map_err(|e| PipelineError::filesystem(&source_root, e))?;
        debug!(entries = tree.len(), "scanned source tree");
        self.tree = tree;
        Ok(())
    }

    /// Scan the source directory, then run every stage.
    pub fn build(&mut self) -> Result<RunResult, PipelineError> {
        self.scan()?;
        self.run()
    }

    /// Reconcile changed paths (absolute, or relative to the source root)
    /// with the tree. Paths outside the source root are ignored.
    pub fn apply_changes(&mut self, paths: &[PathBuf]) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        let mut seen = HashSet::new();
        let canonical_root = self.context.source_root().canonicalize().ok();
        for path in paths {
            let relative = if path.is_absolute() {
                let stripped = path
                    .strip_prefix(self.context.source_root())
                    .ok()
                    .or_else(|| canonical_root.as_deref().and_then(|root| path.strip_prefix(root).ok()));
                match stripped {
                    Some(relative) => relative.to_path_buf(),
                    None => continue,
                }
            } else {
                path.clone()
            };
            if !seen.insert(relative.clone()) {
                continue;
            }

            match sync_path(&mut self.tree, &self.ignore, &relative) {
                Ok(Some(change)) => {
                    debug!(?change, "source tree changed");
                    changes.push(change);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %relative.display(), error = %e, "failed to read changed path"),
            }
        }
        changes
    }

    /// Run every stage over the current tree and sync the output tree.
    pub fn run(&mut self) -> Result<RunResult, PipelineError> {
        let started = Instant::now();
        let mut result = RunResult::new();

        let dirty = self.prepare(&mut result);
        let finish_context = FinishContext {
            output_root: self.context.output_root().to_path_buf(),
            source_root: self.context.source_root().to_path_buf(),
        };

        let mut pending = Vec::new();
        for index in 0..self.pipes.len() {
            if index == self.reusable_stages {
                pending = self.snapshot_dirty(&dirty);
            }
            let scope = if index < self.reusable_stages { Some(&dirty) } else { None };
            self.run_stage(index, scope, &finish_context, &mut result)?;
        }
        if self.reusable_stages == self.pipes.len() {
            pending = self.snapshot_dirty(&dirty);
        }

        let emitted = self.write_outputs(&mut result);
        self.reconcile_records(pending, emitted, &mut result);
        self.persist();

        let result = result.with_duration(started.elapsed());
        info!(
            transformed = result.transformed,
            cached = result.cached,
            copied = result.copied,
            written = result.written.len(),
            deleted = result.deleted.len(),
            failures = result.failures.len(),
            "run complete"
        );
        Ok(result)
    }

    /// Reset every source entry and restore what the cache allows.
    fn prepare(&mut self, result: &mut RunResult) -> HashSet<AssetId> {
        let reuse = self.context.is_cache_enabled();
        let mut dirty = HashSet::new();

        for id in self.tree.walk(self.tree.root()) {
            self.tree.clear_transforms(id);
            let key = path_key(self.tree[id].path());
            let restored = reuse
                && match self.store.get(&key) {
                    Some(record) if Some(record.hash.as_str()) == self.tree[id].hash() => {
                        restore_entry(&mut self.tree, id, record, &self.store)
                    }
                    _ => false,
                };

            if restored {
                result.cached += 1;
            } else {
                dirty.insert(id);
            }
        }
        debug!(dirty = dirty.len(), cached = result.cached, "prepared run");
        dirty
    }

    /// Capture the chains of dirty entries once the reusable stages are done.
    /// Records are committed only after outputs are written.
    fn snapshot_dirty(&self, dirty: &HashSet<AssetId>) -> Vec<(String, CacheRecord)> {
        let mut records = Vec::with_capacity(dirty.len());
        for &id in dirty {
            let key = path_key(self.tree[id].path());
            let record = if self.context.is_cache_enabled() {
                match snapshot_entry(&self.tree, id, &self.store) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(path = %key, error = %e, "failed to cache transform chain");
                        CacheRecord::default()
                    }
                }
            } else {
                CacheRecord {
                    hash: self.tree[id].hash().unwrap_or_default().to_string(),
                    ..CacheRecord::default()
                }
            };
            records.push((key, record));
        }
        records
    }

    fn run_stage(
        &mut self,
        index: usize,
        scope: Option<&HashSet<AssetId>>,
        finish_context: &FinishContext,
        result: &mut RunResult,
    ) -> Result<(), PipelineError> {
        let Self { pipes, tree, pool, context, .. } = self;
        let stage = &mut pipes[index];
        let stage_started = Instant::now();

        if stage.capabilities.start {
            stage
                .pipe
                .start()
                .map_err(|source| PipelineError::Start { pipe: stage.name.clone(), source })?;
        }

        if stage.capabilities.transform {
            let folder = stage.pipe.folder();
            let mut pending = vec![tree.root()];
            while !pending.is_empty() {
                let (wave, deferred) = collect_wave(tree, std::mem::take(&mut pending), folder, scope);
                let outcomes = execute_wave(
                    stage.pipe.as_ref(),
                    &stage.name,
                    &stage.defaults,
                    tree,
                    &wave,
                    pool,
                    context.jobs(),
                );

                for (id, outcome) in wave.into_iter().zip(outcomes) {
                    match outcome {
                        Ok(None) => {}
                        Ok(Some(output)) => {
                            result.transformed += 1;
                            apply_output(tree, id, &stage.name, output);
                        }
                        Err(e) => {
                            let path = tree[id].path().to_path_buf();
                            warn!(
                                pipe = %stage.name,
                                path = %path.display(),
                                error = %e,
                                "transform failed, passing entry through"
                            );
                            result.failures.push(TransformFailure {
                                pipe: stage.name.clone(),
                                path,
                                message: e.to_string(),
                            });
                        }
                    }
                }

                for id in deferred {
                    let entry = &tree[id];
                    if !entry.is_skipped() && !entry.skips_children() {
                        pending.extend(entry.children().iter().copied());
                    }
                }
            }
        }

        if stage.capabilities.finish {
            let root = tree.root();
            let options = resolve_options(&stage.name, &stage.defaults, &tree[root]);
            stage.pipe.finish(tree, root, &options, finish_context).map_err(|source| {
                PipelineError::Finish {
                    pipe: stage.name.clone(),
                    path: finish_context.source_root.clone(),
                    source,
                }
            })?;
        }

        debug!(pipe = %stage.name, elapsed = ?stage_started.elapsed(), "stage complete");
        Ok(())
    }

    /// Write every final leaf that is fresh or missing from the output tree.
    /// Returns the outputs emitted per source key.
    fn write_outputs(&mut self, result: &mut RunResult) -> BTreeMap<String, Vec<String>> {
        let output_root = self.context.output_root().to_path_buf();
        let mut emitted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut owners: HashMap<PathBuf, String> = HashMap::new();

        let mut stack = vec![self.tree.root()];
        while let Some(id) = stack.pop() {
            let entry = &self.tree[id];
            if entry.is_skipped() {
                continue;
            }
            let key = path_key(entry.path());
            if !entry.skips_children() {
                stack.extend(entry.children().iter().rev().copied());
            }

            for leaf in self.tree.final_transformed_children(id) {
                let leaf_entry = &self.tree[leaf];
                if leaf_entry.is_folder() || leaf_entry.is_skipped() {
                    continue;
                }

                let relative = self.tree.output_relative_path(leaf);
                if let Some(previous) = owners.insert(relative.clone(), key.clone()) {
                    if previous != key {
                        warn!(
                            output = %relative.display(),
                            first = %previous,
                            second = %key,
                            "two entries write the same output; the later one wins"
                        );
                    }
                }

                let target = output_root.join(&relative);
                if leaf_entry.is_fresh() || !target.exists() {
                    // A failed write only loses this output; the next run retries it
                    if let Err(e) = write_output(&self.tree, leaf, &target) {
                        warn!(path = %key, error = %e, "failed to write output");
                        result.failures.push(TransformFailure {
                            pipe: OUTPUT_STAGE.to_string(),
                            path: self.tree[id].path().to_path_buf(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                    if leaf == id {
                        result.copied += 1;
                    }
                    result.written.push(relative.clone());
                }
                self.tree.mark_written(leaf);
                emitted.entry(key.clone()).or_default().push(path_key(&relative));
            }
        }
        emitted
    }

    /// Delete orphaned outputs and commit this run's records.
    fn reconcile_records(
        &mut self,
        pending: Vec<(String, CacheRecord)>,
        mut emitted: BTreeMap<String, Vec<String>>,
        result: &mut RunResult,
    ) {
        let output_root = self.context.output_root().to_path_buf();
        let live_outputs: HashSet<String> = emitted.values().flatten().cloned().collect();

        let mut orphans: Vec<String> = Vec::new();
        for key in self.store.keys() {
            if let Some(record) = self.store.get(key) {
                orphans.extend(record.outputs.iter().filter(|o| !live_outputs.contains(*o)).cloned());
            }
        }
        orphans.sort();
        orphans.dedup();
        for orphan in orphans {
            let target = output_root.join(&orphan);
            match fs::remove_file(&target) {
                Ok(()) => {
                    debug!(output = %orphan, "deleted stale output");
                    result.deleted.push(PathBuf::from(orphan));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(output = %target.display(), error = %e, "failed to delete stale output"),
            }
        }

        // Outputs recorded under another pipeline signature
        for (root, outputs) in self.store.take_stale_outputs() {
            let root = root.unwrap_or_else(|| output_root.clone());
            let same_root = root == output_root;
            for output in outputs {
                if same_root && live_outputs.contains(&output) {
                    continue;
                }
                let target = root.join(&output);
                match fs::remove_file(&target) {
                    Ok(()) => {
                        debug!(output = %target.display(), "deleted output of previous pipeline");
                        result.deleted.push(if same_root { PathBuf::from(output) } else { target });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(output = %target.display(), error = %e, "failed to delete stale output"),
                }
            }
        }

        for (key, record) in pending {
            self.store.insert(key, record);
        }

        let live_keys: HashSet<String> =
            self.tree.walk(self.tree.root()).into_iter().map(|id| path_key(self.tree[id].path())).collect();
        let vanished: Vec<String> = self.store.keys().filter(|k| !live_keys.contains(*k)).cloned().collect();
        for key in vanished {
            self.store.remove(&key);
        }
        for key in live_keys {
            if let Some(record) = self.store.get_mut(&key) {
                record.outputs = emitted.remove(&key).unwrap_or_default();
            }
        }
    }

    fn persist(&mut self) {
        if !self.store.is_persistent() {
            return;
        }
        if let Err(e) = self.store.save() {
            warn!(error = %e, "failed to save cache");
            return;
        }
        let removed = self.store.remove_stale_files();
        if removed > 0 {
            debug!(removed, "removed caches of previous pipelines");
        }
        match self.store.prune_blobs() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned cache blobs"),
            Err(e) => warn!(error = %e, "failed to prune cache blobs"),
        }
    }
}

/// Gather one wave of candidates for a stage.
///
/// Returns the frontier entries to test, and the source folders whose
/// children must wait for the wave to be applied.
fn collect_wave(
    tree: &AssetTree,
    from: Vec<AssetId>,
    folder: bool,
    scope: Option<&HashSet<AssetId>>,
) -> (Vec<AssetId>, Vec<AssetId>) {
    let mut wave = Vec::new();
    let mut deferred = Vec::new();
    let mut stack: Vec<AssetId> = from.into_iter().rev().collect();

    while let Some(id) = stack.pop() {
        let entry = &tree[id];
        if entry.is_skipped() {
            continue;
        }

        let mut claimed = false;
        if scope.map_or(true, |s| s.contains(&id)) {
            for leaf in tree.final_transformed_children(id) {
                let leaf_entry = &tree[leaf];
                if leaf_entry.is_skipped() || leaf_entry.is_folder() != folder {
                    continue;
                }
                wave.push(leaf);
                claimed |= leaf_entry.is_folder();
            }
        }

        if entry.skips_children() {
            continue;
        }
        if claimed {
            deferred.push(id);
        } else {
            stack.extend(entry.children().iter().rev().copied());
        }
    }
    (wave, deferred)
}

/// Run `test` and `transform` for a wave, in parallel when allowed.
fn execute_wave(
    pipe: &dyn Pipe,
    name: &str,
    defaults: &Value,
    tree: &AssetTree,
    wave: &[AssetId],
    pool: &rayon::ThreadPool,
    jobs: usize,
) -> Vec<Outcome> {
    let run_one = |id: &AssetId| -> Outcome {
        let view = AssetView::new(tree, *id);
        let options = resolve_options(name, defaults, &tree[*id]);
        if !pipe.test(&view, &options)? {
            return Ok(None);
        }
        pipe.transform(&view, &options).map(Some)
    };

    if jobs == 1 || wave.len() <= 1 {
        wave.iter().map(&run_one).collect()
    } else {
        pool.install(|| wave.par_iter().map(&run_one).collect())
    }
}

fn apply_output(tree: &mut AssetTree, id: AssetId, pipe: &str, output: TransformOutput) {
    for derived in output.derived {
        let child = tree.derive_at(id, pipe, &derived.name, derived.content);
        if let Some(meta) = tree.meta_data_mut(child) {
            meta.extend(derived.tags);
        }
        if let Some(data) = tree.transform_data_mut(child) {
            data.extend(derived.transform_data);
        }
    }
    if output.skip {
        tree.set_skip(id, pipe);
    }
    if output.skip_children {
        tree.set_skip_children(id, pipe);
    }
}

fn write_output(tree: &AssetTree, id: AssetId, target: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::filesystem(parent, e))?;
    }
    let content = tree.content(id).map_err(|e| PipelineError::filesystem(tree[id].path(), e))?;
    fs::write(target, content.as_ref()).map_err(|e| PipelineError::filesystem(target, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::DerivedAsset;
    use serde_json::json;
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn create_test_context(temp: &TempDir) -> BuildContext {
        fs::create_dir_all(temp.path().join("src")).unwrap();
        BuildContext::new(temp.path().join("src"), temp.path().join("out"))
            .with_cache_dir(temp.path().join("cache"))
            .with_jobs(2)
    }

    /// Appends a suffix to every file name.
    struct Suffix {
        name: &'static str,
        suffix: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl Suffix {
        fn new(name: &'static str, suffix: &'static str) -> Self {
            Self { name, suffix, calls: Arc::new(AtomicUsize::new(0)) }
        }
    }

    impl Pipe for Suffix {
        fn name(&self) -> &str {
            self.name
        }

        fn default_options(&self) -> Value {
            json!({})
        }

        fn capabilities(&self) -> PipeCapabilities {
            PipeCapabilities::transform()
        }

        fn test(&self, _asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
            Ok(true)
        }

        fn transform(
            &self,
            asset: &AssetView<'_>,
            _options: &PipeOptions,
        ) -> Result<TransformOutput, PipeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = format!("{}{}", asset.filename(), self.suffix);
            Ok(TransformOutput::derived(vec![DerivedAsset::new(name, asset.content()?.into_owned())]))
        }
    }

    /// Fails on files named `bad.*`.
    struct Picky;

    impl Pipe for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        fn default_options(&self) -> Value {
            json!({})
        }

        fn capabilities(&self) -> PipeCapabilities {
            PipeCapabilities::transform()
        }

        fn test(&self, _asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
            Ok(true)
        }

        fn transform(
            &self,
            asset: &AssetView<'_>,
            _options: &PipeOptions,
        ) -> Result<TransformOutput, PipeError> {
            if asset.filename().starts_with("bad") {
                return Err(PipeError::new("cannot handle this file"));
            }
            Ok(TransformOutput::derived(vec![DerivedAsset::new(
                format!("ok-{}", asset.filename()),
                asset.content()?.into_owned(),
            )]))
        }
    }

    /// Records the phase order it observes.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail_finish: bool,
    }

    impl Pipe for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn default_options(&self) -> Value {
            json!({})
        }

        fn capabilities(&self) -> PipeCapabilities {
            PipeCapabilities { start: true, transform: true, finish: true }
        }

        fn test(&self, _asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
            Ok(true)
        }

        fn start(&mut self) -> Result<(), PipeError> {
            self.log.lock().unwrap().push("start".to_string());
            Ok(())
        }

        fn transform(
            &self,
            asset: &AssetView<'_>,
            _options: &PipeOptions,
        ) -> Result<TransformOutput, PipeError> {
            self.log.lock().unwrap().push(format!("transform {}", asset.filename()));
            Ok(TransformOutput::unchanged())
        }

        fn finish(
            &mut self,
            tree: &mut AssetTree,
            root: AssetId,
            _options: &PipeOptions,
            _context: &FinishContext,
        ) -> Result<(), PipeError> {
            let leaves: usize =
                tree.walk(root).iter().map(|id| tree.final_transformed_children(*id).len()).sum();
            self.log.lock().unwrap().push(format!("finish {}", leaves));
            if self.fail_finish {
                return Err(PipeError::new("finish exploded"));
            }
            Ok(())
        }
    }

    /// Folder pipe that swallows `{pack}` folders.
    struct Packer;

    impl Pipe for Packer {
        fn name(&self) -> &str {
            "packer"
        }

        fn folder(&self) -> bool {
            true
        }

        fn default_options(&self) -> Value {
            json!({})
        }

        fn capabilities(&self) -> PipeCapabilities {
            PipeCapabilities::transform()
        }

        fn test(&self, asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
            Ok(asset.entry().tag("pack").is_some())
        }

        fn transform(
            &self,
            asset: &AssetView<'_>,
            _options: &PipeOptions,
        ) -> Result<TransformOutput, PipeError> {
            let count = asset.entry().children().len();
            Ok(TransformOutput::derived(vec![DerivedAsset::new(
                "packed.txt",
                count.to_string().into_bytes(),
            )])
            .with_skip_children())
        }
    }

    #[test]
    fn test_duplicate_pipe_names_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        let pipes: Vec<Box<dyn Pipe>> = vec![Box::new(Suffix::new("a", ".x")), Box::new(Suffix::new("a", ".y"))];
        let err = PipelineEngine::new(ctx, pipes).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_invalid_ignore_pattern_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_ignore(vec!["[".to_string()]);
        assert!(matches!(PipelineEngine::new(ctx, vec![]), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_missing_source_root_is_filesystem_error() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new(temp.path().join("nope"), temp.path().join("out"));
        let mut engine = PipelineEngine::new(ctx, vec![]).unwrap();
        assert!(matches!(engine.build(), Err(PipelineError::Filesystem { .. })));
    }

    #[test]
    fn test_pass_through_copies_sources() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        create_test_file(&ctx.source_root().to_path_buf(), "dir{tag}/a.txt", b"a");

        let mut engine = PipelineEngine::new(ctx, vec![]).unwrap();
        let result = engine.build().unwrap();

        assert_eq!(result.written, vec![PathBuf::from("dir/a.txt")]);
        assert_eq!(fs::read(temp.path().join("out/dir/a.txt")).unwrap(), b"a");
    }

    #[test]
    fn test_failed_write_only_affects_its_entry() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        let src = ctx.source_root().to_path_buf();
        create_test_file(&src, "a.txt", b"a");
        create_test_file(&src, "b.txt", b"b");
        // A directory where the output file should go
        fs::create_dir_all(temp.path().join("out/a.txt.x")).unwrap();

        let mut engine = PipelineEngine::new(ctx, vec![Box::new(Suffix::new("suffix", ".x"))]).unwrap();
        let result = engine.build().unwrap();

        assert_eq!(result.written, vec![PathBuf::from("b.txt.x")]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].pipe, OUTPUT_STAGE);
        assert_eq!(result.failures[0].path, PathBuf::from("a.txt"));
    }

    #[test]
    fn test_chained_stages_see_previous_output() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        create_test_file(&ctx.source_root().to_path_buf(), "a.txt", b"a");

        let pipes: Vec<Box<dyn Pipe>> =
            vec![Box::new(Suffix::new("one", ".1")), Box::new(Suffix::new("two", ".2"))];
        let mut engine = PipelineEngine::new(ctx, pipes).unwrap();
        let result = engine.build().unwrap();

        assert_eq!(result.transformed, 2);
        assert!(temp.path().join("out/a.txt.1.2").exists());
        assert!(!temp.path().join("out/a.txt").exists());
        assert!(!temp.path().join("out/a.txt.1").exists());
    }

    #[test]
    fn test_transform_failure_falls_back_to_copy() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        let src = ctx.source_root().to_path_buf();
        create_test_file(&src, "bad.txt", b"b");
        create_test_file(&src, "good.txt", b"g");

        let mut engine = PipelineEngine::new(ctx, vec![Box::new(Picky)]).unwrap();
        let result = engine.build().unwrap();

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].pipe, "picky");
        assert_eq!(result.failures[0].path, PathBuf::from("bad.txt"));
        assert!(temp.path().join("out/bad.txt").exists());
        assert!(temp.path().join("out/ok-good.txt").exists());
    }

    #[test]
    fn test_phase_order_and_finish_sees_all_transforms() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false).with_jobs(1);
        let src = ctx.source_root().to_path_buf();
        create_test_file(&src, "a.txt", b"a");
        create_test_file(&src, "b.txt", b"b");

        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder { log: Arc::clone(&log), fail_finish: false };
        let pipes: Vec<Box<dyn Pipe>> = vec![Box::new(Suffix::new("one", ".1")), Box::new(recorder)];
        let mut engine = PipelineEngine::new(ctx, pipes).unwrap();
        engine.build().unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["start", "transform a.txt.1", "transform b.txt.1", "finish 3"]);
    }

    #[test]
    fn test_finish_error_aborts_run() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        create_test_file(&ctx.source_root().to_path_buf(), "a.txt", b"a");

        let recorder = Recorder { log: Arc::new(Mutex::new(Vec::new())), fail_finish: true };
        let mut engine = PipelineEngine::new(ctx, vec![Box::new(recorder)]).unwrap();
        match engine.build() {
            Err(PipelineError::Finish { pipe, .. }) => assert_eq!(pipe, "recorder"),
            other => panic!("expected finish error, got {:?}", other.map(|r| r.summary())),
        }
        assert!(!temp.path().join("out/a.txt").exists());
    }

    #[test]
    fn test_start_runs_every_run() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        create_test_file(&ctx.source_root().to_path_buf(), "a.txt", b"a");

        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder { log: Arc::clone(&log), fail_finish: false };
        let mut engine = PipelineEngine::new(ctx, vec![Box::new(recorder)]).unwrap();
        engine.build().unwrap();
        engine.run().unwrap();

        let starts = log.lock().unwrap().iter().filter(|l| *l == "start").count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn test_folder_pipe_skips_children() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp).with_cache(false);
        let src = ctx.source_root().to_path_buf();
        create_test_file(&src, "sheet{pack}/a.txt", b"a");
        create_test_file(&src, "sheet{pack}/b.txt", b"b");
        create_test_file(&src, "loose.txt", b"l");

        let pipes: Vec<Box<dyn Pipe>> = vec![Box::new(Packer), Box::new(Suffix::new("suffix", ".s"))];
        let mut engine = PipelineEngine::new(ctx, pipes).unwrap();
        let result = engine.build().unwrap();

        let mut written: Vec<String> = result.written.iter().map(|p| path_key(p)).collect();
        written.sort();
        assert_eq!(written, vec!["loose.txt.s", "packed.txt.s"]);
        assert_eq!(fs::read(temp.path().join("out/packed.txt.s")).unwrap(), b"2");
    }

    #[test]
    fn test_second_run_reuses_cache() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        create_test_file(&ctx.source_root().to_path_buf(), "a.txt", b"a");

        let suffix = Suffix::new("suffix", ".s");
        let calls = Arc::clone(&suffix.calls);
        let mut engine = PipelineEngine::new(ctx.clone(), vec![Box::new(suffix)]).unwrap();
        engine.build().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // a fresh engine reads the persisted cache
        let suffix = Suffix::new("suffix", ".s");
        let calls = Arc::clone(&suffix.calls);
        let mut engine = PipelineEngine::new(ctx, vec![Box::new(suffix)]).unwrap();
        let result = engine.build().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.transformed, 0);
        assert!(result.written.is_empty());
    }

    #[test]
    fn test_rename_prunes_old_output() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        let src = ctx.source_root().to_path_buf();
        create_test_file(&src, "keep.txt", b"k");
        create_test_file(&src, "old.txt", b"o");

        let mut engine = PipelineEngine::new(ctx, vec![]).unwrap();
        engine.build().unwrap();
        assert!(temp.path().join("out/old.txt").exists());

        fs::rename(src.join("old.txt"), src.join("new.txt")).unwrap();
        let changes = engine.apply_changes(&[src.join("old.txt"), src.join("new.txt")]);
        assert_eq!(changes.len(), 2);

        let result = engine.run().unwrap();
        assert_eq!(result.deleted, vec![PathBuf::from("old.txt")]);
        assert!(temp.path().join("out/new.txt").exists());
        assert!(temp.path().join("out/keep.txt").exists());
    }

    #[test]
    fn test_missing_output_is_rewritten() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        create_test_file(&ctx.source_root().to_path_buf(), "a.txt", b"a");

        let mut engine = PipelineEngine::new(ctx, vec![Box::new(Suffix::new("s", ".s"))]).unwrap();
        engine.build().unwrap();
        fs::remove_file(temp.path().join("out/a.txt.s")).unwrap();

        let result = engine.run().unwrap();
        assert_eq!(result.transformed, 0);
        assert_eq!(fs::read(temp.path().join("out/a.txt.s")).unwrap(), b"a");
    }

    #[test]
    fn test_reusable_stages_stop_at_first_finish_pipe() {
        let temp = TempDir::new().unwrap();
        let ctx = create_test_context(&temp);
        let recorder = Recorder { log: Arc::new(Mutex::new(Vec::new())), fail_finish: false };
        let pipes: Vec<Box<dyn Pipe>> =
            vec![Box::new(Suffix::new("a", ".a")), Box::new(recorder), Box::new(Suffix::new("b", ".b"))];
        let engine = PipelineEngine::new(ctx, pipes).unwrap();
        assert_eq!(engine.reusable_stages(), 1);
        assert_eq!(engine.pipe_names(), vec!["a", "recorder", "b"]);
    }
}
