use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use taskflow_core::state::LOGS_KEY;
use taskflow_core::{Error, Result, SessionState, ValueMap};
use taskflow_providers::LanguageModel;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bundle::{discover, Bundle, BundleStamp};
use crate::capability::{Capability, CapabilityContext, CapabilitySource};
use crate::glob::GlobSet;
use crate::provider::{CapabilityProvider, ProcessProvider, RhaiProvider};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySummary {
    pub name: String,
    pub description: String,
}

impl CapabilitySummary {
    /// One `- **name**: description` line per entry.
    pub fn render_markdown(items: &[CapabilitySummary]) -> String {
        items
            .iter()
            .map(|c| format!("- **{}**: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Outcome of a load or rescan pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<(PathBuf, String)>,
}

impl LoadReport {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

struct BundleRecord {
    /// Name currently registered from this bundle; `None` if it never loaded.
    name: Option<String>,
    stamp: BundleStamp,
}

/// Name-addressed capability table with hot reload and per-conversation
/// visibility.
///
/// Entries are `Arc`s swapped under a short write lock, so a run that already
/// cloned the old entry finishes on the old handler.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Arc<Capability>>>,
    builtins: RwLock<HashMap<String, Arc<Capability>>>,
    visibility: RwLock<HashMap<String, GlobSet>>,
    roots: RwLock<Vec<PathBuf>>,
    bundles: Mutex<HashMap<PathBuf, BundleRecord>>,
    providers: Vec<Box<dyn CapabilityProvider>>,
    model: Arc<dyn LanguageModel>,
}

impl CapabilityRegistry {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self::with_providers(
            model,
            vec![Box::new(RhaiProvider::default()), Box::new(ProcessProvider)],
        )
    }

    pub fn with_providers(
        model: Arc<dyn LanguageModel>,
        providers: Vec<Box<dyn CapabilityProvider>>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            builtins: RwLock::new(HashMap::new()),
            visibility: RwLock::new(HashMap::new()),
            roots: RwLock::new(Vec::new()),
            bundles: Mutex::new(HashMap::new()),
            providers,
            model,
        }
    }

    // ---------------------------------------------------------------- table

    /// Registers (or replaces) a capability under its name.
    pub fn register(&self, capability: Capability) {
        let capability = Arc::new(capability);
        let name = capability.name().to_string();
        if capability.is_builtin() {
            self.builtins
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), capability.clone());
        }
        debug!(capability = %name, "Registered capability");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, capability);
    }

    /// Removes a capability entirely, built-in fallback included.
    pub fn unregister(&self, name: &str) -> Option<Arc<Capability>> {
        self.builtins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Drops a bundle-provided entry, falling back to the built-in of the
    /// same name if there is one.
    fn remove_bundle_entry(&self, name: &str) {
        let fallback = self
            .builtins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match fallback {
            Some(builtin) => {
                entries.insert(name.to_string(), builtin);
            }
            None => {
                entries.remove(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Capability>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ---------------------------------------------------------------- bundles

    /// Loads every bundle below `dir` and remembers `dir` for rescans.
    /// Broken bundles are reported and skipped.
    pub fn load(&self, dir: &Path) -> LoadReport {
        {
            let mut roots = self.roots.write().unwrap_or_else(PoisonError::into_inner);
            if !roots.iter().any(|r| r == dir) {
                roots.push(dir.to_path_buf());
            }
        }
        let report = self.sync_roots(&[dir.to_path_buf()]);
        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Loaded capability bundles"
        );
        report
    }

    /// Re-examines every known root: reloads changed bundles, registers new
    /// ones, unregisters deleted ones.
    pub fn rescan(&self) -> LoadReport {
        let roots = self
            .roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.sync_roots(&roots)
    }

    fn sync_roots(&self, roots: &[PathBuf]) -> LoadReport {
        let mut report = LoadReport::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut records = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);

        for root in roots {
            for bundle in discover(root) {
                seen.insert(bundle.dir.clone());
                let stamp = bundle.stamp();
                let previous_name = match records.get(&bundle.dir) {
                    Some(record) if record.stamp == stamp => continue,
                    Some(record) => record.name.clone(),
                    None => None,
                };

                match self.load_bundle(&bundle) {
                    Ok(capability) => {
                        let name = capability.name().to_string();
                        self.warn_on_shadowing(&name, &bundle.dir);
                        self.register(capability);
                        report.loaded.push(name.clone());
                        records.insert(
                            bundle.dir.clone(),
                            BundleRecord {
                                name: Some(name.clone()),
                                stamp,
                            },
                        );
                        if let Some(old) = previous_name.filter(|old| *old != name) {
                            self.release_name(&mut records, &old, &mut report);
                        }
                    }
                    Err(e) => {
                        // The old entry, if any, stays registered.
                        warn!(bundle = %bundle.dir.display(), error = %e, "Skipping capability bundle");
                        report.failed.push((bundle.dir.clone(), e.to_string()));
                        records.insert(
                            bundle.dir.clone(),
                            BundleRecord {
                                name: previous_name,
                                stamp,
                            },
                        );
                    }
                }
            }
        }

        let gone: Vec<PathBuf> = records
            .keys()
            .filter(|dir| !seen.contains(*dir) && roots.iter().any(|r| dir.starts_with(r)))
            .cloned()
            .collect();
        for dir in gone {
            if let Some(BundleRecord { name: Some(name), .. }) = records.remove(&dir) {
                info!(capability = %name, bundle = %dir.display(), "Capability bundle removed");
                self.release_name(&mut records, &name, &mut report);
            }
        }

        report
    }

    /// `name` lost the bundle it was registered from. Another bundle still
    /// declaring it takes over; otherwise the built-in comes back or the name
    /// goes away.
    fn release_name(
        &self,
        records: &mut HashMap<PathBuf, BundleRecord>,
        name: &str,
        report: &mut LoadReport,
    ) {
        let mut claimants: Vec<PathBuf> = records
            .iter()
            .filter(|(_, record)| record.name.as_deref() == Some(name))
            .map(|(dir, _)| dir.clone())
            .collect();
        claimants.sort();

        for dir in claimants {
            let Some(bundle) = Bundle::at(&dir) else {
                continue;
            };
            match self.load_bundle(&bundle) {
                Ok(capability) if capability.name() == name => {
                    info!(capability = %name, bundle = %dir.display(), "Remaining bundle takes over capability");
                    self.register(capability);
                    report.loaded.push(name.to_string());
                    if let Some(record) = records.get_mut(&dir) {
                        record.stamp = bundle.stamp();
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(bundle = %dir.display(), error = %e, "Remaining bundle failed to load");
                }
            }
        }

        self.remove_bundle_entry(name);
        report.removed.push(name.to_string());
    }

    fn warn_on_shadowing(&self, name: &str, dir: &Path) {
        if let Some(existing) = self.get(name) {
            if let CapabilitySource::Bundle(other) = &existing.source {
                if other != dir {
                    warn!(
                        capability = %name,
                        previous = %other.display(),
                        replacement = %dir.display(),
                        "Two bundles declare the same capability name"
                    );
                }
            }
        }
    }

    fn load_bundle(&self, bundle: &Bundle) -> Result<Capability> {
        let meta = bundle.read_meta()?;
        if meta.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "{} has no name",
                bundle.descriptor.display()
            )));
        }
        let prompt = bundle.read_prompt()?;
        let provider = self
            .providers
            .iter()
            .find(|p| p.accepts(bundle))
            .ok_or_else(|| Error::execution(&meta.name, "no runnable body in bundle"))?;
        let handler = provider.load(bundle, &meta)?;
        debug!(capability = %meta.name, provider = provider.kind(), "Loaded bundle body");

        Ok(Capability {
            meta,
            source: CapabilitySource::Bundle(bundle.dir.clone()),
            prompt,
            handler,
        })
    }

    /// Polls the known roots until `shutdown` fires.
    pub async fn watch(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = interval.as_millis() as u64, "Capability watcher started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Directory walks and script compiles block.
                    let registry = self.clone();
                    let report = match tokio::task::spawn_blocking(move || registry.rescan()).await {
                        Ok(report) => report,
                        Err(e) => {
                            warn!(error = %e, "Capability rescan aborted");
                            continue;
                        }
                    };
                    if !report.is_empty() {
                        info!(
                            loaded = ?report.loaded,
                            removed = ?report.removed,
                            failed = report.failed.len(),
                            "Capabilities reloaded"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Capability watcher shutting down");
                    break;
                }
            }
        }
    }

    // ---------------------------------------------------------------- running

    /// Runs `name` against `state`. Captured output comes back under `__logs`.
    pub async fn run(
        &self,
        name: &str,
        state: &mut SessionState,
        params: ValueMap,
    ) -> Result<ValueMap> {
        let capability = self
            .get(name)
            .ok_or_else(|| Error::CapabilityNotFound(name.to_string()))?;

        let started = Instant::now();
        let mut ctx = CapabilityContext::new(
            state,
            self,
            self.model.clone(),
            &capability.meta,
            capability.prompt.as_deref(),
        );
        let result = capability.handler.run(&mut ctx, params).await;
        let logs = ctx.take_logs();

        debug!(
            capability = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Capability finished"
        );

        let mut output = result?;
        if !logs.is_empty() {
            output.insert(LOGS_KEY.to_string(), Value::String(logs.join("\n")));
        }
        Ok(output)
    }

    // ---------------------------------------------------------------- visibility

    /// Restricts what `catalogue(Some(cid), ..)` reports. Empty means all.
    pub fn set_visibility(&self, conversation_id: &str, patterns: &[String]) {
        self.visibility
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.to_string(), GlobSet::new(patterns));
    }

    pub fn visibility(&self, conversation_id: &str) -> Option<Vec<String>> {
        self.visibility
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map(|set| set.patterns().to_vec())
    }

    /// Sorted names visible to `conversation_id` (all when `None` or unset),
    /// optionally narrowed to a `<group>_` prefix.
    pub fn catalogue(&self, conversation_id: Option<&str>, group: Option<&str>) -> Vec<String> {
        let mut names = self.names();
        if let Some(cid) = conversation_id {
            if let Some(set) = self
                .visibility
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(cid)
            {
                names.retain(|n| set.is_match(n));
            }
        }
        if let Some(group) = group {
            let prefix = format!("{}_", group);
            names.retain(|n| n.starts_with(&prefix));
        }
        names
    }

    pub fn describe(
        &self,
        conversation_id: Option<&str>,
        group: Option<&str>,
    ) -> Vec<CapabilitySummary> {
        self.catalogue(conversation_id, group)
            .into_iter()
            .filter_map(|name| {
                self.get(&name).map(|c| CapabilitySummary {
                    name,
                    description: c.meta.description.clone(),
                })
            })
            .collect()
    }
}
