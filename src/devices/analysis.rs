//! Image analysis endpoint.
//!
//! Sizing runs follow the current resource space: every image the camera
//! registers there is picked up, grouped into batches and analysed on the
//! blocking pool, with a bounded number of batches in flight. A run keeps
//! going past its deadline until every image it collected is processed, then
//! deletes the resource space.

use crate::config::AnalysisSettings;
use crate::context::{Key, Namespace, SharedContext};
use crate::endpoint::{Endpoint, EndpointController, EndpointId, StartGate, State, StateKind, StateScope};
use crate::error::{AppResult, DaqError};
use crate::resources::ResourceRegistry;
use crate::routine::Algorithm;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Controller driving the [`AnalysisEngine`].
pub type AnalysisController = EndpointController<AnalysisEngine>;

const COLLECT_POLL: Duration = Duration::from_millis(250);

/// Outcome of analysing one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Analysed image.
    pub path: PathBuf,
    /// Algorithm that produced the result.
    pub algorithm: Algorithm,
    /// Bubbles or pellets found.
    pub objects: usize,
    /// Mean equivalent diameter of the objects, in pixels.
    pub mean_diameter_px: f64,
}

/// CPU-bound image analysis. Called on the blocking pool.
pub trait ImageAnalyzer: Send + Sync {
    /// Runs `algorithm` over the image at `path`.
    fn analyze(&self, algorithm: Algorithm, path: &Path) -> AppResult<AnalysisResult>;
}

/// States of the analysis endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    /// Bubble sizing over the current resource space.
    BubbleSizing,
    /// Pellet sizing over the current resource space.
    PelletSizing,
    /// Analyses the images listed under `Analysis/AnalysisTarget`.
    SingleImage(Algorithm),
}

impl StateKind for AnalysisKind {
    fn label(&self) -> &'static str {
        match self {
            AnalysisKind::BubbleSizing => "bubble_sizing",
            AnalysisKind::PelletSizing => "pellet_sizing",
            AnalysisKind::SingleImage(_) => "single_image",
        }
    }
}

impl From<Algorithm> for AnalysisKind {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::BubbleSize => AnalysisKind::BubbleSizing,
            Algorithm::PelletSize => AnalysisKind::PelletSizing,
        }
    }
}

/// Batched image analysis over the images of a slot.
pub struct AnalysisEngine {
    analyzer: Arc<dyn ImageAnalyzer>,
    ctx: Arc<SharedContext>,
    resources: Arc<dyn ResourceRegistry>,
    gate: StartGate,
    settings: AnalysisSettings,
    results: Mutex<Vec<AnalysisResult>>,
}

impl AnalysisEngine {
    /// Creates the engine with its start gate closed.
    pub fn new(
        analyzer: Arc<dyn ImageAnalyzer>,
        ctx: Arc<SharedContext>,
        resources: Arc<dyn ResourceRegistry>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            analyzer,
            ctx,
            resources,
            gate: StartGate::new(),
            settings,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Gate released by the engine when analysis should begin.
    pub fn gate(&self) -> &StartGate {
        &self.gate
    }

    /// Results of all sizing runs so far.
    pub fn results(&self) -> Vec<AnalysisResult> {
        self.results.lock().clone()
    }

    fn analyze_batch(&self, algorithm: Algorithm, batch: Vec<PathBuf>) -> Vec<AnalysisResult> {
        batch
            .into_iter()
            .filter_map(|path| match self.analyzer.analyze(algorithm, &path) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Image analysis failed");
                    None
                }
            })
            .collect()
    }
}

impl Endpoint for AnalysisEngine {
    type Kind = AnalysisKind;
    const ID: EndpointId = EndpointId::Analysis;

    fn build_state(endpoint: &Arc<Self>, kind: AnalysisKind) -> Option<Box<dyn State>> {
        let engine = Arc::clone(endpoint);
        Some(match kind {
            AnalysisKind::BubbleSizing => Box::new(Sizing::new(engine, Algorithm::BubbleSize)),
            AnalysisKind::PelletSizing => Box::new(Sizing::new(engine, Algorithm::PelletSize)),
            AnalysisKind::SingleImage(algorithm) => Box::new(SingleImage { engine, algorithm }),
        })
    }
}

struct Sizing {
    engine: Arc<AnalysisEngine>,
    algorithm: Algorithm,
    seen: HashSet<PathBuf>,
    stack: VecDeque<PathBuf>,
    processed: u64,
}

impl Sizing {
    fn new(engine: Arc<AnalysisEngine>, algorithm: Algorithm) -> Self {
        Self {
            engine,
            algorithm,
            seen: HashSet::new(),
            stack: VecDeque::new(),
            processed: 0,
        }
    }

    /// Stacks resources of `space` not seen before.
    fn collect(&mut self, space: &str) {
        let Some(resources) = self.engine.resources.resources(space) else {
            return;
        };
        for resource in resources {
            if self.seen.insert(resource.path.clone()) {
                self.stack.push_back(resource.path);
            }
        }
    }

    fn record(&mut self, joined: Result<Vec<AnalysisResult>, tokio::task::JoinError>) {
        match joined {
            Ok(results) => {
                self.processed += results.len() as u64;
                self.engine.results.lock().extend(results);
                self.engine
                    .ctx
                    .set(Namespace::Measurement, Key::ResultCount, self.processed);
            }
            Err(e) => error!(error = %e, "Analysis batch panicked"),
        }
    }
}

#[async_trait]
impl State for Sizing {
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
        let space: String = self
            .engine
            .ctx
            .require(Namespace::Measurement, Key::CurrentResourceSpace)?;
        self.engine.ctx.set(Namespace::Measurement, Key::ResultCount, 0u64);

        if !scope.wait_gate(&self.engine.gate).await {
            return Ok(());
        }

        let batch_size = self.engine.settings.batch_size.max(1);
        let max_batches = self.engine.settings.max_parallel_batches.max(1);
        let mut batches = JoinSet::new();
        let mut final_sweep_done = false;

        loop {
            let draining = !scope.running();
            if !final_sweep_done {
                self.collect(&space);
                final_sweep_done = draining;
            }

            // Partial batches only once nothing new will arrive.
            while batches.len() < max_batches
                && (self.stack.len() >= batch_size || (draining && !self.stack.is_empty()))
            {
                let take = batch_size.min(self.stack.len());
                let batch: Vec<PathBuf> = self.stack.drain(..take).collect();
                debug!(images = batch.len(), in_flight = batches.len() + 1, "Analysing batch");
                let engine = Arc::clone(&self.engine);
                let algorithm = self.algorithm;
                batches.spawn_blocking(move || engine.analyze_batch(algorithm, batch));
            }

            if draining && self.stack.is_empty() && batches.is_empty() {
                break;
            }

            tokio::select! {
                _ = scope.cancelled() => {
                    warn!(pending = self.stack.len(), in_flight = batches.len(), "Analysis cancelled");
                    batches.abort_all();
                    break;
                }
                Some(joined) = batches.join_next(), if !batches.is_empty() => self.record(joined),
                _ = tokio::time::sleep(COLLECT_POLL) => {}
            }
        }

        info!(
            algorithm = ?self.algorithm,
            images = self.seen.len(),
            processed = self.processed,
            "Analysis run finished"
        );
        self.engine.resources.delete_space(&space);
        Ok(())
    }
}

/// Analyses explicitly targeted images and stores the results under
/// `Analysis/AnalysisResult`.
struct SingleImage {
    engine: Arc<AnalysisEngine>,
    algorithm: Algorithm,
}

#[async_trait]
impl State for SingleImage {
    async fn run_logic(&mut self, _scope: &StateScope) -> AppResult<()> {
        let targets: Vec<PathBuf> = self
            .engine
            .ctx
            .take(Namespace::Analysis, Key::AnalysisTarget)
            .ok_or(DaqError::MissingContext {
                namespace: Namespace::Analysis,
                key: Key::AnalysisTarget,
            })?;
        let count = targets.len();

        let engine = Arc::clone(&self.engine);
        let algorithm = self.algorithm;
        let results = tokio::task::spawn_blocking(move || engine.analyze_batch(algorithm, targets))
            .await
            .map_err(|e| DaqError::Processing(e.to_string()))?;

        info!(requested = count, analysed = results.len(), "Single image analysis done");
        self.engine
            .ctx
            .set(Namespace::Analysis, Key::AnalysisResult, results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSettings;
    use crate::hardware::mock::MockAnalyzer;
    use crate::resources::InMemoryResourceRegistry;

    struct Rig {
        analyzer: Arc<MockAnalyzer>,
        ctx: Arc<SharedContext>,
        resources: Arc<InMemoryResourceRegistry>,
        ctl: Arc<AnalysisController>,
        dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let analyzer = Arc::new(MockAnalyzer::new());
        let ctx = Arc::new(SharedContext::new());
        let resources = Arc::new(InMemoryResourceRegistry::new());
        let engine = AnalysisEngine::new(
            analyzer.clone(),
            Arc::clone(&ctx),
            resources.clone(),
            AnalysisSettings::default(),
        );
        let ctl = EndpointController::spawn(Arc::new(engine), 10, &EndpointSettings::default());
        Rig {
            analyzer,
            ctx,
            resources,
            ctl,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Rig {
        fn add_image(&self, space: &str, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            self.resources.register(space, name, path.clone());
            path
        }
    }

    #[tokio::test]
    async fn test_sizing_drains_images_after_deadline() {
        let rig = rig();
        rig.ctx
            .set(Namespace::Measurement, Key::CurrentResourceSpace, "space-a");
        for i in 0..12 {
            rig.add_image("space-a", &format!("img_{i}.raw"));
        }
        rig.ctl.endpoint().gate().open();
        rig.ctl
            .enqueue(AnalysisKind::BubbleSizing, Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(10), async {
            while !rig.ctl.is_idle() || rig.ctl.dispatched() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(rig.analyzer.processed(), 12);
        assert_eq!(rig.ctx.get::<u64>(Namespace::Measurement, Key::ResultCount), Some(12));
        assert_eq!(rig.ctl.endpoint().results().len(), 12);
        assert!(rig
            .ctl
            .endpoint()
            .results()
            .iter()
            .all(|r| r.algorithm == Algorithm::BubbleSize));
        assert!(rig.resources.resources("space-a").is_none());
        rig.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_sizing_skips_unreadable_images() {
        let rig = rig();
        rig.ctx
            .set(Namespace::Measurement, Key::CurrentResourceSpace, "space-b");
        rig.add_image("space-b", "good.raw");
        rig.resources
            .register("space-b", "missing.raw", rig.dir.path().join("missing.raw"));
        rig.ctl.endpoint().gate().open();
        rig.ctl
            .enqueue(AnalysisKind::PelletSizing, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.ctx.get::<u64>(Namespace::Measurement, Key::ResultCount), Some(1));
        rig.ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sizing_waits_for_gate_and_stops_on_cancel() {
        let rig = rig();
        rig.ctx
            .set(Namespace::Measurement, Key::CurrentResourceSpace, "space-c");
        rig.ctl
            .enqueue(AnalysisKind::BubbleSizing, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.ctl.current_state_kind(), Some(AnalysisKind::BubbleSizing));

        rig.ctl.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.ctl.is_idle());
        assert_eq!(rig.analyzer.processed(), 0);
        rig.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_image_stores_results() {
        let rig = rig();
        let a = rig.add_image("unused", "a.raw");
        let b = rig.add_image("unused", "b.raw");
        rig.ctx
            .set(Namespace::Analysis, Key::AnalysisTarget, vec![a.clone(), b]);
        rig.ctl
            .enqueue(AnalysisKind::SingleImage(Algorithm::PelletSize), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let results: Vec<AnalysisResult> = rig
            .ctx
            .get(Namespace::Analysis, Key::AnalysisResult)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, a);
        assert!(!rig.ctx.contains(Namespace::Analysis, Key::AnalysisTarget));
        rig.ctl.shutdown().await;
    }

    #[test]
    fn test_kind_from_algorithm() {
        assert_eq!(AnalysisKind::from(Algorithm::BubbleSize), AnalysisKind::BubbleSizing);
        assert_eq!(AnalysisKind::from(Algorithm::PelletSize), AnalysisKind::PelletSizing);
    }
}
