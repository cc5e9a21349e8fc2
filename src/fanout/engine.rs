//! Semaphore-bounded worker pool for image generation tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::{ImageGenerationResult, ImageGenerationTask};
use crate::gateway::{ImageGeneration, ImageRequest, ModelGateway};

/// Configuration for one fan-out run.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Upper bound on concurrent backend image calls.
    pub max_parallel: usize,
    /// Retry backoff base; the delay is `base * 2^attempt`.
    pub backoff_base: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Aggregated outcome of a fan-out run.
#[derive(Debug, Clone)]
pub struct FanOutReport {
    /// One result per task, ordered by priority-sorted submission index.
    pub results: Vec<ImageGenerationResult>,
    pub cache_hits: usize,
    pub total_tasks: usize,
    pub wall_ms: u64,
    pub max_parallel: usize,
}

/// Cached outcome of one prompt triple.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image_url: String,
    pub thumbnail_url: String,
    pub quality: f64,
}

/// Priority-ordered, cache-aware image generation scheduler.
///
/// The cache lives for the lifetime of the engine, so re-running the same
/// task set against a warm engine produces identical results with a cache
/// hit rate of 1.
pub struct FanOutEngine {
    config: FanOutConfig,
    cache: Arc<Mutex<HashMap<String, CachedImage>>>,
}

impl FanOutEngine {
    pub fn new(config: FanOutConfig) -> Self {
        Self::with_cache(config, Arc::new(Mutex::new(HashMap::new())))
    }

    /// Build an engine around an externally owned cache, so warmth survives
    /// across runs (e.g. a phase re-run after rejected feedback).
    pub fn with_cache(
        config: FanOutConfig,
        cache: Arc<Mutex<HashMap<String, CachedImage>>>,
    ) -> Self {
        Self { config, cache }
    }

    /// Run the full task set to completion (or cancellation) and return one
    /// result per task, in priority order.
    pub async fn run(
        &self,
        mut tasks: Vec<ImageGenerationTask>,
        gateway: Arc<dyn ModelGateway>,
        cancel: &CancellationToken,
    ) -> FanOutReport {
        let started = Instant::now();

        // Stable sort keeps submission order among equal priorities.
        tasks.sort_by_key(|t| std::cmp::Reverse(t.priority));
        let total = tasks.len();

        // Tasks with an identical prompt triple collapse to one backend
        // invocation; the later ones are served from the first one's result.
        let mut representative: HashMap<String, usize> = HashMap::new();
        let mut dedup_source: Vec<Option<usize>> = vec![None; total];
        for (index, task) in tasks.iter().enumerate() {
            match representative.get(&task.cache_key()) {
                Some(first) => dedup_source[index] = Some(*first),
                None => {
                    representative.insert(task.cache_key(), index);
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut handles: Vec<Option<JoinHandle<ImageGenerationResult>>> =
            Vec::with_capacity(total);

        for (index, task) in tasks.iter().enumerate() {
            if dedup_source[index].is_some() {
                handles.push(None);
                continue;
            }
            let task = task.clone();
            let semaphore = Arc::clone(&semaphore);
            let gateway = Arc::clone(&gateway);
            let cache = Arc::clone(&self.cache);
            let cancel = cancel.clone();
            let backoff_base = self.config.backoff_base;

            handles.push(Some(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return cancelled_result(&task),
                };
                run_task(task, gateway, cache, cancel, backoff_base).await
            })));
        }

        // Merge in submission order, regardless of completion order.
        let mut results: Vec<ImageGenerationResult> = Vec::with_capacity(total);
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle {
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(join_err) => {
                        warn!(task = index, error = %join_err, "image worker panicked");
                        ImageGenerationResult {
                            panel_id: tasks[index].panel_id.clone(),
                            success: false,
                            error_message: Some(format!("worker failed: {}", join_err)),
                            ..Default::default()
                        }
                    }
                },
                None => {
                    // Duplicate of an earlier task: serve from its result.
                    let source = dedup_source[index].expect("duplicate has a source");
                    let origin = &results[source];
                    let mut cloned = origin.clone();
                    cloned.panel_id = tasks[index].panel_id.clone();
                    cloned.retry_count = 0;
                    cloned.generation_duration_ms = 0;
                    cloned.from_cache = origin.success;
                    cloned
                }
            };
            results.push(result);
        }

        let cache_hits = results.iter().filter(|r| r.from_cache).count();
        FanOutReport {
            results,
            cache_hits,
            total_tasks: total,
            wall_ms: started.elapsed().as_millis() as u64,
            max_parallel: self.config.max_parallel,
        }
    }
}

fn cancelled_result(task: &ImageGenerationTask) -> ImageGenerationResult {
    ImageGenerationResult {
        panel_id: task.panel_id.clone(),
        success: false,
        error_message: Some("cancelled".to_string()),
        ..Default::default()
    }
}

async fn run_task(
    task: ImageGenerationTask,
    gateway: Arc<dyn ModelGateway>,
    cache: Arc<Mutex<HashMap<String, CachedImage>>>,
    cancel: CancellationToken,
    backoff_base: Duration,
) -> ImageGenerationResult {
    let started = Instant::now();
    let key = task.cache_key();

    if cancel.is_cancelled() {
        return cancelled_result(&task);
    }

    if let Some(hit) = cache.lock().await.get(&key).cloned() {
        debug!(panel = %task.panel_id, "image cache hit");
        return ImageGenerationResult {
            panel_id: task.panel_id.clone(),
            success: true,
            image_url: Some(hit.image_url),
            thumbnail_url: Some(hit.thumbnail_url),
            quality_score: Some(hit.quality),
            generation_duration_ms: 0,
            retry_count: 0,
            error_message: None,
            from_cache: true,
        };
    }

    let request = ImageRequest {
        prompt: task.prompt.clone(),
        negative_prompt: task.negative_prompt.clone(),
        style_parameters: task.style_parameters.clone(),
    };

    let mut retry_count = 0;
    let mut last_error = String::new();
    for attempt in 0..task.max_retries.max(1) {
        if cancel.is_cancelled() {
            let mut result = cancelled_result(&task);
            result.retry_count = retry_count;
            result.generation_duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        match gateway.generate_image(&request, &cancel).await {
            Ok(ImageGeneration {
                image_url,
                thumbnail_url,
                quality,
            }) => {
                cache.lock().await.insert(
                    key,
                    CachedImage {
                        image_url: image_url.clone(),
                        thumbnail_url: thumbnail_url.clone(),
                        quality,
                    },
                );
                return ImageGenerationResult {
                    panel_id: task.panel_id.clone(),
                    success: true,
                    image_url: Some(image_url),
                    thumbnail_url: Some(thumbnail_url),
                    quality_score: Some(quality),
                    generation_duration_ms: started.elapsed().as_millis() as u64,
                    retry_count,
                    error_message: None,
                    from_cache: false,
                };
            }
            Err(err) => {
                if !err.is_transient() {
                    // Cancellation: report and stop retrying.
                    let mut result = cancelled_result(&task);
                    result.retry_count = retry_count;
                    result.generation_duration_ms = started.elapsed().as_millis() as u64;
                    return result;
                }
                last_error = err.to_string();
                retry_count += 1;
                debug!(panel = %task.panel_id, attempt, error = %last_error, "image task retry");

                if attempt + 1 < task.max_retries.max(1) {
                    let delay = backoff_base * 2u32.saturating_pow(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let mut result = cancelled_result(&task);
                            result.retry_count = retry_count;
                            result.generation_duration_ms = started.elapsed().as_millis() as u64;
                            return result;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    ImageGenerationResult {
        panel_id: task.panel_id.clone(),
        success: false,
        image_url: None,
        thumbnail_url: None,
        quality_score: None,
        generation_duration_ms: started.elapsed().as_millis() as u64,
        retry_count,
        error_message: Some(last_error),
        from_cache: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StubGateway;
    use std::collections::BTreeMap;

    fn task(panel_id: &str, prompt: &str, priority: u8) -> ImageGenerationTask {
        ImageGenerationTask {
            panel_id: panel_id.into(),
            prompt: prompt.into(),
            negative_prompt: "blurry".into(),
            style_parameters: BTreeMap::new(),
            characters: vec![],
            priority,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn results_preserve_priority_sorted_order() {
        let engine = FanOutEngine::new(FanOutConfig {
            max_parallel: 2,
            backoff_base: Duration::from_millis(1),
        });
        let gateway = Arc::new(StubGateway::new());
        let tasks = vec![
            task("low", "a", 2),
            task("high", "b", 9),
            task("mid", "c", 5),
        ];
        let report = engine
            .run(tasks, gateway, &CancellationToken::new())
            .await;
        let order: Vec<&str> = report.results.iter().map(|r| r.panel_id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert!(report.results.iter().all(|r| r.success));
        assert_eq!(report.cache_hits, 0);
    }

    #[tokio::test]
    async fn equal_priorities_keep_submission_order() {
        let engine = FanOutEngine::new(FanOutConfig::default());
        let gateway = Arc::new(StubGateway::new());
        let tasks = vec![task("first", "a", 5), task("second", "b", 5)];
        let report = engine.run(tasks, gateway, &CancellationToken::new()).await;
        assert_eq!(report.results[0].panel_id, "first");
        assert_eq!(report.results[1].panel_id, "second");
    }

    #[tokio::test]
    async fn identical_prompts_invoke_backend_once() {
        let engine = FanOutEngine::new(FanOutConfig {
            max_parallel: 4,
            backoff_base: Duration::from_millis(1),
        });
        let gateway = Arc::new(StubGateway::new());
        let tasks = vec![task("p1", "same prompt", 5), task("p2", "same prompt", 5)];
        let report = engine
            .run(tasks, Arc::clone(&gateway) as Arc<dyn ModelGateway>, &CancellationToken::new())
            .await;

        assert_eq!(gateway.image_calls(), 1);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.results[0].image_url, report.results[1].image_url);
        assert!(report.results[1].from_cache);
    }

    #[tokio::test]
    async fn warm_cache_yields_full_hit_rate_and_identical_results() {
        let engine = FanOutEngine::new(FanOutConfig {
            max_parallel: 2,
            backoff_base: Duration::from_millis(1),
        });
        let gateway = Arc::new(StubGateway::new());
        let tasks = vec![task("p1", "alpha", 6), task("p2", "beta", 4)];

        let cold = engine
            .run(tasks.clone(), Arc::clone(&gateway) as Arc<dyn ModelGateway>, &CancellationToken::new())
            .await;
        let warm = engine
            .run(tasks, Arc::clone(&gateway) as Arc<dyn ModelGateway>, &CancellationToken::new())
            .await;

        assert_eq!(cold.cache_hits, 0);
        assert_eq!(warm.cache_hits, warm.total_tasks);
        for (a, b) in cold.results.iter().zip(warm.results.iter()) {
            assert_eq!(a.panel_id, b.panel_id);
            assert_eq!(a.image_url, b.image_url);
            assert_eq!(a.quality_score, b.quality_score);
        }
        assert!(warm.results.iter().all(|r| r.generation_duration_ms == 0));
    }

    #[tokio::test]
    async fn failing_backend_exhausts_retries() {
        let engine = FanOutEngine::new(FanOutConfig {
            max_parallel: 1,
            backoff_base: Duration::from_millis(1),
        });
        let gateway = Arc::new(StubGateway::new().with_failing_images());
        let report = engine
            .run(
                vec![task("p1", "a", 5)],
                Arc::clone(&gateway) as Arc<dyn ModelGateway>,
                &CancellationToken::new(),
            )
            .await;

        let result = &report.results[0];
        assert!(!result.success);
        assert_eq!(result.retry_count, 3);
        assert_eq!(gateway.image_calls(), 3);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn cancellation_marks_pending_tasks_cancelled() {
        let engine = FanOutEngine::new(FanOutConfig {
            max_parallel: 1,
            backoff_base: Duration::from_millis(1),
        });
        let gateway = Arc::new(StubGateway::new().with_image_latency(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let tasks = (0..4).map(|i| task(&format!("p{}", i), &format!("prompt {}", i), 5)).collect();
        let report = engine
            .run(tasks, Arc::clone(&gateway) as Arc<dyn ModelGateway>, &cancel)
            .await;

        assert_eq!(report.results.len(), 4);
        let cancelled = report
            .results
            .iter()
            .filter(|r| r.error_message.as_deref() == Some("cancelled"))
            .count();
        assert!(cancelled >= 3, "expected most tasks cancelled, got {}", cancelled);
    }
}
