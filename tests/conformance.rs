use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use bookqueue_core::capability::{CPUExecutor, OCRProvider};
use bookqueue_core::docstore::MemoryDocStore;
use bookqueue_core::error::{CapabilityError, JobError};
use bookqueue_core::job::{apply_retry_policy, BaseJob, Job, RetryOutcome};
use bookqueue_core::registry::JobFactory;
use bookqueue_core::scheduler::{Scheduler, SchedulerConfig};
use bookqueue_core::tracker::TrackerEntry;
use bookqueue_core::types::{Ctx, JobId};
use bookqueue_core::unit::{MetricsAttribution, OcrOutcome, ProviderProgress, UnitKind, UnitPayload, WorkResult, WorkUnit};
use bookqueue_core::worker::WorkerConfig;

/// An OCR provider whose flakiness is scripted per image ref: fail a fixed
/// number of times then succeed, or fail forever for refs in
/// `permanent_fail`.
struct FlakyOcr {
    remaining_failures: StdMutex<HashMap<String, u32>>,
    permanent_fail: HashSet<String>,
}

impl FlakyOcr {
    fn new(remaining_failures: HashMap<String, u32>, permanent_fail: HashSet<String>) -> Self {
        Self {
            remaining_failures: StdMutex::new(remaining_failures),
            permanent_fail,
        }
    }
}

#[async_trait]
impl OCRProvider for FlakyOcr {
    async fn recognize(&self, image_ref: &str) -> Result<OcrOutcome, CapabilityError> {
        if self.permanent_fail.contains(image_ref) {
            return Err(CapabilityError::client_fatal("simulated permanent failure"));
        }
        let mut remaining = self.remaining_failures.lock().unwrap();
        let left = remaining.entry(image_ref.to_string()).or_insert(0);
        if *left > 0 {
            *left -= 1;
            return Err(CapabilityError::retryable("simulated transient failure"));
        }
        Ok(OcrOutcome {
            text: format!("text-for-{image_ref}"),
            confidence: 0.95,
            raw_payload: None,
            latency_ms: 1,
        })
    }
}

struct EchoCpu;

#[async_trait]
impl CPUExecutor for EchoCpu {
    async fn run(&self, function: serde_json::Value) -> Result<serde_json::Value, CapabilityError> {
        Ok(function)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ocr,
    Blend,
}

#[derive(Clone)]
struct PageEntry {
    task_key: String,
    retry_count: u32,
    page: u32,
    stage: Stage,
}

impl TrackerEntry for PageEntry {
    fn task_key(&self) -> &str {
        &self.task_key
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Minimal Job Kind used across every scenario below: OCRs a set of pages
/// then blends each page on the shared CPU worker. Page completion is
/// tracked in `persisted`, an external map standing in for the book's
/// substate document — shared across two `PageOcrJob` instances in the
/// crash-recovery scenario to simulate a process restart.
struct PageOcrJob {
    base: BaseJob<(), PageEntry>,
    book_id: String,
    pages: Vec<u32>,
    persisted: Arc<StdMutex<HashMap<u32, bool>>>,
    provider: String,
    max_retries: u32,
    fatal_on_exhaustion: bool,
}

impl PageOcrJob {
    fn new(
        book_id: impl Into<String>,
        pages: Vec<u32>,
        persisted: Arc<StdMutex<HashMap<u32, bool>>>,
        provider: impl Into<String>,
        max_retries: u32,
        fatal_on_exhaustion: bool,
    ) -> Self {
        Self {
            base: BaseJob::new(()),
            book_id: book_id.into(),
            pages,
            persisted,
            provider: provider.into(),
            max_retries,
            fatal_on_exhaustion,
        }
    }

    fn ocr_unit(&self, job_id: JobId, page: u32) -> (WorkUnit, PageEntry) {
        let task_key = format!("page-{page}-ocr");
        let unit = WorkUnit::new(
            job_id,
            UnitKind::Ocr,
            self.provider.clone(),
            UnitPayload::Ocr {
                image_ref: format!("page-{page}.png"),
            },
            MetricsAttribution {
                book_id: self.book_id.clone(),
                stage: "ocr".to_string(),
                item_key: task_key.clone(),
                ..Default::default()
            },
        );
        let entry = PageEntry {
            task_key,
            retry_count: 0,
            page,
            stage: Stage::Ocr,
        };
        (unit, entry)
    }

    fn blend_unit(&self, job_id: JobId, page: u32) -> (WorkUnit, PageEntry) {
        let task_key = format!("page-{page}-blend");
        let unit = WorkUnit::new(
            job_id,
            UnitKind::Cpu,
            "",
            UnitPayload::Cpu {
                function: serde_json::json!({"op": "blend", "page": page}),
            },
            MetricsAttribution {
                book_id: self.book_id.clone(),
                stage: "blend".to_string(),
                item_key: task_key.clone(),
                ..Default::default()
            },
        );
        let entry = PageEntry {
            task_key,
            retry_count: 0,
            page,
            stage: Stage::Blend,
        };
        (unit, entry)
    }

    fn maybe_finish(&self) {
        if self.base.tracker.is_empty() {
            self.base.mark_done();
        }
    }
}

#[async_trait]
impl Job for PageOcrJob {
    fn job_type(&self) -> &'static str {
        "page_ocr"
    }

    fn id(&self) -> Option<JobId> {
        self.base.id()
    }

    fn set_record_id(&self, id: JobId) {
        self.base.set_record_id(id)
    }

    async fn start(&self, _ctx: &Ctx) -> Result<Vec<WorkUnit>, JobError> {
        let job_id = self.base.id().unwrap_or_else(JobId::new);
        let already_done = self.persisted.lock().unwrap().clone();
        let mut units = Vec::new();
        for &page in &self.pages {
            if *already_done.get(&page).unwrap_or(&false) {
                continue;
            }
            let (unit, entry) = self.ocr_unit(job_id.clone(), page);
            self.base.register_work_unit(&unit, entry);
            units.push(unit);
        }
        self.base.record_expected(&self.provider, units.len() as u64);
        if units.is_empty() {
            self.maybe_finish();
        }
        Ok(units)
    }

    async fn on_complete(&self, _ctx: &Ctx, result: WorkResult) -> Result<Vec<WorkUnit>, JobError> {
        let Some(entry) = self.base.get_work_unit(&result.work_unit_id) else {
            // At-least-once delivery means duplicate/unknown results must
            // be a no-op, not an error.
            return Ok(vec![]);
        };

        if result.success {
            self.base.remove_work_unit(&result.work_unit_id);
            match entry.stage {
                Stage::Ocr => {
                    self.base.record_completed(&self.provider);
                    let job_id = self.base.id().unwrap_or_else(JobId::new);
                    let (unit, blend_entry) = self.blend_unit(job_id, entry.page);
                    self.base.record_expected("cpu", 1);
                    self.base.register_work_unit(&unit, blend_entry);
                    Ok(vec![unit])
                }
                Stage::Blend => {
                    self.base.record_completed("cpu");
                    self.persisted.lock().unwrap().insert(entry.page, true);
                    self.maybe_finish();
                    Ok(vec![])
                }
            }
        } else {
            let load_bearing = self.fatal_on_exhaustion && entry.stage == Stage::Ocr;
            // A permanent capability error (e.g. a client-fatal request)
            // skips the retry path outright rather than burning through
            // `max_retries` on something that can never succeed.
            let outcome = if !result.is_retryable() {
                if load_bearing {
                    RetryOutcome::ExhaustedFatal
                } else {
                    RetryOutcome::ExhaustedContinue
                }
            } else {
                apply_retry_policy(
                    &entry,
                    |n| PageEntry {
                        retry_count: n,
                        ..entry.clone()
                    },
                    self.max_retries,
                    load_bearing,
                )
            };
            match outcome {
                RetryOutcome::Retry(next_entry) => {
                    self.base.remove_work_unit(&result.work_unit_id);
                    let job_id = self.base.id().unwrap_or_else(JobId::new);
                    let (unit, _) = match entry.stage {
                        Stage::Ocr => self.ocr_unit(job_id, entry.page),
                        Stage::Blend => self.blend_unit(job_id, entry.page),
                    };
                    self.base.register_work_unit(&unit, next_entry);
                    Ok(vec![unit])
                }
                RetryOutcome::ExhaustedContinue => {
                    self.base.remove_work_unit(&result.work_unit_id);
                    match entry.stage {
                        Stage::Ocr => self.base.record_completed(&self.provider),
                        Stage::Blend => self.base.record_completed("cpu"),
                    }
                    self.persisted.lock().unwrap().insert(entry.page, true);
                    self.maybe_finish();
                    Ok(vec![])
                }
                RetryOutcome::ExhaustedFatal => Err(JobError::fatal(format!(
                    "page {} exhausted retries on a load-bearing task",
                    entry.page
                ))),
            }
        }
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("is_done".to_string(), self.base.is_done().to_string());
        status
    }

    fn progress(&self) -> HashMap<String, ProviderProgress> {
        self.base.progress_snapshot()
    }

    fn metrics_for(&self, stage: &str) -> MetricsAttribution {
        MetricsAttribution {
            book_id: self.book_id.clone(),
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    fn is_done(&self) -> bool {
        self.base.is_done()
    }
}

fn page_job_factory(
    book_id: &str,
    pages: Vec<u32>,
    persisted: Arc<StdMutex<HashMap<u32, bool>>>,
    provider: &str,
    max_retries: u32,
    fatal_on_exhaustion: bool,
) -> JobFactory {
    let book_id = book_id.to_string();
    let provider = provider.to_string();
    Arc::new(move |_handle, _job_id, _metadata| {
        Arc::new(PageOcrJob::new(
            book_id.clone(),
            pages.clone(),
            persisted.clone(),
            provider.clone(),
            max_retries,
            fatal_on_exhaustion,
        )) as Arc<dyn Job>
    })
}

fn make_scheduler(ocr: FlakyOcr) -> Arc<Scheduler> {
    let sink = Arc::new(MemoryDocStore::new());
    let scheduler = Scheduler::new(sink, SchedulerConfig::default());
    scheduler.register_ocr_worker("mock-ocr", Arc::new(ocr), WorkerConfig::default());
    scheduler.register_cpu_worker(Arc::new(EchoCpu), WorkerConfig::default());
    scheduler
}

async fn wait_for_terminal_status(scheduler: &Scheduler, job_id: &JobId, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = scheduler.job_status(job_id) {
            if let Some(s) = status.get("status") {
                if s == "succeeded" || s == "failed" || s == "cancelled" {
                    return s.clone();
                }
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for job {job_id} to reach a terminal status");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fanout_converge() {
    let ocr = FlakyOcr::new(HashMap::new(), HashSet::new());
    let scheduler = make_scheduler(ocr);
    let ctx = Ctx::new();

    let persisted = Arc::new(StdMutex::new(HashMap::new()));
    let factory = page_job_factory("book-fanout", vec![1, 2, 3], persisted, "mock-ocr", 3, false);
    let job_id = scheduler
        .submit(&ctx, "page_ocr", "book-fanout", serde_json::json!({}), factory)
        .await
        .unwrap();

    let status = wait_for_terminal_status(&scheduler, &job_id, Duration::from_secs(5)).await;
    assert_eq!(status, "succeeded");
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_then_succeed() {
    let mut fails = HashMap::new();
    fails.insert("page-1.png".to_string(), 2);
    let ocr = FlakyOcr::new(fails, HashSet::new());
    let scheduler = make_scheduler(ocr);
    let ctx = Ctx::new();

    let persisted = Arc::new(StdMutex::new(HashMap::new()));
    let factory = page_job_factory("book-retry", vec![1], persisted, "mock-ocr", 3, false);
    let job_id = scheduler
        .submit(&ctx, "page_ocr", "book-retry", serde_json::json!({}), factory)
        .await
        .unwrap();

    let status = wait_for_terminal_status(&scheduler, &job_id, Duration::from_secs(5)).await;
    assert_eq!(status, "succeeded");
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_non_fatal() {
    let mut permanent = HashSet::new();
    permanent.insert("page-5.png".to_string());
    let ocr = FlakyOcr::new(HashMap::new(), permanent);
    let scheduler = make_scheduler(ocr);
    let ctx = Ctx::new();

    let pages: Vec<u32> = (1..=10).collect();
    let persisted = Arc::new(StdMutex::new(HashMap::new()));
    let factory = page_job_factory("book-exhaust-nonfatal", pages, persisted.clone(), "mock-ocr", 3, false);
    let job_id = scheduler
        .submit(&ctx, "page_ocr", "book-exhaust-nonfatal", serde_json::json!({}), factory)
        .await
        .unwrap();

    let status = wait_for_terminal_status(&scheduler, &job_id, Duration::from_secs(5)).await;
    assert_eq!(status, "succeeded");
    // The failing page still ends up marked complete (failed-but-continued),
    // alongside the other nine that succeeded cleanly.
    assert_eq!(persisted.lock().unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_fatal() {
    let mut permanent = HashSet::new();
    permanent.insert("page-1.png".to_string());
    let ocr = FlakyOcr::new(HashMap::new(), permanent);
    let scheduler = make_scheduler(ocr);
    let ctx = Ctx::new();

    let persisted = Arc::new(StdMutex::new(HashMap::new()));
    let factory = page_job_factory("book-exhaust-fatal", vec![1], persisted, "mock-ocr", 3, true);
    let job_id = scheduler
        .submit(&ctx, "page_ocr", "book-exhaust-fatal", serde_json::json!({}), factory)
        .await
        .unwrap();

    let status = wait_for_terminal_status(&scheduler, &job_id, Duration::from_secs(5)).await;
    assert_eq!(status, "failed");
    let record = scheduler.get_job_by_book_id("book-exhaust-fatal").unwrap();
    assert!(record.error.is_some());
}

#[tokio::test]
async fn crash_recovery_resumes_only_incomplete_pages() {
    let persisted = Arc::new(StdMutex::new(HashMap::new()));
    let pages: Vec<u32> = (1..=10).collect();
    let ctx = Ctx::new();

    let job1 = PageOcrJob::new("book-crash", pages.clone(), persisted.clone(), "mock-ocr", 3, false);
    job1.set_record_id(JobId::new());
    let first_units = job1.start(&ctx).await.unwrap();
    assert_eq!(first_units.len(), 10);

    // Complete pages 1..=5 all the way through (ocr then blend), simulating
    // a partial run before the process dies.
    for unit in first_units.iter().take(5) {
        let ocr_result = WorkResult::success(
            unit,
            bookqueue_core::unit::WorkOutcome::Ocr(OcrOutcome {
                text: "text".to_string(),
                confidence: 0.9,
                raw_payload: None,
                latency_ms: 1,
            }),
        );
        let blend_units = job1.on_complete(&ctx, ocr_result).await.unwrap();
        assert_eq!(blend_units.len(), 1);
        let blend_result = WorkResult::success(
            &blend_units[0],
            bookqueue_core::unit::WorkOutcome::Cpu(serde_json::json!({})),
        );
        let follow_up = job1.on_complete(&ctx, blend_result).await.unwrap();
        assert!(follow_up.is_empty());
    }
    assert_eq!(persisted.lock().unwrap().len(), 5);

    // "Restart": a fresh job instance, fresh in-memory tracker, same
    // persisted substate.
    let job2 = PageOcrJob::new("book-crash", pages, persisted.clone(), "mock-ocr", 3, false);
    job2.set_record_id(JobId::new());
    assert_eq!(job2.base.tracker.count(), 0);
    let second_units = job2.start(&ctx).await.unwrap();
    assert_eq!(second_units.len(), 5);
    let resumed_pages: HashSet<u32> = second_units
        .iter()
        .map(|u| match &u.payload {
            UnitPayload::Ocr { image_ref } => image_ref
                .trim_start_matches("page-")
                .trim_end_matches(".png")
                .parse()
                .unwrap(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(resumed_pages, (6..=10).collect());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_submit_is_rejected() {
    let ocr = FlakyOcr::new(HashMap::new(), HashSet::new());
    let scheduler = make_scheduler(ocr);
    let ctx = Ctx::new();

    let persisted_a = Arc::new(StdMutex::new(HashMap::new()));
    let factory_a = page_job_factory("book-dup", vec![1], persisted_a, "mock-ocr", 3, false);
    let first = scheduler
        .submit(&ctx, "page_ocr", "book-dup", serde_json::json!({}), factory_a)
        .await
        .unwrap();

    let persisted_b = Arc::new(StdMutex::new(HashMap::new()));
    let factory_b = page_job_factory("book-dup", vec![1], persisted_b, "mock-ocr", 3, false);
    let second = scheduler
        .submit(&ctx, "page_ocr", "book-dup", serde_json::json!({}), factory_b)
        .await;
    assert!(second.is_err());

    let record = scheduler.get_job_by_book_id("book-dup").unwrap();
    assert_eq!(record.id, first);
}
