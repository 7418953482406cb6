//! Integration tests for the execution kernel.

use ralphy::adapters::planner::Planner;
use ralphy::adapters::MockEngine;
use ralphy::core::command::validate_arg;
use ralphy::core::error::CoreError;
use ralphy::core::locks::LockManager;
use ralphy::core::retry::{with_retry, CircuitBreaker, CircuitState, RetryOptions};
use ralphy::core::task::Task;
use ralphy::queue::file::FileQueue;
use ralphy::queue::memory::MemoryQueue;
use ralphy::queue::{Priority, QueueItem, TaskQueue};
use ralphy::source::{markdown, SourceType, TaskSource};
use ralphy::storage::hash_store::HashStore;
use ralphy::storage::planning_cache::PlanningCache;
use ralphy::storage::state::{TaskState, TaskStateManager};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// S1: CSV parse and write are inverse on a hand-written file.
#[test]
fn csv_round_trip_is_byte_identical() {
    let input = "id,title,done,group,desc\n1,Add login,0,1,\"Use OAuth\"\n2,\"Fix, bug\",1,0,\n";
    let tasks = ralphy::source::parse(SourceType::Csv, input).unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].title, "Add login");
    assert_eq!(tasks[1].title, "Fix, bug");
    assert!(tasks[1].completed);

    let written = ralphy::source::write(SourceType::Csv, &tasks).unwrap();
    assert_eq!(written, input);
}

// S2: markdown checkbox progression.
#[test]
fn markdown_progression() {
    let content = "- [ ] A\n- [ ] B";
    let updated = markdown::mark_complete(content, "1").unwrap();

    assert_eq!(updated, "- [x] A\n- [ ] B");
    assert_eq!(markdown::count_remaining(&updated), 1);
    assert_eq!(markdown::count_completed(&updated), 1);
}

// S3: batch acquisition rolls back, leaving no stray locks.
#[test]
fn lock_contention_rolls_back_batch() {
    let dir = tempfile::tempdir().unwrap();
    let x = LockManager::with_owner("x-1");
    let y = LockManager::with_owner("y-2");

    let ab = vec![PathBuf::from("a"), PathBuf::from("b")];
    let bc = vec![PathBuf::from("b"), PathBuf::from("c")];

    assert!(x.acquire_many(&ab, dir.path()).unwrap());
    assert!(!y.acquire_many(&bc, dir.path()).unwrap());

    // y must not be left holding c.
    assert!(!y.holds(Path::new("c"), dir.path()));
    // x's locks are intact, so another batch against them still fails.
    assert!(!y.acquire_many(&ab, dir.path()).unwrap());

    x.release_many(&ab, dir.path()).unwrap();
    assert!(y.acquire_many(&bc, dir.path()).unwrap());
}

// S4: priority beats FIFO; FIFO breaks priority ties.
#[test]
fn priority_and_fifo_ordering() {
    for (label, queue) in backends() {
        queue
            .enqueue(item("T1", Priority::Normal, 100))
            .unwrap();
        queue.enqueue(item("T2", Priority::High, 101)).unwrap();
        queue.enqueue(item("T3", Priority::High, 102)).unwrap();
        queue
            .enqueue(item("T4", Priority::Critical, 103))
            .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue().unwrap())
            .map(|i| i.task_id().to_string())
            .collect();
        assert_eq!(order, vec!["T4", "T2", "T3", "T1"], "backend {label}");
        queue.close().unwrap();
    }
}

fn backends() -> Vec<(&'static str, Box<dyn TaskQueue>)> {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("queue.json");
    // Leak the tempdir so the file backend outlives this helper.
    std::mem::forget(dir);
    vec![
        ("memory", Box::new(MemoryQueue::new()) as Box<dyn TaskQueue>),
        ("file", Box::new(FileQueue::open(file_path).unwrap())),
    ]
}

fn item(id: &str, priority: Priority, at: i64) -> QueueItem {
    QueueItem::new(Task::new(id, format!("task {id}")), priority).with_enqueued_at(at)
}

// S5: three connection failures open the circuit; the blocked call never
// invokes the function; one trial is admitted after the cooldown and a
// success closes the circuit.
#[test]
fn circuit_breaker_full_cycle() {
    let breaker = CircuitBreaker::new().with_reset_timeout(Duration::from_millis(50));
    let opts = RetryOptions {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };

    for _ in 0..3 {
        let _ = with_retry(&breaker, &opts, |_| {
            Err::<(), _>(CoreError::network("read ECONNRESET"))
        });
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let calls = AtomicU32::new(0);
    let blocked = with_retry(&breaker, &opts, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CoreError>(())
    });
    let err = blocked.unwrap_err();
    assert!(err.message.contains("OPEN"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    std::thread::sleep(Duration::from_millis(70));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let trial = with_retry(&breaker, &opts, |_| Ok::<_, CoreError>("recovered"));
    assert_eq!(trial.unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

// S6: tool_use output forces re-plans; after three identical failures
// the planner reports a planning failure with no files.
#[test]
fn planner_gives_up_after_three_tool_use_responses() {
    let tool_use = r#"{"type":"tool_use","name":"bash","input":{"command":"ls"}}"#;
    let engine = MockEngine::new()
        .with_response(tool_use)
        .with_response(tool_use)
        .with_response(tool_use);

    let planner = Planner::new(&engine);
    let result = planner
        .plan(&Task::new("1", "Refactor"), Path::new("/tmp"), None)
        .unwrap();

    assert_eq!(engine.calls(), 3);
    assert!(result.files.is_empty());
    let error = result.error.unwrap();
    assert!(error.contains("Planning failed"));
    assert!(error.contains("tool"));
}

// Invariant 8: a process killed mid-task leaves a running entry; the
// next initialization downgrades it to pending with a zeroed count.
#[test]
fn state_manager_crash_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![Task::new("1", "interrupted")];

    {
        let manager = TaskStateManager::new(dir.path(), SourceType::Yaml, "tasks.yaml");
        manager.initialize(&tasks).unwrap();
        assert!(manager.claim_task_for_execution("1").unwrap());
        // Process dies here; nothing transitions the entry.
    }

    let manager = TaskStateManager::new(dir.path(), SourceType::Yaml, "tasks.yaml");
    manager.initialize(&tasks).unwrap();

    let entry = manager.get("1").unwrap();
    assert_eq!(entry.state, TaskState::Pending);
    assert_eq!(entry.attempt_count, 0);
}

// Invariants 5 and 6: hash-store round trip and content addressing.
#[test]
fn hash_store_round_trip_and_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"the quick brown fox".repeat(100);
    std::fs::write(dir.path().join("one.txt"), &payload).unwrap();
    std::fs::write(dir.path().join("two.txt"), &payload).unwrap();

    let store = HashStore::open(dir.path(), "task-9").unwrap();
    let added = store.add_file(Path::new("one.txt")).unwrap();
    store.add_file(Path::new("two.txt")).unwrap();

    assert_eq!(added.hash, sha256_hex(&payload));

    let (content, metadata) = store.get(Path::new("one.txt")).unwrap();
    assert_eq!(content, payload);
    assert_eq!(metadata.hash, sha256_hex(&payload));

    // One blob on disk for two logical files.
    let blobs = std::fs::read_dir(dir.path().join(".ralphy-hashes/task-9/content"))
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) != Some("json"))
        .count();
    assert_eq!(blobs, 1);
}

// Invariant 9: fingerprint changes invalidate cached plans.
#[test]
fn planning_cache_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), "{\"name\":\"app\"}").unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();

    let cache = PlanningCache::open(dir.path()).unwrap();
    cache
        .put("7", "Add endpoint", vec!["src/api.ts".into()])
        .unwrap();
    assert!(cache.get("7", "Add endpoint").unwrap().is_some());

    std::fs::write(dir.path().join("package.json"), "{\"name\":\"renamed\"}").unwrap();
    cache.invalidate_fingerprint();
    assert!(cache.get("7", "Add endpoint").unwrap().is_none());
}

// Invariant 12: the command validator rejects shell metacharacters.
#[test]
fn command_validator_rejections() {
    for bad in [";", "&", "|", "`", "$(", "${", "&&", "||"] {
        let arg = format!("payload{bad}rest");
        assert!(validate_arg(&arg).is_err(), "{arg:?} should be rejected");
    }
    assert!(validate_arg("src/main.rs").is_ok());
}

// Queue and state stay consistent across a file-backed restart.
#[test]
fn file_queue_restart_restores_running_as_pending() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");

    {
        let queue = FileQueue::open(&path).unwrap();
        queue.enqueue(item("a", Priority::Normal, 1)).unwrap();
        queue.enqueue(item("b", Priority::Low, 2)).unwrap();
        queue.dequeue().unwrap(); // a → running
        queue.close().unwrap();
    }

    let queue = FileQueue::open(&path).unwrap();
    let stats = queue.stats().unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.running, 0);
    // The restored item dequeues first again.
    assert_eq!(queue.dequeue().unwrap().unwrap().task_id(), "a");
    queue.close().unwrap();
}

// Source formats round-trip through their writers (invariant 10).
#[test]
fn source_round_trips() {
    let tasks = vec![
        Task::new("1", "Alpha").with_body("details"),
        Task::new("2", "Beta").completed(true).with_parallel_group(2),
    ];

    for source_type in [SourceType::Yaml, SourceType::Json] {
        let written = ralphy::source::write(source_type, &tasks).unwrap();
        let parsed = ralphy::source::parse(source_type, &written).unwrap();
        assert_eq!(parsed, tasks, "format {source_type}");
    }

    // Markdown represents title and completion only.
    let md_tasks = vec![
        Task::new("1", "Alpha"),
        Task::new("2", "Beta").completed(true),
    ];
    let written = ralphy::source::write(SourceType::Markdown, &md_tasks).unwrap();
    let parsed = ralphy::source::parse(SourceType::Markdown, &written).unwrap();
    assert_eq!(parsed, md_tasks);
}

fn run_ralphy(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_ralphy"))
        .args(args)
        .output()
        .expect("run ralphy");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

#[test]
fn cli_version_and_gc_smoke() {
    let (code, out, err) = run_ralphy(&["version"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("ralphy"));

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_string_lossy().to_string();
    let (code, out, err) = run_ralphy(&["gc", "--dir", &dir, "-f", "json"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("removedCaches"));
}

#[test]
fn cli_status_reads_state_file() {
    let tmp = tempfile::tempdir().unwrap();
    let source_path = tmp.path().join("tasks.json");
    std::fs::write(
        &source_path,
        r#"{"tasks":[{"id":"1","title":"Visible task"}]}"#,
    )
    .unwrap();

    let source = TaskSource::open(&source_path).unwrap();
    let manager = TaskStateManager::new(
        tmp.path(),
        source.source_type(),
        source.path().to_string_lossy(),
    );
    manager.initialize(&source.load().unwrap()).unwrap();

    let dir = tmp.path().to_string_lossy().to_string();
    let source_arg = source_path.to_string_lossy().to_string();
    let (code, out, err) = run_ralphy(&["status", &source_arg, "--dir", &dir, "-f", "json"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("Visible task"));
    assert!(out.contains("pending"));
}
