//! Server pool behavior against a real child process: single-flight
//! initialization, reference counting, and respawn after teardown.

mod common;

use lsmcp::config::language_by_id;
use test_utils::TestProject;

const APP: &str = "export function greet(n: string) {\n  return 'h' + n;\n}\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_spawn_one_process() {
    let project = TestProject::new(&[("a.ts", APP)]).unwrap();
    let broker = common::stub_broker();
    let pool = broker.pool().clone();
    let lang = language_by_id("typescript").unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        let root = project.root().to_path_buf();
        handles.push(tokio::spawn(
            async move { pool.acquire(&root, lang).await },
        ));
    }

    let mut entries = Vec::new();
    for handle in handles {
        entries.push(handle.await.unwrap().expect("acquire failed"));
    }

    assert_eq!(pool.spawn_count(), 1, "single-flight must spawn exactly once");
    assert_eq!(pool.size(), 1);
    for entry in &entries[1..] {
        assert!(std::sync::Arc::ptr_eq(&entries[0], entry));
    }
    assert_eq!(entries[0].ref_count(), 10);

    for entry in &entries {
        pool.release(entry).await;
    }
    assert_eq!(pool.size(), 0, "pool returns to its prior size");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_tears_down_and_reacquire_respawns() {
    let project = TestProject::new(&[("a.ts", APP)]).unwrap();
    let broker = common::stub_broker();
    let pool = broker.pool().clone();
    let lang = language_by_id("typescript").unwrap();

    let entry = pool.acquire(project.root(), lang).await.unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.spawn_count(), 1);
    pool.release(&entry).await;
    assert_eq!(pool.size(), 0);

    let entry = pool.acquire(project.root(), lang).await.unwrap();
    assert_eq!(pool.spawn_count(), 2, "cold acquire after teardown respawns");
    pool.release(&entry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_root_different_language_gets_its_own_entry() {
    let project = TestProject::new(&[("a.ts", APP), ("lib.rs", "fn main() {}\n")]).unwrap();
    let broker = common::stub_broker();
    let pool = broker.pool().clone();

    let ts = pool
        .acquire(project.root(), language_by_id("typescript").unwrap())
        .await
        .unwrap();
    let rust = pool
        .acquire(project.root(), language_by_id("rust").unwrap())
        .await
        .unwrap();

    assert_eq!(pool.size(), 2);
    assert_eq!(pool.spawn_count(), 2);
    pool.release(&ts).await;
    pool.release(&rust).await;
    assert_eq!(pool.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_spawn_surfaces_and_leaves_pool_empty() {
    let project = TestProject::new(&[("a.ts", APP)]).unwrap();
    let broker = common::broken_broker();
    let pool = broker.pool().clone();
    let lang = language_by_id("typescript").unwrap();

    let result = pool.acquire(project.root(), lang).await;
    assert!(result.is_err());
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.spawn_count(), 0);
}
