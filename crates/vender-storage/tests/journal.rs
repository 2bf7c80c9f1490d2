use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use vender_storage::{Persist, Queue};

#[tokio::test]
async fn test_queue_consumer_drains_in_order() {
    let dir = TempDir::new().unwrap();
    let q = Arc::new(Queue::open(dir.path().join("q")).unwrap());
    for i in 0u8..5 {
        q.push(&[i]).unwrap();
    }
    let consumer = tokio::spawn({
        let q = q.clone();
        async move {
            let mut seen = Vec::new();
            while seen.len() < 5 {
                let e = q.peek().await.unwrap();
                q.delete(e.id).unwrap();
                seen.push(e.data[0]);
            }
            seen
        }
    });
    assert_eq!(consumer.await.unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(q.is_empty());
}

#[test]
fn test_persist_survives_truncated_main() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_str().unwrap();
    let p = Persist::new(root, "money", true).unwrap();
    p.store(b"credit=150").unwrap();
    let main = dir.path().join("money").join("state");
    std::fs::write(&main, b"cred").unwrap();
    assert_eq!(p.load().unwrap().as_deref(), Some(&b"credit=150"[..]));
}

proptest! {
    #[test]
    fn prop_replay_matches_live_set(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q");
        let mut expect = std::collections::VecDeque::new();
        {
            let q = Queue::open(&path).unwrap();
            for (i, push) in ops.iter().enumerate() {
                if *push || expect.is_empty() {
                    let id = q.push(&(i as u32).to_be_bytes()).unwrap();
                    expect.push_back(id);
                } else if let Some(id) = expect.pop_front() {
                    q.delete(id).unwrap();
                }
            }
        }
        let q = Queue::open(&path).unwrap();
        prop_assert_eq!(q.len(), expect.len());
        if let Some(first) = expect.front() {
            prop_assert_eq!(q.try_peek().unwrap().unwrap().id, *first);
        }
    }
}
