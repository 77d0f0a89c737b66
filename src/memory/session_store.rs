//! 会话存储
//!
//! SessionStore 定义 get / append 语义；LruSessionStore 为容量固定的内存实现：
//! 读取或写入某个 key 会将其标记为最近使用，key 数超过容量时淘汰最久未使用的会话（连同全部历史）。
//!
//! 同一 key 上的 Run 通过 `lock` 串行化；不同 key 互不等待。
//! 会话被淘汰时不会通知正在进行的 Run：它持有的是历史快照，下次写入会把该 key 当作新会话重新接纳。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::OwnedMutexGuard;

use crate::memory::Message;

/// 会话存储接口（可由外部持久化实现替换）
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 获取会话历史快照；未知 key 返回空
    async fn get(&self, key: &str) -> Vec<Message>;

    /// 追加一条消息
    async fn append(&self, key: &str, message: Message);

    /// 原子追加一整轮（user + assistant），不会与同一 key 上的其他写入交错
    async fn append_turn(&self, key: &str, messages: Vec<Message>);

    /// 获取该 key 的轮次锁；持有期间同一 key 的其他 Run 等待
    async fn lock(&self, key: &str) -> SessionLock;

    /// 当前会话数
    async fn len(&self) -> usize;

    async fn contains(&self, key: &str) -> bool;
}

/// 单个 key 的轮次锁，drop 时释放
pub struct SessionLock {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// 按 key 分配的异步互斥锁；锁对象无人持有时自动回收
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> SessionLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(m) => m,
                None => {
                    let m = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&m));
                    m
                }
            }
        };
        SessionLock {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }
}

/// 容量固定的 LRU 内存会话存储。IndexMap 的顺序即使用顺序：末尾为最近使用，头部为最久未使用。
pub struct LruSessionStore {
    sessions: Mutex<IndexMap<String, Vec<Message>>>,
    capacity: usize,
    locks: KeyedLocks,
}

impl LruSessionStore {
    /// capacity 为 0 时按 1 处理
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
            locks: KeyedLocks::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 按最久未使用到最近使用的顺序返回当前 key
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    fn sessions(&self) -> MutexGuard<'_, IndexMap<String, Vec<Message>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 将 key 移到末尾（最近使用）；不存在时先淘汰再接纳
    fn touch_or_admit<'a>(
        &self,
        sessions: &'a mut IndexMap<String, Vec<Message>>,
        key: &str,
    ) -> &'a mut Vec<Message> {
        let history = match sessions.shift_remove(key) {
            Some(h) => h,
            None => {
                while sessions.len() >= self.capacity {
                    if let Some((evicted, history)) = sessions.shift_remove_index(0) {
                        tracing::debug!(
                            session = %evicted,
                            messages = history.len(),
                            "evicted least recently used session"
                        );
                    }
                }
                Vec::new()
            }
        };
        let (idx, _) = sessions.insert_full(key.to_string(), history);
        &mut sessions[idx]
    }
}

#[async_trait]
impl SessionStore for LruSessionStore {
    async fn get(&self, key: &str) -> Vec<Message> {
        let mut sessions = self.sessions();
        match sessions.shift_remove(key) {
            Some(history) => {
                let snapshot = history.clone();
                sessions.insert(key.to_string(), history);
                snapshot
            }
            None => Vec::new(),
        }
    }

    async fn append(&self, key: &str, message: Message) {
        let mut sessions = self.sessions();
        self.touch_or_admit(&mut sessions, key).push(message);
    }

    async fn append_turn(&self, key: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions();
        self.touch_or_admit(&mut sessions, key).extend(messages);
    }

    async fn lock(&self, key: &str) -> SessionLock {
        self.locks.lock(key).await
    }

    async fn len(&self) -> usize {
        self.sessions().len()
    }

    async fn contains(&self, key: &str) -> bool {
        self.sessions().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_capacity_two_evicts_first_key() {
        let store = LruSessionStore::new(2);
        store.append("a", Message::user("hi a")).await;
        store.append("b", Message::user("hi b")).await;
        store.append("c", Message::user("hi c")).await;

        assert!(store.get("a").await.is_empty());
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("c").await[0].content, "hi c");
    }

    #[tokio::test]
    async fn test_n_plus_one_keys_evicts_least_recent() {
        for capacity in 1..=6 {
            let store = LruSessionStore::new(capacity);
            for i in 0..capacity {
                store.append(&format!("k{i}"), Message::user("x")).await;
            }
            // 访问 k0，使 k1（若存在）成为最久未使用
            let _ = store.get("k0").await;
            store.append("new", Message::user("x")).await;

            assert_eq!(store.len().await, capacity);
            let expected_evicted = if capacity == 1 { "k0" } else { "k1" };
            assert!(!store.contains(expected_evicted).await, "capacity {capacity}");
            assert!(store.contains("new").await);
        }
    }

    #[tokio::test]
    async fn test_get_unknown_key_does_not_admit() {
        let store = LruSessionStore::new(1);
        store.append("a", Message::user("x")).await;
        assert!(store.get("missing").await.is_empty());
        assert!(store.contains("a").await);
        assert_eq!(store.keys_by_recency(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_append_turn_keeps_order() {
        let store = LruSessionStore::new(4);
        store
            .append_turn("s", vec![Message::user("q1"), Message::assistant("a1")])
            .await;
        store
            .append_turn("s", vec![Message::user("q2"), Message::assistant("a2")])
            .await;
        let contents: Vec<String> = store.get("s").await.into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_write_after_eviction_readmits_as_new() {
        let store = LruSessionStore::new(1);
        store.append("a", Message::user("old")).await;
        let stale = store.get("a").await;
        store.append("b", Message::user("other")).await;
        store.append("a", Message::assistant("late")).await;

        assert_eq!(stale.len(), 1);
        let history = store.get("a").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "late");
        assert!(!store.contains("b").await);
    }

    #[tokio::test]
    async fn test_same_key_lock_serializes_distinct_keys_do_not_wait() {
        let store = Arc::new(LruSessionStore::new(4));
        let held = store.lock("a").await;

        // 不同 key 立即获取
        let other = tokio::time::timeout(Duration::from_millis(50), store.lock("b")).await;
        assert!(other.is_ok());

        // 同一 key 需等待
        let same = tokio::time::timeout(Duration::from_millis(50), store.lock("a")).await;
        assert!(same.is_err());

        drop(held);
        let same = tokio::time::timeout(Duration::from_millis(50), store.lock("a")).await;
        assert_eq!(same.map(|l| l.key().to_string()).ok().as_deref(), Some("a"));
    }
}
