//! 进程内命名锁表
//!
//! 状态机要求转换期间独占venue锁; 标识符分配要求(命名空间,类型)
//! 短时独占锁。锁按键惰性创建, 全部写入方经由同一锁表。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 按键异步锁表
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    inner: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// 获取指定键的独占锁, 持有guard期间同键操作串行
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().expect("lock table poisoned");
            map.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// venue独占锁表
pub type VenueLocks = KeyedLocks<uuid::Uuid>;
