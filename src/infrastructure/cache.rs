use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::RwLock;

/// 名前付きキャッシュ。値はJSONで保持する
///
/// キーごとに世代番号を持ち、`put`・`evict`・`clear`のたびに進める。
/// 読み込み前に取得した世代と比べることで、古い値の書き戻しを防ぐ
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, Value>,
    generations: HashMap<String, u64>,
    clock: u64,
}

impl Entries {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.generations.insert(key.to_owned(), self.clock);
    }
}

impl Cache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.values.get(key).cloned()
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.entries.write().await;
        entries.touch(&key);
        entries.values.insert(key, value);
    }

    /// キーの現在の世代
    pub async fn generation(&self, key: &str) -> u64 {
        self.entries
            .read()
            .await
            .generations
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// 世代が`generation`から変わっていなければ値を格納する
    pub async fn put_if_unchanged(
        &self,
        key: impl Into<String>,
        value: Value,
        generation: u64,
    ) -> bool {
        let key = key.into();
        let mut entries = self.entries.write().await;
        if entries.generations.get(&key).copied().unwrap_or_default() != generation {
            return false;
        }
        entries.touch(&key);
        entries.values.insert(key, value);
        true
    }

    pub async fn evict(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.touch(key);
        entries.values.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let keys = entries.generations.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            entries.touch(&key);
        }
        entries.values.clear()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.values.is_empty()
    }
}

/// 設定されたキャッシュを名前で管理する
#[derive(Debug, Default)]
pub struct CacheManager {
    caches: BTreeMap<String, Arc<Cache>>,
}

impl CacheManager {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caches = names
            .into_iter()
            .map(|name| {
                let name: String = name.into();
                (name.clone(), Arc::new(Cache::new(name)))
            })
            .collect();
        Self { caches }
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    pub fn get_cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.get(name).cloned()
    }

    pub async fn clear_all(&self) {
        for cache in self.caches.values() {
            cache.clear().await;
        }
    }
}
