use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::EventData;

/// 信号类型：决定 handler 查表与数据变更广播的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Event,
    FlowData,
    RuntimeData,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Event => "event",
            TriggerType::FlowData => "flow_data",
            TriggerType::RuntimeData => "runtime_data",
        }
    }
}

/// 启动信号：`Execution::start` 发出的事件键
pub const START_SIGNAL: &str = "START";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 进程生命周期内单调递增、不会碰撞的 ID
pub fn next_id(prefix: &str) -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let prefix = if prefix.is_empty() { "id" } else { prefix };
    format!("{prefix}-{id}")
}

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// 信号 handler：`EventData -> Result<Value>` 的异步函数
#[derive(Clone)]
pub struct Handler {
    func: Arc<dyn Fn(EventData) -> HandlerFuture + Send + Sync>,
}

impl Handler {
    pub fn from_fn<F, Fut>(func: F) -> Self
    where
        F: Fn(EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |data| Box::pin(func(data))),
        }
    }

    pub fn from_sync<F>(func: F) -> Self
    where
        F: Fn(&mut EventData) -> Result<Value> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::from_fn(move |mut data| {
            let func = Arc::clone(&func);
            async move { func(&mut data) }
        })
    }

    pub async fn call(&self, data: EventData) -> Result<Value> {
        (self.func)(data).await
    }

    /// 同一 handler 实例判定（用于按实例移除注册）
    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

/// 判定条件：match case 使用的谓词
pub type Condition = Arc<dyn Fn(&EventData) -> bool + Send + Sync>;

/// 信号键 -> handler ID -> handler
pub type HandlerMap = HashMap<String, HashMap<String, Handler>>;

/// 三类信号各一张 handler 表
#[derive(Clone, Debug)]
pub struct HandlerTable {
    tables: HashMap<TriggerType, HandlerMap>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        let mut tables = HashMap::new();
        tables.insert(TriggerType::Event, HandlerMap::new());
        tables.insert(TriggerType::FlowData, HandlerMap::new());
        tables.insert(TriggerType::RuntimeData, HandlerMap::new());
        Self { tables }
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 handler，返回注册 ID；重复注册同一 handler 产生两次独立调用
    pub fn insert(
        &mut self,
        trigger_type: TriggerType,
        key: &str,
        handler: Handler,
        id: Option<String>,
    ) -> String {
        let id = id.unwrap_or_else(|| next_id("handler"));
        self.tables
            .entry(trigger_type)
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(id.clone(), handler);
        id
    }

    pub fn get(&self, trigger_type: TriggerType, key: &str) -> Option<&HashMap<String, Handler>> {
        self.tables.get(&trigger_type).and_then(|map| map.get(key))
    }

    pub fn contains(&self, trigger_type: TriggerType, key: &str) -> bool {
        self.get(trigger_type, key)
            .map(|handlers| !handlers.is_empty())
            .unwrap_or(false)
    }

    pub fn remove_by_id(&mut self, trigger_type: TriggerType, key: &str, id: &str) {
        if let Some(handlers) = self
            .tables
            .get_mut(&trigger_type)
            .and_then(|map| map.get_mut(key))
        {
            handlers.remove(id);
        }
    }

    pub fn remove_by_handler(&mut self, trigger_type: TriggerType, key: &str, handler: &Handler) {
        if let Some(handlers) = self
            .tables
            .get_mut(&trigger_type)
            .and_then(|map| map.get_mut(key))
        {
            let found = handlers
                .iter()
                .find(|(_, item)| item.ptr_eq(handler))
                .map(|(id, _)| id.clone());
            if let Some(id) = found {
                handlers.remove(&id);
            }
        }
    }

    pub fn remove_all(&mut self, trigger_type: TriggerType, key: &str) {
        if let Some(map) = self.tables.get_mut(&trigger_type) {
            map.insert(key.to_string(), HashMap::new());
        }
    }

    /// 深拷贝外层各级 map；handler 本体以 Arc 共享
    pub fn snapshot(&self) -> HandlerTable {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_is_monotonic_and_unique() {
        let first = next_id("t");
        let second = next_id("t");
        assert_ne!(first, second);
        assert!(first.starts_with("t-"));
        // 空前缀退化为 "id"
        assert!(next_id("").starts_with("id-"));
    }

    #[test]
    fn handler_table_snapshot_is_independent() {
        let mut table = HandlerTable::new();
        let handler = Handler::from_sync(|data| Ok(data.value.clone()));
        table.insert(TriggerType::Event, "a", handler.clone(), None);

        let snapshot = table.snapshot();
        table.insert(TriggerType::Event, "a", handler.clone(), None);
        table.insert(TriggerType::Event, "b", handler, None);

        assert_eq!(snapshot.get(TriggerType::Event, "a").map(|h| h.len()), Some(1));
        assert!(snapshot.get(TriggerType::Event, "b").is_none());
        assert_eq!(table.get(TriggerType::Event, "a").map(|h| h.len()), Some(2));
    }

    #[test]
    fn remove_by_handler_uses_instance_identity() {
        let mut table = HandlerTable::new();
        let keep = Handler::from_sync(|data| Ok(data.value.clone()));
        let drop = Handler::from_sync(|data| Ok(data.value.clone()));
        table.insert(TriggerType::Event, "a", keep.clone(), None);
        table.insert(TriggerType::Event, "a", drop.clone(), None);

        table.remove_by_handler(TriggerType::Event, "a", &drop);
        let remaining = table.get(TriggerType::Event, "a").unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.values().next().unwrap().ptr_eq(&keep));
    }
}
