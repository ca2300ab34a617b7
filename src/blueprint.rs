use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::event::EventData;
use crate::signal::{next_id, Handler, HandlerTable, TriggerType};

/// 可解析的 handler 目标：To/Batch/Chunk 接受的几种写法
pub enum ChunkTarget {
    /// chunk 目录里的名字
    Name(String),
    Chunk(Chunk),
    Handler(Handler),
    Named { name: String, handler: Handler },
}

impl ChunkTarget {
    pub fn named(name: impl Into<String>, handler: Handler) -> Self {
        ChunkTarget::Named {
            name: name.into(),
            handler,
        }
    }
}

impl From<&str> for ChunkTarget {
    fn from(name: &str) -> Self {
        ChunkTarget::Name(name.to_string())
    }
}

impl From<String> for ChunkTarget {
    fn from(name: String) -> Self {
        ChunkTarget::Name(name)
    }
}

impl From<Chunk> for ChunkTarget {
    fn from(chunk: Chunk) -> Self {
        ChunkTarget::Chunk(chunk)
    }
}

impl From<&Chunk> for ChunkTarget {
    fn from(chunk: &Chunk) -> Self {
        ChunkTarget::Chunk(chunk.clone())
    }
}

impl From<Handler> for ChunkTarget {
    fn from(handler: Handler) -> Self {
        ChunkTarget::Handler(handler)
    }
}

/// 具名 handler 包装：调用成功后以派生事件键重新发射结果，
/// 是构建算子之间串联的基本单元。不引入新的 layer mark。
#[derive(Clone)]
pub struct Chunk {
    id: String,
    name: String,
    trigger: String,
    handler: Handler,
}

impl Chunk {
    pub fn new(handler: Option<Handler>, name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = next_id("chunk");
        }
        // 无 handler 时为回显直通
        let handler = handler.unwrap_or_else(|| Handler::from_sync(|data| Ok(data.value.clone())));
        let id = next_id("chunk");
        let trigger = format!("Chunk[{name}]-{id}");
        Self {
            id,
            name,
            trigger,
            handler,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 派生事件键，进程生命周期内全局唯一
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub async fn call(&self, data: EventData) -> Result<Value> {
        let result = self.handler.call(data.clone()).await?;
        data.emit_with_marks(
            &self.trigger,
            result.clone(),
            data.layer_marks(),
            TriggerType::Event,
        )
        .await?;
        Ok(result)
    }

    /// 把 chunk 包装成可注册的 handler
    pub fn as_handler(&self) -> Handler {
        let chunk = self.clone();
        Handler::from_fn(move |data| {
            let chunk = chunk.clone();
            async move { chunk.call(data).await }
        })
    }
}

/// Collect 汇合表：按 flow（blueprint）持有，避免进程级单例
/// 让两个独立 flow 在同名 collection 上互相干扰。
#[derive(Default)]
pub struct CollectRegistry {
    collections: Mutex<HashMap<String, HashMap<String, Option<Value>>>>,
}

impl CollectRegistry {
    /// 建图时登记分支槽位（未填充哨兵为 None）
    pub fn register(&self, collection: &str, branch: &str) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .entry(branch.to_string())
            .or_insert(None);
    }

    /// 写入分支值；当该 collection 所有槽位都已填充时返回合并 map
    pub fn fill(&self, collection: &str, branch: &str, value: Value) -> Option<Map<String, Value>> {
        let mut collections = self.collections.lock();
        let slots = collections.entry(collection.to_string()).or_default();
        slots.insert(branch.to_string(), Some(value));
        if slots.values().any(|slot| slot.is_none()) {
            return None;
        }
        let mut merged = Map::new();
        for (name, slot) in slots.iter() {
            if let Some(value) = slot {
                merged.insert(name.clone(), value.clone());
            }
        }
        Some(merged)
    }

    /// 把整个 collection 重置为未填充（filled_then_empty 模式）
    pub fn reset(&self, collection: &str) {
        if let Some(slots) = self.collections.lock().get_mut(collection) {
            for slot in slots.values_mut() {
                *slot = None;
            }
        }
    }
}

struct BluePrintInner {
    name: String,
    handlers: RwLock<HandlerTable>,
    chunks: RwLock<HashMap<String, Chunk>>,
    collections: Arc<CollectRegistry>,
}

/// flow 接线模板：handler 注册表 + chunk 目录。
/// 构建期可变；快照后的执行不受后续编辑影响。
#[derive(Clone)]
pub struct BluePrint {
    inner: Arc<BluePrintInner>,
}

impl BluePrint {
    pub fn new(name: &str) -> Self {
        let name = if name.is_empty() {
            next_id("blueprint")
        } else {
            name.to_string()
        };
        Self {
            inner: Arc::new(BluePrintInner {
                name,
                handlers: RwLock::new(HandlerTable::new()),
                chunks: RwLock::new(HashMap::new()),
                collections: Arc::new(CollectRegistry::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_handler(
        &self,
        trigger_type: TriggerType,
        key: &str,
        handler: Handler,
        id: Option<String>,
    ) -> String {
        self.inner
            .handlers
            .write()
            .insert(trigger_type, key, handler, id)
    }

    pub fn add_event_handler(&self, key: &str, handler: Handler, id: Option<String>) -> String {
        self.add_handler(TriggerType::Event, key, handler, id)
    }

    pub fn add_flow_data_handler(&self, key: &str, handler: Handler, id: Option<String>) -> String {
        self.add_handler(TriggerType::FlowData, key, handler, id)
    }

    pub fn add_runtime_data_handler(
        &self,
        key: &str,
        handler: Handler,
        id: Option<String>,
    ) -> String {
        self.add_handler(TriggerType::RuntimeData, key, handler, id)
    }

    /// 按注册 ID 移除；不存在时静默
    pub fn remove_handler_by_id(&self, trigger_type: TriggerType, key: &str, id: &str) {
        self.inner.handlers.write().remove_by_id(trigger_type, key, id);
    }

    /// 按 handler 实例移除（Arc 指针判等）；不存在时静默
    pub fn remove_handler(&self, trigger_type: TriggerType, key: &str, handler: &Handler) {
        self.inner
            .handlers
            .write()
            .remove_by_handler(trigger_type, key, handler);
    }

    pub fn remove_all(&self, trigger_type: TriggerType, key: &str) {
        self.inner.handlers.write().remove_all(trigger_type, key);
    }

    /// 创建并登记 chunk；给名字不给 handler 时登记一个回显直通 chunk
    pub fn chunk(&self, target: impl Into<ChunkTarget>) -> Chunk {
        let chunk = match target.into() {
            ChunkTarget::Name(name) => Chunk::new(None, name),
            ChunkTarget::Chunk(chunk) => chunk,
            ChunkTarget::Handler(handler) => Chunk::new(Some(handler), next_id("chunk_handler")),
            ChunkTarget::Named { name, handler } => Chunk::new(Some(handler), name),
        };
        self.inner
            .chunks
            .write()
            .insert(chunk.name().to_string(), chunk.clone());
        chunk
    }

    pub fn find_chunk(&self, name: &str) -> Option<Chunk> {
        self.inner.chunks.read().get(name).cloned()
    }

    /// 深拷贝外层表结构，handler 以 Arc 共享——并发中的执行
    /// 对后续蓝图编辑免疫
    pub fn snapshot_handlers(&self) -> HandlerTable {
        self.inner.handlers.read().snapshot()
    }

    /// 独立副本：共享 handler 快照、chunk 目录与 collect 汇合表
    pub fn copy(&self, name: &str) -> BluePrint {
        let name = if name.is_empty() {
            format!("{}-copy", self.inner.name)
        } else {
            name.to_string()
        };
        Self {
            inner: Arc::new(BluePrintInner {
                name,
                handlers: RwLock::new(self.snapshot_handlers()),
                chunks: RwLock::new(self.inner.chunks.read().clone()),
                collections: Arc::clone(&self.inner.collections),
            }),
        }
    }

    pub fn collections(&self) -> Arc<CollectRegistry> {
        Arc::clone(&self.inner.collections)
    }
}
