use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::blueprint::{BluePrint, Chunk, ChunkTarget};
use crate::data::{DataOp, DataStore};
use crate::error::Result;
use crate::execution::{Execution, StartOptions};
use crate::process::{
    BatchOptions, BlockData, CaseCondition, CollectMode, MatchMode, Process, ToOptions,
    TriggerSpec, WhenMode,
};
use crate::signal::{next_id, TriggerType, START_SIGNAL};

/// 创建执行时的覆盖项；None 沿用 flow 级默认
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub skip_exceptions: Option<bool>,
    pub concurrency: Option<usize>,
}

impl ExecutionOptions {
    pub fn skip_exceptions(mut self, skip: bool) -> Self {
        self.skip_exceptions = Some(skip);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }
}

pub(crate) struct FlowInner {
    name: String,
    blueprint: BluePrint,
    settings: Arc<DataStore>,
    flow_data: Arc<DataStore>,
    skip_exceptions: bool,
    executions: RwLock<HashMap<String, Execution>>,
}

/// 变更 flow 数据并广播给所有在册执行；caller 自身被排除，
/// 避免写入方收到自己的回声。只投递给真正订阅了该键的执行。
pub(crate) async fn change_flow_data(
    flow: &FlowInner,
    caller: Option<&str>,
    op: DataOp,
    key: &str,
    value: Option<Value>,
    emit: bool,
) -> Result<()> {
    match op {
        DataOp::Set => flow.flow_data.set(key, value.unwrap_or(Value::Null)),
        DataOp::Append => flow.flow_data.append(key, value.unwrap_or(Value::Null)),
        DataOp::Delete => flow.flow_data.delete(key),
    }
    if !emit {
        return Ok(());
    }
    let current = flow.flow_data.get(key).unwrap_or(Value::Null);
    // 先快照再逐个投递，广播期间的增删执行互不阻塞
    let targets: Vec<Execution> = flow
        .executions
        .read()
        .values()
        .filter(|execution| caller != Some(execution.id()))
        .filter(|execution| execution.has_handler(TriggerType::FlowData, key))
        .cloned()
        .collect();
    for execution in targets {
        execution
            .emit_with_marks(key, current.clone(), Vec::new(), TriggerType::FlowData)
            .await?;
    }
    Ok(())
}

/// 信号驱动的执行引擎入口：持有蓝图、flow 级共享数据与
/// 在册执行表。克隆共享同一实例。
#[derive(Clone)]
pub struct TriggerFlow {
    inner: Arc<FlowInner>,
}

impl TriggerFlow {
    pub fn new(blueprint: Option<BluePrint>, name: &str, skip_exceptions: bool) -> Self {
        let name = if name.is_empty() {
            next_id("flow")
        } else {
            name.to_string()
        };
        let blueprint = blueprint.unwrap_or_else(|| BluePrint::new(&format!("{name}-blueprint")));
        Self {
            inner: Arc::new(FlowInner {
                name,
                blueprint,
                settings: Arc::new(DataStore::new("flow-settings")),
                flow_data: Arc::new(DataStore::new("flow-data")),
                skip_exceptions,
                executions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn blueprint(&self) -> &BluePrint {
        &self.inner.blueprint
    }

    /// 蓝图的独立副本，可在其它 flow 上复用接线
    pub fn save_blueprint(&self, name: &str) -> BluePrint {
        self.inner.blueprint.copy(name)
    }

    pub fn settings(&self) -> Arc<DataStore> {
        Arc::clone(&self.inner.settings)
    }

    pub fn set_settings(&self, key: &str, value: Value) -> &Self {
        self.inner.settings.set(key, value);
        self
    }

    pub fn get_flow_data(&self, path: &str) -> Option<Value> {
        self.inner.flow_data.get(path)
    }

    pub async fn set_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        change_flow_data(&self.inner, None, DataOp::Set, path, Some(value), emit).await
    }

    pub async fn append_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        change_flow_data(&self.inner, None, DataOp::Append, path, Some(value), emit).await
    }

    pub async fn del_flow_data(&self, path: &str, emit: bool) -> Result<()> {
        change_flow_data(&self.inner, None, DataOp::Delete, path, None, emit).await
    }

    /// 以当前蓝图快照创建一个隔离执行并登记在册
    pub fn create_execution(&self, options: ExecutionOptions) -> Execution {
        let id = next_id("execution");
        let execution = Execution::new(
            self.inner.blueprint.snapshot_handlers(),
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.flow_data),
            Arc::clone(&self.inner.settings),
            id.clone(),
            options.skip_exceptions.unwrap_or(self.inner.skip_exceptions),
            options.concurrency,
        );
        debug!(flow = %self.inner.name, execution = %id, "execution created");
        self.inner.executions.write().insert(id, execution.clone());
        execution
    }

    pub fn get_execution(&self, id: &str) -> Option<Execution> {
        self.inner.executions.read().get(id).cloned()
    }

    /// 注销执行：之后的 flow 数据广播不再投递给它
    pub fn remove_execution(&self, id: &str) {
        self.inner.executions.write().remove(id);
    }

    pub async fn start_execution(
        &self,
        initial: Value,
        start: StartOptions,
        options: ExecutionOptions,
    ) -> Result<(Execution, Value)> {
        let execution = self.create_execution(options);
        let result = execution.start(initial, start).await?;
        Ok((execution, result))
    }

    /// 一次性运行：创建执行、发 START、等结果
    pub async fn start(&self, initial: Value) -> Result<Value> {
        let (_, result) = self
            .start_execution(initial, StartOptions::default(), ExecutionOptions::default())
            .await?;
        Ok(result)
    }

    /// 创建执行并订阅其 runtime 流；执行在后台以 no-wait 启动
    pub fn get_runtime_stream(
        &self,
        initial: Value,
        idle_timeout: Option<Duration>,
    ) -> (Execution, mpsc::UnboundedReceiver<Value>) {
        let execution = self.create_execution(ExecutionOptions::default());
        let stream = execution.get_runtime_stream(initial, idle_timeout);
        (execution, stream)
    }

    pub fn chunk(&self, target: impl Into<ChunkTarget>) -> Chunk {
        self.inner.blueprint.chunk(target)
    }

    /// 从 START 信号起笔的构建游标
    pub fn process(&self) -> Process {
        Process::new(
            self.inner.blueprint.clone(),
            START_SIGNAL,
            TriggerType::Event,
            BlockData::root(),
        )
    }

    pub fn when(&self, trigger: impl Into<TriggerSpec>, mode: WhenMode) -> Process {
        self.process().when(trigger, mode)
    }

    pub fn to(&self, target: impl Into<ChunkTarget>) -> Process {
        self.process().to(target)
    }

    pub fn to_named(&self, target: impl Into<ChunkTarget>, name: &str) -> Process {
        self.process().to_named(target, name)
    }

    pub fn to_opts(&self, target: impl Into<ChunkTarget>, options: ToOptions) -> Process {
        self.process().to_opts(target, options)
    }

    pub fn side_branch(&self, target: impl Into<ChunkTarget>, name: &str) -> Process {
        self.process().side_branch(target, name)
    }

    pub fn batch(&self, targets: Vec<ChunkTarget>, options: BatchOptions) -> Process {
        self.process().batch(targets, options)
    }

    pub fn collect(
        &self,
        collection: &str,
        branch_id: Option<String>,
        mode: CollectMode,
    ) -> Process {
        self.process().collect(collection, branch_id, mode)
    }

    pub fn for_each(&self, concurrency: Option<usize>) -> Process {
        self.process().for_each(concurrency)
    }

    pub fn match_on(&self, mode: MatchMode) -> Process {
        self.process().match_on(mode)
    }

    pub fn if_condition(&self, condition: impl Into<CaseCondition>) -> Process {
        self.process().if_condition(condition)
    }
}

impl std::fmt::Display for TriggerFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TriggerFlow<{}>", self.inner.name)
    }
}
