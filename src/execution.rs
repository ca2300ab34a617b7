use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::data::{DataOp, DataStore};
use crate::error::{Result, TriggerFlowError};
use crate::event::EventData;
use crate::flow::{change_flow_data, FlowInner};
use crate::signal::{HandlerTable, TriggerType, START_SIGNAL};
use crate::stream::{StreamFanout, StreamItem};
use crate::system::SystemState;

/// 结果等待与 runtime 流空闲的默认超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Start 行为配置
#[derive(Clone, Debug)]
pub struct StartOptions {
    pub wait_for_result: bool,
    pub timeout: Option<Duration>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait_for_result: true,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl StartOptions {
    pub fn no_wait(mut self) -> Self {
        self.wait_for_result = false;
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// 不设截止时间地等待结果
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

struct ExecInner {
    id: String,
    handlers: HandlerTable,
    flow: Weak<FlowInner>,
    flow_data: Arc<DataStore>,
    runtime_data: Arc<DataStore>,
    settings: Arc<DataStore>,
    system: SystemState,
    skip_exceptions: bool,
    semaphore: RwLock<Option<Arc<Semaphore>>>,
    started: AtomicBool,
    stream_tx: mpsc::UnboundedSender<StreamItem>,
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamItem>>>,
    fanout: Arc<StreamFanout>,
    result: Mutex<Option<Value>>,
    result_tx: watch::Sender<bool>,
    result_rx: watch::Receiver<bool>,
}

/// 蓝图快照的一次独立运行：私有 handler 表、私有 runtime 数据、
/// 一次性结果槽与推送式 runtime 流。信号派发即并发扇出。
#[derive(Clone)]
pub struct Execution {
    inner: Arc<ExecInner>,
}

impl Execution {
    pub(crate) fn new(
        handlers: HandlerTable,
        flow: Weak<FlowInner>,
        flow_data: Arc<DataStore>,
        settings_parent: Arc<DataStore>,
        id: String,
        skip_exceptions: bool,
        concurrency: Option<usize>,
    ) -> Self {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = watch::channel(false);
        Self {
            inner: Arc::new(ExecInner {
                id,
                handlers,
                flow,
                flow_data,
                runtime_data: Arc::new(DataStore::new("execution-runtime")),
                settings: Arc::new(DataStore::with_parent(
                    "execution-settings",
                    settings_parent,
                )),
                system: SystemState::default(),
                skip_exceptions,
                semaphore: RwLock::new(
                    concurrency
                        .filter(|limit| *limit > 0)
                        .map(|limit| Arc::new(Semaphore::new(limit))),
                ),
                started: AtomicBool::new(false),
                stream_tx,
                stream_rx: Mutex::new(Some(stream_rx)),
                fanout: StreamFanout::new(),
                result: Mutex::new(None),
                result_tx,
                result_rx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn settings(&self) -> Arc<DataStore> {
        Arc::clone(&self.inner.settings)
    }

    pub fn set_settings(&self, key: &str, value: Value) -> &Self {
        self.inner.settings.set(key, value);
        self
    }

    pub fn set_concurrency(&self, concurrency: Option<usize>) -> &Self {
        *self.inner.semaphore.write() = concurrency
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        self
    }

    pub(crate) fn system(&self) -> &SystemState {
        &self.inner.system
    }

    pub(crate) fn has_handler(&self, trigger_type: TriggerType, key: &str) -> bool {
        self.inner.handlers.contains(trigger_type, key)
    }

    pub async fn emit(&self, event: &str, value: Value) -> Result<()> {
        self.emit_with_marks(event, value, Vec::new(), TriggerType::Event)
            .await
    }

    /// 并发派发：每个已注册 handler 一个任务，屏障等待全部完成。
    /// 无人订阅的信号不是错误。skip_exceptions 为 false 时返回
    /// 最先观察到的 handler 错误，其余错误丢弃。
    pub async fn emit_with_marks(
        &self,
        event: &str,
        value: Value,
        marks: Vec<String>,
        trigger_type: TriggerType,
    ) -> Result<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        debug!(
            execution = %self.inner.id,
            event,
            trigger_type = trigger_type.as_str(),
            "emit signal"
        );

        let targets: Vec<(String, crate::signal::Handler)> = match self
            .inner
            .handlers
            .get(trigger_type, event)
        {
            Some(handlers) if !handlers.is_empty() => handlers
                .iter()
                .map(|(id, handler)| (id.clone(), handler.clone()))
                .collect(),
            _ => return Ok(()),
        };

        let semaphore = self.inner.semaphore.read().clone();
        let mut join_set: JoinSet<Result<Value>> = JoinSet::new();
        for (handler_id, handler) in targets {
            let data = EventData::new(
                event.to_string(),
                trigger_type,
                value.clone(),
                self.clone(),
                marks.clone(),
            );
            let semaphore = semaphore.clone();
            trace!(execution = %self.inner.id, event, handler = %handler_id, "dispatch handler");
            join_set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => Some(semaphore.acquire_owned().await.map_err(|_| {
                        TriggerFlowError::Other(anyhow!("execution concurrency semaphore closed"))
                    })?),
                    None => None,
                };
                handler.call(data).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(TriggerFlowError::Other(join_error.into()));
                    }
                }
            }
        }

        if self.inner.skip_exceptions {
            if let Some(error) = first_error {
                debug!(execution = %self.inner.id, event, %error, "handler error skipped");
            }
            return Ok(());
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// 先写先赢：第一次调用记录结果并释放等待者，之后的调用是空操作
    pub fn set_result(&self, result: Value) {
        let mut slot = self.inner.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            let _ = self.inner.result_tx.send(true);
        }
    }

    pub fn has_result(&self) -> bool {
        self.inner.result.lock().is_some()
    }

    /// 阻塞到结果就绪或超时；超时返回 `ResultTimeout` 而不是伪成功
    pub async fn get_result(&self, wait_timeout: Option<Duration>) -> Result<Value> {
        let mut ready = self.inner.result_rx.clone();
        match wait_timeout {
            Some(limit) => match timeout(limit, ready.wait_for(|set| *set)).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => return Err(TriggerFlowError::ResultCancelled(error.to_string())),
                Err(_) => return Err(TriggerFlowError::ResultTimeout(limit)),
            },
            None => {
                if let Err(error) = ready.wait_for(|set| *set).await {
                    return Err(TriggerFlowError::ResultCancelled(error.to_string()));
                }
            }
        }
        Ok(self.inner.result.lock().clone().unwrap_or(Value::Null))
    }

    /// 发出 START 事件；默认等待结果（默认超时见 `DEFAULT_TIMEOUT`）
    pub async fn start(&self, initial: Value, options: StartOptions) -> Result<Value> {
        self.emit_with_marks(START_SIGNAL, initial, Vec::new(), TriggerType::Event)
            .await?;
        if options.wait_for_result {
            self.get_result(options.timeout).await
        } else {
            Ok(Value::Null)
        }
    }

    pub fn get_runtime_data(&self, path: &str) -> Option<Value> {
        self.inner.runtime_data.get(path)
    }

    pub async fn set_runtime_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.change_runtime_data(DataOp::Set, path, Some(value), emit)
            .await
    }

    pub async fn append_runtime_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.change_runtime_data(DataOp::Append, path, Some(value), emit)
            .await
    }

    pub async fn del_runtime_data(&self, path: &str, emit: bool) -> Result<()> {
        self.change_runtime_data(DataOp::Delete, path, None, emit)
            .await
    }

    async fn change_runtime_data(
        &self,
        op: DataOp,
        path: &str,
        value: Option<Value>,
        emit: bool,
    ) -> Result<()> {
        match op {
            DataOp::Set => self
                .inner
                .runtime_data
                .set(path, value.unwrap_or(Value::Null)),
            DataOp::Append => self
                .inner
                .runtime_data
                .append(path, value.unwrap_or(Value::Null)),
            DataOp::Delete => self.inner.runtime_data.delete(path),
        }
        if emit {
            let current = self.inner.runtime_data.get(path).unwrap_or(Value::Null);
            self.emit_with_marks(path, current, Vec::new(), TriggerType::RuntimeData)
                .await?;
        }
        Ok(())
    }

    pub fn get_flow_data(&self, path: &str) -> Option<Value> {
        self.inner.flow_data.get(path)
    }

    pub async fn set_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.change_flow_data(DataOp::Set, path, Some(value), emit)
            .await
    }

    pub async fn append_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.change_flow_data(DataOp::Append, path, Some(value), emit)
            .await
    }

    pub async fn del_flow_data(&self, path: &str, emit: bool) -> Result<()> {
        self.change_flow_data(DataOp::Delete, path, None, emit)
            .await
    }

    async fn change_flow_data(
        &self,
        op: DataOp,
        path: &str,
        value: Option<Value>,
        emit: bool,
    ) -> Result<()> {
        match self.inner.flow.upgrade() {
            Some(flow) => {
                change_flow_data(&flow, Some(self.id()), op, path, value, emit).await
            }
            // flow 已被释放：只改数据，无人可广播
            None => {
                match op {
                    DataOp::Set => self.inner.flow_data.set(path, value.unwrap_or(Value::Null)),
                    DataOp::Append => self
                        .inner
                        .flow_data
                        .append(path, value.unwrap_or(Value::Null)),
                    DataOp::Delete => self.inner.flow_data.delete(path),
                }
                Ok(())
            }
        }
    }

    /// handler 向执行私有队列推送一个流元素
    pub fn put_into_stream(&self, item: Value) {
        let _ = self.inner.stream_tx.send(StreamItem::Item(item));
    }

    /// 推送终止哨兵，订阅端随之结束
    pub fn stop_stream(&self) {
        let _ = self.inner.stream_tx.send(StreamItem::Stop);
    }

    /// 订阅 runtime 流；未启动时在后台以 no-wait 方式启动。
    /// 空闲超时（默认 10s）后流结束而不是永久阻塞。
    pub fn get_runtime_stream(
        &self,
        initial: Value,
        idle_timeout: Option<Duration>,
    ) -> mpsc::UnboundedReceiver<Value> {
        // 抢占 started 标志，两个并发的首订阅者只有一个触发启动
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let execution = self.clone();
            tokio::spawn(async move {
                if let Err(error) = execution
                    .start(initial, StartOptions::default().no_wait())
                    .await
                {
                    warn!(%error, "background start for runtime stream failed");
                }
            });
        }
        if let Some(source) = self.inner.stream_rx.lock().take() {
            self.inner
                .fanout
                .start(source, Some(idle_timeout.unwrap_or(DEFAULT_TIMEOUT)));
        }
        self.inner.fanout.subscribe()
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.inner.id)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}
