use std::sync::Arc;

use serde_json::Value;

use crate::data::DataStore;
use crate::error::Result;
use crate::execution::Execution;
use crate::signal::{next_id, TriggerType};

/// 每次 handler 调用的上下文：触发信号、载荷、所属执行，
/// 以及用于并发分支实例对齐的 layer mark 栈。
#[derive(Clone)]
pub struct EventData {
    pub trigger_event: String,
    pub trigger_type: TriggerType,
    pub value: Value,
    pub execution_id: String,
    execution: Execution,
    layer_marks: Vec<String>,
}

impl EventData {
    pub(crate) fn new(
        trigger_event: String,
        trigger_type: TriggerType,
        value: Value,
        execution: Execution,
        layer_marks: Vec<String>,
    ) -> Self {
        Self {
            trigger_event,
            trigger_type,
            value,
            execution_id: execution.id().to_string(),
            execution,
            layer_marks,
        }
    }

    pub(crate) fn execution(&self) -> &Execution {
        &self.execution
    }

    /// 以当前 mark 栈发射信号
    pub async fn emit(&self, event: &str, value: Value, trigger_type: TriggerType) -> Result<()> {
        self.execution
            .emit_with_marks(event, value, self.layer_marks(), trigger_type)
            .await
    }

    pub async fn emit_with_marks(
        &self,
        event: &str,
        value: Value,
        marks: Vec<String>,
        trigger_type: TriggerType,
    ) -> Result<()> {
        self.execution
            .emit_with_marks(event, value, marks, trigger_type)
            .await
    }

    pub fn set_result(&self, result: Value) {
        self.execution.set_result(result);
    }

    pub fn settings(&self) -> Arc<DataStore> {
        self.execution.settings()
    }

    pub fn get_flow_data(&self, path: &str) -> Option<Value> {
        self.execution.get_flow_data(path)
    }

    pub async fn set_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.execution.set_flow_data(path, value, emit).await
    }

    pub async fn append_flow_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.execution.append_flow_data(path, value, emit).await
    }

    pub async fn del_flow_data(&self, path: &str, emit: bool) -> Result<()> {
        self.execution.del_flow_data(path, emit).await
    }

    pub fn get_runtime_data(&self, path: &str) -> Option<Value> {
        self.execution.get_runtime_data(path)
    }

    pub async fn set_runtime_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.execution.set_runtime_data(path, value, emit).await
    }

    pub async fn append_runtime_data(&self, path: &str, value: Value, emit: bool) -> Result<()> {
        self.execution.append_runtime_data(path, value, emit).await
    }

    pub async fn del_runtime_data(&self, path: &str, emit: bool) -> Result<()> {
        self.execution.del_runtime_data(path, emit).await
    }

    pub fn put_into_stream(&self, item: Value) {
        self.execution.put_into_stream(item);
    }

    pub fn stop_stream(&self) {
        self.execution.stop_stream();
    }

    /// 压入一个新 layer mark（进入嵌套分支实例）
    pub fn layer_in(&mut self) {
        self.layer_marks.push(next_id("layer"));
    }

    pub fn layer_out(&mut self) {
        self.layer_marks.pop();
    }

    /// 栈顶 mark：当前分支实例标识
    pub fn layer_mark(&self) -> Option<String> {
        self.layer_marks.last().cloned()
    }

    /// 次顶 mark：外层构造实例标识
    pub fn upper_layer_mark(&self) -> Option<String> {
        let len = self.layer_marks.len();
        if len > 1 {
            Some(self.layer_marks[len - 2].clone())
        } else {
            None
        }
    }

    pub fn layer_marks(&self) -> Vec<String> {
        self.layer_marks.clone()
    }
}
