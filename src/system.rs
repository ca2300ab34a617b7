use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::signal::TriggerType;

/// 聚合槽位推进结果
pub(crate) enum Aggregation {
    /// 该信号不属于任何登记中的实例
    NotTracked,
    /// 已记录，但还有槽位未填
    Pending,
    /// 全部填齐，返回按登记顺序排列的结果
    Complete(Vec<Value>),
}

/// 执行私有的系统簿记：and-join、batch、for-each、match 的
/// 汇合状态都按执行隔离，避免蓝图级共享状态串扰并发执行。
#[derive(Default)]
pub(crate) struct SystemState {
    joins: Mutex<HashMap<String, Vec<((TriggerType, String), Option<Value>)>>>,
    batches: Mutex<HashMap<String, Vec<(String, String, Option<Value>)>>>,
    for_each: Mutex<HashMap<String, Vec<(String, Option<Value>)>>>,
    matches: Mutex<HashMap<String, Vec<(String, Option<Value>)>>>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SystemState {
    /// 按构造（batch/for-each 实例）懒建的许可池，同一执行内共享
    pub(crate) fn scoped_semaphore(&self, scope: &str, limit: usize) -> Arc<Semaphore> {
        Arc::clone(
            self.semaphores
                .lock()
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit))),
        )
    }

    /// and-join：首次触发时按 expected 初始化槽位；填齐后返回
    /// `{type: {key: value}}` 的合并对象并重新武装（槽位回到未填）。
    pub(crate) fn join_fill(
        &self,
        join_id: &str,
        expected: &[(TriggerType, String)],
        trigger_type: TriggerType,
        event: &str,
        value: Value,
    ) -> Option<Value> {
        let mut joins = self.joins.lock();
        let slots = joins.entry(join_id.to_string()).or_insert_with(|| {
            expected
                .iter()
                .map(|signal| (signal.clone(), None))
                .collect()
        });
        if let Some(slot) = slots
            .iter_mut()
            .find(|((kind, key), _)| *kind == trigger_type && key == event)
        {
            slot.1 = Some(value);
        }
        if slots.iter().any(|(_, slot)| slot.is_none()) {
            return None;
        }
        let mut combined: Map<String, Value> = Map::new();
        for ((kind, key), slot) in slots.iter_mut() {
            let value = slot.take().unwrap_or(Value::Null);
            if let Value::Object(bucket) = combined
                .entry(kind.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                bucket.insert(key.clone(), value);
            }
        }
        Some(Value::Object(combined))
    }

    /// batch 扇入：填齐后返回 `{name -> value}` 并清掉状态，
    /// 下一轮触发重新初始化。
    pub(crate) fn batch_fill(
        &self,
        batch_id: &str,
        expected: &[(String, String)],
        trigger: &str,
        value: Value,
    ) -> Option<Map<String, Value>> {
        let mut batches = self.batches.lock();
        let slots = batches.entry(batch_id.to_string()).or_insert_with(|| {
            expected
                .iter()
                .map(|(trigger, name)| (trigger.clone(), name.clone(), None))
                .collect()
        });
        if let Some(slot) = slots.iter_mut().find(|(key, _, _)| key == trigger) {
            slot.2 = Some(value);
        }
        if slots.iter().any(|(_, _, slot)| slot.is_none()) {
            return None;
        }
        let mut merged = Map::new();
        for (_, name, slot) in slots.iter() {
            if let Some(value) = slot {
                merged.insert(name.clone(), value.clone());
            }
        }
        batches.remove(batch_id);
        Some(merged)
    }

    /// 登记一次 for-each 迭代项（按扇出顺序决定结果顺序）
    pub(crate) fn for_each_expect(&self, instance: &str, item: &str) {
        self.for_each
            .lock()
            .entry(instance.to_string())
            .or_default()
            .push((item.to_string(), None));
    }

    pub(crate) fn for_each_fill(&self, instance: &str, item: &str, value: Value) -> Aggregation {
        let mut states = self.for_each.lock();
        let Some(slots) = states.get_mut(instance) else {
            return Aggregation::NotTracked;
        };
        let Some(slot) = slots.iter_mut().find(|(id, _)| id == item) else {
            return Aggregation::NotTracked;
        };
        slot.1 = Some(value);
        if slots.iter().any(|(_, slot)| slot.is_none()) {
            return Aggregation::Pending;
        }
        let slots = states.remove(instance).unwrap_or_default();
        Aggregation::Complete(
            slots
                .into_iter()
                .filter_map(|(_, slot)| slot)
                .collect(),
        )
    }

    /// 登记一个 hit_all 分支（按 case 声明顺序决定结果顺序）
    pub(crate) fn match_expect(&self, instance: &str, branch: &str) {
        self.matches
            .lock()
            .entry(instance.to_string())
            .or_default()
            .push((branch.to_string(), None));
    }

    pub(crate) fn match_fill(&self, instance: &str, branch: &str, value: Value) -> Aggregation {
        let mut states = self.matches.lock();
        let Some(slots) = states.get_mut(instance) else {
            return Aggregation::NotTracked;
        };
        let Some(slot) = slots.iter_mut().find(|(id, _)| id == branch) else {
            // 实例存在但分支未登记：来自无关链路的信号，忽略
            return Aggregation::Pending;
        };
        slot.1 = Some(value);
        if slots.iter().any(|(_, slot)| slot.is_none()) {
            return Aggregation::Pending;
        }
        let slots = states.remove(instance).unwrap_or_default();
        Aggregation::Complete(
            slots
                .into_iter()
                .filter_map(|(_, slot)| slot)
                .collect(),
        )
    }
}
