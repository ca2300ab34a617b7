use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::blueprint::{BluePrint, Chunk, ChunkTarget};
use crate::error::{Result, TriggerFlowError};
use crate::event::EventData;
use crate::signal::{next_id, Condition, Handler, TriggerType};
use crate::system::Aggregation;

/// 多信号 When 的汇合模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WhenMode {
    /// 等全部信号到齐后发射合并 map
    #[default]
    And,
    /// 每次触发都发射，载荷包一层 `{trigger_type, trigger_event, value}`
    Or,
    /// 每次触发都发射原始载荷
    SimpleOr,
}

/// Match 分支命中模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// 按声明顺序求值，命中第一个就短路
    #[default]
    HitFirst,
    /// 所有命中的分支并发执行并聚合结果列表
    HitAll,
}

/// Collect 填满后的行为
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollectMode {
    /// 发射后清空，同名 collection 可跨轮次复用
    FilledThenEmpty,
    /// 保留已填值，后续单槽更新会再次触发
    #[default]
    FilledAndUpdate,
}

/// When 接受的信号引用
pub enum TriggerSpec {
    /// 事件键或 chunk 目录里的名字
    Event(String),
    Chunk(Chunk),
    /// 多信号 join 描述
    Signals(Vec<(TriggerType, String)>),
}

impl TriggerSpec {
    pub fn signals<I, S>(signals: I) -> Self
    where
        I: IntoIterator<Item = (TriggerType, S)>,
        S: Into<String>,
    {
        TriggerSpec::Signals(
            signals
                .into_iter()
                .map(|(trigger_type, key)| (trigger_type, key.into()))
                .collect(),
        )
    }
}

impl From<&str> for TriggerSpec {
    fn from(key: &str) -> Self {
        TriggerSpec::Event(key.to_string())
    }
}

impl From<String> for TriggerSpec {
    fn from(key: String) -> Self {
        TriggerSpec::Event(key)
    }
}

impl From<Chunk> for TriggerSpec {
    fn from(chunk: Chunk) -> Self {
        TriggerSpec::Chunk(chunk)
    }
}

impl From<&Chunk> for TriggerSpec {
    fn from(chunk: &Chunk) -> Self {
        TriggerSpec::Chunk(chunk.clone())
    }
}

/// case 判定：字面量相等或谓词
#[derive(Clone)]
pub enum CaseCondition {
    Equals(Value),
    Predicate(Condition),
}

impl CaseCondition {
    pub fn equals(value: impl Into<Value>) -> Self {
        CaseCondition::Equals(value.into())
    }

    pub fn predicate<F>(func: F) -> Self
    where
        F: Fn(&EventData) -> bool + Send + Sync + 'static,
    {
        CaseCondition::Predicate(Arc::new(func))
    }

    fn matches(&self, data: &EventData) -> bool {
        match self {
            CaseCondition::Equals(value) => *value == data.value,
            CaseCondition::Predicate(condition) => condition(data),
        }
    }
}

impl From<Value> for CaseCondition {
    fn from(value: Value) -> Self {
        CaseCondition::Equals(value)
    }
}

/// To/SideBranch 行为配置
#[derive(Clone, Debug, Default)]
pub struct ToOptions {
    pub side_branch: bool,
    pub name: Option<String>,
}

impl ToOptions {
    pub fn side_branch(mut self) -> Self {
        self.side_branch = true;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Batch 行为配置
#[derive(Clone, Debug, Default)]
pub struct BatchOptions {
    pub side_branch: bool,
    pub concurrency: Option<usize>,
}

impl BatchOptions {
    pub fn side_branch(mut self) -> Self {
        self.side_branch = true;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }
}

/// 构建期作用域栈：Match/ForEach 的构造内簿记挂在这里，
/// EndMatch/EndForEach 弹回外层作用域。
#[derive(Clone)]
pub(crate) struct BlockData {
    node: Arc<BlockNode>,
}

struct BlockNode {
    outer: Option<BlockData>,
    payload: BlockPayload,
}

enum BlockPayload {
    Root,
    ForEach { id: String },
    Match(Arc<MatchBlock>),
}

pub(crate) struct MatchBlock {
    id: String,
    mode: MatchMode,
    state: Mutex<MatchBuild>,
}

struct MatchBuild {
    cases: Vec<(String, CaseCondition)>,
    branch_ends: Vec<String>,
    is_first_case: bool,
    has_else: bool,
}

impl BlockData {
    pub(crate) fn root() -> Self {
        Self {
            node: Arc::new(BlockNode {
                outer: None,
                payload: BlockPayload::Root,
            }),
        }
    }

    fn child(outer: &BlockData, payload: BlockPayload) -> Self {
        Self {
            node: Arc::new(BlockNode {
                outer: Some(outer.clone()),
                payload,
            }),
        }
    }

    fn outer(&self) -> Option<BlockData> {
        self.node.outer.clone()
    }

    fn for_each_id(&self) -> Option<String> {
        match &self.node.payload {
            BlockPayload::ForEach { id } => Some(id.clone()),
            _ => None,
        }
    }

    fn match_block(&self) -> Option<Arc<MatchBlock>> {
        match &self.node.payload {
            BlockPayload::Match(block) => Some(Arc::clone(block)),
            _ => None,
        }
    }
}

/// 指向"下一个 handler 挂在哪个信号上"的流式游标。
/// 每个算子返回新的 Process，留住旧引用即可从任意节点再分叉。
#[derive(Clone)]
pub struct Process {
    blueprint: BluePrint,
    trigger_event: String,
    trigger_type: TriggerType,
    block: BlockData,
}

impl Process {
    pub(crate) fn new(
        blueprint: BluePrint,
        trigger_event: impl Into<String>,
        trigger_type: TriggerType,
        block: BlockData,
    ) -> Self {
        Self {
            blueprint,
            trigger_event: trigger_event.into(),
            trigger_type,
            block,
        }
    }

    pub fn trigger_event(&self) -> &str {
        &self.trigger_event
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger_type
    }

    fn derive(
        &self,
        trigger_event: String,
        trigger_type: TriggerType,
        block: Option<BlockData>,
    ) -> Process {
        Process {
            blueprint: self.blueprint.clone(),
            trigger_event,
            trigger_type,
            block: block.unwrap_or_else(|| self.block.clone()),
        }
    }

    /// 订阅信号。单信号直接换游标；多信号按 mode 汇合。
    /// and-join 状态按执行隔离，成功合并一次后重新武装。
    pub fn when(&self, trigger: impl Into<TriggerSpec>, mode: WhenMode) -> Process {
        match trigger.into() {
            TriggerSpec::Chunk(chunk) => self.derive(
                chunk.trigger().to_string(),
                TriggerType::Event,
                Some(BlockData::root()),
            ),
            TriggerSpec::Event(key) => {
                let resolved = self
                    .blueprint
                    .find_chunk(&key)
                    .map(|chunk| chunk.trigger().to_string())
                    .unwrap_or(key);
                self.derive(resolved, TriggerType::Event, Some(BlockData::root()))
            }
            TriggerSpec::Signals(signals) => {
                let expected: Vec<(TriggerType, String)> = signals
                    .into_iter()
                    .map(|(trigger_type, key)| {
                        if trigger_type == TriggerType::Event {
                            if let Some(chunk) = self.blueprint.find_chunk(&key) {
                                return (trigger_type, chunk.trigger().to_string());
                            }
                        }
                        (trigger_type, key)
                    })
                    .collect();

                if expected.len() == 1 {
                    if let Some((trigger_type, key)) = expected.into_iter().next() {
                        return self.derive(key, trigger_type, Some(BlockData::root()));
                    }
                    return self.clone();
                }

                let when_id = next_id("when");
                let handler = match mode {
                    WhenMode::And => {
                        let expected = Arc::new(expected.clone());
                        let when_id = when_id.clone();
                        Handler::from_fn(move |data| {
                            let expected = Arc::clone(&expected);
                            let when_id = when_id.clone();
                            async move {
                                let combined = data.execution().system().join_fill(
                                    &when_id,
                                    &expected,
                                    data.trigger_type,
                                    &data.trigger_event,
                                    data.value.clone(),
                                );
                                if let Some(combined) = combined {
                                    data.emit(&when_id, combined, TriggerType::Event).await?;
                                }
                                Ok(Value::Null)
                            }
                        })
                    }
                    WhenMode::Or => {
                        let when_id = when_id.clone();
                        Handler::from_fn(move |data| {
                            let when_id = when_id.clone();
                            async move {
                                let wrapped = json!({
                                    "trigger_type": data.trigger_type.as_str(),
                                    "trigger_event": data.trigger_event,
                                    "value": data.value,
                                });
                                data.emit(&when_id, wrapped, TriggerType::Event).await?;
                                Ok(Value::Null)
                            }
                        })
                    }
                    WhenMode::SimpleOr => {
                        let when_id = when_id.clone();
                        Handler::from_fn(move |data| {
                            let when_id = when_id.clone();
                            async move {
                                data.emit(&when_id, data.value.clone(), TriggerType::Event)
                                    .await?;
                                Ok(Value::Null)
                            }
                        })
                    }
                };
                for (trigger_type, key) in &expected {
                    self.blueprint
                        .add_handler(*trigger_type, key, handler.clone(), None);
                }
                self.derive(when_id, TriggerType::Event, Some(BlockData::root()))
            }
        }
    }

    pub fn to(&self, target: impl Into<ChunkTarget>) -> Process {
        self.to_opts(target, ToOptions::default())
    }

    pub fn to_named(&self, target: impl Into<ChunkTarget>, name: &str) -> Process {
        self.to_opts(target, ToOptions::default().named(name))
    }

    /// 旁路分支：注册目标但游标留在原信号上，主链不受影响
    pub fn side_branch(&self, target: impl Into<ChunkTarget>, name: &str) -> Process {
        self.to_opts(target, ToOptions::default().named(name).side_branch())
    }

    pub fn to_opts(&self, target: impl Into<ChunkTarget>, options: ToOptions) -> Process {
        let Some(chunk) = self.resolve(target.into(), options.name.as_deref()) else {
            // 解析不了的目标静默跳过，保持流式构建不中断
            warn!(trigger = %self.trigger_event, "unresolvable chunk target, skipping");
            return self.clone();
        };
        self.blueprint
            .add_handler(self.trigger_type, &self.trigger_event, chunk.as_handler(), None);
        if options.side_branch {
            self.derive(self.trigger_event.clone(), self.trigger_type, None)
        } else {
            // chunk 派生键永远是事件类型信号
            self.derive(chunk.trigger().to_string(), TriggerType::Event, None)
        }
    }

    fn resolve(&self, target: ChunkTarget, name: Option<&str>) -> Option<Chunk> {
        match target {
            ChunkTarget::Name(name) => self.blueprint.find_chunk(&name),
            ChunkTarget::Chunk(chunk) => Some(chunk),
            ChunkTarget::Handler(handler) => Some(self.blueprint.chunk(match name {
                Some(name) if !name.is_empty() => ChunkTarget::named(name, handler),
                _ => ChunkTarget::Handler(handler),
            })),
            named @ ChunkTarget::Named { .. } => Some(self.blueprint.chunk(named)),
        }
    }

    /// 把每个目标注册成当前信号的独立 handler，外加一个共享扇入：
    /// 全部目标报到后发射一次 `{name -> result}` 合并 map。
    /// 扇入状态按执行隔离，发射后清空。
    pub fn batch(&self, targets: Vec<ChunkTarget>, options: BatchOptions) -> Process {
        let batch_id = next_id("batch");
        let mut chunks = Vec::new();
        let mut expected = Vec::new();
        for target in targets {
            let Some(chunk) = self.resolve(target, None) else {
                warn!(trigger = %self.trigger_event, "unresolvable batch target, skipping");
                continue;
            };
            expected.push((chunk.trigger().to_string(), chunk.name().to_string()));
            chunks.push(chunk);
        }

        let expected = Arc::new(expected);
        let fan_in = Handler::from_fn({
            let expected = Arc::clone(&expected);
            let batch_id = batch_id.clone();
            move |data| {
                let expected = Arc::clone(&expected);
                let batch_id = batch_id.clone();
                async move {
                    let merged = data.execution().system().batch_fill(
                        &batch_id,
                        &expected,
                        &data.trigger_event,
                        data.value.clone(),
                    );
                    if let Some(merged) = merged {
                        data.emit(&batch_id, Value::Object(merged), TriggerType::Event)
                            .await?;
                    }
                    Ok(Value::Null)
                }
            }
        });

        for chunk in chunks {
            let handler = match options.concurrency {
                Some(limit) if limit > 0 => {
                    let chunk = chunk.clone();
                    let scope = batch_id.clone();
                    Handler::from_fn(move |data| {
                        let chunk = chunk.clone();
                        let scope = scope.clone();
                        async move {
                            let semaphore =
                                data.execution().system().scoped_semaphore(&scope, limit);
                            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                                TriggerFlowError::Other(anyhow!("batch semaphore closed"))
                            })?;
                            chunk.call(data).await
                        }
                    })
                }
                _ => chunk.as_handler(),
            };
            self.blueprint
                .add_handler(self.trigger_type, &self.trigger_event, handler, None);
            self.blueprint
                .add_event_handler(chunk.trigger(), fan_in.clone(), None);
        }

        if options.side_branch {
            self.derive(self.trigger_event.clone(), self.trigger_type, None)
        } else {
            self.derive(batch_id, TriggerType::Event, None)
        }
    }

    /// 具名汇合点：分支槽位建图时登记在 flow 自己的汇合表里，
    /// 全部填满后以 `Collect-<name>` 发射合并 map。
    pub fn collect(
        &self,
        collection: &str,
        branch_id: Option<String>,
        mode: CollectMode,
    ) -> Process {
        let branch = branch_id
            .filter(|branch| !branch.is_empty())
            .unwrap_or_else(|| next_id("branch"));
        let collect_trigger = format!("Collect-{collection}");
        let registry = self.blueprint.collections();
        registry.register(collection, &branch);

        let handler = Handler::from_fn({
            let registry = Arc::clone(&registry);
            let collection = collection.to_string();
            let branch = branch.clone();
            let collect_trigger = collect_trigger.clone();
            move |data| {
                let registry = Arc::clone(&registry);
                let collection = collection.clone();
                let branch = branch.clone();
                let collect_trigger = collect_trigger.clone();
                async move {
                    if let Some(merged) = registry.fill(&collection, &branch, data.value.clone()) {
                        data.emit(&collect_trigger, Value::Object(merged), TriggerType::Event)
                            .await?;
                        if mode == CollectMode::FilledThenEmpty {
                            registry.reset(&collection);
                        }
                    }
                    Ok(Value::Null)
                }
            }
        });

        let _ = self.to_named(handler, "collect");
        self.derive(collect_trigger, TriggerType::Event, None)
    }

    /// 终点：把到达的值写入结果槽（先写先赢，handler 里更早的
    /// 显式 SetResult 总是优先于链的自然终值）。
    pub fn end(&self) -> Process {
        self.to_named(
            Handler::from_fn(|data| async move {
                data.set_result(data.value.clone());
                Ok(Value::Null)
            }),
            "end",
        )
    }

    /// 列表载荷逐项并发扇出，每项带独立的嵌套 layer mark；
    /// 非列表退化为单次迭代。并发上限是执行内按构造共享的许可池。
    pub fn for_each(&self, concurrency: Option<usize>) -> Process {
        let for_each_id = next_id("foreach");
        let send_trigger = format!("ForEach-{for_each_id}-Send");

        let handler = Handler::from_fn({
            let send_trigger = send_trigger.clone();
            let scope = for_each_id.clone();
            move |mut data| {
                let send_trigger = send_trigger.clone();
                let scope = scope.clone();
                async move {
                    data.layer_in();
                    let Some(instance) = data.layer_mark() else {
                        return Ok(Value::Null);
                    };
                    let items = match &data.value {
                        Value::Array(list) => list.clone(),
                        other => vec![other.clone()],
                    };
                    // 先登记全部槽位，再扇出，避免快手分支提前触发聚合
                    let mut dispatch = Vec::with_capacity(items.len());
                    for item in items {
                        data.layer_in();
                        if let Some(item_id) = data.layer_mark() {
                            data.execution().system().for_each_expect(&instance, &item_id);
                            dispatch.push((data.layer_marks(), item));
                        }
                        data.layer_out();
                    }

                    let semaphore = concurrency.filter(|limit| *limit > 0).map(|limit| {
                        data.execution().system().scoped_semaphore(&scope, limit)
                    });
                    let mut join_set: JoinSet<Result<()>> = JoinSet::new();
                    for (marks, item) in dispatch {
                        let execution = data.execution().clone();
                        let semaphore = semaphore.clone();
                        let trigger = send_trigger.clone();
                        join_set.spawn(async move {
                            let _permit = match semaphore {
                                Some(semaphore) => {
                                    Some(semaphore.acquire_owned().await.map_err(|_| {
                                        TriggerFlowError::Other(anyhow!(
                                            "for-each semaphore closed"
                                        ))
                                    })?)
                                }
                                None => None,
                            };
                            execution
                                .emit_with_marks(&trigger, item, marks, TriggerType::Event)
                                .await
                        });
                    }
                    join_first_error(join_set).await?;
                    Ok(Value::Null)
                }
            }
        });

        let _ = self.to_named(handler, "for_each_send");
        let block = BlockData::child(&self.block, BlockPayload::ForEach { id: for_each_id });
        self.derive(send_trigger, TriggerType::Event, Some(block))
    }

    /// 按 item layer mark 收敛各迭代的终值；全部到齐后按扇出
    /// 顺序发射结果列表，并弹掉 item 与循环两层 mark。
    pub fn end_for_each(&self) -> Process {
        let Some(for_each_id) = self.block.for_each_id() else {
            return self.clone();
        };
        let end_trigger = format!("ForEach-{for_each_id}-End");

        let handler = Handler::from_fn({
            let end_trigger = end_trigger.clone();
            move |mut data| {
                let end_trigger = end_trigger.clone();
                async move {
                    let (Some(item_id), Some(instance)) =
                        (data.layer_mark(), data.upper_layer_mark())
                    else {
                        return Ok(Value::Null);
                    };
                    match data
                        .execution()
                        .system()
                        .for_each_fill(&instance, &item_id, data.value.clone())
                    {
                        Aggregation::Complete(results) => {
                            data.layer_out();
                            data.layer_out();
                            data.emit(&end_trigger, Value::Array(results), TriggerType::Event)
                                .await?;
                        }
                        Aggregation::Pending | Aggregation::NotTracked => {}
                    }
                    Ok(Value::Null)
                }
            }
        });

        let _ = self.to_named(handler, "for_each_collect");
        let block = self.block.outer().unwrap_or_else(BlockData::root);
        self.derive(end_trigger, TriggerType::Event, Some(block))
    }

    /// 条件分派块。cases 存有序序列，HitFirst 按声明顺序短路；
    /// HitAll 并发跑所有命中分支并按声明顺序聚合结果。
    pub fn match_on(&self, mode: MatchMode) -> Process {
        let match_id = next_id("match");
        let block = Arc::new(MatchBlock {
            id: match_id,
            mode,
            state: Mutex::new(MatchBuild {
                cases: Vec::new(),
                branch_ends: Vec::new(),
                is_first_case: true,
                has_else: false,
            }),
        });

        let handler = Handler::from_fn({
            let block = Arc::clone(&block);
            move |mut data| {
                let block = Arc::clone(&block);
                async move {
                    data.layer_in();
                    let (cases, has_else) = {
                        let state = block.state.lock();
                        (state.cases.clone(), state.has_else)
                    };
                    match block.mode {
                        MatchMode::HitFirst => {
                            for (case_id, condition) in &cases {
                                if condition.matches(&data) {
                                    let case_trigger =
                                        format!("Match-{}-Case-{}", block.id, case_id);
                                    data.emit(&case_trigger, data.value.clone(), TriggerType::Event)
                                        .await?;
                                    return Ok(Value::Null);
                                }
                            }
                            emit_match_fallback(&mut data, &block.id, has_else).await?;
                            Ok(Value::Null)
                        }
                        MatchMode::HitAll => {
                            let Some(instance) = data.layer_mark() else {
                                return Ok(Value::Null);
                            };
                            let mut branches = Vec::new();
                            for (case_id, condition) in &cases {
                                if condition.matches(&data) {
                                    data.layer_in();
                                    if let Some(branch_mark) = data.layer_mark() {
                                        data.execution()
                                            .system()
                                            .match_expect(&instance, &branch_mark);
                                        branches.push((
                                            format!("Match-{}-Case-{}", block.id, case_id),
                                            data.layer_marks(),
                                        ));
                                    }
                                    data.layer_out();
                                }
                            }
                            if branches.is_empty() {
                                emit_match_fallback(&mut data, &block.id, has_else).await?;
                                return Ok(Value::Null);
                            }
                            let mut join_set: JoinSet<Result<()>> = JoinSet::new();
                            for (case_trigger, marks) in branches {
                                let execution = data.execution().clone();
                                let value = data.value.clone();
                                join_set.spawn(async move {
                                    execution
                                        .emit_with_marks(
                                            &case_trigger,
                                            value,
                                            marks,
                                            TriggerType::Event,
                                        )
                                        .await
                                });
                            }
                            join_first_error(join_set).await?;
                            Ok(Value::Null)
                        }
                    }
                }
            }
        });

        let _ = self.to_named(handler, "match");
        let block = BlockData::child(&self.block, BlockPayload::Match(block));
        self.derive(self.trigger_event.clone(), self.trigger_type, Some(block))
    }

    /// 追加一个 case；游标移到该 case 的派生键上
    pub fn case(&self, condition: impl Into<CaseCondition>) -> Process {
        let Some(block) = self.block.match_block() else {
            return self.clone();
        };
        let case_id = next_id("case");
        {
            let mut state = block.state.lock();
            state.cases.push((case_id.clone(), condition.into()));
            if state.is_first_case {
                state.is_first_case = false;
            } else if !self.trigger_event.starts_with(&format!("Match-{}", block.id)) {
                // 上一个分支链的末端，EndMatch 时统一接收敛器
                state.branch_ends.push(self.trigger_event.clone());
            }
        }
        self.derive(
            format!("Match-{}-Case-{}", block.id, case_id),
            TriggerType::Event,
            None,
        )
    }

    pub fn case_else(&self) -> Process {
        let Some(block) = self.block.match_block() else {
            return self.clone();
        };
        {
            let mut state = block.state.lock();
            if state.is_first_case {
                return self.clone();
            }
            state.has_else = true;
            if !self.trigger_event.starts_with(&format!("Match-{}", block.id)) {
                state.branch_ends.push(self.trigger_event.clone());
            }
        }
        self.derive(
            format!("Match-{}-Else", block.id),
            TriggerType::Event,
            None,
        )
    }

    /// 关闭 match 块：给每个分支末端接上收敛器，游标移到
    /// `Match-<id>-Result`，作用域弹回外层。
    pub fn end_match(&self) -> Process {
        let Some(block) = self.block.match_block() else {
            return self.clone();
        };
        let branch_ends = {
            let mut state = block.state.lock();
            if !self.trigger_event.starts_with(&format!("Match-{}", block.id)) {
                state.branch_ends.push(self.trigger_event.clone());
            }
            state.branch_ends.clone()
        };
        let result_trigger = format!("Match-{}-Result", block.id);

        let collector = Handler::from_fn({
            let result_trigger = result_trigger.clone();
            move |mut data| {
                let result_trigger = result_trigger.clone();
                async move {
                    let aggregation = match (data.upper_layer_mark(), data.layer_mark()) {
                        (Some(instance), Some(branch)) => Some(
                            data.execution()
                                .system()
                                .match_fill(&instance, &branch, data.value.clone()),
                        ),
                        _ => None,
                    };
                    match aggregation {
                        Some(Aggregation::Complete(results)) => {
                            // 弹掉分支与 match 两层
                            data.layer_out();
                            data.layer_out();
                            data.emit(&result_trigger, Value::Array(results), TriggerType::Event)
                                .await?;
                        }
                        Some(Aggregation::Pending) => {}
                        Some(Aggregation::NotTracked) | None => {
                            // hit_first 路径：直接透传，弹掉 match 层
                            data.layer_out();
                            let value = data.value.clone();
                            data.emit(&result_trigger, value, TriggerType::Event).await?;
                        }
                    }
                    Ok(Value::Null)
                }
            }
        });

        for branch_end in branch_ends {
            let _ = self
                .when(branch_end.as_str(), WhenMode::And)
                .to_named(collector.clone(), "match_collect");
        }

        let outer = self.block.outer().unwrap_or_else(BlockData::root);
        self.derive(result_trigger, TriggerType::Event, Some(outer))
    }

    pub fn if_condition(&self, condition: impl Into<CaseCondition>) -> Process {
        self.match_on(MatchMode::HitFirst).case(condition)
    }

    pub fn elif_condition(&self, condition: impl Into<CaseCondition>) -> Process {
        self.case(condition)
    }

    pub fn else_condition(&self) -> Process {
        self.case_else()
    }

    pub fn end_condition(&self) -> Process {
        self.end_match()
    }

    /// 纯旁路的人类可读落点，不影响主链载荷与时序
    pub fn separator(&self, log_info: bool, show_value: bool, annotations: Vec<String>) -> Process {
        if !log_info && !show_value {
            return self.clone();
        }
        let handler = Handler::from_fn(move |data| {
            let annotations = annotations.clone();
            async move {
                if show_value {
                    info!(annotations = ?annotations, value = %data.value, "separator");
                } else {
                    info!(annotations = ?annotations, "separator");
                }
                Ok(Value::Null)
            }
        });
        self.side_branch(handler, "separator")
    }
}

async fn emit_match_fallback(data: &mut EventData, match_id: &str, has_else: bool) -> Result<()> {
    if has_else {
        // Else 链还要经过收敛器，match 层 mark 保留给它弹
        data.emit(
            &format!("Match-{match_id}-Else"),
            data.value.clone(),
            TriggerType::Event,
        )
        .await
    } else {
        data.layer_out();
        let value = data.value.clone();
        data.emit(&format!("Match-{match_id}-Result"), value, TriggerType::Event)
            .await
    }
}

async fn join_first_error(mut join_set: JoinSet<Result<()>>) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
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
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
