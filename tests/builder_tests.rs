use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use triggerflow::{
    BatchOptions, CaseCondition, ChunkTarget, CollectMode, ExecutionOptions, Handler,
    LoggingConfig, MatchMode, TriggerFlow, TriggerSpec, TriggerType, WhenMode,
};

fn double() -> Handler {
    Handler::from_sync(|data| Ok(json!(data.value.as_i64().unwrap_or(0) * 2)))
}

fn plus_one() -> Handler {
    Handler::from_sync(|data| Ok(json!(data.value.as_i64().unwrap_or(0) + 1)))
}

#[tokio::test]
async fn batch_emits_merged_map_after_all_targets_finish() -> anyhow::Result<()> {
    LoggingConfig::init();
    let flow = TriggerFlow::new(None, "batch", false);
    let double = flow.chunk(ChunkTarget::named("double", double()));
    let square = flow.chunk(ChunkTarget::named(
        "square",
        Handler::from_sync(|data| {
            let v = data.value.as_i64().unwrap_or(0);
            Ok(json!(v * v))
        }),
    ));

    flow.process()
        .batch(
            vec![ChunkTarget::from(double), ChunkTarget::from(square)],
            BatchOptions::default(),
        )
        .end();

    let result = flow.start(json!(3)).await?;
    assert_eq!(result, json!({"double": 6, "square": 9}));
    Ok(())
}

#[tokio::test]
async fn batch_with_concurrency_limit_still_completes() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "batch-limited", false);
    let a = flow.chunk(ChunkTarget::named("a", double()));
    let b = flow.chunk(ChunkTarget::named("b", plus_one()));

    flow.process()
        .batch(
            vec![ChunkTarget::from(a), ChunkTarget::from(b)],
            BatchOptions::default().with_concurrency(1),
        )
        .end();

    let result = flow.start(json!(5)).await?;
    assert_eq!(result, json!({"a": 10, "b": 6}));
    Ok(())
}

#[tokio::test]
async fn and_join_waits_for_every_signal() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "join", false);
    flow.when(
        TriggerSpec::signals([
            (TriggerType::Event, "a"),
            (TriggerType::FlowData, "cfg"),
        ]),
        WhenMode::And,
    )
    .end();

    let execution = flow.create_execution(ExecutionOptions::default());
    execution.emit("a", json!(1)).await?;
    assert!(!execution.has_result());

    flow.set_flow_data("cfg", json!(2), true).await?;
    let result = execution.get_result(Some(Duration::from_secs(2))).await?;
    assert_eq!(result["event"]["a"], json!(1));
    assert_eq!(result["flow_data"]["cfg"], json!(2));
    Ok(())
}

#[tokio::test]
async fn or_mode_wraps_payload_with_signal_origin() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "or", false);
    flow.when(
        TriggerSpec::signals([(TriggerType::Event, "x"), (TriggerType::Event, "y")]),
        WhenMode::Or,
    )
    .end();

    let execution = flow.create_execution(ExecutionOptions::default());
    execution.emit("y", json!(7)).await?;

    let result = execution.get_result(Some(Duration::from_secs(2))).await?;
    assert_eq!(result["trigger_event"], json!("y"));
    assert_eq!(result["trigger_type"], json!("event"));
    assert_eq!(result["value"], json!(7));
    Ok(())
}

#[tokio::test]
async fn simple_or_passes_raw_payload_through() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "simple-or", false);
    flow.when(
        TriggerSpec::signals([(TriggerType::Event, "x"), (TriggerType::Event, "y")]),
        WhenMode::SimpleOr,
    )
    .end();

    let execution = flow.create_execution(ExecutionOptions::default());
    execution.emit("x", json!(5)).await?;
    assert_eq!(
        execution.get_result(Some(Duration::from_secs(2))).await?,
        json!(5)
    );
    Ok(())
}

#[tokio::test]
async fn for_each_preserves_item_order_under_concurrency() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "for-each", false);
    flow.process()
        .for_each(Some(2))
        .to(double())
        .end_for_each()
        .end();

    let result = flow.start(json!([1, 2, 3])).await?;
    assert_eq!(result, json!([2, 4, 6]));
    Ok(())
}

#[tokio::test]
async fn for_each_wraps_non_list_payload_as_single_item() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "for-each-scalar", false);
    flow.process()
        .for_each(None)
        .to(double())
        .end_for_each()
        .end();

    let result = flow.start(json!(4)).await?;
    assert_eq!(result, json!([8]));
    Ok(())
}

#[tokio::test]
async fn nested_for_each_keeps_instances_apart() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "nested", false);
    flow.process()
        .for_each(None)
        .for_each(None)
        .to(double())
        .end_for_each()
        .end_for_each()
        .end();

    let result = flow.start(json!([[1, 2], [3]])).await?;
    assert_eq!(result, json!([[2, 4], [6]]));
    Ok(())
}

#[tokio::test]
async fn hit_first_stops_at_the_first_matching_case() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "hit-first", false);
    let visited = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let tag = |name: &'static str, visited: Arc<Mutex<Vec<&'static str>>>| {
        Handler::from_fn(move |_| {
            let visited = Arc::clone(&visited);
            async move {
                visited.lock().push(name);
                Ok(json!(name))
            }
        })
    };

    flow.process()
        .match_on(MatchMode::HitFirst)
        .case(CaseCondition::equals(json!(1)))
        .to(tag("one", Arc::clone(&visited)))
        .case(CaseCondition::predicate(|data| data.value == json!(2)))
        .to(tag("two", Arc::clone(&visited)))
        .case_else()
        .to(tag("other", Arc::clone(&visited)))
        .end_match()
        .end();

    let result = flow.start(json!(2)).await?;
    assert_eq!(result, json!("two"));
    assert_eq!(*visited.lock(), vec!["two"]);
    Ok(())
}

#[tokio::test]
async fn unmatched_payload_falls_through_to_else() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "else", false);
    flow.process()
        .match_on(MatchMode::HitFirst)
        .case(CaseCondition::equals(json!(1)))
        .to(Handler::from_sync(|_| Ok(json!("one"))))
        .case_else()
        .to(Handler::from_sync(|_| Ok(json!("fallback"))))
        .end_match()
        .end();

    let result = flow.start(json!(99)).await?;
    assert_eq!(result, json!("fallback"));
    Ok(())
}

#[tokio::test]
async fn hit_all_aggregates_branch_results_in_case_order() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "hit-all", false);
    flow.process()
        .match_on(MatchMode::HitAll)
        .case(CaseCondition::predicate(|data| {
            data.value.as_i64().unwrap_or(0) > 0
        }))
        .to(double())
        .case(CaseCondition::predicate(|data| {
            data.value.as_i64().unwrap_or(0) >= 10
        }))
        .to(plus_one())
        .end_match()
        .end();

    let result = flow.start(json!(10)).await?;
    assert_eq!(result, json!([20, 11]));
    Ok(())
}

#[tokio::test]
async fn if_condition_sugar_builds_a_two_way_branch() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "if", false);
    flow.process()
        .if_condition(CaseCondition::predicate(|data| {
            data.value.as_i64().unwrap_or(0) % 2 == 0
        }))
        .to(Handler::from_sync(|_| Ok(json!("even"))))
        .else_condition()
        .to(Handler::from_sync(|_| Ok(json!("odd"))))
        .end_condition()
        .end();

    assert_eq!(flow.start(json!(4)).await?, json!("even"));
    assert_eq!(flow.start(json!(5)).await?, json!("odd"));
    Ok(())
}

#[tokio::test]
async fn collect_rendezvous_resets_between_runs() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "collect", false);
    let entry = flow.process();
    entry
        .to(Handler::from_sync(|data| {
            Ok(json!(data.value.as_i64().unwrap_or(0) * 10))
        }))
        .collect("pair", Some("a".to_string()), CollectMode::FilledThenEmpty);
    entry
        .to(plus_one())
        .collect("pair", Some("b".to_string()), CollectMode::FilledThenEmpty);
    flow.when("Collect-pair", WhenMode::And).end();

    assert_eq!(flow.start(json!(1)).await?, json!({"a": 10, "b": 2}));
    // filled_then_empty 清空后，第二次执行重新汇合
    assert_eq!(flow.start(json!(2)).await?, json!({"a": 20, "b": 3}));
    Ok(())
}

#[tokio::test]
async fn side_branch_observes_without_diverting_the_chain() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "side", false);
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));

    let tap = {
        let seen = Arc::clone(&seen);
        Handler::from_fn(move |data| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(data.value.clone());
                Ok(Value::Null)
            }
        })
    };

    flow.process().side_branch(tap, "tap").to(double()).end();

    let result = flow.start(json!(2)).await?;
    assert_eq!(result, json!(4));
    assert_eq!(*seen.lock(), vec![json!(2)]);
    Ok(())
}

#[tokio::test]
async fn separator_without_output_is_a_no_op() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "separator", false);
    flow.process()
        .to(double())
        .separator(false, false, vec!["checkpoint".to_string()])
        .end();

    assert_eq!(flow.start(json!(3)).await?, json!(6));
    Ok(())
}

#[tokio::test]
async fn named_chunks_are_addressable_by_directory_name() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "directory", false);
    flow.chunk(ChunkTarget::named("double", double()));

    flow.to("double").end();
    assert_eq!(flow.start(json!(6)).await?, json!(12));
    Ok(())
}

#[tokio::test]
async fn handlerless_chunk_echoes_its_input() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "echo", false);
    let echo = flow.chunk("echo");
    flow.process().to(&echo).end();

    assert_eq!(flow.start(json!("hello")).await?, json!("hello"));
    Ok(())
}
