use serde_json::json;
use triggerflow::{ExecutionOptions, Handler, TriggerFlow};

fn double() -> Handler {
    Handler::from_sync(|data| Ok(json!(data.value.as_i64().unwrap_or(0) * 2)))
}

#[tokio::test]
async fn saved_blueprint_replays_wiring_in_a_new_flow() -> anyhow::Result<()> {
    let original = TriggerFlow::new(None, "original", false);
    original.process().to(double()).end();

    let blueprint = original.save_blueprint("shared-wiring");
    assert_eq!(blueprint.name(), "shared-wiring");

    let replica = TriggerFlow::new(Some(blueprint), "replica", false);
    assert_eq!(replica.start(json!(4)).await?, json!(8));
    // 原 flow 不受副本影响，照常工作
    assert_eq!(original.start(json!(5)).await?, json!(10));
    Ok(())
}

#[tokio::test]
async fn editing_a_saved_blueprint_does_not_touch_the_source() -> anyhow::Result<()> {
    let original = TriggerFlow::new(None, "source", false);
    original.process().to(double()).end();

    let blueprint = original.save_blueprint("");
    let replica = TriggerFlow::new(Some(blueprint), "replica", false);
    // 副本上追加一个会报错的分支
    replica.process().to(Handler::from_sync(|_| {
        Err(triggerflow::TriggerFlowError::Other(anyhow::anyhow!(
            "replica only"
        )))
    }));

    assert!(replica.start(json!(1)).await.is_err());
    assert_eq!(original.start(json!(1)).await?, json!(2));
    Ok(())
}

#[tokio::test]
async fn when_start_is_an_explicit_entry_point() -> anyhow::Result<()> {
    use triggerflow::WhenMode;

    let flow = TriggerFlow::new(None, "entry", false);
    flow.when("START", WhenMode::And).to(double()).end();

    assert_eq!(flow.start(json!(3)).await?, json!(6));
    Ok(())
}

#[tokio::test]
async fn flow_display_includes_its_name() {
    let flow = TriggerFlow::new(None, "billing", false);
    assert_eq!(flow.to_string(), "TriggerFlow<billing>");

    // 未命名时分配一个生成名
    let anonymous = TriggerFlow::new(None, "", false);
    assert!(anonymous.to_string().starts_with("TriggerFlow<flow-"));
}

#[tokio::test]
async fn executions_are_registered_and_removable() {
    let flow = TriggerFlow::new(None, "registry", false);
    let execution = flow.create_execution(ExecutionOptions::default());

    let id = execution.id().to_string();
    assert!(flow.get_execution(&id).is_some());

    flow.remove_execution(&id);
    assert!(flow.get_execution(&id).is_none());
}

#[tokio::test]
async fn flow_data_supports_dot_paths() -> anyhow::Result<()> {
    let flow = TriggerFlow::new(None, "paths", false);
    flow.set_flow_data("user.name", json!("ada"), false).await?;
    flow.append_flow_data("user.tags", json!("admin"), false).await?;
    flow.append_flow_data("user.tags", json!("ops"), false).await?;

    assert_eq!(flow.get_flow_data("user.name"), Some(json!("ada")));
    assert_eq!(flow.get_flow_data("user.tags"), Some(json!(["admin", "ops"])));

    flow.del_flow_data("user.name", false).await?;
    assert_eq!(flow.get_flow_data("user.name"), None);
    Ok(())
}

#[tokio::test]
async fn per_execution_overrides_beat_flow_defaults() -> anyhow::Result<()> {
    // flow 级默认严格；单个执行放宽
    let flow = TriggerFlow::new(None, "overrides", false);
    flow.process().to(Handler::from_sync(|_| {
        Err(triggerflow::TriggerFlowError::Other(anyhow::anyhow!("boom")))
    }));
    flow.process().to(double()).end();

    let strict = flow.create_execution(ExecutionOptions::default());
    assert!(strict.emit("START", json!(1)).await.is_err());

    let lenient = flow.create_execution(ExecutionOptions::default().skip_exceptions(true));
    lenient.emit("START", json!(1)).await?;
    assert_eq!(
        lenient
            .get_result(Some(std::time::Duration::from_secs(2)))
            .await?,
        json!(2)
    );
    Ok(())
}
