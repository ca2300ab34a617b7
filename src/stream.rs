use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// runtime 队列里的元素：普通值或终止哨兵
pub(crate) enum StreamItem {
    Item(Value),
    Stop,
}

/// 把单一 runtime 队列扇出给多个订阅者，并为晚到的订阅者回放历史。
/// 空闲超时后流结束而不是永久阻塞。
pub struct StreamFanout {
    state: Mutex<FanoutState>,
}

#[derive(Default)]
struct FanoutState {
    history: Vec<Value>,
    listeners: Vec<mpsc::UnboundedSender<Value>>,
    started: bool,
    closed: bool,
}

impl StreamFanout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanoutState::default()),
        })
    }

    /// 启动消费任务（只生效一次）
    pub(crate) fn start(
        self: &Arc<Self>,
        mut source: mpsc::UnboundedReceiver<StreamItem>,
        idle_timeout: Option<Duration>,
    ) {
        {
            let mut state = self.state.lock();
            if state.started {
                return;
            }
            state.started = true;
        }
        let fanout = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let received = match idle_timeout {
                    Some(idle) => match timeout(idle, source.recv()).await {
                        Ok(item) => item,
                        Err(_) => {
                            tracing::debug!("runtime stream idle timeout, closing");
                            break;
                        }
                    },
                    None => source.recv().await,
                };
                match received {
                    Some(StreamItem::Item(value)) => fanout.publish(value),
                    Some(StreamItem::Stop) | None => break,
                }
            }
            fanout.close();
        });
    }

    fn publish(&self, value: Value) {
        let mut state = self.state.lock();
        state.history.push(value.clone());
        state
            .listeners
            .retain(|listener| listener.send(value.clone()).is_ok());
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }

    /// 订阅：先回放历史，再接收后续元素；流已结束则只回放历史
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for item in &state.history {
            let _ = tx.send(item.clone());
        }
        if !state.closed {
            state.listeners.push(tx);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_history_to_late_subscribers() {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = StreamFanout::new();
        fanout.start(rx, None);

        tx.send(StreamItem::Item(json!(1))).unwrap();
        tx.send(StreamItem::Item(json!(2))).unwrap();
        tx.send(StreamItem::Stop).unwrap();

        // 等消费任务排空队列
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut late = fanout.subscribe();
        assert_eq!(late.recv().await, Some(json!(1)));
        assert_eq!(late.recv().await, Some(json!(2)));
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn idle_timeout_closes_stream() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let fanout = StreamFanout::new();
        fanout.start(rx, Some(Duration::from_millis(20)));

        let mut sub = fanout.subscribe();
        assert_eq!(sub.recv().await, None);
    }
}
